//! UDP socket with the low delay type of service bit set
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use super::box_error::BoxError;

/// IPTOS_LOWDELAY
pub const LOW_DELAY_TOS: u32 = 0x10;

/// Bind to all interfaces on port.  Use port 0 to get whatever the OS hands out.
pub fn new(port: u16) -> Result<UdpSocket, BoxError> {
    let raw_sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    raw_sock.set_tos(LOW_DELAY_TOS)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    raw_sock.bind(&SockAddr::from(addr))?;
    Ok(UdpSocket::from(raw_sock))
}

#[cfg(test)]
mod test_sock_with_tos {
    use super::*;

    #[test]
    fn any_port() {
        // It should bind to a port the OS picks
        let sock = new(0).unwrap();
        assert_ne!(sock.local_addr().unwrap().port(), 0);
    }
}
