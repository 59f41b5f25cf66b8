//! UDP socket the client uses to talk to its server
use log::info;
use rand::Rng;
use simple_error::{bail, SimpleError};
use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
};

use crate::common::{box_error::BoxError, sock_with_tos};

pub struct JamSocket {
    sock: UdpSocket,
    server: Option<SocketAddr>,
}

impl JamSocket {
    pub fn build(port: u16) -> Result<JamSocket, BoxError> {
        Ok(JamSocket {
            sock: sock_with_tos::new(port)?,
            server: None,
        })
    }
    /// bind somewhere in base..base+spread, so two clients on one box do not collide
    pub fn build_random(base: u16, spread: u16) -> Result<JamSocket, BoxError> {
        let offset = rand::thread_rng().gen_range(0..spread.max(1));
        let port = base.saturating_add(offset);
        info!("client socket on port {}", port);
        JamSocket::build(port)
    }
    /// Resolve the server.  Only IPv4, that is what the socket speaks.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), BoxError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| SimpleError::new(format!("no IPv4 address for {}", host)))?;
        self.server = Some(addr);
        Ok(())
    }
    pub fn disconnect(&mut self) {
        self.server = None;
    }
    pub fn is_connected(&self) -> bool {
        self.server.is_some()
    }
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server
    }
    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.sock.local_addr()?)
    }
    /// second handle on the same socket for the receive thread
    pub fn try_clone_socket(&self) -> Result<UdpSocket, BoxError> {
        Ok(self.sock.try_clone()?)
    }
    pub fn send(&self, bytes: &[u8]) -> Result<usize, BoxError> {
        match self.server {
            Some(addr) => Ok(self.sock.send_to(bytes, addr)?),
            None => bail!("socket not connected"),
        }
    }
}

impl fmt::Display for JamSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.sock.local_addr() {
            Ok(addr) => write!(f, "{{ sock: {}, server: {:?} }}", addr, self.server),
            Err(_) => write!(f, "{{ sock: ?, server: {:?} }}", self.server),
        }
    }
}
