//! ClientInfo message: who is connected to the server and how well their packets arrive.
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::{
    fmt,
    io::{Cursor, Read},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use super::box_error::BoxError;

/// Snapshot of the counters a [`crate::common::packet_stream::PacketStreamQueue`] keeps
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamQualityInfo {
    pub too_late_or_duplicate: u64,
    pub dropped_packet_counter: i64,
    pub out_of_order_packet_counter: i64,
    pub duplicate_packet_counter: i64,
    pub drops_healed: u64,
    pub packages_pushed: u64,
    pub packages_popped: u64,
    pub max_length_of_gap: u64,
    pub max_wrong_order_span: u64,
    pub wall_clock_delta: f64,
    pub jitter_mean_millis: f64,
    pub jitter_sd_millis: f64,
}

impl StreamQualityInfo {
    fn write(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_u64::<LittleEndian>(self.too_late_or_duplicate)?;
        out.write_i64::<LittleEndian>(self.dropped_packet_counter)?;
        out.write_i64::<LittleEndian>(self.out_of_order_packet_counter)?;
        out.write_i64::<LittleEndian>(self.duplicate_packet_counter)?;
        out.write_u64::<LittleEndian>(self.drops_healed)?;
        out.write_u64::<LittleEndian>(self.packages_pushed)?;
        out.write_u64::<LittleEndian>(self.packages_popped)?;
        out.write_u64::<LittleEndian>(self.max_length_of_gap)?;
        out.write_u64::<LittleEndian>(self.max_wrong_order_span)?;
        out.write_f64::<LittleEndian>(self.wall_clock_delta)?;
        out.write_f64::<LittleEndian>(self.jitter_mean_millis)?;
        out.write_f64::<LittleEndian>(self.jitter_sd_millis)
    }
    fn read(cur: &mut Cursor<&[u8]>) -> std::io::Result<StreamQualityInfo> {
        Ok(StreamQualityInfo {
            too_late_or_duplicate: cur.read_u64::<LittleEndian>()?,
            dropped_packet_counter: cur.read_i64::<LittleEndian>()?,
            out_of_order_packet_counter: cur.read_i64::<LittleEndian>()?,
            duplicate_packet_counter: cur.read_i64::<LittleEndian>()?,
            drops_healed: cur.read_u64::<LittleEndian>()?,
            packages_pushed: cur.read_u64::<LittleEndian>()?,
            packages_popped: cur.read_u64::<LittleEndian>()?,
            max_length_of_gap: cur.read_u64::<LittleEndian>()?,
            max_wrong_order_span: cur.read_u64::<LittleEndian>()?,
            wall_clock_delta: cur.read_f64::<LittleEndian>()?,
            jitter_mean_millis: cur.read_f64::<LittleEndian>()?,
            jitter_sd_millis: cur.read_f64::<LittleEndian>()?,
        })
    }
}

impl fmt::Display for StreamQualityInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{{ }}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub address: SocketAddr,
    pub quality: StreamQualityInfo,
}

/// one entry per live sender, at most 255
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfoMessage {
    infos: Vec<ClientInfo>,
}

impl ClientInfoMessage {
    pub fn new() -> ClientInfoMessage {
        ClientInfoMessage { infos: Vec::new() }
    }
    /// returns false once the message is full
    pub fn add_client_info(&mut self, address: SocketAddr, quality: StreamQualityInfo) -> bool {
        if self.infos.len() >= u8::MAX as usize {
            return false;
        }
        self.infos.push(ClientInfo { address, quality });
        true
    }
    pub fn num_clients(&self) -> usize {
        self.infos.len()
    }
    pub fn get(&self, idx: usize) -> Option<&ClientInfo> {
        self.infos.get(idx)
    }
    pub fn iter(&self) -> impl Iterator<Item = &ClientInfo> {
        self.infos.iter()
    }

    pub(crate) fn write_body(&self, out: &mut Vec<u8>) -> Result<(), BoxError> {
        out.write_u8(self.infos.len() as u8)?;
        for info in self.infos.iter() {
            let mut raw = [0u8; 16];
            match info.address.ip() {
                IpAddr::V4(ip) => {
                    out.write_u8(0)?;
                    raw[..4].copy_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    out.write_u8(1)?;
                    raw.copy_from_slice(&ip.octets());
                }
            }
            out.extend_from_slice(&raw);
            out.write_u16::<LittleEndian>(info.address.port())?;
            info.quality.write(out)?;
        }
        Ok(())
    }

    pub(crate) fn read_body(cur: &mut Cursor<&[u8]>) -> Option<ClientInfoMessage> {
        let count = cur.read_u8().ok()?;
        let mut msg = ClientInfoMessage::new();
        for _ in 0..count {
            let is_ipv6 = cur.read_u8().ok()?;
            let mut raw = [0u8; 16];
            cur.read_exact(&mut raw).ok()?;
            let port = cur.read_u16::<LittleEndian>().ok()?;
            let ip = match is_ipv6 {
                0 => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
                1 => IpAddr::V6(Ipv6Addr::from(raw)),
                _ => return None,
            };
            let quality = StreamQualityInfo::read(cur).ok()?;
            msg.add_client_info(SocketAddr::new(ip, port), quality);
        }
        Some(msg)
    }
}

#[cfg(test)]
mod test_client_info {
    use super::*;
    use crate::common::jam_packet::JamMessage;

    #[test]
    fn over_the_wire() {
        // It should carry v4 and v6 addresses with their stats
        let mut msg = ClientInfoMessage::new();
        let quality = StreamQualityInfo {
            packages_pushed: 500,
            dropped_packet_counter: 3,
            jitter_mean_millis: 1.25,
            ..Default::default()
        };
        msg.add_client_info("10.0.0.9:48481".parse().unwrap(), quality);
        msg.add_client_info("[::1]:7777".parse().unwrap(), StreamQualityInfo::default());
        let bytes = JamMessage::ClientInfo(msg.clone()).serialize().unwrap();
        match JamMessage::deserialize(&bytes) {
            Some(JamMessage::ClientInfo(back)) => {
                assert_eq!(back.num_clients(), 2);
                assert_eq!(back, msg);
                assert_eq!(back.get(0).unwrap().quality.packages_pushed, 500);
            }
            other => assert!(false, "unexpected decode {:?}", other),
        }
        assert!(JamMessage::deserialize(&bytes[..bytes.len() - 4]).is_none());
    }
    #[test]
    fn caps_at_255() {
        let mut msg = ClientInfoMessage::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        for _ in 0..255 {
            assert!(msg.add_client_info(addr, StreamQualityInfo::default()));
        }
        assert!(!msg.add_client_info(addr, StreamQualityInfo::default()));
    }
}
