//! SessionSetup message: how every other sender in the session has its channels routed.
//!
//! The client uses it to label the mix and to know which client id owns which channel
//! when it wants to send a remote volume change.
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num::FromPrimitive;
use std::{fmt, io::Cursor};

use super::{box_error::BoxError, jam_packet::ChannelTarget};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionChannel {
    pub client_id: u32,
    pub channel_index: u8,
    pub target: ChannelTarget,
    pub volume: f32,
    pub balance: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSetup {
    pub channels: Vec<SessionChannel>,
}

impl SessionSetup {
    pub fn new() -> SessionSetup {
        SessionSetup {
            channels: Vec::new(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
    /// channels that belong to one client
    pub fn channels_of(&self, client_id: u32) -> impl Iterator<Item = &SessionChannel> {
        self.channels.iter().filter(move |c| c.client_id == client_id)
    }

    pub(crate) fn write_body(&self, out: &mut Vec<u8>) -> Result<(), BoxError> {
        if self.channels.len() > u8::MAX as usize {
            simple_error::bail!("session setup with {} channels", self.channels.len());
        }
        out.write_u8(self.channels.len() as u8)?;
        for channel in self.channels.iter() {
            out.write_u32::<LittleEndian>(channel.client_id)?;
            out.write_u8(channel.channel_index)?;
            out.write_u8(channel.target as u8)?;
            out.write_f32::<LittleEndian>(channel.volume)?;
            out.write_f32::<LittleEndian>(channel.balance)?;
        }
        Ok(())
    }

    pub(crate) fn read_body(cur: &mut Cursor<&[u8]>) -> Option<SessionSetup> {
        let count = cur.read_u8().ok()?;
        let mut setup = SessionSetup::new();
        for _ in 0..count {
            setup.channels.push(SessionChannel {
                client_id: cur.read_u32::<LittleEndian>().ok()?,
                channel_index: cur.read_u8().ok()?,
                target: ChannelTarget::from_u8(cur.read_u8().ok()?)?,
                volume: cur.read_f32::<LittleEndian>().ok()?,
                balance: cur.read_f32::<LittleEndian>().ok()?,
            });
        }
        Some(setup)
    }
}

impl fmt::Display for SessionSetup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.channels.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}.{}:{:?}@{:.2}", c.client_id, c.channel_index, c.target, c.volume)?;
        }
        write!(f, "]")
    }
}
