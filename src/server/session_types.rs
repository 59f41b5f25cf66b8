//! Types handed between the accept, mixer and send threads.
use dashmap::DashMap;
use std::{fmt, sync::Arc};

use crate::common::{
    control_message::ControlMessage, jam_packet::AudioBlock, packet_stream::PacketStreamQueue,
    session_info::SessionSetup,
};

/// One queue per sender endpoint ("ip:port").
///
/// An entry is set to None when the sender stops delivering and gets a fresh queue
/// when it shows up again.  Entries are never removed.
pub type PacketStreamBundle = DashMap<String, Option<Arc<PacketStreamQueue>>>;

/// a finished mix for one receiver
#[derive(Debug, Clone)]
pub struct MixPackage {
    pub target: String,
    pub block: Arc<AudioBlock>,
    pub session_setup: Arc<SessionSetup>,
}

#[derive(Debug, Clone)]
pub enum OutgoingPackage {
    Mix(MixPackage),
    /// stops the send thread
    Shutdown,
}

/// control message the accept thread wants delivered to an endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ControlForward {
    pub target: String,
    pub message: ControlMessage,
}

impl fmt::Display for MixPackage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ target: {}, counter: {}, server_time: {}, session: {} }}",
            self.target, self.block.message_counter, self.block.server_time, self.session_setup
        )
    }
}
