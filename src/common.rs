//! These modules are shared among both the client and server executables for netmix.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod box_error;
pub mod buffers_config;
pub mod client_info;
pub mod config;
pub mod control_message;
pub mod encryption;
pub mod jam_packet;
pub mod packet_stream;
pub mod ring_buffer;
pub mod session_info;
pub mod sock_with_tos;
pub mod stream_time_stat;

/// wall clock in microseconds, used for all the timers
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// wall clock in milliseconds, this is what goes into the packet timestamps
pub fn get_milli_time() -> f64 {
    get_micro_time() as f64 / 1000.0
}

/// Latch so a noisy error condition only makes it into the log once per thread
#[derive(Debug, Default)]
pub struct LogOnce {
    fired: bool,
}

impl LogOnce {
    pub fn new() -> LogOnce {
        LogOnce { fired: false }
    }
    /// returns true the first time it is called
    pub fn first(&mut self) -> bool {
        let first = !self.fired;
        self.fired = true;
        first
    }
}
