//! Frame sizes, sample rate and the buffering depths derived from them.
//!
//! Everything is expressed in packets of [`SAMPLE_BUFFER_SIZE`] samples.  At 48kHz
//! one packet is 2.67ms of audio, so a sender produces 375 packets per second.
use super::config::{Config, MissingConfigError};

pub const SAMPLE_BUFFER_SIZE: usize = 128;
pub const SAMPLE_RATE: u16 = 48_000;
const SAMPLES_PER_MILLISECOND: usize = SAMPLE_RATE as usize / 1000;

/// packets needed to cover millis worth of audio (rounded down)
pub const fn packets_for_millis(millis: usize) -> usize {
    millis * SAMPLES_PER_MILLISECOND / SAMPLE_BUFFER_SIZE
}

/// every sender queue must hold this many packets before the mixer runs (10ms)
pub const SERVER_INCOMING_JITTER_BUFFER: usize = packets_for_millis(10);
/// any sender queue deeper than this forces a mix (30ms)
pub const SERVER_INCOMING_MAXIMUM_BUFFER: usize = packets_for_millis(30);
/// synthetic packets pushed in front of the first packet of a new sender
pub const BUFFER_PREFILL_ON_CONNECT: usize = SERVER_INCOMING_JITTER_BUFFER;

/// client playout starts once it has this many packets (20ms)
pub const CLIENT_PLAYOUT_JITTER_BUFFER: usize = packets_for_millis(20);
/// client playout discards above this depth (60ms)
pub const CLIENT_PLAYOUT_MAX_BUFFER: usize = packets_for_millis(60);

pub const FEC_RINGBUFFER_SIZE: usize = 16;
/// the redundant copy of the previous block is sent at a reduced sample rate
pub const FEC_SAMPLERATE_REDUCTION: u16 = 2;

pub const MAX_FRAME_SIZE: usize = 65_536;
pub const SEND_QUEUE_CAPACITY: usize = 128;

/// ClientInfo / SessionSetup go out every this many packages per receiver
pub const CLIENT_INFO_INTERVAL: u64 = 100;

pub const DEFAULT_SERVER_PORT: u16 = 7777;

/// Server side queue thresholds.  Loaded from the config file, the constants above are defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerBufferConfig {
    pub incoming_jitter_buffer: usize,
    pub incoming_maximum_buffer: usize,
    pub prefill_on_connect: usize,
}

impl Default for ServerBufferConfig {
    fn default() -> ServerBufferConfig {
        ServerBufferConfig {
            incoming_jitter_buffer: SERVER_INCOMING_JITTER_BUFFER,
            incoming_maximum_buffer: SERVER_INCOMING_MAXIMUM_BUFFER,
            prefill_on_connect: BUFFER_PREFILL_ON_CONNECT,
        }
    }
}

impl ServerBufferConfig {
    pub fn from_config(config: &Config) -> Result<ServerBufferConfig, MissingConfigError> {
        let defaults = ServerBufferConfig::default();
        let jitter = config.get_u32_value(
            "incoming_jitter_buffer",
            Some(defaults.incoming_jitter_buffer as u32),
        )? as usize;
        let maximum = config.get_u32_value(
            "incoming_maximum_buffer",
            Some(defaults.incoming_maximum_buffer as u32),
        )? as usize;
        let prefill =
            config.get_u32_value("prefill_on_connect", Some(jitter as u32))? as usize;
        Ok(ServerBufferConfig {
            incoming_jitter_buffer: jitter.max(1),
            // a maximum below the threshold would make every push an overrun
            incoming_maximum_buffer: maximum.max(jitter.max(1)),
            prefill_on_connect: prefill,
        })
    }
}

#[cfg(test)]
mod test_buffers_config {
    use super::*;

    #[test]
    fn derived_depths() {
        // It should turn milliseconds into whole packets
        assert_eq!(SERVER_INCOMING_JITTER_BUFFER, 3);
        assert_eq!(SERVER_INCOMING_MAXIMUM_BUFFER, 11);
        assert_eq!(BUFFER_PREFILL_ON_CONNECT, 3);
        assert_eq!(CLIENT_PLAYOUT_JITTER_BUFFER, 7);
        assert_eq!(CLIENT_PLAYOUT_MAX_BUFFER, 22);
    }
    #[test]
    fn from_settings() {
        let config = Config::from_str(
            r#"{ "incoming_jitter_buffer": 5, "incoming_maximum_buffer": 2 }"#,
            json::object! {},
        )
        .unwrap();
        let buffers = ServerBufferConfig::from_config(&config).unwrap();
        assert_eq!(buffers.incoming_jitter_buffer, 5);
        assert_eq!(buffers.incoming_maximum_buffer, 5);
        assert_eq!(buffers.prefill_on_connect, 5);
    }
}
