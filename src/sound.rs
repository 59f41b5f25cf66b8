//! components used to make the netmix client
//!
//! [`client::Client`] sends the local audio to the server and runs a
//! [`receive_thread::ReceiveThread`] for what comes back.  [`jam_engine::JamEngine`]
//! ties it to the audio callback.
use crate::common::box_error::BoxError;

/// What the audio device calls every frame: two input channels in, stereo out.
pub trait SoundCallback {
    fn process(&mut self, in_a: &[f32], in_b: &[f32], out_a: &mut [f32], out_b: &mut [f32]) -> Result<(), BoxError>;
}

pub mod client;
pub mod jam_engine;
pub mod jam_socket;
pub mod receive_thread;
