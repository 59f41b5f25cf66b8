//! the JamEngine ties a [`Client`] to the audio callback
//!
//! The engine drives off [`SoundCallback::process`], called once per frame of
//! `SAMPLE_BUFFER_SIZE` samples.  It never blocks: volume commands are polled with
//! `try_recv` and the mix comes out of a [`PacketStreamQueue`] filled by the
//! receive thread.
use log::{debug, info, warn};
use std::sync::{mpsc, Arc};

use super::{client::Client, jam_socket::JamSocket, SoundCallback};
use crate::common::{
    box_error::BoxError,
    buffers_config::{CLIENT_PLAYOUT_JITTER_BUFFER, CLIENT_PLAYOUT_MAX_BUFFER},
    control_message::ApplyLocalVolume,
    encryption::PacketCipher,
    get_micro_time,
    jam_packet::{AudioData, ChannelSetup, MAX_CHANNELS_PER_CLIENT},
    packet_stream::PacketStreamQueue,
    stream_time_stat::MicroTimer,
    LogOnce,
};

pub const DEBUG_INTERVAL: u128 = 5 * 1000 * 1000;

/// Aggregates the client and its playout queue into one audio callback.
///
/// Every frame:
/// - apply volume commands that other clients sent us
/// - send the two input channels to the server
/// - play one mix from the playout queue
///
/// Playout waits until `CLIENT_PLAYOUT_JITTER_BUFFER` mixes are queued, trims back
/// to that depth past `CLIENT_PLAYOUT_MAX_BUFFER`, and plays silence (and starts
/// filling again) when the queue runs dry.
pub struct JamEngine {
    client: Client,
    playout: Arc<PacketStreamQueue>,
    volume_rx: mpsc::Receiver<ApplyLocalVolume>,
    channel_setup: ChannelSetup,
    filling: bool,
    now: u128,
    debug_timer: MicroTimer,
    underruns: u64,
    discarded: u64,
    send_errors: LogOnce,
}

impl JamEngine {
    pub fn new(
        client: Client,
        playout: Arc<PacketStreamQueue>,
        volume_rx: mpsc::Receiver<ApplyLocalVolume>,
        channel_setup: ChannelSetup,
    ) -> JamEngine {
        let now = get_micro_time();
        JamEngine {
            client,
            playout,
            volume_rx,
            channel_setup,
            filling: true,
            now,
            debug_timer: MicroTimer::new(now, DEBUG_INTERVAL),
            underruns: 0,
            discarded: 0,
            send_errors: LogOnce::new(),
        }
    }
    /// Start a client on a connected socket with the mix feeding a fresh playout queue
    pub fn connect(sock: JamSocket, cipher: Arc<dyn PacketCipher>, channel_setup: ChannelSetup) -> Result<JamEngine, BoxError> {
        let playout = Arc::new(PacketStreamQueue::new("playout"));
        let queue = playout.clone();
        let (volume_tx, volume_rx) = mpsc::channel();
        let client = Client::start(
            sock,
            cipher,
            Box::new(move |audio: AudioData| {
                queue.push(audio);
            }),
            volume_tx,
        )?;
        Ok(JamEngine::new(client, playout, volume_rx, channel_setup))
    }
    pub fn client(&self) -> &Client {
        &self.client
    }
    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }
    pub fn playout(&self) -> Arc<PacketStreamQueue> {
        self.playout.clone()
    }
    pub fn channel_setup(&self) -> ChannelSetup {
        self.channel_setup
    }
    pub fn is_filling(&self) -> bool {
        self.filling
    }
    pub fn underruns(&self) -> u64 {
        self.underruns
    }
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn check_volume_commands(&mut self) {
        while let Ok(cmd) = self.volume_rx.try_recv() {
            let idx = cmd.target_channel_index as usize;
            if idx >= MAX_CHANNELS_PER_CLIENT {
                warn!("volume command for channel {} ignored", idx);
                continue;
            }
            info!(
                "client {} set channel {} to {}%",
                cmd.source_client_id, idx, cmd.volume_percent
            );
            self.channel_setup.channels[idx].volume = cmd.volume_percent / 100.0;
        }
    }
    fn send_my_audio(&mut self, in_a: &[f32], in_b: &[f32]) {
        if let Err(e) = self.client.send_data(self.channel_setup, &[in_a, in_b]) {
            if self.send_errors.first() {
                warn!("cannot send audio: {}", e);
            }
        }
    }
    /// Fill the outputs with the next mix, or silence
    pub fn get_playback_data(&mut self, out_a: &mut [f32], out_b: &mut [f32]) {
        if self.filling {
            if self.playout.size() < CLIENT_PLAYOUT_JITTER_BUFFER {
                silence(out_a, out_b);
                return;
            }
            debug!("playout primed with {} packets", self.playout.size());
            self.filling = false;
        }
        if self.playout.size() > CLIENT_PLAYOUT_MAX_BUFFER {
            // trim back down to the jitter depth
            while self.playout.size() > CLIENT_PLAYOUT_JITTER_BUFFER {
                if self.playout.try_pop().is_none() {
                    break;
                }
                self.discarded += 1;
            }
        }
        match self.playout.try_pop() {
            Some((data, _fill_in)) => {
                let block = data.audio_block();
                let left = block.audio.first();
                let right = block.audio.get(1).or(left);
                copy_channel(left, out_a);
                copy_channel(right, out_b);
            }
            None => {
                self.underruns += 1;
                self.filling = true;
                silence(out_a, out_b);
            }
        }
    }
    fn debug_output(&mut self) {
        if self.debug_timer.expired(self.now) {
            self.debug_timer.reset(self.now);
            debug!(
                "rtt: {:.1} ms, receiving: {}, playout: {}, underruns: {}, discarded: {}",
                self.client.current_rtt(),
                self.client.is_receiving(),
                self.playout.size(),
                self.underruns,
                self.discarded
            );
        }
    }
}

impl SoundCallback for JamEngine {
    fn process(&mut self, in_a: &[f32], in_b: &[f32], out_a: &mut [f32], out_b: &mut [f32]) -> Result<(), BoxError> {
        self.now = get_micro_time();
        self.check_volume_commands();
        self.send_my_audio(in_a, in_b);
        self.get_playback_data(out_a, out_b);
        self.debug_output();
        Ok(())
    }
}

fn silence(out_a: &mut [f32], out_b: &mut [f32]) {
    out_a.fill(0.0);
    out_b.fill(0.0);
}

fn copy_channel(src: Option<&Vec<f32>>, out: &mut [f32]) {
    out.fill(0.0);
    if let Some(src) = src {
        let n = src.len().min(out.len());
        out[..n].copy_from_slice(&src[..n]);
    }
}
