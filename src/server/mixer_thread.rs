//! Builds a personal mix for every client.
//!
//! The accept thread pokes the wake queue for every packet it stores.  On each poke the
//! mixer checks the queue depths: it only mixes once every sender has buffered enough
//! (or one sender is so far ahead that waiting would only add delay).  Then it pops one
//! block from each sender and builds one stereo mix per sender out of all of them.
//!
//! A sender whose queue comes up empty is considered gone and its queue is torn down.
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{error, info, warn};
use simple_error::bail;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{
    client_registry::ClientIdentityRegistry,
    session_types::{MixPackage, OutgoingPackage, PacketStreamBundle},
};
use crate::common::{
    box_error::BoxError,
    buffers_config::ServerBufferConfig,
    jam_packet::{AudioBlock, AudioData, ChannelSetup, ChannelTarget, MidiSignal},
    packet_stream::PacketStreamQueue,
    session_info::{SessionChannel, SessionSetup},
};

/// how long to block on the wake queue before checking the exit flag
const WAKE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixDecision {
    Wait,
    Mix { overrun: bool },
}

/// Look at the depth of every active queue and decide if it is time to mix
pub fn mix_decision(depths: &[usize], config: &ServerBufferConfig) -> MixDecision {
    if depths.is_empty() {
        return MixDecision::Wait;
    }
    let all_delivered = depths.iter().all(|d| *d >= config.incoming_jitter_buffer);
    let overrun = depths.iter().any(|d| *d > config.incoming_maximum_buffer);
    if !all_delivered && !overrun && depths.len() > 1 {
        MixDecision::Wait
    } else {
        MixDecision::Mix { overrun }
    }
}

/// Square root pan, capped at unity: both sides at full volume in the centre,
/// the far side fades out and the near side never gets boosted.
fn pan_gains(volume: f32, balance: f32) -> (f32, f32) {
    let b = balance.clamp(-1.0, 1.0);
    (volume * (1.0 - b).sqrt().min(1.0), volume * (1.0 + b).sqrt().min(1.0))
}

/// Add one sender's block into a stereo bus.  Returns false if the block was skipped.
pub fn buffer_mixdown(left: &mut [f32], right: &mut [f32], block: &AudioBlock, is_for_sender: bool) -> bool {
    if block.num_channels() == 0 {
        warn!("audio block {} has no channels", block.message_counter);
    }
    if block.num_samples() != left.len() {
        error!(
            "client uses a buffer size of {} instead of {}",
            block.num_samples(),
            left.len()
        );
        return false;
    }
    for (samples, setup) in block.audio.iter().zip(block.channel_setup.channels.iter()) {
        let (l_gain, r_gain) = match setup.target {
            ChannelTarget::Unused | ChannelTarget::Mute => continue,
            target if target.is_send_only() && is_for_sender => continue,
            ChannelTarget::Left | ChannelTarget::SendLeft => (setup.volume, 0.0),
            ChannelTarget::Right | ChannelTarget::SendRight => (0.0, setup.volume),
            ChannelTarget::Mono | ChannelTarget::SendMono => pan_gains(setup.volume, setup.balance),
        };
        for ((l, r), s) in left.iter_mut().zip(right.iter_mut()).zip(samples.iter()) {
            *l += s * l_gain;
            *r += s * r_gain;
        }
    }
    true
}

pub struct MixerThread {
    incoming: Arc<PacketStreamBundle>,
    registry: Arc<ClientIdentityRegistry>,
    outgoing_tx: Sender<OutgoingPackage>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    buffer_config: ServerBufferConfig,
    mixdown_setup: ChannelSetup,
    server_time: u64,
    exit: Arc<AtomicBool>,
}

impl MixerThread {
    pub fn new(
        incoming: Arc<PacketStreamBundle>,
        registry: Arc<ClientIdentityRegistry>,
        outgoing_tx: Sender<OutgoingPackage>,
        wake_tx: Sender<()>,
        wake_rx: Receiver<()>,
        buffer_config: ServerBufferConfig,
        exit: Arc<AtomicBool>,
    ) -> MixerThread {
        MixerThread {
            incoming,
            registry,
            outgoing_tx,
            wake_tx,
            wake_rx,
            buffer_config,
            mixdown_setup: ChannelSetup::stereo(),
            server_time: 0,
            exit,
        }
    }

    pub fn run(&mut self) -> Result<(), BoxError> {
        info!("mixer running {:?}", self.buffer_config);
        while !self.exit.load(Ordering::Acquire) {
            match self.wake_rx.recv_timeout(WAKE_TIMEOUT) {
                Ok(()) => {
                    // wakes still queued at shutdown are not worth a mix
                    if self.exit.load(Ordering::Acquire) {
                        break;
                    }
                    self.mix_once()?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn wake(&self) {
        // a full wake queue already has a wake pending
        let _ = self.wake_tx.try_send(());
    }

    /// server sample clock
    pub fn server_time(&self) -> u64 {
        self.server_time
    }

    /// One pass of the mixer.  Returns the number of packages handed to the send thread.
    /// An error means the send queue is stuck and the server can not go on.
    pub fn mix_once(&mut self) -> Result<usize, BoxError> {
        let active: Vec<(String, Arc<PacketStreamQueue>)> = self
            .incoming
            .iter()
            .filter_map(|entry| entry.value().as_ref().map(|q| (entry.key().clone(), q.clone())))
            .collect();
        let depths: Vec<usize> = active.iter().map(|(_, q)| q.size()).collect();
        match mix_decision(&depths, &self.buffer_config) {
            MixDecision::Wait => return Ok(0),
            MixDecision::Mix { overrun } => {
                if overrun {
                    self.wake();
                }
            }
        }

        let mut collected: BTreeMap<String, AudioData> = BTreeMap::new();
        for (name, queue) in active.iter() {
            match queue.try_pop() {
                Some((data, is_fill_in)) => {
                    if is_fill_in {
                        self.wake();
                    }
                    collected.insert(name.clone(), data);
                }
                None => self.tear_down(name, queue, &active),
            }
        }
        if collected.is_empty() {
            return Ok(0);
        }
        self.send_mixes(&collected)
    }

    fn tear_down(&self, name: &str, queue: &Arc<PacketStreamQueue>, active: &[(String, Arc<PacketStreamQueue>)]) {
        info!("client {} has not delivered for a while, removing it from the mix", name);
        for (_, q) in active.iter() {
            info!("{}", q.quality_statement());
        }
        if let Some(mut entry) = self.incoming.get_mut(name) {
            // the accept thread may have replaced it already
            if entry.value().as_ref().map_or(false, |current| Arc::ptr_eq(current, queue)) {
                *entry = None;
            }
        }
    }

    fn session_channels(&self, name: &str, block: &AudioBlock) -> Vec<SessionChannel> {
        let client_id = self.registry.client_id_for(name).unwrap_or(0);
        block
            .channel_setup
            .channels
            .iter()
            .take(block.num_channels())
            .enumerate()
            .filter(|(_, setup)| setup.target != ChannelTarget::Unused)
            .map(|(idx, setup)| SessionChannel {
                client_id,
                channel_index: idx as u8,
                target: setup.target,
                volume: setup.volume,
                balance: setup.balance,
            })
            .collect()
    }

    fn send_mixes(&mut self, collected: &BTreeMap<String, AudioData>) -> Result<usize, BoxError> {
        let blocks: Vec<(&String, Arc<AudioBlock>)> =
            collected.iter().map(|(name, data)| (name, data.audio_block())).collect();
        let buffer_length = blocks[0].1.num_samples();
        let bpm = blocks.iter().map(|(_, b)| b.bpm).fold(0.0f32, f32::max);
        let midi_signal = blocks
            .iter()
            .map(|(_, b)| b.midi_signal)
            .find(|m| *m != MidiSignal::None)
            .unwrap_or(MidiSignal::None);
        let channels: HashMap<&String, Vec<SessionChannel>> = blocks
            .iter()
            .map(|(name, block)| (*name, self.session_channels(name, block)))
            .collect();

        let mut sent = 0;
        for (receiver, receiver_block) in blocks.iter() {
            let mut left = vec![0.0f32; buffer_length];
            let mut right = vec![0.0f32; buffer_length];
            let mut session = SessionSetup::new();
            for (sender, block) in blocks.iter() {
                let is_for_sender = sender == receiver;
                buffer_mixdown(&mut left, &mut right, block, is_for_sender);
                if !is_for_sender {
                    if let Some(c) = channels.get(sender) {
                        session.channels.extend_from_slice(c);
                    }
                }
            }
            let mix = AudioBlock {
                timestamp: receiver_block.timestamp,
                message_counter: receiver_block.message_counter,
                server_time: self.server_time,
                bpm,
                midi_signal,
                sample_rate: receiver_block.sample_rate,
                channel_setup: self.mixdown_setup,
                audio: vec![left, right],
            };
            let package = OutgoingPackage::Mix(MixPackage {
                target: receiver.to_string(),
                block: Arc::new(mix),
                session_setup: Arc::new(session),
            });
            match self.outgoing_tx.try_send(package) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    bail!("send queue overflow at {} packages, network down?", self.outgoing_tx.len())
                }
                Err(TrySendError::Disconnected(_)) => {
                    if self.exit.load(Ordering::Acquire) {
                        info!("send thread stopped, mixer done");
                        return Ok(sent);
                    }
                    bail!("send thread is gone")
                }
            }
        }
        self.server_time += buffer_length as u64;
        Ok(sent)
    }
}
