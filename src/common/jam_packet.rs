//! messages that go on the wire between the clients and the mixing server
//!
//! Every datagram starts with a four byte header, the magic bytes `123` and a message
//! type.  What follows depends on the type.  All multi byte values are little endian.
//!
//! Audio data is sent as planar 16 bit integers.  Samples are clamped to [-1, 1] and
//! scaled by 32767, so a round trip loses a little precision and nothing else.
//!
//! An audio packet can carry a second, reduced sample rate copy of the previous block.
//! If the previous packet is lost the receiver can rebuild it from that copy (see
//! [`crate::common::packet_stream`]).
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num::FromPrimitive;
use serde_json::Value;
use simple_error::bail;
use std::{
    fmt,
    io::{Cursor, Read},
    sync::Arc,
};

use super::{
    box_error::BoxError,
    buffers_config::{FEC_SAMPLERATE_REDUCTION, MAX_FRAME_SIZE},
    client_info::ClientInfoMessage,
    session_info::SessionSetup,
};

pub const MAGIC: [u8; 3] = *b"123";
pub const HEADER_SIZE: usize = 4;
pub const MAX_CHANNELS_PER_CLIENT: usize = 4;

const CHANNEL_SETUP_SIZE: usize = MAX_CHANNELS_PER_CLIENT * (1 + 4 + 4);
/// fixed part of an audio block before the samples start
pub const AUDIO_BLOCK_HEADER_SIZE: usize = 8 + 8 + CHANNEL_SETUP_SIZE + 1 + 2 + 2 + 8 + 4 + 1;

#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    AudioData = 1,
    ClientInfo = 8,
    SessionSetup = 16,
    Control = 32,
    /// NAT hole punch, no payload
    Flare = 255,
}

/// where a channel goes in the mix
#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelTarget {
    #[default]
    Unused = 0,
    Left = 1,
    Right = 2,
    Mono = 3,
    /// like Mono but never echoed back to the sender
    SendMono = 4,
    SendLeft = 5,
    SendRight = 6,
    Mute = 7,
}

impl ChannelTarget {
    pub fn is_send_only(&self) -> bool {
        matches!(
            self,
            ChannelTarget::SendMono | ChannelTarget::SendLeft | ChannelTarget::SendRight
        )
    }
}

#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MidiSignal {
    #[default]
    None = 0,
    Start = 1,
    Stop = 2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleChannelSetup {
    pub target: ChannelTarget,
    pub volume: f32,
    /// -1 hard left, 0 center, 1 hard right
    pub balance: f32,
}

impl SingleChannelSetup {
    pub fn new(target: ChannelTarget, volume: f32, balance: f32) -> SingleChannelSetup {
        SingleChannelSetup {
            target,
            volume,
            balance,
        }
    }
}

impl Default for SingleChannelSetup {
    fn default() -> SingleChannelSetup {
        SingleChannelSetup::new(ChannelTarget::Unused, 1.0, 0.0)
    }
}

/// routing for the (up to four) channels of one sender
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelSetup {
    pub channels: [SingleChannelSetup; MAX_CHANNELS_PER_CLIENT],
}

impl ChannelSetup {
    pub fn new(setups: &[SingleChannelSetup]) -> ChannelSetup {
        let mut channels = [SingleChannelSetup::default(); MAX_CHANNELS_PER_CLIENT];
        for (slot, setup) in channels.iter_mut().zip(setups.iter()) {
            *slot = *setup;
        }
        ChannelSetup { channels }
    }
    /// channel 0 left, channel 1 right.  This is what a mixdown looks like.
    pub fn stereo() -> ChannelSetup {
        ChannelSetup::new(&[
            SingleChannelSetup::new(ChannelTarget::Left, 1.0, 0.0),
            SingleChannelSetup::new(ChannelTarget::Right, 1.0, 0.0),
        ])
    }
    /// single channel in the middle
    pub fn mono() -> ChannelSetup {
        ChannelSetup::new(&[SingleChannelSetup::new(ChannelTarget::Mono, 1.0, 0.0)])
    }
}

/// One frame of audio plus the stuff that travels with it.
///
/// Once built it gets wrapped in an Arc and never changes, so the
/// queues and FEC rings can share it freely.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    /// sender wall clock in milliseconds
    pub timestamp: f64,
    pub message_counter: u64,
    /// server sample clock, zero from clients
    pub server_time: u64,
    pub bpm: f32,
    pub midi_signal: MidiSignal,
    pub sample_rate: u16,
    pub channel_setup: ChannelSetup,
    /// planar, one Vec per channel, all the same length
    pub audio: Vec<Vec<f32>>,
}

impl AudioBlock {
    pub fn new(
        timestamp: f64,
        message_counter: u64,
        sample_rate: u16,
        channel_setup: ChannelSetup,
        audio: Vec<Vec<f32>>,
    ) -> AudioBlock {
        AudioBlock {
            timestamp,
            message_counter,
            server_time: 0,
            bpm: 0.0,
            midi_signal: MidiSignal::None,
            sample_rate,
            channel_setup,
            audio,
        }
    }
    pub fn num_channels(&self) -> usize {
        self.audio.len()
    }
    pub fn num_samples(&self) -> usize {
        self.audio.first().map_or(0, |c| c.len())
    }
    /// same block under a different counter
    pub fn renumbered(&self, message_counter: u64) -> AudioBlock {
        AudioBlock {
            message_counter,
            ..self.clone()
        }
    }
    /// same shape and metadata, all samples zero
    pub fn silent(&self, message_counter: u64) -> AudioBlock {
        AudioBlock {
            message_counter,
            audio: vec![vec![0.0; self.num_samples()]; self.num_channels()],
            ..self.clone()
        }
    }
}

/// An audio packet: the block itself and maybe the FEC copy of the block before it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    block: Arc<AudioBlock>,
    fec: Option<Arc<AudioBlock>>,
}

impl AudioData {
    pub fn new(block: Arc<AudioBlock>, fec: Option<Arc<AudioBlock>>) -> AudioData {
        AudioData { block, fec }
    }
    pub fn message_counter(&self) -> u64 {
        self.block.message_counter
    }
    pub fn timestamp(&self) -> f64 {
        self.block.timestamp
    }
    pub fn audio_block(&self) -> Arc<AudioBlock> {
        self.block.clone()
    }
    pub fn fec_block(&self) -> Option<Arc<AudioBlock>> {
        self.fec.clone()
    }
    /// Rebuild packet `missing` from the FEC data, if the copy we carry is that packet.
    pub fn fill_in_from_fec(&self, missing: u64) -> Option<AudioData> {
        match &self.fec {
            Some(fec) if fec.message_counter == missing => Some(AudioData::new(fec.clone(), None)),
            _ => None,
        }
    }
    /// Silent packet numbered one before this one.  None when there is no "before".
    pub fn create_prepadding(&self) -> Option<AudioData> {
        let counter = self.message_counter().checked_sub(1)?;
        Some(AudioData::new(Arc::new(self.block.silent(counter)), None))
    }
}

/// Everything that can arrive in a datagram
#[derive(Debug, Clone, PartialEq)]
pub enum JamMessage {
    AudioData(AudioData),
    ClientInfo(ClientInfoMessage),
    SessionSetup(SessionSetup),
    Control(Value),
    Flare,
}

impl JamMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            JamMessage::AudioData(_) => MessageType::AudioData,
            JamMessage::ClientInfo(_) => MessageType::ClientInfo,
            JamMessage::SessionSetup(_) => MessageType::SessionSetup,
            JamMessage::Control(_) => MessageType::Control,
            JamMessage::Flare => MessageType::Flare,
        }
    }

    /// Turn a message into bytes for the socket (before encryption)
    pub fn serialize(&self) -> Result<Vec<u8>, BoxError> {
        let mut out = Vec::with_capacity(1024);
        self.serialize_into(&mut out)?;
        Ok(out)
    }

    /// Same as [`JamMessage::serialize`] but into a buffer the caller keeps between calls
    pub fn serialize_into(&self, out: &mut Vec<u8>) -> Result<(), BoxError> {
        out.clear();
        out.extend_from_slice(&MAGIC);
        out.write_u8(self.message_type() as u8)?;
        match self {
            JamMessage::AudioData(data) => {
                write_audio_block(out, &data.block, 1)?;
                if let Some(fec) = &data.fec {
                    write_audio_block(out, fec, FEC_SAMPLERATE_REDUCTION)?;
                }
            }
            JamMessage::ClientInfo(info) => info.write_body(out)?,
            JamMessage::SessionSetup(setup) => setup.write_body(out)?,
            JamMessage::Control(value) => {
                let text = value.to_string();
                out.write_u32::<LittleEndian>(text.len() as u32)?;
                out.extend_from_slice(text.as_bytes());
            }
            JamMessage::Flare => {}
        }
        if out.len() > MAX_FRAME_SIZE {
            bail!("message of {} bytes exceeds the maximum frame size", out.len());
        }
        Ok(())
    }

    /// Parse bytes from the socket (after decryption).  None for anything malformed.
    pub fn deserialize(data: &[u8]) -> Option<JamMessage> {
        if data.len() < HEADER_SIZE || data[0..3] != MAGIC {
            return None;
        }
        let mut cur = Cursor::new(&data[HEADER_SIZE..]);
        match MessageType::from_u8(data[3])? {
            MessageType::AudioData => {
                let block = read_audio_block(&mut cur)?;
                let fec = if remaining(&cur) > 0 {
                    Some(Arc::new(upsample(
                        read_audio_block(&mut cur)?,
                        block.sample_rate,
                        block.num_samples(),
                    )?))
                } else {
                    None
                };
                if remaining(&cur) > 0 {
                    return None;
                }
                Some(JamMessage::AudioData(AudioData::new(Arc::new(block), fec)))
            }
            MessageType::ClientInfo => Some(JamMessage::ClientInfo(ClientInfoMessage::read_body(&mut cur)?)),
            MessageType::SessionSetup => Some(JamMessage::SessionSetup(SessionSetup::read_body(&mut cur)?)),
            MessageType::Control => {
                let len = cur.read_u32::<LittleEndian>().ok()? as usize;
                if remaining(&cur) != len {
                    return None;
                }
                let mut text = vec![0u8; len];
                cur.read_exact(&mut text).ok()?;
                let text = String::from_utf8(text).ok()?;
                serde_json::from_str(&text).ok().map(JamMessage::Control)
            }
            MessageType::Flare => Some(JamMessage::Flare),
        }
    }
}

impl fmt::Display for JamMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JamMessage::AudioData(data) => write!(
                f,
                "{{ audio: {}, channels: {}, samples: {}, fec: {} }}",
                data.message_counter(),
                data.block.num_channels(),
                data.block.num_samples(),
                data.fec.is_some()
            ),
            JamMessage::ClientInfo(info) => write!(f, "{{ client_info: {} }}", info.num_clients()),
            JamMessage::SessionSetup(setup) => write!(f, "{{ session_setup: {} }}", setup),
            JamMessage::Control(value) => write!(f, "{{ control: {} }}", value),
            JamMessage::Flare => write!(f, "{{ flare }}"),
        }
    }
}

pub(crate) fn remaining(cur: &Cursor<&[u8]>) -> usize {
    cur.get_ref().len().saturating_sub(cur.position() as usize)
}

fn to_i16(v: f32) -> i16 {
    (v.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

fn to_f32(v: i16) -> f32 {
    v as f32 / 32767.0
}

fn write_audio_block(out: &mut Vec<u8>, block: &AudioBlock, reduction: u16) -> Result<(), BoxError> {
    let samples = block.num_samples();
    if block.num_channels() > MAX_CHANNELS_PER_CLIENT {
        bail!("audio block has {} channels", block.num_channels());
    }
    if samples > u16::MAX as usize || block.audio.iter().any(|c| c.len() != samples) {
        bail!("audio block has a bad channel length");
    }
    let step = reduction.max(1) as usize;
    // keep the odd last sample, the receiver trims the upsampled copy back to length
    let written = (samples + step - 1) / step;
    out.write_f64::<LittleEndian>(block.timestamp)?;
    out.write_u64::<LittleEndian>(block.message_counter)?;
    for setup in block.channel_setup.channels.iter() {
        out.write_u8(setup.target as u8)?;
        out.write_f32::<LittleEndian>(setup.volume)?;
        out.write_f32::<LittleEndian>(setup.balance)?;
    }
    out.write_u8(block.num_channels() as u8)?;
    out.write_u16::<LittleEndian>(written as u16)?;
    out.write_u16::<LittleEndian>(block.sample_rate / step as u16)?;
    out.write_u64::<LittleEndian>(block.server_time)?;
    out.write_f32::<LittleEndian>(block.bpm)?;
    out.write_u8(block.midi_signal as u8)?;
    for channel in block.audio.iter() {
        for sample in channel.iter().step_by(step).take(written) {
            out.write_i16::<LittleEndian>(to_i16(*sample))?;
        }
    }
    Ok(())
}

fn read_audio_block(cur: &mut Cursor<&[u8]>) -> Option<AudioBlock> {
    let timestamp = cur.read_f64::<LittleEndian>().ok()?;
    let message_counter = cur.read_u64::<LittleEndian>().ok()?;
    let mut channels = [SingleChannelSetup::default(); MAX_CHANNELS_PER_CLIENT];
    for setup in channels.iter_mut() {
        let target = ChannelTarget::from_u8(cur.read_u8().ok()?)?;
        let volume = cur.read_f32::<LittleEndian>().ok()?;
        let balance = cur.read_f32::<LittleEndian>().ok()?;
        *setup = SingleChannelSetup::new(target, volume, balance);
    }
    let num_channels = cur.read_u8().ok()? as usize;
    let num_samples = cur.read_u16::<LittleEndian>().ok()? as usize;
    let sample_rate = cur.read_u16::<LittleEndian>().ok()?;
    let server_time = cur.read_u64::<LittleEndian>().ok()?;
    let bpm = cur.read_f32::<LittleEndian>().ok()?;
    let midi_signal = MidiSignal::from_u8(cur.read_u8().ok()?)?;
    if num_channels > MAX_CHANNELS_PER_CLIENT || remaining(cur) < num_channels * num_samples * 2 {
        return None;
    }
    let mut audio = Vec::with_capacity(num_channels);
    for _ in 0..num_channels {
        let mut channel = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            channel.push(to_f32(cur.read_i16::<LittleEndian>().ok()?));
        }
        audio.push(channel);
    }
    Some(AudioBlock {
        timestamp,
        message_counter,
        server_time,
        bpm,
        midi_signal,
        sample_rate,
        channel_setup: ChannelSetup { channels },
        audio,
    })
}

/// Nearest neighbour upsample of a reduced rate FEC block back to the primary rate and
/// length.  Short results are padded with their last sample.
fn upsample(block: AudioBlock, primary_rate: u16, primary_samples: usize) -> Option<AudioBlock> {
    if block.sample_rate == 0 || primary_rate % block.sample_rate != 0 {
        return None;
    }
    let factor = (primary_rate / block.sample_rate) as usize;
    let audio = block
        .audio
        .iter()
        .map(|channel| {
            let last = channel.last().copied().unwrap_or(0.0);
            channel
                .iter()
                .flat_map(|s| std::iter::repeat(*s).take(factor))
                .chain(std::iter::repeat(last))
                .take(primary_samples)
                .collect()
        })
        .collect();
    Some(AudioBlock {
        sample_rate: primary_rate,
        audio,
        ..block
    })
}

#[cfg(test)]
mod test_jam_packet {
    use super::*;
    use crate::common::buffers_config::{SAMPLE_BUFFER_SIZE, SAMPLE_RATE};

    fn ramp_block(counter: u64) -> AudioBlock {
        let left: Vec<f32> = (0..SAMPLE_BUFFER_SIZE).map(|i| i as f32 / 200.0).collect();
        let right: Vec<f32> = left.iter().map(|v| -v).collect();
        AudioBlock::new(1234.5, counter, SAMPLE_RATE, ChannelSetup::stereo(), vec![left, right])
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= 1.0 / 32767.0)
    }

    #[test]
    fn audio_round_trip() {
        // It should come back within one quantization step
        let mut block = ramp_block(42);
        block.server_time = 777;
        block.bpm = 120.0;
        block.midi_signal = MidiSignal::Start;
        let msg = JamMessage::AudioData(AudioData::new(Arc::new(block.clone()), None));
        let bytes = msg.serialize().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + AUDIO_BLOCK_HEADER_SIZE + 2 * SAMPLE_BUFFER_SIZE * 2);
        match JamMessage::deserialize(&bytes) {
            Some(JamMessage::AudioData(data)) => {
                let back = data.audio_block();
                assert_eq!(back.message_counter, 42);
                assert_eq!(back.timestamp, 1234.5);
                assert_eq!(back.server_time, 777);
                assert_eq!(back.bpm, 120.0);
                assert_eq!(back.midi_signal, MidiSignal::Start);
                assert_eq!(back.sample_rate, SAMPLE_RATE);
                assert_eq!(back.channel_setup, ChannelSetup::stereo());
                assert!(close(&back.audio[0], &block.audio[0]));
                assert!(close(&back.audio[1], &block.audio[1]));
                assert!(data.fec_block().is_none());
            }
            other => assert!(false, "unexpected decode {:?}", other),
        }
    }
    #[test]
    fn clamps_out_of_range() {
        let block = AudioBlock::new(0.0, 1, SAMPLE_RATE, ChannelSetup::mono(), vec![vec![2.0, -3.0, 0.5]]);
        let bytes = JamMessage::AudioData(AudioData::new(Arc::new(block), None))
            .serialize()
            .unwrap();
        if let Some(JamMessage::AudioData(data)) = JamMessage::deserialize(&bytes) {
            assert_eq!(data.audio_block().audio[0][0], 1.0);
            assert_eq!(data.audio_block().audio[0][1], -1.0);
        } else {
            assert!(false, "should decode");
        }
    }
    #[test]
    fn fec_is_upsampled() {
        // It should bring the half rate copy back to full length
        let previous = Arc::new(ramp_block(9));
        let current = Arc::new(ramp_block(10));
        let bytes = JamMessage::AudioData(AudioData::new(current, Some(previous.clone())))
            .serialize()
            .unwrap();
        let data = match JamMessage::deserialize(&bytes) {
            Some(JamMessage::AudioData(data)) => data,
            _ => panic!("should decode"),
        };
        let fec = data.fec_block().unwrap();
        assert_eq!(fec.message_counter, 9);
        assert_eq!(fec.sample_rate, SAMPLE_RATE);
        assert_eq!(fec.num_samples(), SAMPLE_BUFFER_SIZE);
        // every odd sample is a repeat of the even one before it
        assert_eq!(fec.audio[0][2], fec.audio[0][3]);
        assert!((fec.audio[0][2] - previous.audio[0][2]).abs() < 1.0 / 32767.0);
        assert!(data.fill_in_from_fec(9).is_some());
        assert!(data.fill_in_from_fec(8).is_none());
    }
    #[test]
    fn fec_odd_frame_length() {
        // It should heal to the same length as the primary block when the frame is odd
        let samples: Vec<f32> = (0..127).map(|i| i as f32 / 254.0).collect();
        let previous = Arc::new(AudioBlock::new(0.0, 4, SAMPLE_RATE, ChannelSetup::mono(), vec![samples.clone()]));
        let current = Arc::new(AudioBlock::new(0.0, 5, SAMPLE_RATE, ChannelSetup::mono(), vec![samples.clone()]));
        let bytes = JamMessage::AudioData(AudioData::new(current, Some(previous)))
            .serialize()
            .unwrap();
        // 64 FEC samples on the wire, the odd last one included
        assert_eq!(bytes.len(), HEADER_SIZE + 2 * AUDIO_BLOCK_HEADER_SIZE + 127 * 2 + 64 * 2);
        let data = match JamMessage::deserialize(&bytes) {
            Some(JamMessage::AudioData(data)) => data,
            _ => panic!("should decode"),
        };
        let fec = data.fill_in_from_fec(4).unwrap().audio_block();
        assert_eq!(data.audio_block().num_samples(), 127);
        assert_eq!(fec.num_samples(), 127);
        assert!((fec.audio[0][126] - samples[126]).abs() <= 1.0 / 32767.0);
        assert!((fec.audio[0][125] - samples[124]).abs() <= 1.0 / 32767.0);
    }
    #[test]
    fn rejects_garbage() {
        assert!(JamMessage::deserialize(&[]).is_none());
        assert!(JamMessage::deserialize(b"12").is_none());
        assert!(JamMessage::deserialize(&[b'4', b'5', b'6', 1]).is_none());
        // unknown type
        assert!(JamMessage::deserialize(&[b'1', b'2', b'3', 77]).is_none());
        // truncated audio
        let bytes = JamMessage::AudioData(AudioData::new(Arc::new(ramp_block(1)), None))
            .serialize()
            .unwrap();
        assert!(JamMessage::deserialize(&bytes).is_some());
        assert!(JamMessage::deserialize(&bytes[..bytes.len() - 1]).is_none());
        assert!(JamMessage::deserialize(&bytes[..HEADER_SIZE + 20]).is_none());
        assert!(JamMessage::deserialize(&bytes[..HEADER_SIZE + AUDIO_BLOCK_HEADER_SIZE + 10]).is_none());
    }
    #[test]
    fn unknown_channel_target() {
        let mut bytes = JamMessage::AudioData(AudioData::new(Arc::new(ramp_block(1)), None))
            .serialize()
            .unwrap();
        // first target byte sits right after timestamp and counter
        bytes[HEADER_SIZE + 16] = 42;
        assert!(JamMessage::deserialize(&bytes).is_none());
    }
    #[test]
    fn control_and_flare() {
        let value = serde_json::json!({ "FEC": false });
        let bytes = JamMessage::Control(value.clone()).serialize().unwrap();
        assert_eq!(JamMessage::deserialize(&bytes), Some(JamMessage::Control(value)));
        // length that does not match the payload
        let mut bad = bytes.clone();
        bad[HEADER_SIZE] += 1;
        assert!(JamMessage::deserialize(&bad).is_none());

        let flare = JamMessage::Flare.serialize().unwrap();
        assert_eq!(flare, vec![b'1', b'2', b'3', 255]);
        assert_eq!(JamMessage::deserialize(&flare), Some(JamMessage::Flare));
    }
    #[test]
    fn refuses_ragged_blocks() {
        let block = AudioBlock::new(0.0, 1, SAMPLE_RATE, ChannelSetup::stereo(), vec![vec![0.0; 4], vec![0.0; 3]]);
        assert!(JamMessage::AudioData(AudioData::new(Arc::new(block), None)).serialize().is_err());
    }
    #[test]
    fn prepadding() {
        let data = AudioData::new(Arc::new(ramp_block(5)), None);
        let pad = data.create_prepadding().unwrap();
        assert_eq!(pad.message_counter(), 4);
        assert!(pad.audio_block().audio[0].iter().all(|s| *s == 0.0));
        assert_eq!(pad.audio_block().num_samples(), SAMPLE_BUFFER_SIZE);
        let first = AudioData::new(Arc::new(ramp_block(0)), None);
        assert!(first.create_prepadding().is_none());
        assert!(ChannelTarget::SendLeft.is_send_only());
        assert!(!ChannelTarget::Mono.is_send_only());
    }
}
