//! the netmix client: send path plus the thread that listens for the mix
//!
//! A [`Client`] owns the socket.  Every [`Client::send_data`] numbers a block,
//! attaches the previous block as FEC, encrypts and sends it.  [`Client::start`]
//! spawns a [`ReceiveThread`] on a clone of the socket that lives until the
//! client is dropped.
use log::{debug, error, warn};
use serde_json::Value;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
};

use super::{
    jam_socket::JamSocket,
    receive_thread::{AudioHandler, ReceiveState, ReceiveThread},
};
use crate::common::{
    box_error::BoxError,
    buffers_config::{FEC_RINGBUFFER_SIZE, MAX_FRAME_SIZE, SAMPLE_RATE},
    client_info::ClientInfoMessage,
    control_message::{clamp_volume_percent, ApplyLocalVolume, ControlMessage, SetRemoteVolume},
    encryption::PacketCipher,
    get_milli_time,
    jam_packet::{AudioBlock, AudioData, ChannelSetup, JamMessage},
    ring_buffer::RingBuffer,
    session_info::SessionSetup,
    LogOnce,
};

/// the server pads in front of the first packet, so leave room below it
pub const FIRST_MESSAGE_COUNTER: u64 = 10;
/// clients bind somewhere in CLIENT_BASE_PORT..+CLIENT_PORT_SPREAD
pub const CLIENT_BASE_PORT: u16 = 8888;
pub const CLIENT_PORT_SPREAD: u16 = 64;

pub struct Client {
    sock: JamSocket,
    server: SocketAddr,
    cipher: Arc<dyn PacketCipher>,
    message_counter: u64,
    command_sequence: u64,
    use_fec: bool,
    fec_history: RingBuffer<Arc<AudioBlock>>,
    // block pushed out of the FEC ring, its buffers get reused for the next frame
    spare: Option<AudioBlock>,
    recycled: u64,
    send_buffer: Vec<u8>,
    state: Arc<ReceiveState>,
    exit: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    encrypt_errors: LogOnce,
}

impl Client {
    /// Start talking to the server the socket is connected to
    pub fn start(
        sock: JamSocket,
        cipher: Arc<dyn PacketCipher>,
        on_audio: AudioHandler,
        volume_tx: mpsc::Sender<ApplyLocalVolume>,
    ) -> Result<Client, BoxError> {
        let server = match sock.server_addr() {
            Some(addr) => addr,
            None => simple_error::bail!("client socket has no server"),
        };
        let state = Arc::new(ReceiveState::new());
        let exit = Arc::new(AtomicBool::new(false));
        let mut receive = ReceiveThread::new(
            sock.try_clone_socket()?,
            server,
            cipher.clone(),
            state.clone(),
            on_audio,
            volume_tx,
            exit.clone(),
        );
        let receiver = thread::Builder::new().name("receive".to_string()).spawn(move || {
            if let Err(e) = receive.run() {
                error!("receive thread died: {}", e);
            }
        })?;
        Ok(Client {
            sock,
            server,
            cipher,
            message_counter: FIRST_MESSAGE_COUNTER,
            command_sequence: 0,
            use_fec: true,
            fec_history: RingBuffer::new(FEC_RINGBUFFER_SIZE),
            spare: None,
            recycled: 0,
            send_buffer: Vec::with_capacity(MAX_FRAME_SIZE),
            state,
            exit,
            receiver: Some(receiver),
            encrypt_errors: LogOnce::new(),
        })
    }

    /// Send one frame of local audio, one slice per channel.
    ///
    /// Once the FEC ring has filled up this does not allocate for the audio: the block
    /// falling out of the ring is reused for the next frame.
    pub fn send_data(&mut self, channel_setup: ChannelSetup, channels: &[&[f32]]) -> Result<(), BoxError> {
        let block = Arc::new(self.next_block(channel_setup, channels));
        self.message_counter += 1;
        let fec = match self.use_fec {
            true => self.fec_history.last().cloned(),
            false => None,
        };
        if let Some(oldest) = self.fec_history.push(block.clone()) {
            if let Ok(oldest) = Arc::try_unwrap(oldest) {
                self.spare = Some(oldest);
            }
        }
        JamMessage::AudioData(AudioData::new(block, fec)).serialize_into(&mut self.send_buffer)?;
        self.transmit()
    }

    fn next_block(&mut self, channel_setup: ChannelSetup, channels: &[&[f32]]) -> AudioBlock {
        let timestamp = get_milli_time();
        match self.spare.take() {
            Some(mut block) => {
                block.timestamp = timestamp;
                block.message_counter = self.message_counter;
                block.channel_setup = channel_setup;
                block.audio.resize_with(channels.len(), Vec::new);
                for (dst, src) in block.audio.iter_mut().zip(channels.iter()) {
                    dst.clear();
                    dst.extend_from_slice(src);
                }
                self.recycled += 1;
                block
            }
            None => AudioBlock::new(
                timestamp,
                self.message_counter,
                SAMPLE_RATE,
                channel_setup,
                channels.iter().map(|c| c.to_vec()).collect(),
            ),
        }
    }

    pub fn send_control(&mut self, msg: &ControlMessage) -> Result<(), BoxError> {
        self.send_json(msg.to_json()?)
    }

    fn send_json(&mut self, value: Value) -> Result<(), BoxError> {
        JamMessage::Control(value).serialize_into(&mut self.send_buffer)?;
        self.transmit()
    }

    /// Decoy packet, the server ignores it
    pub fn send_flare(&mut self) -> Result<(), BoxError> {
        JamMessage::Flare.serialize_into(&mut self.send_buffer)?;
        self.transmit()
    }

    /// FEC on our own packets, and ask the server to do the same for us
    pub fn set_send_fec_data(&mut self, enabled: bool) -> Result<(), BoxError> {
        self.use_fec = enabled;
        self.send_control(&ControlMessage::Fec(enabled))
    }

    /// Ask client `target_client_id` to change the volume of its channel `channel`.
    /// Returns the sequence number used.
    pub fn send_remote_volume(
        &mut self,
        target_client_id: u32,
        channel: u16,
        volume_percent: f32,
    ) -> Result<u64, BoxError> {
        self.command_sequence += 1;
        let msg = ControlMessage::SetRemoteVolume(SetRemoteVolume {
            target_client_id,
            target_channel_index: channel,
            volume_percent: clamp_volume_percent(volume_percent),
            command_sequence: Some(self.command_sequence),
        });
        self.send_control(&msg)?;
        Ok(self.command_sequence)
    }

    /// encrypt and send whatever is in the send buffer
    fn transmit(&mut self) -> Result<(), BoxError> {
        match self.cipher.encrypt(&self.send_buffer) {
            Ok(sealed) => {
                self.sock.send(&sealed)?;
            }
            Err(e) => {
                // never fall back to plaintext
                if self.encrypt_errors.first() {
                    warn!("encryption failed, dropping packets: {}", e);
                }
            }
        }
        Ok(())
    }

    pub fn is_receiving(&self) -> bool {
        self.state.is_receiving()
    }
    pub fn current_rtt(&self) -> f64 {
        self.state.current_rtt()
    }
    pub fn client_info(&self) -> Option<Arc<ClientInfoMessage>> {
        self.state.client_info()
    }
    pub fn session_setup(&self) -> Option<Arc<SessionSetup>> {
        self.state.session_setup()
    }
    /// shared view of the receive side, usable after the client moves into the audio thread
    pub fn receive_state(&self) -> Arc<ReceiveState> {
        self.state.clone()
    }
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }
    pub fn message_counter(&self) -> u64 {
        self.message_counter
    }
    pub fn fec_enabled(&self) -> bool {
        self.use_fec
    }
    /// frames built from a reused block
    pub fn recycled_frames(&self) -> u64 {
        self.recycled
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("receive thread panicked");
            }
        }
        debug!("client for {} stopped", self.server);
    }
}
