//! thread that reads whatever the server sends back to a client
//!
//! Audio goes to the handler the client was started with.  ClientInfo and
//! SessionSetup snapshots are parked in [`ReceiveState`] for whoever wants to
//! show them.  ApplyLocalVolume requests go over an mpsc channel to the engine.
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread::sleep,
    time::Duration,
};

use crate::common::{
    box_error::BoxError,
    buffers_config::MAX_FRAME_SIZE,
    client_info::ClientInfoMessage,
    control_message::{clamp_volume_percent, ApplyLocalVolume, ControlMessage},
    encryption::PacketCipher,
    get_milli_time,
    jam_packet::{AudioData, JamMessage},
    session_info::SessionSetup,
    LogOnce,
};

pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// called with every audio packet from the server
pub type AudioHandler = Box<dyn FnMut(AudioData) + Send>;

/// What the receive thread learned, shared with the client
#[derive(Debug, Default)]
pub struct ReceiveState {
    receiving: AtomicBool,
    rtt_bits: AtomicU64,
    client_info: Mutex<Option<Arc<ClientInfoMessage>>>,
    session_setup: Mutex<Option<Arc<SessionSetup>>>,
}

impl ReceiveState {
    pub fn new() -> ReceiveState {
        ReceiveState::default()
    }
    /// false once the server has been quiet for a receive timeout
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }
    /// milliseconds from our timestamp to the mix coming back
    pub fn current_rtt(&self) -> f64 {
        f64::from_bits(self.rtt_bits.load(Ordering::Relaxed))
    }
    pub fn client_info(&self) -> Option<Arc<ClientInfoMessage>> {
        self.client_info.lock().clone()
    }
    pub fn session_setup(&self) -> Option<Arc<SessionSetup>> {
        self.session_setup.lock().clone()
    }
    fn set_receiving(&self, receiving: bool) {
        self.receiving.store(receiving, Ordering::Release);
    }
    fn set_rtt(&self, rtt: f64) {
        self.rtt_bits.store(rtt.to_bits(), Ordering::Relaxed);
    }
}

pub struct ReceiveThread {
    sock: UdpSocket,
    server: SocketAddr,
    cipher: Arc<dyn PacketCipher>,
    state: Arc<ReceiveState>,
    on_audio: AudioHandler,
    volume_tx: mpsc::Sender<ApplyLocalVolume>,
    // last applied sequence per (source client, channel)
    applied: HashMap<(u32, u16), u64>,
    exit: Arc<AtomicBool>,
    decrypt_errors: LogOnce,
    decode_errors: LogOnce,
    socket_errors: LogOnce,
}

impl ReceiveThread {
    pub fn new(
        sock: UdpSocket,
        server: SocketAddr,
        cipher: Arc<dyn PacketCipher>,
        state: Arc<ReceiveState>,
        on_audio: AudioHandler,
        volume_tx: mpsc::Sender<ApplyLocalVolume>,
        exit: Arc<AtomicBool>,
    ) -> ReceiveThread {
        ReceiveThread {
            sock,
            server,
            cipher,
            state,
            on_audio,
            volume_tx,
            applied: HashMap::new(),
            exit,
            decrypt_errors: LogOnce::new(),
            decode_errors: LogOnce::new(),
            socket_errors: LogOnce::new(),
        }
    }

    pub fn run(&mut self) -> Result<(), BoxError> {
        info!("receive thread listening for {}", self.server);
        self.sock.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        while !self.exit.load(Ordering::Acquire) {
            match self.sock.recv_from(&mut buf) {
                Ok((amt, src)) => self.handle_datagram(&buf[..amt], src, get_milli_time()),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    if self.state.is_receiving() {
                        info!("server {} went quiet", self.server);
                    }
                    self.state.set_receiving(false);
                }
                Err(e) => {
                    // ICMP errors and the like, keep listening
                    if self.socket_errors.first() {
                        warn!("receive error: {}", e);
                    }
                    self.state.set_receiving(false);
                    sleep(Duration::from_millis(10));
                }
            }
        }
        info!("receive thread exit");
        Ok(())
    }

    pub fn handle_datagram(&mut self, data: &[u8], src: SocketAddr, now_ms: f64) {
        let plain = match self.cipher.decrypt(data) {
            Ok(plain) => plain,
            Err(e) => {
                if self.decrypt_errors.first() {
                    warn!("cannot decrypt packet from {}: {}", src, e);
                }
                return;
            }
        };
        if src != self.server {
            trace!("ignoring packet from {}", src);
            return;
        }
        let msg = match JamMessage::deserialize(&plain) {
            Some(msg) => msg,
            None => {
                if self.decode_errors.first() {
                    warn!("bad packet from server, {} bytes", plain.len());
                }
                return;
            }
        };
        match msg {
            JamMessage::AudioData(audio) => {
                self.state.set_rtt(now_ms - audio.timestamp());
                self.state.set_receiving(true);
                (self.on_audio)(audio);
            }
            JamMessage::ClientInfo(info) => {
                *self.state.client_info.lock() = Some(Arc::new(info));
            }
            JamMessage::SessionSetup(setup) => {
                debug!("session: {}", setup);
                *self.state.session_setup.lock() = Some(Arc::new(setup));
            }
            JamMessage::Control(value) => self.process_control(&value),
            JamMessage::Flare => (),
        }
    }

    fn process_control(&mut self, value: &serde_json::Value) {
        match ControlMessage::from_json(value) {
            Ok(ControlMessage::ApplyLocalVolume(apply)) => {
                let key = (apply.source_client_id, apply.target_channel_index);
                if let Some(seq) = apply.command_sequence {
                    if let Some(last) = self.applied.get(&key) {
                        if seq <= *last {
                            debug!("stale volume command {} from {}", seq, apply.source_client_id);
                            return;
                        }
                    }
                    self.applied.insert(key, seq);
                }
                let apply = ApplyLocalVolume {
                    volume_percent: clamp_volume_percent(apply.volume_percent),
                    ..apply
                };
                if self.volume_tx.send(apply).is_err() {
                    debug!("nobody listening for volume commands");
                }
            }
            Ok(other) => warn!("unexpected control from server: {:?}", other),
            Err(e) => warn!("bad control message {}: {}", value, e),
        }
    }
}

#[cfg(test)]
mod test_receive_thread {
    use super::*;
    use crate::common::{
        encryption::{MockPacketCipher, Plaintext},
        jam_packet::{AudioBlock, ChannelSetup},
    };
    use serde_json::json;

    fn build(cipher: Arc<dyn PacketCipher>) -> (ReceiveThread, mpsc::Receiver<AudioData>, mpsc::Receiver<ApplyLocalVolume>) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        let (audio_tx, audio_rx) = mpsc::channel();
        let (volume_tx, volume_rx) = mpsc::channel();
        let thread = ReceiveThread::new(
            sock,
            server,
            cipher,
            Arc::new(ReceiveState::new()),
            Box::new(move |audio: AudioData| {
                let _ = audio_tx.send(audio);
            }),
            volume_tx,
            Arc::new(AtomicBool::new(false)),
        );
        (thread, audio_rx, volume_rx)
    }
    fn server() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }
    fn audio_bytes(counter: u64, timestamp: f64) -> Vec<u8> {
        let block = AudioBlock::new(timestamp, counter, 48000, ChannelSetup::stereo(), vec![vec![0.5; 128], vec![0.5; 128]]);
        JamMessage::AudioData(AudioData::new(Arc::new(block), None)).serialize().unwrap()
    }
    fn volume_bytes(source: u32, channel: u16, volume: f32, seq: Option<u64>) -> Vec<u8> {
        let mut body = json!({"target_channel_index": channel, "volume_percent": volume, "source_client_id": source});
        if let Some(seq) = seq {
            body["command_sequence"] = json!(seq);
        }
        JamMessage::Control(json!({ "ApplyLocalVolume": body })).serialize().unwrap()
    }

    #[test]
    fn audio_and_rtt() {
        // It should hand audio to the handler and measure the round trip
        let (mut thread, audio_rx, _volume_rx) = build(Arc::new(Plaintext));
        assert!(!thread.state.is_receiving());
        thread.handle_datagram(&audio_bytes(12, 1000.0), server(), 1025.0);
        let audio = audio_rx.try_recv().unwrap();
        assert_eq!(audio.message_counter(), 12);
        assert!(thread.state.is_receiving());
        assert_eq!(thread.state.current_rtt(), 25.0);
    }
    #[test]
    fn ignores_strangers() {
        // It should drop packets that did not come from the server
        let (mut thread, audio_rx, _volume_rx) = build(Arc::new(Plaintext));
        thread.handle_datagram(&audio_bytes(12, 1000.0), "127.0.0.1:9999".parse().unwrap(), 1025.0);
        assert!(audio_rx.try_recv().is_err());
        assert!(!thread.state.is_receiving());
    }
    #[test]
    fn snapshots() {
        let (mut thread, _audio_rx, _volume_rx) = build(Arc::new(Plaintext));
        assert!(thread.state.client_info().is_none());
        let mut info = ClientInfoMessage::new();
        info.add_client_info("10.0.0.1:1234".parse().unwrap(), Default::default());
        thread.handle_datagram(&JamMessage::ClientInfo(info).serialize().unwrap(), server(), 0.0);
        assert_eq!(thread.state.client_info().unwrap().num_clients(), 1);

        let setup = SessionSetup::new();
        thread.handle_datagram(&JamMessage::SessionSetup(setup).serialize().unwrap(), server(), 0.0);
        assert!(thread.state.session_setup().unwrap().is_empty());
    }
    #[test]
    fn volume_commands() {
        // It should clamp, forward, and drop repeated sequences per source and channel
        let (mut thread, _audio_rx, volume_rx) = build(Arc::new(Plaintext));
        thread.handle_datagram(&volume_bytes(3, 0, 150.0, Some(5)), server(), 0.0);
        let apply = volume_rx.try_recv().unwrap();
        assert_eq!(apply.volume_percent, 100.0);
        assert_eq!(apply.source_client_id, 3);

        thread.handle_datagram(&volume_bytes(3, 0, 20.0, Some(5)), server(), 0.0);
        thread.handle_datagram(&volume_bytes(3, 0, 20.0, Some(4)), server(), 0.0);
        assert!(volume_rx.try_recv().is_err());

        // other channel, other source, no sequence all go through
        thread.handle_datagram(&volume_bytes(3, 1, 20.0, Some(1)), server(), 0.0);
        thread.handle_datagram(&volume_bytes(4, 0, 20.0, Some(1)), server(), 0.0);
        thread.handle_datagram(&volume_bytes(3, 0, -5.0, None), server(), 0.0);
        assert_eq!(volume_rx.try_recv().unwrap().target_channel_index, 1);
        assert_eq!(volume_rx.try_recv().unwrap().source_client_id, 4);
        assert_eq!(volume_rx.try_recv().unwrap().volume_percent, 0.0);
    }
    #[test]
    fn decrypt_failure() {
        // It should drop what it cannot decrypt
        let mut cipher = MockPacketCipher::new();
        cipher.expect_decrypt().returning(|_| Err("bad key".into()));
        let (mut thread, audio_rx, _volume_rx) = build(Arc::new(cipher));
        thread.handle_datagram(&audio_bytes(12, 1000.0), server(), 1025.0);
        thread.handle_datagram(&audio_bytes(13, 1000.0), server(), 1025.0);
        assert!(audio_rx.try_recv().is_err());
    }
    #[test]
    fn quiet_server() {
        // It should stop when asked even with nothing arriving
        let (mut thread, _audio_rx, _volume_rx) = build(Arc::new(Plaintext));
        thread.state.set_receiving(true);
        let exit = thread.exit.clone();
        let state = thread.state.clone();
        let handle = std::thread::spawn(move || thread.run());
        sleep(Duration::from_millis(700));
        assert!(!state.is_receiving());
        exit.store(true, Ordering::Release);
        handle.join().unwrap().unwrap();
    }
}
