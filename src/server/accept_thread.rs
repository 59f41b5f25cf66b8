//! listen for datagrams from the clients and sort them into the per sender queues
//!
//! The socket read times out every 250ms.  A timeout still wakes the mixer so a sender
//! that went quiet gets noticed and torn down.
use crossbeam_channel::Sender;
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::{
    io::ErrorKind,
    net::UdpSocket,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{
    client_registry::ClientIdentityRegistry,
    remote_volume::RemoteVolumeRouter,
    session_types::{ControlForward, PacketStreamBundle},
};
use crate::common::{
    box_error::BoxError,
    buffers_config::{ServerBufferConfig, MAX_FRAME_SIZE},
    control_message::ControlMessage,
    encryption::PacketCipher,
    get_micro_time,
    jam_packet::{AudioData, JamMessage},
    packet_stream::PacketStreamQueue,
    stream_time_stat::MicroTimer,
    LogOnce,
};

const READ_TIMEOUT: Duration = Duration::from_millis(250);
const QUALITY_LOG_INTERVAL: u128 = 5_000_000;

pub struct AcceptThread {
    sock: UdpSocket,
    incoming: Arc<PacketStreamBundle>,
    registry: Arc<ClientIdentityRegistry>,
    wake_tx: Sender<()>,
    control_tx: Sender<ControlForward>,
    cipher: Arc<dyn PacketCipher>,
    fec_preferences: Arc<DashMap<String, bool>>,
    router: RemoteVolumeRouter,
    buffer_config: ServerBufferConfig,
    exit: Arc<AtomicBool>,
    quality_timer: MicroTimer,
    decrypt_errors: LogOnce,
    decode_errors: LogOnce,
}

impl AcceptThread {
    pub fn new(
        sock: UdpSocket,
        incoming: Arc<PacketStreamBundle>,
        registry: Arc<ClientIdentityRegistry>,
        wake_tx: Sender<()>,
        control_tx: Sender<ControlForward>,
        cipher: Arc<dyn PacketCipher>,
        fec_preferences: Arc<DashMap<String, bool>>,
        router: RemoteVolumeRouter,
        buffer_config: ServerBufferConfig,
        exit: Arc<AtomicBool>,
    ) -> AcceptThread {
        AcceptThread {
            sock,
            incoming,
            registry,
            wake_tx,
            control_tx,
            cipher,
            fec_preferences,
            router,
            buffer_config,
            exit,
            quality_timer: MicroTimer::new(get_micro_time(), QUALITY_LOG_INTERVAL),
            decrypt_errors: LogOnce::new(),
            decode_errors: LogOnce::new(),
        }
    }

    /// Read until the exit flag goes up.  Any socket error other than a timeout ends it.
    pub fn run(&mut self) -> Result<(), BoxError> {
        self.sock.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        info!("accepting on {}", self.sock.local_addr()?);
        while !self.exit.load(Ordering::Acquire) {
            let now = get_micro_time();
            self.router.tick(now);
            self.log_quality(now);
            match self.sock.recv_from(&mut buf) {
                Ok((amt, src)) => self.handle_datagram(&buf[..amt], &src.to_string(), now),
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => self.wake(),
                    _ => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn log_quality(&mut self, now: u128) {
        if !self.quality_timer.expired(now) {
            return;
        }
        self.quality_timer.reset(now);
        for entry in self.incoming.iter() {
            if let Some(queue) = entry.value() {
                info!("{}", queue.quality_statement());
            }
        }
    }

    /// One datagram from `endpoint` ("ip:port")
    pub fn handle_datagram(&mut self, data: &[u8], endpoint: &str, now: u128) {
        let plain = match self.cipher.decrypt(data) {
            Ok(p) => p,
            Err(e) => {
                if self.decrypt_errors.first() {
                    warn!("can not decrypt datagram from {}: {}", endpoint, e);
                }
                return;
            }
        };
        let message = match JamMessage::deserialize(&plain) {
            Some(m) => m,
            None => {
                if self.decode_errors.first() {
                    warn!("garbage datagram of {} bytes from {}", plain.len(), endpoint);
                }
                return;
            }
        };
        self.registry.get_or_assign_client_id(endpoint);
        match message {
            JamMessage::AudioData(audio) => {
                if self.ingest_audio(endpoint, audio) {
                    self.wake();
                }
            }
            JamMessage::Control(value) => self.handle_control(endpoint, &value, now),
            JamMessage::Flare => trace!("flare from {}", endpoint),
            other => debug!("ignoring {} from {}", other, endpoint),
        }
    }

    /// Put audio in the sender's queue, making the queue if needed.  True if it was taken.
    pub fn ingest_audio(&self, endpoint: &str, audio: AudioData) -> bool {
        let existing = self.incoming.get(endpoint).map(|entry| entry.value().clone());
        let queue = match existing {
            Some(Some(queue)) => queue,
            Some(None) => {
                info!("{} is back, new queue", endpoint);
                let queue = Arc::new(PacketStreamQueue::new(endpoint));
                self.incoming.insert(endpoint.to_string(), Some(queue.clone()));
                queue
            }
            None => {
                info!("new client {}", endpoint);
                let queue = Arc::new(PacketStreamQueue::new(endpoint));
                let mut padding = Vec::with_capacity(self.buffer_config.prefill_on_connect);
                let mut next = audio.clone();
                for _ in 0..self.buffer_config.prefill_on_connect {
                    match next.create_prepadding() {
                        Some(pad) => {
                            padding.push(pad.clone());
                            next = pad;
                        }
                        None => break,
                    }
                }
                for pad in padding.into_iter().rev() {
                    queue.push(pad);
                }
                self.incoming.insert(endpoint.to_string(), Some(queue.clone()));
                queue
            }
        };
        queue.push(audio)
    }

    fn handle_control(&mut self, endpoint: &str, value: &serde_json::Value, now: u128) {
        match ControlMessage::from_json(value) {
            Ok(ControlMessage::SetRemoteVolume(request)) => {
                let control_tx = &self.control_tx;
                let result = self.router.handle_set_remote_volume(
                    endpoint,
                    &request,
                    &self.registry,
                    now,
                    |forward| control_tx.try_send(forward).is_ok(),
                );
                debug!("volume command from {}: {:?}", endpoint, result);
            }
            Ok(ControlMessage::Fec(enabled)) => {
                info!("{} turns FEC {}", endpoint, if enabled { "on" } else { "off" });
                self.fec_preferences.insert(endpoint.to_string(), enabled);
            }
            Ok(ControlMessage::ApplyLocalVolume(_)) => {
                warn!("{} sent ApplyLocalVolume, that only goes to clients", endpoint)
            }
            Err(e) => warn!("malformed control message from {}: {} ({})", endpoint, value, e),
        }
    }
}

#[cfg(test)]
mod test_accept_thread {
    use super::*;
    use crate::common::{
        encryption::{MockPacketCipher, Plaintext},
        jam_packet::{AudioBlock, ChannelSetup},
        sock_with_tos,
    };
    use crossbeam_channel::{bounded, Receiver};
    use serde_json::json;
    use std::sync::atomic::AtomicU64;

    struct Rig {
        accept: AcceptThread,
        incoming: Arc<PacketStreamBundle>,
        registry: Arc<ClientIdentityRegistry>,
        wake_rx: Receiver<()>,
        control_rx: Receiver<ControlForward>,
        fec: Arc<DashMap<String, bool>>,
        revision: Arc<AtomicU64>,
    }

    fn rig_with(cipher: Arc<dyn PacketCipher>) -> Rig {
        let incoming: Arc<PacketStreamBundle> = Arc::new(DashMap::new());
        let registry = Arc::new(ClientIdentityRegistry::new());
        let (wake_tx, wake_rx) = bounded(64);
        let (control_tx, control_rx) = bounded(4);
        let fec = Arc::new(DashMap::new());
        let revision = Arc::new(AtomicU64::new(0));
        let accept = AcceptThread::new(
            sock_with_tos::new(0).unwrap(),
            incoming.clone(),
            registry.clone(),
            wake_tx,
            control_tx,
            cipher,
            fec.clone(),
            RemoteVolumeRouter::new(revision.clone()),
            ServerBufferConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );
        Rig {
            accept,
            incoming,
            registry,
            wake_rx,
            control_rx,
            fec,
            revision,
        }
    }

    fn rig() -> Rig {
        rig_with(Arc::new(Plaintext))
    }

    fn audio_bytes(counter: u64) -> Vec<u8> {
        let block = AudioBlock::new(0.0, counter, 48_000, ChannelSetup::mono(), vec![vec![0.25; 8]]);
        JamMessage::AudioData(AudioData::new(Arc::new(block), None))
            .serialize()
            .unwrap()
    }

    fn queue_of(rig: &Rig, endpoint: &str) -> Option<Arc<PacketStreamQueue>> {
        rig.incoming.get(endpoint).and_then(|e| e.value().clone())
    }

    #[test]
    fn new_sender_is_prepadded() {
        // It should put three silent packets in front of the first real one
        let mut rig = rig();
        rig.accept.handle_datagram(&audio_bytes(10), "10.0.0.1:8888", 0);
        let queue = queue_of(&rig, "10.0.0.1:8888").unwrap();
        assert_eq!(queue.size(), 4);
        assert!(rig.wake_rx.try_recv().is_ok());
        let (first, _) = queue.try_pop().unwrap();
        assert_eq!(first.message_counter(), 7);
        assert_eq!(first.audio_block().audio[0][0], 0.0);
        assert_eq!(rig.registry.client_id_for("10.0.0.1:8888"), Some(1));
        assert_eq!(queue.quality_info().out_of_order_packet_counter, 0);
    }
    #[test]
    fn prepadding_stops_at_zero() {
        let mut rig = rig();
        rig.accept.handle_datagram(&audio_bytes(1), "10.0.0.1:8888", 0);
        assert_eq!(queue_of(&rig, "10.0.0.1:8888").unwrap().size(), 2);
    }
    #[test]
    fn returning_sender_gets_bare_queue() {
        let mut rig = rig();
        rig.incoming.insert("10.0.0.1:8888".to_string(), None);
        rig.accept.handle_datagram(&audio_bytes(500), "10.0.0.1:8888", 0);
        assert_eq!(queue_of(&rig, "10.0.0.1:8888").unwrap().size(), 1);
    }
    #[test]
    fn duplicate_does_not_wake() {
        let mut rig = rig();
        rig.accept.handle_datagram(&audio_bytes(10), "10.0.0.1:8888", 0);
        while rig.wake_rx.try_recv().is_ok() {}
        rig.accept.handle_datagram(&audio_bytes(10), "10.0.0.1:8888", 0);
        assert!(rig.wake_rx.try_recv().is_err());
    }
    #[test]
    fn garbage_is_dropped() {
        let mut rig = rig();
        rig.accept.handle_datagram(b"hello there", "10.0.0.1:8888", 0);
        assert!(rig.incoming.is_empty());
        assert!(rig.registry.is_empty());
    }
    #[test]
    fn undecryptable_is_dropped() {
        let mut cipher = MockPacketCipher::new();
        cipher
            .expect_decrypt()
            .times(2)
            .returning(|_| Err("bad key".into()));
        let mut rig = rig_with(Arc::new(cipher));
        rig.accept.handle_datagram(&audio_bytes(10), "10.0.0.1:8888", 0);
        rig.accept.handle_datagram(&audio_bytes(11), "10.0.0.1:8888", 0);
        assert!(rig.incoming.is_empty());
    }
    #[test]
    fn fec_preference() {
        let mut rig = rig();
        let bytes = JamMessage::Control(json!({"FEC": false})).serialize().unwrap();
        rig.accept.handle_datagram(&bytes, "10.0.0.1:8888", 0);
        assert_eq!(*rig.fec.get("10.0.0.1:8888").unwrap(), false);
    }
    #[test]
    fn remote_volume_forwarded() {
        // It should turn SetRemoteVolume into ApplyLocalVolume for the target
        let mut rig = rig();
        rig.accept.handle_datagram(&audio_bytes(10), "10.0.0.1:8888", 0);
        rig.accept.handle_datagram(&audio_bytes(10), "10.0.0.2:8888", 0);
        let request = json!({"SetRemoteVolume": {"target_client_id": 2, "target_channel_index": 0, "volume_percent": 75.0, "command_sequence": 3}});
        let bytes = JamMessage::Control(request).serialize().unwrap();
        rig.accept.handle_datagram(&bytes, "10.0.0.1:8888", 0);
        let forward = rig.control_rx.try_recv().unwrap();
        assert_eq!(forward.target, "10.0.0.2:8888");
        match forward.message {
            ControlMessage::ApplyLocalVolume(apply) => {
                assert_eq!(apply.source_client_id, 1);
                assert_eq!(apply.volume_percent, 75.0);
                assert_eq!(apply.command_sequence, Some(3));
            }
            other => assert!(false, "wrong forward {:?}", other),
        }
        assert_eq!(rig.revision.load(Ordering::Acquire), 1);
        // same sequence again goes nowhere
        rig.accept.handle_datagram(&bytes, "10.0.0.1:8888", 0);
        assert!(rig.control_rx.try_recv().is_err());
    }
    #[test]
    fn malformed_control_dropped() {
        let mut rig = rig();
        let bytes = JamMessage::Control(json!({"SetRemoteVolume": {"volume_percent": "loud"}}))
            .serialize()
            .unwrap();
        rig.accept.handle_datagram(&bytes, "10.0.0.1:8888", 0);
        assert!(rig.control_rx.try_recv().is_err());
        assert_eq!(rig.revision.load(Ordering::Acquire), 0);
    }
}
