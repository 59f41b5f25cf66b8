//! puts the finished mixes on the wire
//!
//! Each target has its own FEC history, so the copy of the previous block that rides along
//! is the previous block that target got.  Every [`CLIENT_INFO_INTERVAL`] packages a
//! target also gets a ClientInfo, and a SessionSetup goes out on the same cadence or as
//! soon as the session revision moved.
use crossbeam_channel::{never, select, Receiver};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::session_types::{ControlForward, MixPackage, OutgoingPackage, PacketStreamBundle};
use crate::common::{
    box_error::BoxError,
    buffers_config::{CLIENT_INFO_INTERVAL, FEC_RINGBUFFER_SIZE},
    client_info::ClientInfoMessage,
    encryption::PacketCipher,
    jam_packet::{AudioBlock, AudioData, JamMessage},
    ring_buffer::RingBuffer,
    session_info::SessionSetup,
    LogOnce,
};

pub struct SendThread {
    sock: UdpSocket,
    outgoing_rx: Receiver<OutgoingPackage>,
    control_rx: Receiver<ControlForward>,
    incoming: Arc<PacketStreamBundle>,
    cipher: Arc<dyn PacketCipher>,
    fec_preferences: Arc<DashMap<String, bool>>,
    revision: Arc<AtomicU64>,
    fec_data: HashMap<String, RingBuffer<Arc<AudioBlock>>>,
    package_counters: HashMap<String, u64>,
    sent_revisions: HashMap<String, u64>,
    send_errors: LogOnce,
}

impl SendThread {
    pub fn new(
        sock: UdpSocket,
        outgoing_rx: Receiver<OutgoingPackage>,
        control_rx: Receiver<ControlForward>,
        incoming: Arc<PacketStreamBundle>,
        cipher: Arc<dyn PacketCipher>,
        fec_preferences: Arc<DashMap<String, bool>>,
        revision: Arc<AtomicU64>,
    ) -> SendThread {
        SendThread {
            sock,
            outgoing_rx,
            control_rx,
            incoming,
            cipher,
            fec_preferences,
            revision,
            fec_data: HashMap::new(),
            package_counters: HashMap::new(),
            sent_revisions: HashMap::new(),
            send_errors: LogOnce::new(),
        }
    }

    /// Runs until it pops a Shutdown.  An error means we could not encrypt.
    pub fn run(&mut self) -> Result<(), BoxError> {
        let outgoing_rx = self.outgoing_rx.clone();
        let mut control_open = true;
        loop {
            // once the accept thread is gone stop listening for control
            let control_rx = if control_open {
                self.control_rx.clone()
            } else {
                never()
            };
            select! {
                recv(outgoing_rx) -> msg => match msg {
                    Ok(OutgoingPackage::Mix(package)) => self.send_package(&package)?,
                    Ok(OutgoingPackage::Shutdown) | Err(_) => break,
                },
                recv(control_rx) -> msg => match msg {
                    Ok(forward) => self.send_control(&forward)?,
                    Err(_) => control_open = false,
                },
            }
        }
        info!("send thread done");
        Ok(())
    }

    fn fec_enabled(&self, target: &str) -> bool {
        self.fec_preferences.get(target).map_or(true, |enabled| *enabled)
    }

    pub fn send_package(&mut self, package: &MixPackage) -> Result<(), BoxError> {
        let fec_on = self.fec_enabled(&package.target);
        let ring = self
            .fec_data
            .entry(package.target.clone())
            .or_insert_with(|| RingBuffer::new(FEC_RINGBUFFER_SIZE));
        let fec = if fec_on { ring.last().cloned() } else { None };
        ring.push(package.block.clone());
        let bytes = JamMessage::AudioData(AudioData::new(package.block.clone(), fec)).serialize()?;
        self.transmit(&package.target, &bytes)?;

        let counter = self.package_counters.entry(package.target.clone()).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        let revision = self.revision.load(Ordering::Acquire);
        let stale = self.sent_revisions.get(&package.target) != Some(&revision);
        if sequence % CLIENT_INFO_INTERVAL == 0 {
            let bytes = JamMessage::ClientInfo(self.client_info()).serialize()?;
            self.transmit(&package.target, &bytes)?;
        }
        if sequence % CLIENT_INFO_INTERVAL == 0 || stale {
            self.send_session_setup(&package.target, &package.session_setup)?;
            self.sent_revisions.insert(package.target.clone(), revision);
        }
        Ok(())
    }

    fn send_session_setup(&mut self, target: &str, setup: &SessionSetup) -> Result<(), BoxError> {
        debug!("session for {}: {}", target, setup);
        let bytes = JamMessage::SessionSetup(setup.clone()).serialize()?;
        self.transmit(target, &bytes)
    }

    pub fn send_control(&mut self, forward: &ControlForward) -> Result<(), BoxError> {
        let bytes = JamMessage::Control(forward.message.to_json()?).serialize()?;
        self.transmit(&forward.target, &bytes)
    }

    /// stats for every sender that still has packets queued
    fn client_info(&self) -> ClientInfoMessage {
        let mut info = ClientInfoMessage::new();
        for entry in self.incoming.iter() {
            if let Some(queue) = entry.value() {
                if queue.is_empty() {
                    continue;
                }
                if let Ok(addr) = entry.key().parse::<SocketAddr>() {
                    info.add_client_info(addr, queue.quality_info());
                }
            }
        }
        info
    }

    fn transmit(&mut self, target: &str, plain: &[u8]) -> Result<(), BoxError> {
        let sealed = self.cipher.encrypt(plain)?;
        let addr: SocketAddr = match target.parse() {
            Ok(a) => a,
            Err(_) => {
                warn!("can not send to {}, not an address", target);
                return Ok(());
            }
        };
        if let Err(e) = self.sock.send_to(&sealed, addr) {
            if self.send_errors.first() {
                warn!("send to {} failed: {}", target, e);
            }
        }
        Ok(())
    }
}
