//! entry point called by main to run the mixing server
//!
//! [`MixServer::start`] opens the socket and starts the three threads:
//! - accept thread [`AcceptThread`] reads the socket and fills the per sender queues
//! - mixer thread [`MixerThread`] (max priority) mixes when everybody has delivered
//! - send thread [`SendThread`] encrypts and sends the mixes
//!
//! They share the queue bundle, the identity registry, the FEC preferences and the
//! session revision.  A fatal error in any of them ends the process.
use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use json::JsonValue;
use log::{error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, sleep, JoinHandle},
    time::Duration,
};
use thread_priority::{ThreadBuilder, ThreadPriority};

use super::{
    accept_thread::AcceptThread,
    client_registry::ClientIdentityRegistry,
    mixer_thread::MixerThread,
    remote_volume::RemoteVolumeRouter,
    send_thread::SendThread,
    session_types::{OutgoingPackage, PacketStreamBundle},
};
use crate::common::{
    box_error::BoxError,
    buffers_config::{ServerBufferConfig, DEFAULT_SERVER_PORT, SEND_QUEUE_CAPACITY},
    config::Config,
    encryption::cipher_from_key,
    sock_with_tos,
};

const WAKE_QUEUE_CAPACITY: usize = 256;
const CONTROL_QUEUE_CAPACITY: usize = 64;

/// defaults underneath the server settings file
pub fn server_defaults() -> JsonValue {
    json::object! {
        "port": DEFAULT_SERVER_PORT,
        "key": "",
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    /// key file or base64 key, None for no encryption
    pub key: Option<String>,
    pub buffer_config: ServerBufferConfig,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Result<ServerSettings, BoxError> {
        let port = config.get_u32_value("port", None)?;
        if port > u16::MAX as u32 {
            simple_error::bail!("port {} out of range", port);
        }
        Ok(ServerSettings {
            port: port as u16,
            key: config.get_opt_str_value("key"),
            buffer_config: ServerBufferConfig::from_config(config)?,
        })
    }
}

impl Default for ServerSettings {
    fn default() -> ServerSettings {
        ServerSettings {
            port: DEFAULT_SERVER_PORT,
            key: None,
            buffer_config: ServerBufferConfig::default(),
        }
    }
}

pub struct MixServer {
    port: u16,
    exit: Arc<AtomicBool>,
    outgoing_tx: Sender<OutgoingPackage>,
    incoming: Arc<PacketStreamBundle>,
    registry: Arc<ClientIdentityRegistry>,
    send_handle: JoinHandle<()>,
    mixer_handle: JoinHandle<()>,
    accept_handle: JoinHandle<()>,
}

impl MixServer {
    pub fn start(settings: &ServerSettings) -> Result<MixServer, BoxError> {
        let cipher = cipher_from_key(settings.key.as_deref())?;
        let sock = sock_with_tos::new(settings.port)?;
        let port = sock.local_addr()?.port();
        info!("mix server on port {} with {:?}", port, settings.buffer_config);

        let exit = Arc::new(AtomicBool::new(false));
        let incoming: Arc<PacketStreamBundle> = Arc::new(DashMap::new());
        let registry = Arc::new(ClientIdentityRegistry::new());
        let fec_preferences = Arc::new(DashMap::new());
        let revision = Arc::new(AtomicU64::new(0));
        let (wake_tx, wake_rx) = bounded(WAKE_QUEUE_CAPACITY);
        let (outgoing_tx, outgoing_rx) = bounded(SEND_QUEUE_CAPACITY);
        let (control_tx, control_rx) = bounded(CONTROL_QUEUE_CAPACITY);

        let mut accept = AcceptThread::new(
            sock.try_clone()?,
            incoming.clone(),
            registry.clone(),
            wake_tx.clone(),
            control_tx,
            cipher.clone(),
            fec_preferences.clone(),
            RemoteVolumeRouter::new(revision.clone()),
            settings.buffer_config,
            exit.clone(),
        );
        let mut mixer = MixerThread::new(
            incoming.clone(),
            registry.clone(),
            outgoing_tx.clone(),
            wake_tx,
            wake_rx,
            settings.buffer_config,
            exit.clone(),
        );
        let mut send = SendThread::new(
            sock,
            outgoing_rx,
            control_rx,
            incoming.clone(),
            cipher,
            fec_preferences,
            revision,
        );

        let send_handle = thread::Builder::new().name("send".to_string()).spawn(move || {
            if let Err(e) = send.run() {
                error!("send thread died: {}", e);
                std::process::exit(-1);
            }
        })?;
        let mixer_handle = ThreadBuilder::default()
            .name("mixer".to_string())
            .priority(ThreadPriority::Max)
            .spawn(move |result| {
                if let Err(e) = result {
                    warn!("mixer running without raised priority: {:?}", e);
                }
                if let Err(e) = mixer.run() {
                    error!("mixer died: {}", e);
                    std::process::exit(-1);
                }
            })?;
        let accept_handle = thread::Builder::new().name("accept".to_string()).spawn(move || {
            if let Err(e) = accept.run() {
                error!("accept thread died: {}", e);
                std::process::exit(-1);
            }
        })?;

        Ok(MixServer {
            port,
            exit,
            outgoing_tx,
            incoming,
            registry,
            send_handle,
            mixer_handle,
            accept_handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> Arc<ClientIdentityRegistry> {
        self.registry.clone()
    }

    pub fn incoming(&self) -> Arc<PacketStreamBundle> {
        self.incoming.clone()
    }

    /// Stop all three threads and wait for them.  Producers go first so the send
    /// thread is still draining while accept and mixer wind down.
    pub fn shutdown(self) -> Result<(), BoxError> {
        info!("mix server shutting down");
        self.exit.store(true, Ordering::Release);
        for (name, handle) in [("accept", self.accept_handle), ("mixer", self.mixer_handle)] {
            if handle.join().is_err() {
                simple_error::bail!("{} thread panicked", name);
            }
        }
        self.outgoing_tx.send(OutgoingPackage::Shutdown)?;
        if self.send_handle.join().is_err() {
            simple_error::bail!("send thread panicked");
        }
        Ok(())
    }
}

/// Start the server and never come back
pub fn run(settings: &ServerSettings) -> Result<(), BoxError> {
    let _server = MixServer::start(settings)?;
    loop {
        sleep(Duration::from_secs(1));
    }
}
