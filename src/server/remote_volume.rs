//! Routing of remote volume commands.
//!
//! A client sends `SetRemoteVolume` naming another client by id.  The server turns it into
//! an `ApplyLocalVolume` for that client, saying who asked.  Commands that carry a
//! `command_sequence` are only forwarded if the sequence moved forward for that
//! (source, target, channel), so a reordered older command can not undo a newer one.
//!
//! Every forward also bumps the session revision, which makes the send thread push a
//! fresh SessionSetup out to everybody.  Bumps are limited to one per 60ms, a bump that
//! comes in too soon is remembered and done by [`RemoteVolumeRouter::tick`].
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::{client_registry::ClientIdentityRegistry, session_types::ControlForward};
use crate::common::{
    control_message::{clamp_volume_percent, ApplyLocalVolume, ControlMessage, SetRemoteVolume},
    stream_time_stat::MicroTimer,
};

/// microseconds between revision bumps
pub const REVISION_MIN_INTERVAL: u128 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    Forwarded,
    /// sequence did not move forward
    Stale,
    UnknownTarget,
    /// control queue to the send thread is full
    Dropped,
}

pub struct RemoteVolumeRouter {
    last_sequence: HashMap<(u32, u32, u16), u64>,
    revision: Arc<AtomicU64>,
    revision_timer: Option<MicroTimer>,
    pending_bump: bool,
}

impl RemoteVolumeRouter {
    pub fn new(revision: Arc<AtomicU64>) -> RemoteVolumeRouter {
        RemoteVolumeRouter {
            last_sequence: HashMap::new(),
            revision,
            revision_timer: None,
            pending_bump: false,
        }
    }

    /// Route a request from `source_endpoint`.  `deliver` gets the message for the
    /// target and returns false if it could not take it.
    pub fn handle_set_remote_volume<F>(
        &mut self,
        source_endpoint: &str,
        request: &SetRemoteVolume,
        registry: &ClientIdentityRegistry,
        now: u128,
        deliver: F,
    ) -> RouteResult
    where
        F: FnOnce(ControlForward) -> bool,
    {
        let source_id = registry.get_or_assign_client_id(source_endpoint);
        let key = (source_id, request.target_client_id, request.target_channel_index);
        if let (Some(seq), Some(last)) = (request.command_sequence, self.last_sequence.get(&key)) {
            if seq <= *last {
                debug!("stale volume command {} from {} (last {})", seq, source_endpoint, last);
                return RouteResult::Stale;
            }
        }
        let target = match registry.endpoint_for_client_id(request.target_client_id) {
            Some(t) => t,
            None => {
                warn!(
                    "volume command from {} for unknown client {}",
                    source_endpoint, request.target_client_id
                );
                return RouteResult::UnknownTarget;
            }
        };
        let forward = ControlForward {
            target,
            message: ControlMessage::ApplyLocalVolume(ApplyLocalVolume {
                target_channel_index: request.target_channel_index,
                volume_percent: clamp_volume_percent(request.volume_percent),
                source_client_id: source_id,
                command_sequence: request.command_sequence,
            }),
        };
        if !deliver(forward) {
            warn!("control queue full, dropping volume command from {}", source_endpoint);
            return RouteResult::Dropped;
        }
        if let Some(seq) = request.command_sequence {
            self.last_sequence.insert(key, seq);
        }
        self.bump_revision(now);
        RouteResult::Forwarded
    }

    /// do a bump that was held back by the rate limit
    pub fn tick(&mut self, now: u128) {
        if self.pending_bump {
            self.bump_revision(now);
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn bump_revision(&mut self, now: u128) {
        let allowed = self
            .revision_timer
            .as_ref()
            .map_or(true, |timer| timer.expired(now));
        if allowed {
            let rev = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
            info!("session revision {}", rev);
            self.revision_timer = Some(MicroTimer::new(now, REVISION_MIN_INTERVAL));
            self.pending_bump = false;
        } else {
            self.pending_bump = true;
        }
    }
}
