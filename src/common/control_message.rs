//! JSON control messages carried in [`crate::common::jam_packet::JamMessage::Control`]
//!
//! ```json
//! {"SetRemoteVolume": {"target_client_id": 2, "target_channel_index": 0, "volume_percent": 80.0, "command_sequence": 7}}
//! {"ApplyLocalVolume": {"target_channel_index": 0, "volume_percent": 80.0, "source_client_id": 1, "command_sequence": 7}}
//! {"FEC": false}
//! ```
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::box_error::BoxError;

/// client -> server: please turn me down on that client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetRemoteVolume {
    pub target_client_id: u32,
    pub target_channel_index: u16,
    pub volume_percent: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_sequence: Option<u64>,
}

/// server -> client: someone asked you to change your volume of one of their channels
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApplyLocalVolume {
    pub target_channel_index: u16,
    pub volume_percent: f32,
    pub source_client_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_sequence: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMessage {
    SetRemoteVolume(SetRemoteVolume),
    ApplyLocalVolume(ApplyLocalVolume),
    /// should the server attach FEC data to what it sends me
    #[serde(rename = "FEC")]
    Fec(bool),
}

impl ControlMessage {
    pub fn from_json(value: &Value) -> Result<ControlMessage, BoxError> {
        Ok(serde_json::from_value(value.clone())?)
    }
    pub fn to_json(&self) -> Result<Value, BoxError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// volume requests are percentages, anything outside gets pinned
pub fn clamp_volume_percent(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    volume.clamp(0.0, 100.0)
}
