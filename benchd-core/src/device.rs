//! Device specs (configuration) and device records (runtime state).

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::DeviceFault;

/// Synthetic path reported when reader hardware is present but has no media.
pub const UNMOUNTED_PATH: &str = "unmounted";

/// Declarative description of one required peripheral, immutable after load.
///
/// A spec without `id_token` is a static device: the supervisor opens the
/// port but performs no identify handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud: Option<u32>,
    /// The device exposes a USB mass-storage disk rather than a tty.
    #[serde(default)]
    pub block_device: bool,
    #[serde(default)]
    pub identify_required: bool,
    #[serde(default)]
    pub startup_required: bool,
}

impl DeviceSpec {
    /// Identify only runs when the spec both demands it and names a token.
    pub fn wants_identify(&self) -> bool {
        self.identify_required && self.id_token.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Identifying,
    Ready,
    Error,
    Lost,
}

/// Runtime record for one discovered device, keyed by [`DeviceRecord::id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub kind: String,
    pub path: String,
    pub vid: String,
    pub pid: String,
    pub baud: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub status: DeviceStatus,
    pub last_seen_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeviceFault>,
}

impl DeviceRecord {
    pub fn touch(&mut self) {
        self.last_seen_ms = Utc::now().timestamp_millis();
    }
}

/// Discovery's view of a matched device, handed to supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentInfo {
    pub id: String,
    pub kind: String,
    pub path: String,
    pub vid: String,
    pub pid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// Canonical device identifier: `usb:<vid>:<pid>:<kind>:<path>` with
/// lowercase hex ids and no `0x` prefix.
pub fn device_id(vid: &str, pid: &str, kind: &str, path: &str) -> String {
    format!(
        "usb:{}:{}:{}:{}",
        vid.to_ascii_lowercase(),
        pid.to_ascii_lowercase(),
        kind,
        path
    )
}

/// Per-device error history, bounded, newest first.
#[derive(Debug, Clone, Default)]
pub struct FaultHistory {
    limit: usize,
    faults: VecDeque<DeviceFault>,
}

impl FaultHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            faults: VecDeque::new(),
        }
    }

    pub fn record(&mut self, fault: DeviceFault) {
        if self.faults.len() == self.limit {
            self.faults.pop_back();
        }
        self.faults.push_front(fault);
    }

    pub fn newest(&self) -> Option<&DeviceFault> {
        self.faults.front()
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceFault> {
        self.faults.iter()
    }
}
