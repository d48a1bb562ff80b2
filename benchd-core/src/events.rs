//! Structured events emitted by the core.
//!
//! Every component publishes through [`Events`], a fan-out over sinks with
//! per-sink error isolation: one misbehaving sink never stops the others.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::device::PresentInfo;
use crate::error::{DeviceFault, Result};
use crate::imager::{FsSnapshot, ImagingProgress, MediaState};
use crate::ops::Operation;

/// Serial link lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum LinkEvent {
    DeviceConnected { device_id: String },
    DeviceDisconnected { device_id: String, reason: String },
    IdentifyStart { device_id: String },
    IdentifySuccess { device_id: String, token: String },
    IdentifyFailed { device_id: String, fault: DeviceFault },
    Ready { device_id: String },
    Reconnecting { device_id: String, attempt: u32, delay_ms: u64 },
    RecoverableError { device_id: String, fault: DeviceFault },
    FatalError { device_id: String, fault: DeviceFault },
}

/// Discovery poller output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DiscoveryEvent {
    DevicePresent { info: PresentInfo },
    DeviceLost { device_id: String },
    PollFailed { fault: DeviceFault },
}

/// Per-operation lifecycle, emitted by the op queue worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OpEvent {
    OpQueued { device_id: String, op: Operation },
    OpStarted { device_id: String, op: Operation },
    OpCompleted { device_id: String, op: Operation },
    OpCancelled { device_id: String, op: Operation, reason: String },
    OpFailed { device_id: String, op: Operation, fault: DeviceFault },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum KeyboardEvent {
    KeySent {
        device_id: String,
        key: String,
        action: String,
        wire: String,
    },
    ModifiersChanged {
        device_id: String,
        held: Vec<String>,
    },
    PowerCommand {
        device_id: String,
        on: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ImagerEvent {
    ImagingStarted {
        device_id: String,
        direction: String,
        image: String,
    },
    Progress {
        device_id: String,
        progress: ImagingProgress,
    },
    ImagingFinished {
        device_id: String,
        direction: String,
        image: String,
    },
    MediaUpdated {
        device_id: String,
        media: MediaState,
    },
    FsUpdated {
        snapshot: FsSnapshot,
    },
}

/// The one event union fanned out to sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BenchEvent {
    Link(LinkEvent),
    Discovery(DiscoveryEvent),
    Op(OpEvent),
    Keyboard(KeyboardEvent),
    Imager(ImagerEvent),
}

impl From<LinkEvent> for BenchEvent {
    fn from(e: LinkEvent) -> Self {
        Self::Link(e)
    }
}

impl From<DiscoveryEvent> for BenchEvent {
    fn from(e: DiscoveryEvent) -> Self {
        Self::Discovery(e)
    }
}

impl From<OpEvent> for BenchEvent {
    fn from(e: OpEvent) -> Self {
        Self::Op(e)
    }
}

impl From<KeyboardEvent> for BenchEvent {
    fn from(e: KeyboardEvent) -> Self {
        Self::Keyboard(e)
    }
}

impl From<ImagerEvent> for BenchEvent {
    fn from(e: ImagerEvent) -> Self {
        Self::Imager(e)
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &BenchEvent) -> Result<()>;

    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Fan-out sink handed to every service.
#[derive(Clone, Default)]
pub struct Events {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Events {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn publish(&self, event: impl Into<BenchEvent>) {
        let event = event.into();
        for sink in &self.sinks {
            if let Err(err) = sink.publish(&event) {
                tracing::warn!(target: "events", sink = sink.name(), error = %err, "event sink failed");
            }
        }
    }
}

/// Routes every event into tracing at a level matching its severity.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &BenchEvent) -> Result<()> {
        match event {
            BenchEvent::Link(LinkEvent::RecoverableError { device_id, fault })
            | BenchEvent::Link(LinkEvent::IdentifyFailed { device_id, fault }) => {
                tracing::warn!(target: "serial", device = %device_id, fault = %fault.message, "link fault");
            }
            BenchEvent::Link(LinkEvent::FatalError { device_id, fault }) => {
                tracing::error!(target: "serial", device = %device_id, fault = %fault.message, "link gave up");
            }
            BenchEvent::Op(OpEvent::OpFailed { device_id, op, fault }) => {
                tracing::warn!(target: "opq", device = %device_id, op = %op.id, fault = %fault.message, "op failed");
            }
            BenchEvent::Discovery(DiscoveryEvent::PollFailed { fault }) => {
                tracing::warn!(target: "discovery", fault = %fault.message, "poll failed");
            }
            other => {
                tracing::debug!(target: "events", event = ?other, "event");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Bridges events onto a broadcast channel for external observers.
#[derive(Debug)]
pub struct BroadcastSink {
    sender: broadcast::Sender<BenchEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BenchEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &BenchEvent) -> Result<()> {
        // No receivers is fine; observers come and go.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}
