//! # benchd-core
//!
//! Core of the benchd lab-bench device orchestrator: USB discovery, serial
//! link supervision, per-device operation queues, the CompactFlash imager
//! pipeline, host-power policy gating, and the authoritative state fabric
//! that external observers mirror.

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod front_panel;
pub mod imager;
pub mod keyboard;
pub mod ops;
pub mod orchestrator;
pub mod policy;
pub mod serial;
pub mod state;

pub use config::{BenchConfig, FrontPanelConfig, ImagerConfig, KeyboardConfig, SerialConfig};
pub use device::{DeviceRecord, DeviceSpec, DeviceStatus, PresentInfo, UNMOUNTED_PATH};
pub use error::{BenchError, DeviceFault, FaultScope, Result};
pub use events::{BenchEvent, BroadcastSink, EventSink, Events, LogSink};
pub use orchestrator::{Bench, StateSink};
pub use state::{StateDelta, StateFabric, StateSnapshot};
