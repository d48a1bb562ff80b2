//! Service-of-services: wires discovery to the per-device services and owns
//! startup/shutdown ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BenchConfig;
use crate::device::{DeviceRecord, DeviceSpec, DeviceStatus, PresentInfo};
use crate::discovery::{DiscoveryPoller, DiscoveryUpdate, native_enumerator};
use crate::error::{BenchError, Result};
use crate::events::{
    BenchEvent, BroadcastSink, DiscoveryEvent, EventSink, Events, ImagerEvent, LinkEvent, LogSink,
};
use crate::front_panel::{FRONT_PANEL_SLICE, FrontPanelService};
use crate::imager::ImagerService;
use crate::keyboard::KeyboardService;
use crate::policy::{GateTarget, PolicyGate};
use crate::serial::{LinkPhase, NativeOpener};
use crate::state::StateFabric;

pub const DEVICES_SLICE: &str = "devices";

/// The event → authoritative-state adapter. Mirrors device lifecycles into
/// the `devices` slice and imager events into their slices.
pub struct StateSink {
    fabric: Arc<StateFabric>,
    devices: StdMutex<HashMap<String, DeviceRecord>>,
    specs_by_kind: HashMap<String, DeviceSpec>,
    default_baud: u32,
}

impl std::fmt::Debug for StateSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSink")
            .field("devices", &self.devices.lock().expect("devices lock").len())
            .finish()
    }
}

impl StateSink {
    pub fn new(fabric: Arc<StateFabric>, config: &BenchConfig) -> Self {
        let specs_by_kind = config
            .serial
            .required_devices
            .iter()
            .map(|spec| (spec.kind.clone(), spec.clone()))
            .collect();
        Self {
            fabric,
            devices: StdMutex::new(HashMap::new()),
            specs_by_kind,
            default_baud: config.serial.default_baud,
        }
    }

    fn sync_devices(&self) {
        let value = {
            let devices = self.devices.lock().expect("devices lock");
            serde_json::to_value(&*devices).unwrap_or(Value::Null)
        };
        self.fabric.update(DEVICES_SLICE, value);
    }

    fn upsert_present(&self, info: &PresentInfo) {
        let spec = self.specs_by_kind.get(&info.kind);
        let record = DeviceRecord {
            id: info.id.clone(),
            kind: info.kind.clone(),
            path: info.path.clone(),
            vid: info.vid.clone(),
            pid: info.pid.clone(),
            baud: spec.and_then(|s| s.baud).unwrap_or(self.default_baud),
            id_token: spec.and_then(|s| s.id_token.clone()),
            status: if spec.map(DeviceSpec::wants_identify).unwrap_or(false) {
                DeviceStatus::Identifying
            } else {
                DeviceStatus::Ready
            },
            last_seen_ms: chrono::Utc::now().timestamp_millis(),
            error: None,
        };
        {
            let mut devices = self.devices.lock().expect("devices lock");
            // A reattach replaces the kind's previous record outright.
            devices.retain(|_, existing| existing.kind != record.kind);
            devices.insert(record.id.clone(), record);
        }
        self.sync_devices();
    }

    fn set_status(&self, device_id: &str, status: DeviceStatus) {
        let mut changed = false;
        {
            let mut devices = self.devices.lock().expect("devices lock");
            if let Some(record) = devices.get_mut(device_id) {
                if record.status != status {
                    record.status = status;
                    changed = true;
                }
                record.touch();
            }
        }
        if changed {
            self.sync_devices();
        }
    }

    fn set_error(&self, device_id: &str, fault: &crate::error::DeviceFault) {
        {
            let mut devices = self.devices.lock().expect("devices lock");
            if let Some(record) = devices.get_mut(device_id) {
                record.status = DeviceStatus::Error;
                record.error = Some(fault.clone());
                record.touch();
            }
        }
        self.sync_devices();
    }
}

impl EventSink for StateSink {
    fn publish(&self, event: &BenchEvent) -> Result<()> {
        match event {
            BenchEvent::Discovery(DiscoveryEvent::DevicePresent { info }) => {
                self.upsert_present(info);
            }
            BenchEvent::Discovery(DiscoveryEvent::DeviceLost { device_id }) => {
                self.set_status(device_id, DeviceStatus::Lost);
            }
            BenchEvent::Link(LinkEvent::IdentifyStart { device_id }) => {
                self.set_status(device_id, DeviceStatus::Identifying);
            }
            BenchEvent::Link(LinkEvent::Ready { device_id }) => {
                self.set_status(device_id, DeviceStatus::Ready);
            }
            BenchEvent::Link(LinkEvent::IdentifyFailed { device_id, fault })
            | BenchEvent::Link(LinkEvent::RecoverableError { device_id, fault })
            | BenchEvent::Link(LinkEvent::FatalError { device_id, fault }) => {
                self.set_error(device_id, fault);
            }
            BenchEvent::Link(LinkEvent::DeviceDisconnected { device_id, .. }) => {
                self.set_status(device_id, DeviceStatus::Error);
            }
            BenchEvent::Imager(ImagerEvent::FsUpdated { snapshot }) => {
                self.fabric
                    .update("imagerFs", serde_json::to_value(snapshot)?);
            }
            BenchEvent::Imager(ImagerEvent::MediaUpdated { device_id, media }) => {
                self.fabric.update(
                    "imagerMedia",
                    serde_json::json!({"deviceId": device_id, "media": media}),
                );
            }
            BenchEvent::Imager(ImagerEvent::Progress { progress, .. }) => {
                self.fabric
                    .update("imagerProgress", serde_json::to_value(progress)?);
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "state"
    }
}

pub struct Bench {
    config: BenchConfig,
    fabric: Arc<StateFabric>,
    events: Events,
    broadcast: Arc<BroadcastSink>,
    keyboard: Arc<KeyboardService<NativeOpener>>,
    front_panel: Arc<FrontPanelService<NativeOpener>>,
    imager: Arc<ImagerService>,
    poller: Arc<DiscoveryPoller>,
    attached: StdMutex<HashMap<String, String>>,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Bench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bench")
            .field("attached", &self.attached.lock().expect("attached lock").len())
            .finish()
    }
}

impl Bench {
    /// Build and start everything: services, policy gate, discovery, and the
    /// startup-required check. On a failed required startup the bench is
    /// already stopped when the error returns.
    pub async fn start(config: BenchConfig) -> Result<Arc<Self>> {
        let fabric = Arc::new(StateFabric::new());
        let broadcast = Arc::new(BroadcastSink::new(1024));
        let state_sink = Arc::new(StateSink::new(Arc::clone(&fabric), &config));
        let events = Events::new(vec![
            Arc::new(LogSink),
            state_sink,
            Arc::clone(&broadcast) as Arc<dyn EventSink>,
        ]);

        let keyboard = KeyboardService::new(
            NativeOpener,
            &config.serial,
            &config.keyboard,
            events.clone(),
            Arc::clone(&fabric),
        );
        let front_panel = FrontPanelService::new(
            NativeOpener,
            &config.serial,
            &config.front_panel,
            events.clone(),
            Arc::clone(&fabric),
        );
        let imager = ImagerService::new(config.imager.clone(), events.clone())?;

        let (poller, updates_rx) = DiscoveryPoller::new(
            native_enumerator(),
            config.serial.required_devices.clone(),
            config.serial.rescan_ms,
            events.clone(),
        );

        let shutdown = CancellationToken::new();
        let gate = PolicyGate::spawn(
            Arc::clone(&fabric),
            FRONT_PANEL_SLICE,
            Arc::clone(&keyboard) as Arc<dyn GateTarget>,
            shutdown.child_token(),
        );

        let bench = Arc::new(Self {
            config,
            fabric,
            events,
            broadcast,
            keyboard,
            front_panel,
            imager,
            poller,
            attached: StdMutex::new(HashMap::new()),
            shutdown,
            tasks: StdMutex::new(vec![gate]),
        });

        let router = tokio::spawn(Self::route_updates(
            Arc::clone(&bench),
            updates_rx,
            bench.shutdown.child_token(),
        ));
        bench.tasks.lock().expect("tasks lock").push(router);

        bench.poller.start();

        if let Err(err) = bench.await_startup().await {
            bench.stop().await;
            return Err(err);
        }
        Ok(bench)
    }

    pub fn fabric(&self) -> &Arc<StateFabric> {
        &self.fabric
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn broadcast(&self) -> &Arc<BroadcastSink> {
        &self.broadcast
    }

    pub fn keyboard(&self) -> &Arc<KeyboardService<NativeOpener>> {
        &self.keyboard
    }

    pub fn imager(&self) -> &Arc<ImagerService> {
        &self.imager
    }

    /// Ordered shutdown: discovery first so nothing re-attaches, then the
    /// services (cancelling their queues and closing ports).
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.poller.stop().await;

        let tasks = {
            let mut guard = self.tasks.lock().expect("tasks lock");
            guard.drain(..).collect::<Vec<_>>()
        };
        for task in tasks {
            let _ = task.await;
        }

        self.keyboard.stop().await;
        self.front_panel.stop().await;
        self.imager.stop().await;
    }

    async fn route_updates(
        bench: Arc<Self>,
        mut updates: mpsc::Receiver<DiscoveryUpdate>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                update = updates.recv() => match update {
                    Some(DiscoveryUpdate::Present(info)) => bench.handle_present(info).await,
                    Some(DiscoveryUpdate::Lost { device_id }) => bench.handle_lost(&device_id).await,
                    None => break,
                }
            }
        }
    }

    async fn handle_present(&self, info: PresentInfo) {
        self.attached
            .lock()
            .expect("attached lock")
            .insert(info.id.clone(), info.kind.clone());

        if info.kind == self.config.keyboard.kind {
            self.keyboard.attach(&info.id, &info.path);
        } else if info.kind == self.config.front_panel.kind {
            self.front_panel.attach(&info.id, &info.path);
        } else if info.kind == self.config.imager.kind {
            self.imager.attach_reader(&info.id, &info.path).await;
        } else {
            tracing::warn!(target: "discovery", kind = %info.kind, "no service for device kind");
        }
    }

    async fn handle_lost(&self, device_id: &str) {
        let kind = self
            .attached
            .lock()
            .expect("attached lock")
            .remove(device_id);
        let Some(kind) = kind else {
            return;
        };

        if kind == self.config.keyboard.kind {
            self.keyboard.detach("device-lost").await;
        } else if kind == self.config.front_panel.kind {
            self.front_panel.detach("device-lost").await;
        } else if kind == self.config.imager.kind {
            self.imager.detach_reader().await;
        }
    }

    fn kind_ready(&self, kind: &str) -> bool {
        if kind == self.config.keyboard.kind {
            self.keyboard.link().phase() == LinkPhase::Ready
        } else if kind == self.config.front_panel.kind {
            self.front_panel.link().phase() == LinkPhase::Ready
        } else if kind == self.config.imager.kind {
            self.imager.reader_path().is_some()
        } else {
            false
        }
    }

    /// Enforce `startup_required` within the configured window. Missing
    /// devices are fatal only with `SERIAL_FAIL_ON_MISSING`; otherwise they
    /// stay visible through the `devices` slice.
    async fn await_startup(&self) -> Result<()> {
        let required: Vec<String> = self
            .config
            .serial
            .required_devices
            .iter()
            .filter(|spec| spec.startup_required)
            .map(|spec| spec.kind.clone())
            .collect();
        if required.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.serial.startup_timeout_ms);
        loop {
            if required.iter().all(|kind| self.kind_ready(kind)) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let missing: Vec<String> = required
            .into_iter()
            .filter(|kind| !self.kind_ready(kind))
            .collect();
        if self.config.serial.fail_on_missing {
            return Err(BenchError::Config(format!(
                "required devices missing at startup: {}",
                missing.join(", ")
            )));
        }
        tracing::warn!(target: "discovery", missing = %missing.join(", "), "continuing without required devices");
        Ok(())
    }
}
