//! USB discovery: periodic enumeration matched against device specs.
//!
//! The poller is platform-neutral; OS adapters implement [`UsbEnumerator`].
//! Arrival, loss, and reattach (same device, new path) are derived by
//! diffing consecutive polls keyed on `(vid, pid, kind)`. A reader whose
//! disk node is absent surfaces with the synthetic `unmounted` path so
//! downstream can tell "no reader" from "reader without media".

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceSpec, PresentInfo, UNMOUNTED_PATH, device_id};
use crate::error::{DeviceFault, FaultScope, Result};
use crate::events::{DiscoveryEvent, Events};

/// One USB function as the OS reports it, with any tty nodes it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbInterface {
    pub vid: String,
    pub pid: String,
    pub serial: Option<String>,
    pub tty_paths: Vec<String>,
}

/// A whole USB mass-storage disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDisk {
    pub path: String,
    pub serial: Option<String>,
}

#[async_trait]
pub trait UsbEnumerator: Send + Sync + 'static {
    async fn usb_interfaces(&self) -> Result<Vec<UsbInterface>>;
    async fn usb_disks(&self) -> Result<Vec<UsbDisk>>;
}

/// The platform's native enumerator.
#[cfg(target_os = "linux")]
pub fn native_enumerator() -> Arc<dyn UsbEnumerator> {
    Arc::new(linux::SysfsEnumerator::new())
}

#[cfg(target_os = "macos")]
pub fn native_enumerator() -> Arc<dyn UsbEnumerator> {
    Arc::new(macos::SystemProfilerEnumerator::new())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryUpdate {
    Present(PresentInfo),
    Lost { device_id: String },
}

struct SpecMatcher {
    spec: DeviceSpec,
    path_regex: Option<Regex>,
}

impl SpecMatcher {
    fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.spec.vendor_id.as_deref().unwrap_or("*"),
            self.spec.product_id.as_deref().unwrap_or("*"),
            self.spec.kind
        )
    }

    fn interface_matches(&self, iface: &UsbInterface) -> bool {
        let vid_ok = self
            .spec
            .vendor_id
            .as_ref()
            .is_none_or(|v| iface.vid.eq_ignore_ascii_case(v));
        let pid_ok = self
            .spec
            .product_id
            .as_ref()
            .is_none_or(|p| iface.pid.eq_ignore_ascii_case(p));
        let serial_ok = self
            .spec
            .serial
            .as_ref()
            .is_none_or(|s| iface.serial.as_deref() == Some(s));
        vid_ok && pid_ok && serial_ok
    }

    fn path_matches(&self, path: &str) -> bool {
        self.path_regex.as_ref().is_none_or(|re| re.is_match(path))
    }

    fn info(&self, iface: Option<&UsbInterface>, path: &str, serial: Option<String>) -> PresentInfo {
        let vid = iface
            .map(|i| i.vid.clone())
            .or_else(|| self.spec.vendor_id.clone())
            .unwrap_or_else(|| "0000".into());
        let pid = iface
            .map(|i| i.pid.clone())
            .or_else(|| self.spec.product_id.clone())
            .unwrap_or_else(|| "0000".into());
        PresentInfo {
            id: device_id(&vid, &pid, &self.spec.kind, path),
            kind: self.spec.kind.clone(),
            path: path.to_string(),
            vid: vid.to_ascii_lowercase(),
            pid: pid.to_ascii_lowercase(),
            serial,
        }
    }

    /// Resolve this spec against one enumeration pass.
    fn resolve(&self, interfaces: &[UsbInterface], disks: &[UsbDisk]) -> Option<PresentInfo> {
        let iface = interfaces.iter().find(|i| self.interface_matches(i));

        if self.spec.block_device {
            // Prefer the serial-matched disk; fall back to any USB disk.
            let disk = self
                .spec
                .serial
                .as_ref()
                .and_then(|serial| {
                    disks
                        .iter()
                        .find(|d| d.serial.as_deref() == Some(serial.as_str()))
                })
                .or_else(|| disks.first());

            if let Some(disk) = disk {
                return Some(self.info(iface, &disk.path, disk.serial.clone()));
            }
            // Hardware present, no disk node: reader without media.
            return iface.map(|i| self.info(Some(i), UNMOUNTED_PATH, i.serial.clone()));
        }

        let iface = iface?;
        let path = iface.tty_paths.iter().find(|p| self.path_matches(p))?;
        Some(self.info(Some(iface), path, iface.serial.clone()))
    }
}

pub struct DiscoveryPoller {
    enumerator: Arc<dyn UsbEnumerator>,
    matchers: Vec<SpecMatcher>,
    interval_ms: u64,
    events: Events,
    updates: mpsc::Sender<DiscoveryUpdate>,
    seen: StdMutex<HashMap<String, PresentInfo>>,
    shutdown: CancellationToken,
    runner: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DiscoveryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryPoller")
            .field("specs", &self.matchers.len())
            .field("interval_ms", &self.interval_ms)
            .finish()
    }
}

impl DiscoveryPoller {
    pub fn new(
        enumerator: Arc<dyn UsbEnumerator>,
        specs: Vec<DeviceSpec>,
        interval_ms: u64,
        events: Events,
    ) -> (Arc<Self>, mpsc::Receiver<DiscoveryUpdate>) {
        let matchers = specs
            .into_iter()
            .map(|spec| {
                let path_regex = spec
                    .path_regex
                    .as_deref()
                    .and_then(|raw| match Regex::new(raw) {
                        Ok(re) => Some(re),
                        Err(err) => {
                            tracing::warn!(target: "discovery", kind = %spec.kind, error = %err, "bad path regex, ignoring");
                            None
                        }
                    });
                SpecMatcher { spec, path_regex }
            })
            .collect();

        let (tx, rx) = mpsc::channel(64);
        let poller = Arc::new(Self {
            enumerator,
            matchers,
            interval_ms,
            events,
            updates: tx,
            seen: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            runner: StdMutex::new(None),
        });
        (poller, rx)
    }

    pub fn start(self: &Arc<Self>) {
        let mut runner = self.runner.lock().expect("runner lock");
        if runner.is_some() {
            return;
        }
        let poller = Arc::clone(self);
        *runner = Some(tokio::spawn(async move {
            let interval = Duration::from_millis(poller.interval_ms);
            loop {
                if let Err(err) = poller.poll_once().await {
                    // Single poll failures are retried on the next cycle.
                    poller.events.publish(DiscoveryEvent::PollFailed {
                        fault: DeviceFault::from_error(FaultScope::Discovery, &err),
                    });
                }
                tokio::select! {
                    _ = poller.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.runner.lock().expect("runner lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One enumeration + diff pass.
    pub async fn poll_once(&self) -> Result<()> {
        let interfaces = self.enumerator.usb_interfaces().await?;
        let disks = if self.matchers.iter().any(|m| m.spec.block_device) {
            self.enumerator.usb_disks().await?
        } else {
            Vec::new()
        };

        let mut current: HashMap<String, PresentInfo> = HashMap::new();
        for matcher in &self.matchers {
            if let Some(info) = matcher.resolve(&interfaces, &disks) {
                current.insert(matcher.key(), info);
            }
        }

        let mut changes: Vec<DiscoveryUpdate> = Vec::new();
        {
            let mut seen = self.seen.lock().expect("seen lock");
            for (key, old) in seen.iter() {
                match current.get(key) {
                    None => changes.push(DiscoveryUpdate::Lost {
                        device_id: old.id.clone(),
                    }),
                    Some(new) if new.path != old.path => {
                        // Reattach: old id goes away before the new arrives.
                        changes.push(DiscoveryUpdate::Lost {
                            device_id: old.id.clone(),
                        });
                        changes.push(DiscoveryUpdate::Present(new.clone()));
                    }
                    Some(_) => {}
                }
            }
            for (key, info) in &current {
                if !seen.contains_key(key) {
                    changes.push(DiscoveryUpdate::Present(info.clone()));
                }
            }
            *seen = current;
        }

        for change in changes {
            match &change {
                DiscoveryUpdate::Present(info) => {
                    tracing::info!(target: "discovery", id = %info.id, "device present");
                    self.events.publish(DiscoveryEvent::DevicePresent { info: info.clone() });
                }
                DiscoveryUpdate::Lost { device_id } => {
                    tracing::info!(target: "discovery", id = %device_id, "device lost");
                    self.events.publish(DiscoveryEvent::DeviceLost {
                        device_id: device_id.clone(),
                    });
                }
            }
            let _ = self.updates.send(change).await;
        }

        Ok(())
    }
}
