//! Shared fixtures: an event-capturing sink, a scripted serial opener, and
//! small async wait helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use benchd_core::error::Result;
use benchd_core::events::{BenchEvent, EventSink};
use benchd_core::serial::PortOpener;

/// Records every published event for later assertions.
#[derive(Debug, Default)]
pub struct CaptureSink {
    events: Mutex<Vec<BenchEvent>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<BenchEvent> {
        self.events.lock().expect("capture lock").clone()
    }

    /// Event tags in emission order, e.g. `["device-connected", "ready"]`.
    pub fn tags(&self) -> Vec<String> {
        self.all()
            .iter()
            .filter_map(|event| {
                serde_json::to_value(event)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            })
            .collect()
    }

    pub fn count_tag(&self, tag: &str) -> usize {
        self.tags().iter().filter(|t| t.as_str() == tag).count()
    }
}

impl EventSink for CaptureSink {
    fn publish(&self, event: &BenchEvent) -> Result<()> {
        self.events.lock().expect("capture lock").push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "capture"
    }
}

/// Firmware behaviour for one fake serial device.
#[derive(Debug, Clone, Default)]
pub struct FirmwareConfig {
    /// Line written back when the host sends `identify`.
    pub identify_response: Option<String>,
    /// Lines pushed unprompted as soon as the port opens.
    pub greeting: Vec<String>,
    /// Lines pushed once the host acknowledges with `identify_complete`.
    pub post_identify: Vec<String>,
}

/// Emulates the device side of a duplex pipe: logs every inbound line and
/// answers identify requests per the config.
pub fn spawn_firmware(
    mut stream: DuplexStream,
    config: FirmwareConfig,
    wire_log: Arc<Mutex<Vec<String>>>,
) {
    tokio::spawn(async move {
        for line in &config.greeting {
            if stream.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
        }

        let mut buf = [0u8; 256];
        let mut pending = Vec::new();
        loop {
            let Ok(n) = stream.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            pending.extend_from_slice(&buf[..n]);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                    .trim()
                    .to_string();
                if line.is_empty() {
                    continue;
                }
                wire_log.lock().expect("wire lock").push(line.clone());

                if line == "identify" {
                    if let Some(response) = &config.identify_response {
                        let _ = stream
                            .write_all(format!("{response}\n").as_bytes())
                            .await;
                    }
                } else if line == "identify_complete" {
                    for extra in &config.post_identify {
                        let _ = stream.write_all(format!("{extra}\n").as_bytes()).await;
                    }
                }
            }
        }
    });
}

/// A [`PortOpener`] that hands out duplex pipes driven by fake firmware.
pub struct ScriptedOpener {
    config: FirmwareConfig,
    pub wire_log: Arc<Mutex<Vec<String>>>,
    pub opens: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn new(config: FirmwareConfig) -> Self {
        Self {
            config,
            wire_log: Arc::new(Mutex::new(Vec::new())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn wire(&self) -> Vec<String> {
        self.wire_log.lock().expect("wire lock").clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortOpener for ScriptedOpener {
    type Port = DuplexStream;

    async fn open(&self, _path: &str, _baud: u32) -> Result<Self::Port> {
        let (host, device) = tokio::io::duplex(4096);
        spawn_firmware(device, self.config.clone(), Arc::clone(&self.wire_log));
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(host)
    }
}

/// Poll until `cond` holds or the timeout elapses; panics on timeout.
pub async fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
