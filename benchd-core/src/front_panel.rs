//! Front-panel power sense service.
//!
//! The front panel is a small serial peripheral (identify token `FP`) that
//! reports the host's power rail as `sense:on` / `sense:off` lines. This
//! service owns its supervised link and writes the authoritative
//! `frontPanel` slice that the policy gate watches. Before the first report,
//! and whenever the link drops, the sense is `unknown`.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{FrontPanelConfig, SerialConfig};
use crate::events::Events;
use crate::policy::PowerSense;
use crate::serial::{IdentifyOptions, LinkOptions, LinkPhase, PortOpener, SerialSupervisor};
use crate::state::StateFabric;

pub const FRONT_PANEL_SLICE: &str = "frontPanel";

fn parse_sense(line: &str) -> Option<PowerSense> {
    match line.trim() {
        "sense:on" => Some(PowerSense::On),
        "sense:off" => Some(PowerSense::Off),
        _ => None,
    }
}

pub struct FrontPanelService<O: PortOpener> {
    link: Arc<SerialSupervisor<O>>,
    fabric: Arc<StateFabric>,
    last: StdMutex<PowerSense>,
    shutdown: CancellationToken,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl<O: PortOpener> std::fmt::Debug for FrontPanelService<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontPanelService")
            .field("device", &self.link.device())
            .field("sense", &*self.last.lock().expect("sense lock"))
            .finish()
    }
}

impl<O: PortOpener> FrontPanelService<O> {
    pub fn new(
        opener: O,
        serial: &SerialConfig,
        config: &FrontPanelConfig,
        events: Events,
        fabric: Arc<StateFabric>,
    ) -> Arc<Self> {
        let link = SerialSupervisor::new(
            opener,
            LinkOptions {
                label: config.kind.clone(),
                baud: config.baud,
                write_eol: serial.write_eol.clone(),
                identify: Some(IdentifyOptions {
                    expected_token: config.id_token.clone(),
                    request: serial.identify_request.clone(),
                    completion: serial.identify_completion.clone(),
                    timeout_ms: serial.identify_timeout_ms,
                    retries: serial.retries,
                }),
                reconnect: config.reconnect,
                fault_history_limit: 50,
            },
            events,
        );

        let service = Arc::new(Self {
            link,
            fabric,
            last: StdMutex::new(PowerSense::Unknown),
            shutdown: CancellationToken::new(),
            pump: StdMutex::new(None),
        });

        service.set_sense(PowerSense::Unknown, true);
        let handle = tokio::spawn(Self::pump_loop(Arc::clone(&service)));
        *service.pump.lock().expect("pump lock") = Some(handle);
        service
    }

    pub fn link(&self) -> &Arc<SerialSupervisor<O>> {
        &self.link
    }

    pub fn sense(&self) -> PowerSense {
        *self.last.lock().expect("sense lock")
    }

    pub fn attach(&self, device_id: &str, path: &str) {
        self.link.attach(device_id, path);
    }

    pub async fn detach(&self, reason: &str) {
        self.link.detach(reason).await;
        self.set_sense(PowerSense::Unknown, false);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.pump.lock().expect("pump lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.link.stop().await;
    }

    async fn pump_loop(service: Arc<Self>) {
        let mut lines = service.link.subscribe_lines();
        let mut phase = service.link.subscribe_phase();

        loop {
            tokio::select! {
                _ = service.shutdown.cancelled() => break,
                line = lines.recv() => match line {
                    Ok(line) => {
                        if let Some(sense) = parse_sense(&line) {
                            service.set_sense(sense, false);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "frontpanel", skipped, "sense stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                changed = phase.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *phase.borrow_and_update();
                    if matches!(current, LinkPhase::Disconnected | LinkPhase::Error) {
                        service.set_sense(PowerSense::Unknown, false);
                    }
                }
            }
        }
    }

    fn set_sense(&self, sense: PowerSense, force: bool) {
        {
            let mut last = self.last.lock().expect("sense lock");
            if *last == sense && !force {
                return;
            }
            *last = sense;
        }
        self.fabric.update(
            FRONT_PANEL_SLICE,
            json!({
                "powerSense": sense,
                "updatedAtMs": Utc::now().timestamp_millis(),
            }),
        );
    }
}
