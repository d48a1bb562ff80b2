//! Filesystem watchdog: periodic snapshots, structural-change detection.
//!
//! The watchdog is paused for the duration of an imaging operation so the
//! growing `.part` file never reaches observers, then resumed with at most
//! one immediate refresh. `start`/`stop` are idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{Events, ImagerEvent};
use crate::imager::fs_ops::FsSnapshot;

#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn current_snapshot(&self) -> Result<FsSnapshot>;
}

pub struct FsWatchdog {
    interval_ms: u64,
    source: Arc<dyn SnapshotSource>,
    events: Events,
    paused: AtomicBool,
    last: StdMutex<Option<FsSnapshot>>,
    shutdown: CancellationToken,
    running: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FsWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatchdog")
            .field("interval_ms", &self.interval_ms)
            .field("paused", &self.paused.load(Ordering::SeqCst))
            .finish()
    }
}

impl FsWatchdog {
    pub fn new(interval_ms: u64, source: Arc<dyn SnapshotSource>, events: Events) -> Arc<Self> {
        Arc::new(Self {
            interval_ms,
            source,
            events,
            paused: AtomicBool::new(false),
            last: StdMutex::new(None),
            shutdown: CancellationToken::new(),
            running: StdMutex::new(None),
        })
    }

    /// Begin polling. A zero interval disables the loop entirely; explicit
    /// refreshes still work.
    pub fn start(self: &Arc<Self>) {
        if self.interval_ms == 0 {
            return;
        }
        let mut running = self.running.lock().expect("watchdog lock");
        if running.is_some() {
            return;
        }

        let watchdog = Arc::clone(self);
        *running = Some(tokio::spawn(async move {
            let interval = Duration::from_millis(watchdog.interval_ms);
            loop {
                tokio::select! {
                    _ = watchdog.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if watchdog.paused.load(Ordering::SeqCst) {
                    continue;
                }
                watchdog.poll_once().await;
            }
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.running.lock().expect("watchdog lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Unpause; with `refresh` a single immediate snapshot is taken so
    /// observers catch up on whatever the operation changed.
    pub async fn resume(&self, refresh: bool) {
        self.paused.store(false, Ordering::SeqCst);
        if refresh {
            self.poll_once().await;
        }
    }

    /// Take a snapshot now and emit if it differs from the last one sent.
    pub async fn refresh_now(&self) {
        self.poll_once().await;
    }

    async fn poll_once(&self) {
        match self.source.current_snapshot().await {
            Ok(snapshot) => {
                let changed = {
                    let mut last = self.last.lock().expect("watchdog lock");
                    if last.as_ref() != Some(&snapshot) {
                        *last = Some(snapshot.clone());
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.events.publish(ImagerEvent::FsUpdated { snapshot });
                }
            }
            Err(err) => {
                tracing::warn!(target: "imager", error = %err, "fs snapshot failed");
            }
        }
    }
}
