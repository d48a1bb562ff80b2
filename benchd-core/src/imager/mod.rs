//! CompactFlash imager service.
//!
//! Owns a bounded root directory and the external read/write scripts. File
//! operations and imaging runs are serialized through the device op queue;
//! imaging additionally enforces at-most-one in flight across queued work.

pub mod fs_ops;
pub mod media;
pub mod paths;
pub mod progress;
pub mod watchdog;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::ImagerConfig;
use crate::error::{BenchError, Result};
use crate::events::{Events, ImagerEvent};
use crate::ops::{OpContext, OpExec, OpHandle, OpKind, OpMeta, OpQueue, QueueConfig};

pub use fs_ops::{EntryKind, FsEntry, FsSnapshot};
pub use media::{MediaState, probe_media};
pub use paths::{check_safe_name, resolve_within};
pub use progress::{ImagingProgress, ProgressSample, RateWindowAvg, parse_progress_line};
pub use watchdog::{FsWatchdog, SnapshotSource};

use crate::device::UNMOUNTED_PATH;

/// Snapshot provider shared between the service and its watchdog. Resets
/// the cwd to the root when it disappears underneath us.
struct CwdSnapshotSource {
    root: PathBuf,
    max_entries: usize,
    visible_extensions: Vec<String>,
    cwd: Arc<StdMutex<String>>,
}

#[async_trait]
impl SnapshotSource for CwdSnapshotSource {
    async fn current_snapshot(&self) -> Result<FsSnapshot> {
        let cwd = self.cwd.lock().expect("cwd lock").clone();
        let dir = paths::resolve_within(&self.root, &cwd)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tracing::warn!(target: "imager", lost = %cwd, "cwd vanished, resetting to root");
            self.cwd.lock().expect("cwd lock").clear();
        }
        let cwd = self.cwd.lock().expect("cwd lock").clone();
        fs_ops::snapshot_dir(&self.root, &cwd, self.max_entries, &self.visible_extensions).await
    }
}

pub struct ImagerService {
    config: ImagerConfig,
    events: Events,
    queue: Arc<OpQueue>,
    cwd: Arc<StdMutex<String>>,
    reader_path: StdMutex<Option<String>>,
    media: StdMutex<MediaState>,
    watchdog: Arc<FsWatchdog>,
}

impl std::fmt::Debug for ImagerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagerService")
            .field("root", &self.config.root_dir)
            .field("cwd", &*self.cwd.lock().expect("cwd lock"))
            .field("media", &*self.media.lock().expect("media lock"))
            .finish()
    }
}

impl ImagerService {
    pub fn new(config: ImagerConfig, events: Events) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.root_dir)?;

        let cwd = Arc::new(StdMutex::new(String::new()));
        let source = Arc::new(CwdSnapshotSource {
            root: config.root_dir.clone(),
            max_entries: config.max_entries,
            visible_extensions: config.visible_extensions.clone(),
            cwd: Arc::clone(&cwd),
        });
        let watchdog = FsWatchdog::new(config.fs_poll_ms, source, events.clone());
        watchdog.start();

        let queue = OpQueue::spawn(config.kind.clone(), QueueConfig::default(), events.clone());

        Ok(Arc::new(Self {
            config,
            events,
            queue,
            cwd,
            reader_path: StdMutex::new(None),
            media: StdMutex::new(MediaState::Unknown),
            watchdog,
        }))
    }

    pub fn queue(&self) -> &Arc<OpQueue> {
        &self.queue
    }

    pub fn watchdog(&self) -> &Arc<FsWatchdog> {
        &self.watchdog
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().expect("cwd lock").clone()
    }

    pub fn media(&self) -> MediaState {
        *self.media.lock().expect("media lock")
    }

    pub fn reader_path(&self) -> Option<String> {
        self.reader_path.lock().expect("reader lock").clone()
    }

    /// Discovery found (or re-found) the reader hardware.
    pub async fn attach_reader(&self, device_id: &str, path: &str) {
        self.queue.set_device(device_id);
        *self.reader_path.lock().expect("reader lock") = Some(path.to_string());
        self.refresh_media().await;
    }

    pub async fn detach_reader(&self) {
        *self.reader_path.lock().expect("reader lock") = None;
        self.set_media(MediaState::Unknown);
    }

    /// Probe the reader and emit `media-updated` on a state transition;
    /// repeated same-state probes stay silent.
    pub async fn refresh_media(&self) -> MediaState {
        let state = match self.reader_path() {
            Some(path) => probe_media(&path).await,
            None => MediaState::Unknown,
        };
        self.set_media(state);
        state
    }

    fn set_media(&self, state: MediaState) {
        let changed = {
            let mut media = self.media.lock().expect("media lock");
            if *media == state {
                false
            } else {
                *media = state;
                true
            }
        };
        if changed {
            self.events.publish(ImagerEvent::MediaUpdated {
                device_id: self.queue.device(),
                media: state,
            });
        }
    }

    /// Navigate to `rel` and list it. The path is validated before anything
    /// is enqueued; an escape never reaches the filesystem.
    pub fn list(&self, rel: &str) -> Result<OpHandle> {
        paths::resolve_within(&self.config.root_dir, rel)?;
        let rel = paths::normalize_rel(rel)?;

        let root = self.config.root_dir.clone();
        let max_entries = self.config.max_entries;
        let exts = self.config.visible_extensions.clone();
        let cwd = Arc::clone(&self.cwd);
        let watchdog = Arc::clone(&self.watchdog);

        let meta = OpMeta {
            label: Some(format!("list {}", if rel.is_empty() { "/" } else { rel.as_str() })),
            requested_by: None,
            payload: Some(json!({"path": rel})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                let snapshot = fs_ops::snapshot_dir(&root, &rel, max_entries, &exts).await?;
                *cwd.lock().expect("cwd lock") = rel;
                watchdog.refresh_now().await;
                Ok(serde_json::to_value(&snapshot)?)
            })
        });
        self.queue.enqueue(OpKind::List, meta, exec)
    }

    pub fn make_directory(&self, name: &str) -> Result<OpHandle> {
        paths::check_safe_name(name)?;
        let root = self.config.root_dir.clone();
        let cwd = Arc::clone(&self.cwd);
        let watchdog = Arc::clone(&self.watchdog);
        let name = name.to_string();

        let meta = OpMeta {
            label: Some(format!("mkdir {name}")),
            requested_by: None,
            payload: Some(json!({"name": name})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                let here = cwd.lock().expect("cwd lock").clone();
                let changed = fs_ops::make_dir(&root, &here, &name).await?;
                if changed {
                    watchdog.refresh_now().await;
                }
                Ok(json!({"changed": changed}))
            })
        });
        self.queue.enqueue(OpKind::Mkdir, meta, exec)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<OpHandle> {
        paths::check_safe_name(from)?;
        paths::check_safe_name(to)?;
        let root = self.config.root_dir.clone();
        let cwd = Arc::clone(&self.cwd);
        let watchdog = Arc::clone(&self.watchdog);
        let (from, to) = (from.to_string(), to.to_string());

        let meta = OpMeta {
            label: Some(format!("rename {from} -> {to}")),
            requested_by: None,
            payload: Some(json!({"from": from, "to": to})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                let here = cwd.lock().expect("cwd lock").clone();
                let changed = fs_ops::rename_entry(&root, &here, &from, &to).await?;
                if changed {
                    watchdog.refresh_now().await;
                }
                Ok(json!({"changed": changed}))
            })
        });
        self.queue.enqueue(OpKind::Rename, meta, exec)
    }

    pub fn move_to(&self, from: &str, dest_dir: &str) -> Result<OpHandle> {
        paths::check_safe_name(from)?;
        paths::resolve_within(&self.config.root_dir, dest_dir)?;
        let root = self.config.root_dir.clone();
        let cwd = Arc::clone(&self.cwd);
        let watchdog = Arc::clone(&self.watchdog);
        let (from, dest_dir) = (from.to_string(), dest_dir.to_string());

        let meta = OpMeta {
            label: Some(format!("move {from} -> {dest_dir}")),
            requested_by: None,
            payload: Some(json!({"from": from, "destDir": dest_dir})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                let here = cwd.lock().expect("cwd lock").clone();
                let changed = fs_ops::move_entry(&root, &here, &from, &dest_dir).await?;
                if changed {
                    watchdog.refresh_now().await;
                }
                Ok(json!({"changed": changed}))
            })
        });
        self.queue.enqueue(OpKind::Move, meta, exec)
    }

    pub fn delete(&self, rel: &str) -> Result<OpHandle> {
        let here = self.cwd();
        let joined = if here.is_empty() {
            rel.to_string()
        } else {
            format!("{here}/{rel}")
        };
        paths::resolve_within(&self.config.root_dir, &joined)?;
        let root = self.config.root_dir.clone();
        let cwd = Arc::clone(&self.cwd);
        let watchdog = Arc::clone(&self.watchdog);
        let rel = rel.to_string();

        let meta = OpMeta {
            label: Some(format!("delete {rel}")),
            requested_by: None,
            payload: Some(json!({"path": rel})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                let here = cwd.lock().expect("cwd lock").clone();
                let changed = fs_ops::delete_entry(&root, &here, &rel).await?;
                if changed {
                    watchdog.refresh_now().await;
                }
                Ok(json!({"changed": changed}))
            })
        });
        self.queue.enqueue(OpKind::Delete, meta, exec)
    }

    /// Write `<cwd>/<name>.img` onto the media in the reader.
    pub fn write_image(&self, name: &str, requested_by: Option<String>) -> Result<OpHandle> {
        paths::check_safe_name(name)?;
        self.ensure_no_imaging()?;

        let service = self.view();
        let name = name.to_string();
        let meta = OpMeta {
            label: Some(format!("write {name}")),
            requested_by,
            payload: Some(json!({"image": name})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move { service.run_write(&ctx, &name).await })
        });
        self.queue.enqueue(OpKind::Write, meta, exec)
    }

    /// Read the media in the reader into `<dest_dir>/<name>.img`.
    pub fn read_image(
        &self,
        dest_dir: &str,
        name: &str,
        requested_by: Option<String>,
    ) -> Result<OpHandle> {
        paths::check_safe_name(name)?;
        paths::resolve_within(&self.config.root_dir, dest_dir)?;
        self.ensure_no_imaging()?;

        let service = self.view();
        let (dest_dir, name) = (dest_dir.to_string(), name.to_string());
        let meta = OpMeta {
            label: Some(format!("read -> {name}")),
            requested_by,
            payload: Some(json!({"destDir": dest_dir, "image": name})),
        };
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move { service.run_read(&ctx, &dest_dir, &name).await })
        });
        self.queue.enqueue(OpKind::Read, meta, exec)
    }

    pub async fn stop(&self) {
        self.queue.stop("service stopped").await;
        self.watchdog.stop().await;
    }

    fn ensure_no_imaging(&self) -> Result<()> {
        let active = self
            .queue
            .active()
            .map(|op| op.kind.is_imaging())
            .unwrap_or(false);
        if active || self.queue.has_queued(|op| op.kind.is_imaging()) {
            return Err(BenchError::Busy("operation already in progress".into()));
        }
        Ok(())
    }

    fn view(&self) -> ImagerRun {
        ImagerRun {
            config: self.config.clone(),
            events: self.events.clone(),
            queue: Arc::clone(&self.queue),
            cwd: Arc::clone(&self.cwd),
            reader_path: self.reader_path(),
            watchdog: Arc::clone(&self.watchdog),
        }
    }
}

/// Everything an imaging run needs, detached from the service so the op
/// closure owns its state.
struct ImagerRun {
    config: ImagerConfig,
    events: Events,
    queue: Arc<OpQueue>,
    cwd: Arc<StdMutex<String>>,
    reader_path: Option<String>,
    watchdog: Arc<FsWatchdog>,
}

impl ImagerRun {
    /// Fresh probe at run time; the enqueue-time state may be stale.
    async fn require_media(&self) -> Result<String> {
        let Some(path) = self.reader_path.clone() else {
            return Err(BenchError::NotFound("no card reader attached".into()));
        };
        if path == UNMOUNTED_PATH {
            return Err(BenchError::NotFound("reader has no media".into()));
        }
        if probe_media(&path).await != MediaState::Present {
            return Err(BenchError::NotFound("no media present in reader".into()));
        }
        Ok(path)
    }

    async fn run_write(&self, ctx: &OpContext, name: &str) -> Result<serde_json::Value> {
        ctx.checkpoint()?;
        let device = self.require_media().await?;

        let here = self.cwd.lock().expect("cwd lock").clone();
        let dir = paths::resolve_within(&self.config.root_dir, &here)?;
        let image = dir.join(format!("{name}.img"));
        let meta = tokio::fs::metadata(&image).await.map_err(|_| {
            BenchError::NotFound(format!("image not found: {name}.img"))
        })?;
        if !meta.is_file() {
            return Err(BenchError::NotFound(format!("not a regular file: {name}.img")));
        }

        self.watchdog.pause();
        let run = self
            .run_script(
                ctx,
                &self.config.write_script,
                image.to_string_lossy().as_ref(),
                &device,
                "write",
                name,
            )
            .await;
        // A clean write leaves the root untouched; everything else warrants
        // a refresh.
        self.watchdog.resume(run.is_err()).await;
        run?;
        Ok(json!({"image": format!("{name}.img"), "device": device}))
    }

    async fn run_read(&self, ctx: &OpContext, dest_dir: &str, name: &str) -> Result<serde_json::Value> {
        ctx.checkpoint()?;
        let device = self.require_media().await?;

        let dest = paths::resolve_within(&self.config.root_dir, dest_dir)?;
        let target = dest.join(format!("{name}.img"));

        self.watchdog.pause();
        let run = self
            .run_script(
                ctx,
                &self.config.read_script,
                &device,
                target.to_string_lossy().as_ref(),
                "read",
                name,
            )
            .await;
        self.watchdog.resume(true).await;
        run?;
        Ok(json!({"image": format!("{name}.img"), "device": device}))
    }

    async fn run_script(
        &self,
        ctx: &OpContext,
        script: &std::path::Path,
        arg1: &str,
        arg2: &str,
        direction: &str,
        image: &str,
    ) -> Result<()> {
        let mut child = Command::new(script)
            .arg(arg1)
            .arg(arg2)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        self.events.publish(ImagerEvent::ImagingStarted {
            device_id: self.queue.device(),
            direction: direction.to_string(),
            image: image.to_string(),
        });

        if let Some(stderr) = child.stderr.take() {
            let device = self.queue.device();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "imager", device = %device, line = %line, "script stderr");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BenchError::Internal("script stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut rate = RateWindowAvg::new();
        let started = Instant::now();
        let mut last_total = 0u64;

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(sample) = parse_progress_line(&line) {
                            rate.push(started.elapsed().as_secs_f64(), sample.bytes);
                            last_total = sample.total;
                            self.events.publish(ImagerEvent::Progress {
                                device_id: self.queue.device(),
                                progress: ImagingProgress::new(sample, rate.bytes_per_sec()),
                            });
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    // Cancellation kills the child via kill_on_drop.
                    ctx.checkpoint()?;
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            self.events.publish(ImagerEvent::Progress {
                device_id: self.queue.device(),
                progress: ImagingProgress::completed(last_total, rate.bytes_per_sec()),
            });
            self.events.publish(ImagerEvent::ImagingFinished {
                device_id: self.queue.device(),
                direction: direction.to_string(),
                image: image.to_string(),
            });
            Ok(())
        } else {
            let reason = exit_reason(&status);
            Err(BenchError::Internal(reason))
        }
    }
}

fn exit_reason(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated".to_string(),
    }
}
