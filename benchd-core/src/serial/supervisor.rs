//! Per-device serial link supervision.
//!
//! Each supervised link owns exactly one serial port and runs three
//! cooperating pieces: the supervise loop (open, identify, reconnect
//! backoff), the inbound line pump, and the write path used by the op queue.
//! Inbound lines fan out on a broadcast channel; during the identify
//! handshake they are additionally buffered in a small FIFO so responses
//! arriving before the identify procedure starts draining are not lost.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectConfig;
use crate::device::FaultHistory;
use crate::error::{BenchError, DeviceFault, FaultScope, Result};
use crate::events::{Events, LinkEvent};
use crate::serial::backoff::BackoffPolicy;
use crate::serial::framing::LineFramer;

/// Unclaimed inbound lines buffered for the identify procedure.
const IDENTIFY_FIFO_LIMIT: usize = 256;

/// How a supervisor obtains its port. Production uses [`NativeOpener`];
/// tests substitute in-memory duplex pipes.
#[async_trait]
pub trait PortOpener: Send + Sync + 'static {
    type Port: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn open(&self, path: &str, baud: u32) -> Result<Self::Port>;
}

/// Opens real serial ports at 8N1.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

#[async_trait]
impl PortOpener for NativeOpener {
    type Port = tokio_serial::SerialStream;

    async fn open(&self, path: &str, baud: u32) -> Result<Self::Port> {
        let port = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()?;
        Ok(port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct IdentifyOptions {
    pub expected_token: String,
    pub request: String,
    pub completion: String,
    pub timeout_ms: u64,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Stable label used for events until discovery assigns a device id.
    pub label: String,
    pub baud: u32,
    pub write_eol: String,
    pub identify: Option<IdentifyOptions>,
    pub reconnect: ReconnectConfig,
    pub fault_history_limit: usize,
}

enum IdentifyFailure {
    Mismatch(String),
    Timeout(u64),
}

struct IdentifyBuffer {
    lines: StdMutex<VecDeque<String>>,
    notify: Notify,
}

impl IdentifyBuffer {
    fn new() -> Self {
        Self {
            lines: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("identify buffer lock");
        if lines.len() == IDENTIFY_FIFO_LIMIT {
            lines.pop_front();
        }
        lines.push_back(line);
        drop(lines);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<String> {
        self.lines.lock().expect("identify buffer lock").pop_front()
    }

    fn clear(&self) {
        self.lines.lock().expect("identify buffer lock").clear();
    }

    /// Pop the next buffered line, waiting until `until` at the latest.
    async fn wait_pop(&self, until: Instant) -> Option<String> {
        loop {
            if let Some(line) = self.pop() {
                return Some(line);
            }
            if Instant::now() >= until {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(until) => return self.pop(),
            }
        }
    }
}

pub struct SerialSupervisor<O: PortOpener> {
    opener: O,
    options: LinkOptions,
    events: Events,
    device: StdMutex<String>,
    phase_tx: watch::Sender<LinkPhase>,
    writer: Mutex<Option<WriteHalf<O::Port>>>,
    lines_tx: broadcast::Sender<String>,
    identify_buf: IdentifyBuffer,
    conn_gen: AtomicU64,
    link_down: Notify,
    stop_token: CancellationToken,
    supervise: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
    open_gate: Mutex<()>,
    faults: StdMutex<FaultHistory>,
}

impl<O: PortOpener> fmt::Debug for SerialSupervisor<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSupervisor")
            .field("device", &self.device())
            .field("phase", &self.phase())
            .finish()
    }
}

impl<O: PortOpener> SerialSupervisor<O> {
    pub fn new(opener: O, options: LinkOptions, events: Events) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(LinkPhase::Disconnected);
        let (lines_tx, _) = broadcast::channel(256);
        let fault_limit = options.fault_history_limit;
        Arc::new(Self {
            opener,
            device: StdMutex::new(options.label.clone()),
            options,
            events,
            phase_tx,
            writer: Mutex::new(None),
            lines_tx,
            identify_buf: IdentifyBuffer::new(),
            conn_gen: AtomicU64::new(0),
            link_down: Notify::new(),
            stop_token: CancellationToken::new(),
            supervise: StdMutex::new(None),
            open_gate: Mutex::new(()),
            faults: StdMutex::new(FaultHistory::new(fault_limit)),
        })
    }

    pub fn device(&self) -> String {
        self.device.lock().expect("device lock").clone()
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<LinkPhase> {
        self.phase_tx.subscribe()
    }

    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.lines_tx.subscribe()
    }

    pub fn faults(&self) -> Vec<DeviceFault> {
        self.faults
            .lock()
            .expect("faults lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Begin supervising the given path: open, identify, and keep the link
    /// alive with bounded backoff until `detach` or `stop`.
    pub fn attach(self: &Arc<Self>, device_id: impl Into<String>, path: impl Into<String>) {
        let path = path.into();
        *self.device.lock().expect("device lock") = device_id.into();

        let token = self.stop_token.child_token();
        let handle = tokio::spawn(Self::supervise_loop(
            Arc::clone(self),
            path,
            token.clone(),
        ));

        let previous = self
            .supervise
            .lock()
            .expect("supervise lock")
            .replace((token, handle));
        if let Some((old_token, old_handle)) = previous {
            old_token.cancel();
            old_handle.abort();
        }
    }

    /// Stop supervising (device lost). The port closes and no reconnect
    /// fires until a new `attach`.
    pub async fn detach(&self, reason: &str) {
        let taken = self.supervise.lock().expect("supervise lock").take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.await;
        }
        self.close_port(reason, LinkPhase::Disconnected).await;
    }

    /// Full shutdown: waits for any in-flight open attempt, closes the port,
    /// and guarantees no reconnect timer fires afterwards.
    pub async fn stop(&self) {
        self.stop_token.cancel();
        let taken = self.supervise.lock().expect("supervise lock").take();
        if let Some((_, handle)) = taken {
            let _ = handle.await;
        }
        let _gate = self.open_gate.lock().await;
        self.close_port("stopped", LinkPhase::Disconnected).await;
    }

    /// Write one line (EOL appended) to the open port.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(BenchError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port not open",
            )));
        };

        let mut bytes = Vec::with_capacity(line.len() + self.options.write_eol.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(self.options.write_eol.as_bytes());
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn set_phase(&self, phase: LinkPhase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    fn record_fault(&self, fault: DeviceFault) {
        self.faults.lock().expect("faults lock").record(fault);
    }

    async fn supervise_loop(self: Arc<Self>, path: String, token: CancellationToken) {
        let mut failures: u32 = 0;
        let backoff = BackoffPolicy::reconnect(
            self.options.reconnect.base_delay_ms,
            self.options.reconnect.max_delay_ms,
        );

        loop {
            if token.is_cancelled() {
                return;
            }

            match self.connect_once(&path).await {
                Ok(r#gen) => {
                    failures = 0;
                    tokio::select! {
                        _ = token.cancelled() => {
                            self.close_port("stopped", LinkPhase::Disconnected).await;
                            return;
                        }
                        _ = self.wait_down(r#gen) => {}
                    }
                }
                Err(_) => {
                    failures += 1;
                }
            }

            let reconnect = &self.options.reconnect;
            if !reconnect.enabled {
                return;
            }
            if reconnect.max_attempts > 0 && failures >= reconnect.max_attempts {
                let fault = DeviceFault::new(
                    FaultScope::Open,
                    format!(
                        "giving up on {path} after {} failed attempts",
                        reconnect.max_attempts
                    ),
                    false,
                );
                self.record_fault(fault.clone());
                self.set_phase(LinkPhase::Error);
                self.events.publish(LinkEvent::FatalError {
                    device_id: self.device(),
                    fault,
                });
                return;
            }

            let attempt = failures.max(1);
            let delay_ms = backoff.delay_ms(attempt);
            self.events.publish(LinkEvent::Reconnecting {
                device_id: self.device(),
                attempt,
                delay_ms,
            });
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
    }

    /// One open + identify attempt. Emits its own events and leaves the port
    /// closed on failure.
    async fn connect_once(self: &Arc<Self>, path: &str) -> Result<u64> {
        let _gate = self.open_gate.lock().await;

        self.quiet_close().await;
        self.set_phase(LinkPhase::Connecting);

        let port = match self.opener.open(path, self.options.baud).await {
            Ok(port) => port,
            Err(err) => {
                let fault = DeviceFault::from_error(FaultScope::Open, &err);
                self.record_fault(fault.clone());
                self.set_phase(LinkPhase::Error);
                self.events.publish(LinkEvent::RecoverableError {
                    device_id: self.device(),
                    fault,
                });
                return Err(err);
            }
        };

        let r#gen = self.conn_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = tokio::io::split(port);
        *self.writer.lock().await = Some(write_half);
        self.identify_buf.clear();

        tokio::spawn(Self::pump_lines(Arc::clone(self), read_half, r#gen));
        self.events.publish(LinkEvent::DeviceConnected {
            device_id: self.device(),
        });

        let Some(identify) = self.options.identify.clone() else {
            self.set_phase(LinkPhase::Ready);
            self.events.publish(LinkEvent::Ready {
                device_id: self.device(),
            });
            return Ok(r#gen);
        };

        self.set_phase(LinkPhase::Identifying);
        self.events.publish(LinkEvent::IdentifyStart {
            device_id: self.device(),
        });

        match self.run_identify(&identify).await {
            Ok(token) => {
                self.write_line(&identify.completion).await?;
                self.set_phase(LinkPhase::Ready);
                self.events.publish(LinkEvent::IdentifySuccess {
                    device_id: self.device(),
                    token,
                });
                self.events.publish(LinkEvent::Ready {
                    device_id: self.device(),
                });
                Ok(r#gen)
            }
            Err(failure) => {
                let (fault, reason) = match failure {
                    IdentifyFailure::Mismatch(token) => (
                        DeviceFault::new(
                            FaultScope::Identify,
                            format!("unexpected identify token: {token}"),
                            true,
                        ),
                        "unknown".to_string(),
                    ),
                    IdentifyFailure::Timeout(ms) => (
                        DeviceFault::new(
                            FaultScope::Identify,
                            format!("no identify token within {ms}ms"),
                            true,
                        ),
                        "identify-timeout".to_string(),
                    ),
                };
                self.record_fault(fault.clone());
                self.events.publish(LinkEvent::IdentifyFailed {
                    device_id: self.device(),
                    fault: fault.clone(),
                });
                self.close_port(&reason, LinkPhase::Error).await;
                Err(BenchError::Identify(fault.message))
            }
        }
    }

    /// Drain the identify FIFO until the expected token arrives or the
    /// shared deadline expires. Retried requests share one deadline; early
    /// windows are short to absorb reset-on-open chatter.
    async fn run_identify(
        &self,
        identify: &IdentifyOptions,
    ) -> std::result::Result<String, IdentifyFailure> {
        let deadline = Instant::now() + Duration::from_millis(identify.timeout_ms);
        let attempts = identify.retries.max(1);

        for attempt in 1..=attempts {
            if Instant::now() >= deadline {
                break;
            }
            if self.write_line(&identify.request).await.is_err() {
                break;
            }

            let window_end = if attempt < attempts {
                let short = Duration::from_millis((150u64 << (attempt - 1).min(8)).min(750));
                (Instant::now() + short).min(deadline)
            } else {
                deadline
            };

            while let Some(line) = self.identify_buf.wait_pop(window_end).await {
                if line.starts_with("debug:") || line.starts_with("done:") {
                    continue;
                }
                if line == identify.expected_token {
                    return Ok(line);
                }
                return Err(IdentifyFailure::Mismatch(line));
            }
        }

        Err(IdentifyFailure::Timeout(identify.timeout_ms))
    }

    async fn pump_lines(self: Arc<Self>, mut read_half: ReadHalf<O::Port>, r#gen: u64) {
        let mut framer = LineFramer::new();
        let mut buf = [0u8; 512];

        let reason = loop {
            if self.conn_gen.load(Ordering::SeqCst) != r#gen {
                return;
            }
            tokio::select! {
                _ = self.stop_token.cancelled() => return,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break "eof".to_string(),
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            self.dispatch_line(line);
                        }
                    }
                    Err(err) => break err.to_string(),
                }
            }
        };

        if self.conn_gen.load(Ordering::SeqCst) == r#gen {
            tracing::debug!(target: "serial", device = %self.device(), %reason, "link down");
            self.record_fault(DeviceFault::new(FaultScope::Read, reason.clone(), true));
            *self.writer.lock().await = None;
            self.set_phase(LinkPhase::Disconnected);
            self.events.publish(LinkEvent::DeviceDisconnected {
                device_id: self.device(),
                reason,
            });
            self.link_down.notify_one();
        }
    }

    fn dispatch_line(&self, line: String) {
        let phase = self.phase();
        if matches!(phase, LinkPhase::Connecting | LinkPhase::Identifying) {
            self.identify_buf.push(line.clone());
        }
        let _ = self.lines_tx.send(line);
    }

    async fn wait_down(&self, r#gen: u64) {
        loop {
            if self.conn_gen.load(Ordering::SeqCst) != r#gen {
                return;
            }
            if matches!(self.phase(), LinkPhase::Disconnected | LinkPhase::Error) {
                return;
            }
            self.link_down.notified().await;
        }
    }

    /// Tear down without events: used right before reopening.
    async fn quiet_close(&self) {
        self.conn_gen.fetch_add(1, Ordering::SeqCst);
        *self.writer.lock().await = None;
    }

    async fn close_port(&self, reason: &str, phase: LinkPhase) {
        self.conn_gen.fetch_add(1, Ordering::SeqCst);
        let had_port = self.writer.lock().await.take().is_some();
        self.set_phase(phase);
        if had_port {
            self.events.publish(LinkEvent::DeviceDisconnected {
                device_id: self.device(),
                reason: reason.to_string(),
            });
        }
    }
}
