//! Per-device operation queue: bounded FIFO, exactly one op in flight.
//!
//! Cancellation is tied to the active op's sequence number. Raising a cancel
//! with nothing active drains the backlog but never leaves a sticky flag
//! behind, so later ops cannot be poisoned by an earlier cancel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BenchError, DeviceFault, FaultScope, Result};
use crate::events::{Events, OpEvent};
use crate::ops::{OpKind, OpMeta, OpStatus, Operation};

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_depth: usize,
    pub inter_command_delay_ms: u64,
    pub history_limit: usize,
    /// Keep queued ops across a device reconnect instead of dropping them.
    pub retain_across_reconnect: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 500,
            inter_command_delay_ms: 25,
            history_limit: 100,
            retain_across_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Completed(Value),
    Cancelled { reason: String },
    Failed { fault: DeviceFault },
}

/// Completion handle returned by enqueue. `wait` resolves to the terminal
/// outcome once the worker settles the op.
#[derive(Debug)]
pub struct OpHandle {
    pub id: String,
    done: oneshot::Receiver<OpOutcome>,
}

impl OpHandle {
    pub async fn wait(self) -> OpOutcome {
        self.done.await.unwrap_or(OpOutcome::Cancelled {
            reason: "queue dropped".into(),
        })
    }
}

pub type OpExec = Box<dyn FnOnce(OpContext) -> BoxFuture<'static, Result<Value>> + Send + 'static>;

#[derive(Debug, Clone)]
struct CancelRequest {
    seq: u64,
    reason: String,
}

/// Cooperative cancellation view handed to the executing op.
#[derive(Debug, Clone)]
pub struct OpContext {
    seq: u64,
    op_id: String,
    cancel: Arc<Mutex<Option<CancelRequest>>>,
}

impl OpContext {
    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    /// Fail fast when this op has been cancelled. Call before every wire
    /// write and at each long-loop iteration.
    pub fn checkpoint(&self) -> Result<()> {
        let cell = self.cancel.lock().expect("cancel lock");
        match &*cell {
            Some(req) if req.seq == self.seq => Err(BenchError::Cancelled(req.reason.clone())),
            _ => Ok(()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.checkpoint().is_err()
    }
}

struct QueuedOp {
    seq: u64,
    op: Operation,
    exec: OpExec,
    done: oneshot::Sender<OpOutcome>,
}

struct QueueState {
    backlog: VecDeque<QueuedOp>,
    active: Option<(u64, Operation)>,
    history: VecDeque<Operation>,
    next_seq: u64,
}

pub struct OpQueue {
    device: Mutex<String>,
    config: QueueConfig,
    events: Events,
    state: Mutex<QueueState>,
    cancel: Arc<Mutex<Option<CancelRequest>>>,
    notify: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for OpQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("queue lock");
        f.debug_struct("OpQueue")
            .field("device", &*self.device.lock().expect("device lock"))
            .field("backlog", &state.backlog.len())
            .field("active", &state.active.as_ref().map(|(_, op)| op.id.clone()))
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl OpQueue {
    pub fn spawn(device: impl Into<String>, config: QueueConfig, events: Events) -> Arc<Self> {
        let queue = Arc::new(Self {
            device: Mutex::new(device.into()),
            config,
            events,
            state: Mutex::new(QueueState {
                backlog: VecDeque::new(),
                active: None,
                history: VecDeque::new(),
                next_seq: 1,
            }),
            cancel: Arc::new(Mutex::new(None)),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::worker_loop(Arc::clone(&queue)));
        *queue.worker.lock().expect("worker lock") = Some(handle);
        queue
    }

    pub fn device(&self) -> String {
        self.device.lock().expect("device lock").clone()
    }

    pub fn set_device(&self, device: impl Into<String>) {
        *self.device.lock().expect("device lock") = device.into();
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.state.lock().expect("queue lock").backlog.len()
    }

    pub fn active(&self) -> Option<Operation> {
        self.state
            .lock()
            .expect("queue lock")
            .active
            .as_ref()
            .map(|(_, op)| op.clone())
    }

    /// Whether any backlog op matches the predicate.
    pub fn has_queued(&self, pred: impl Fn(&Operation) -> bool) -> bool {
        self.state
            .lock()
            .expect("queue lock")
            .backlog
            .iter()
            .any(|item| pred(&item.op))
    }

    /// Terminal ops, newest first.
    pub fn history(&self) -> Vec<Operation> {
        let state = self.state.lock().expect("queue lock");
        state.history.iter().cloned().collect()
    }

    pub fn enqueue(&self, kind: OpKind, meta: OpMeta, exec: OpExec) -> Result<OpHandle> {
        if self.shutdown.is_cancelled() {
            return Err(BenchError::Queue("queue stopped".into()));
        }

        let (seq, op) = {
            let mut state = self.state.lock().expect("queue lock");
            if state.backlog.len() >= self.config.max_depth {
                return Err(BenchError::Queue(format!(
                    "queue depth limit {} reached",
                    self.config.max_depth
                )));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            (seq, Operation::new(kind, meta))
        };

        // Announce before the op becomes poppable so `queued` always
        // precedes `started`.
        self.events.publish(OpEvent::OpQueued {
            device_id: self.device(),
            op: op.clone(),
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().expect("queue lock");
            state.backlog.push_back(QueuedOp {
                seq,
                op: op.clone(),
                exec,
                done: tx,
            });
        }
        self.notify.notify_one();
        Ok(OpHandle { id: op.id, done: rx })
    }

    /// Settle an op as cancelled without ever running it. Used by services
    /// that refuse work up front (host-power gate).
    pub fn reject_cancelled(&self, kind: OpKind, meta: OpMeta, reason: &str) -> OpHandle {
        let mut op = Operation::new(kind, meta);
        self.events.publish(OpEvent::OpQueued {
            device_id: self.device(),
            op: op.clone(),
        });

        op.status = OpStatus::Cancelled;
        op.ended_at = Some(Utc::now().timestamp_millis());
        op.error = Some(reason.to_string());
        self.record_history(op.clone());

        self.events.publish(OpEvent::OpCancelled {
            device_id: self.device(),
            op: op.clone(),
            reason: reason.to_string(),
        });

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(OpOutcome::Cancelled {
            reason: reason.to_string(),
        });
        OpHandle { id: op.id, done: rx }
    }

    /// Request cancellation of the active op, if any. With nothing active
    /// this is a no-op by design.
    pub fn cancel_active(&self, reason: &str) {
        self.cancel_active_if(|_| true, reason);
    }

    pub fn cancel_active_if(&self, pred: impl Fn(&Operation) -> bool, reason: &str) {
        let state = self.state.lock().expect("queue lock");
        if let Some((seq, op)) = &state.active {
            if pred(op) {
                *self.cancel.lock().expect("cancel lock") = Some(CancelRequest {
                    seq: *seq,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Settle matching queued ops as cancelled without running them.
    /// Returns how many were dropped.
    pub fn cancel_queued(&self, pred: impl Fn(&Operation) -> bool, reason: &str) -> usize {
        let dropped = {
            let mut state = self.state.lock().expect("queue lock");
            let mut kept = VecDeque::new();
            let mut dropped = Vec::new();
            for item in state.backlog.drain(..) {
                if pred(&item.op) {
                    dropped.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            state.backlog = kept;
            dropped
        };

        let count = dropped.len();
        for item in dropped {
            self.settle_cancelled(item, reason);
        }
        count
    }

    pub fn cancel_all(&self, reason: &str) {
        self.cancel_queued(|_| true, reason);
        self.cancel_active(reason);
    }

    /// Drain the backlog, cancel the active op, and stop the worker.
    pub async fn stop(&self, reason: &str) {
        self.cancel_all(reason);
        self.shutdown.cancel();
        self.notify.notify_one();
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn settle_cancelled(&self, item: QueuedOp, reason: &str) {
        let mut op = item.op;
        op.status = OpStatus::Cancelled;
        op.ended_at = Some(Utc::now().timestamp_millis());
        op.error = Some(reason.to_string());
        self.record_history(op.clone());

        self.events.publish(OpEvent::OpCancelled {
            device_id: self.device(),
            op,
            reason: reason.to_string(),
        });
        let _ = item.done.send(OpOutcome::Cancelled {
            reason: reason.to_string(),
        });
    }

    fn record_history(&self, op: Operation) {
        let mut state = self.state.lock().expect("queue lock");
        if state.history.len() == self.config.history_limit {
            state.history.pop_back();
        }
        state.history.push_front(op);
    }

    async fn worker_loop(queue: Arc<Self>) {
        loop {
            let next = {
                let mut state = queue.state.lock().expect("queue lock");
                state.backlog.pop_front()
            };

            let Some(item) = next else {
                tokio::select! {
                    _ = queue.shutdown.cancelled() => break,
                    _ = queue.notify.notified() => continue,
                }
            };

            queue.run_one(item).await;

            if queue.shutdown.is_cancelled() {
                break;
            }
            if queue.config.inter_command_delay_ms > 0 {
                tokio::select! {
                    _ = queue.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(queue.config.inter_command_delay_ms)) => {}
                }
            }
        }

        // Settle anything still queued so no handle is left hanging.
        let leftovers = {
            let mut state = queue.state.lock().expect("queue lock");
            state.backlog.drain(..).collect::<Vec<_>>()
        };
        for item in leftovers {
            queue.settle_cancelled(item, "queue stopped");
        }
    }

    async fn run_one(&self, item: QueuedOp) {
        let QueuedOp {
            seq,
            mut op,
            exec,
            done,
        } = item;

        op.status = OpStatus::Running;
        op.started_at = Some(Utc::now().timestamp_millis());
        {
            let mut state = self.state.lock().expect("queue lock");
            state.active = Some((seq, op.clone()));
        }
        self.events.publish(OpEvent::OpStarted {
            device_id: self.device(),
            op: op.clone(),
        });

        let ctx = OpContext {
            seq,
            op_id: op.id.clone(),
            cancel: Arc::clone(&self.cancel),
        };
        let result = exec(ctx).await;

        // Clear the cancel cell iff it targeted this op; a request for a
        // prior op must never leak forward.
        {
            let mut cell = self.cancel.lock().expect("cancel lock");
            if matches!(&*cell, Some(req) if req.seq == seq) {
                *cell = None;
            }
        }

        let outcome = match result {
            Ok(value) => OpOutcome::Completed(value),
            Err(BenchError::Cancelled(reason)) => OpOutcome::Cancelled { reason },
            Err(err) => OpOutcome::Failed {
                fault: DeviceFault::from_error(scope_for(op.kind), &err),
            },
        };

        op.ended_at = Some(Utc::now().timestamp_millis());
        match &outcome {
            OpOutcome::Completed(_) => op.status = OpStatus::Completed,
            OpOutcome::Cancelled { reason } => {
                op.status = OpStatus::Cancelled;
                op.error = Some(reason.clone());
            }
            OpOutcome::Failed { fault } => {
                op.status = OpStatus::Failed;
                op.error = Some(fault.message.clone());
            }
        }

        {
            let mut state = self.state.lock().expect("queue lock");
            state.active = None;
        }
        self.record_history(op.clone());

        match &outcome {
            OpOutcome::Completed(_) => self.events.publish(OpEvent::OpCompleted {
                device_id: self.device(),
                op: op.clone(),
            }),
            OpOutcome::Cancelled { reason } => self.events.publish(OpEvent::OpCancelled {
                device_id: self.device(),
                op: op.clone(),
                reason: reason.clone(),
            }),
            OpOutcome::Failed { fault } => self.events.publish(OpEvent::OpFailed {
                device_id: self.device(),
                op: op.clone(),
                fault: fault.clone(),
            }),
        }

        let _ = done.send(outcome);
    }
}

fn scope_for(kind: OpKind) -> FaultScope {
    match kind {
        OpKind::Press | OpKind::Hold | OpKind::Release | OpKind::PowerOn | OpKind::PowerOff => {
            FaultScope::Write
        }
        OpKind::Read => FaultScope::Read,
        OpKind::Write => FaultScope::Write,
        OpKind::List | OpKind::Mkdir | OpKind::Rename | OpKind::Move | OpKind::Delete => {
            FaultScope::Queue
        }
    }
}
