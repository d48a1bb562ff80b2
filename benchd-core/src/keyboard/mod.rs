//! PS/2 keyboard emulator service.
//!
//! Key actions become framed wire commands (`press 00:1c`) funneled through
//! the per-device op queue. The service tracks held modifiers and enforces
//! the host-power gate: with the host known off, key work is refused and
//! in-flight key ops are cancelled; power commands are never gated.

pub mod scancodes;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{KeyboardConfig, SerialConfig};
use crate::error::{BenchError, Result};
use crate::events::{Events, KeyboardEvent};
use crate::ops::{OpExec, OpHandle, OpKind, OpMeta, OpQueue, QueueConfig};
use crate::policy::{GateCommand, GateTarget};
use crate::serial::{IdentifyOptions, LinkOptions, PortOpener, SerialSupervisor};
use crate::state::StateFabric;

pub use scancodes::{MODIFIERS, ScanCode, is_modifier, lookup};

pub const KEYBOARD_SLICE: &str = "keyboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Press,
    Hold,
    Release,
}

impl KeyAction {
    pub fn verb(self) -> &'static str {
        match self {
            Self::Press => "press",
            Self::Hold => "hold",
            Self::Release => "release",
        }
    }

    fn op_kind(self) -> OpKind {
        match self {
            Self::Press => OpKind::Press,
            Self::Hold => OpKind::Hold,
            Self::Release => OpKind::Release,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEventRequest {
    /// Stable key identifier, preferred over `key`.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

pub struct KeyboardService<O: PortOpener> {
    link: Arc<SerialSupervisor<O>>,
    queue: Arc<OpQueue>,
    events: Events,
    fabric: Arc<StateFabric>,
    held: Arc<StdMutex<BTreeSet<String>>>,
    gate_open: AtomicBool,
}

impl<O: PortOpener> std::fmt::Debug for KeyboardService<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyboardService")
            .field("device", &self.queue.device())
            .field("gate_open", &self.gate_open.load(Ordering::SeqCst))
            .finish()
    }
}

impl<O: PortOpener> KeyboardService<O> {
    pub fn new(
        opener: O,
        serial: &SerialConfig,
        config: &KeyboardConfig,
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
            events.clone(),
        );

        let queue = OpQueue::spawn(
            config.kind.clone(),
            QueueConfig {
                max_depth: config.queue_max_depth,
                inter_command_delay_ms: config.inter_command_delay_ms,
                ..QueueConfig::default()
            },
            events.clone(),
        );

        let service = Arc::new(Self {
            link,
            queue,
            events,
            fabric,
            held: Arc::new(StdMutex::new(BTreeSet::new())),
            gate_open: AtomicBool::new(true),
        });
        service.publish_held();
        service
    }

    pub fn link(&self) -> &Arc<SerialSupervisor<O>> {
        &self.link
    }

    pub fn queue(&self) -> &Arc<OpQueue> {
        &self.queue
    }

    pub fn held_modifiers(&self) -> Vec<String> {
        self.held
            .lock()
            .expect("held lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn attach(&self, device_id: &str, path: &str) {
        self.queue.set_device(device_id);
        self.link.attach(device_id, path);
    }

    pub async fn detach(&self, reason: &str) {
        self.link.detach(reason).await;
        if !self.queue.config().retain_across_reconnect {
            self.queue.cancel_queued(|_| true, reason);
        }
    }

    /// Queue a key action. Refused outright while the host is known off.
    pub fn enqueue_key_event(
        &self,
        action: KeyAction,
        request: KeyEventRequest,
    ) -> Result<OpHandle> {
        let identifier = request
            .code
            .clone()
            .or_else(|| request.key.clone())
            .ok_or_else(|| BenchError::Protocol("key event without identifier".into()))?;
        let scan = lookup(&identifier).ok_or_else(|| {
            BenchError::Protocol(format!("unknown key identifier: {identifier}"))
        })?;

        let meta = OpMeta {
            label: Some(format!("{} {identifier}", action.verb())),
            requested_by: request.requested_by,
            payload: Some(json!({"key": identifier, "action": action.verb()})),
        };

        if !self.gate_open.load(Ordering::SeqCst) {
            return Ok(self.queue.reject_cancelled(
                action.op_kind(),
                meta,
                crate::policy::HOST_POWER_OFF_REASON,
            ));
        }

        let line = format!("{} {}", action.verb(), scan.wire());
        let link = Arc::clone(&self.link);
        let events = self.events.clone();
        let fabric = Arc::clone(&self.fabric);
        let held = Arc::clone(&self.held);
        let modifier = is_modifier(&identifier);

        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                link.write_line(&line).await?;

                if modifier && matches!(action, KeyAction::Hold | KeyAction::Release) {
                    let held_now = {
                        let mut set = held.lock().expect("held lock");
                        match action {
                            KeyAction::Hold => {
                                set.insert(identifier.clone());
                            }
                            KeyAction::Release => {
                                set.remove(&identifier);
                            }
                            KeyAction::Press => {}
                        }
                        set.iter().cloned().collect::<Vec<_>>()
                    };
                    fabric.update(KEYBOARD_SLICE, json!({"heldModifiers": held_now}));
                    events.publish(KeyboardEvent::ModifiersChanged {
                        device_id: link.device(),
                        held: held_now,
                    });
                } else if !matches!(action, KeyAction::Release) {
                    // Non-modifier releases still hit the wire above, but the
                    // observable event is suppressed to keep the stream quiet.
                    events.publish(KeyboardEvent::KeySent {
                        device_id: link.device(),
                        key: identifier.clone(),
                        action: action.verb().to_string(),
                        wire: line.clone(),
                    });
                }

                Ok(json!({"wire": line}))
            })
        });

        self.queue.enqueue(action.op_kind(), meta, exec)
    }

    pub fn power_on(&self, requested_by: Option<String>) -> Result<OpHandle> {
        self.power_op(true, requested_by)
    }

    pub fn power_off(&self, requested_by: Option<String>) -> Result<OpHandle> {
        self.power_op(false, requested_by)
    }

    fn power_op(&self, on: bool, requested_by: Option<String>) -> Result<OpHandle> {
        let line = if on { "power_on" } else { "power_off" };
        let kind = if on { OpKind::PowerOn } else { OpKind::PowerOff };

        let link = Arc::clone(&self.link);
        let events = self.events.clone();
        let exec: OpExec = Box::new(move |ctx| {
            Box::pin(async move {
                ctx.checkpoint()?;
                link.write_line(line).await?;
                events.publish(KeyboardEvent::PowerCommand {
                    device_id: link.device(),
                    on,
                });
                Ok(json!({"wire": line}))
            })
        });

        self.queue.enqueue(
            kind,
            OpMeta {
                label: Some(line.to_string()),
                requested_by,
                payload: None,
            },
            exec,
        )
    }

    pub fn cancel_all(&self, reason: &str) {
        self.queue.cancel_all(reason);
    }

    pub async fn stop(&self) {
        self.queue.stop("service stopped").await;
        self.link.stop().await;
    }

    fn clear_held(&self) {
        let cleared = {
            let mut set = self.held.lock().expect("held lock");
            let had_any = !set.is_empty();
            set.clear();
            had_any
        };
        if cleared {
            self.publish_held();
            self.events.publish(KeyboardEvent::ModifiersChanged {
                device_id: self.link.device(),
                held: Vec::new(),
            });
        }
    }

    fn publish_held(&self) {
        self.fabric.update(
            KEYBOARD_SLICE,
            json!({"heldModifiers": self.held_modifiers()}),
        );
    }
}

#[async_trait]
impl<O: PortOpener> GateTarget for KeyboardService<O> {
    async fn dispatch(&self, command: GateCommand) {
        match command {
            GateCommand::Permit => {
                self.gate_open.store(true, Ordering::SeqCst);
            }
            GateCommand::CancelAll { reason } => {
                self.gate_open.store(false, Ordering::SeqCst);
                self.queue.cancel_queued(|op| op.kind.is_key(), &reason);
                self.queue.cancel_active_if(|op| op.kind.is_key(), &reason);
                self.clear_held();
            }
            GateCommand::CommandPeripheralPower { on } => {
                if let Err(err) = self.power_op(on, None) {
                    tracing::warn!(target: "kb", error = %err, "peripheral power command refused");
                }
            }
        }
    }
}
