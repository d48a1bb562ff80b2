//! Cross-device policy gating.
//!
//! A gate watches one slice of the authoritative state and translates value
//! transitions into concrete service commands. The translation is a pure
//! function so the fail-open/fail-closed policy is testable without tasks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::StateFabric;

pub const HOST_POWER_OFF_REASON: &str = "host-power-off";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSense {
    On,
    Off,
    Unknown,
}

impl PowerSense {
    /// Read the sense out of a `frontPanel` slice value; anything absent or
    /// malformed is `Unknown`.
    pub fn from_slice(value: &Value) -> Self {
        match value.get("powerSense").and_then(Value::as_str) {
            Some("on") => Self::On,
            Some("off") => Self::Off,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCommand {
    Permit,
    CancelAll { reason: String },
    CommandPeripheralPower { on: bool },
}

/// Translate a sense transition into a command. Equal values yield nothing,
/// which makes repeated dispatch idempotent. Known-off fails closed;
/// unknown fails open so a booting host is not locked out.
pub fn power_gate_command(previous: PowerSense, next: PowerSense) -> Option<GateCommand> {
    if previous == next {
        return None;
    }
    match next {
        PowerSense::Off => Some(GateCommand::CancelAll {
            reason: HOST_POWER_OFF_REASON.to_string(),
        }),
        PowerSense::On | PowerSense::Unknown => Some(GateCommand::Permit),
    }
}

#[async_trait]
pub trait GateTarget: Send + Sync {
    async fn dispatch(&self, command: GateCommand);
}

/// Subscribes a target service to the `frontPanel` slice.
#[derive(Debug)]
pub struct PolicyGate;

impl PolicyGate {
    pub fn spawn(
        fabric: Arc<StateFabric>,
        slice: &str,
        target: Arc<dyn GateTarget>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = fabric.subscribe_slice(slice, true);
        let slice = slice.to_string();

        tokio::spawn(async move {
            let mut last = PowerSense::Unknown;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let value = rx.borrow_and_update().clone();
                let sense = PowerSense::from_slice(&value);
                if let Some(command) = power_gate_command(last, sense) {
                    tracing::debug!(target: "policy", slice = %slice, ?sense, ?command, "gate transition");
                    target.dispatch(command).await;
                }
                last = sense;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_off_fails_closed() {
        let cmd = power_gate_command(PowerSense::Unknown, PowerSense::Off);
        assert_eq!(
            cmd,
            Some(GateCommand::CancelAll {
                reason: HOST_POWER_OFF_REASON.into()
            })
        );
    }

    #[test]
    fn unknown_fails_open() {
        let cmd = power_gate_command(PowerSense::Off, PowerSense::Unknown);
        assert_eq!(cmd, Some(GateCommand::Permit));
    }

    #[test]
    fn repeated_state_is_a_no_op() {
        assert_eq!(power_gate_command(PowerSense::Off, PowerSense::Off), None);
        assert_eq!(power_gate_command(PowerSense::On, PowerSense::On), None);
    }

    #[test]
    fn sense_parses_from_slice_value() {
        assert_eq!(
            PowerSense::from_slice(&json!({"powerSense": "on", "updatedAtMs": 1})),
            PowerSense::On
        );
        assert_eq!(PowerSense::from_slice(&json!({})), PowerSense::Unknown);
        assert_eq!(PowerSense::from_slice(&json!(null)), PowerSense::Unknown);
    }
}
