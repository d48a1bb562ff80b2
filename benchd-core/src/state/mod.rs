//! Authoritative, versioned, slice-structured state.
//!
//! The fabric is the source of truth for external observers: every mutation
//! bumps `version` by exactly one and yields a [`StateDelta`] whose patch,
//! applied to the previous document, reproduces the new one.

pub mod patch;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};

pub use patch::{PatchOp, apply_patch};

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateDelta {
    pub from: u64,
    pub to: u64,
    pub patch: Vec<PatchOp>,
}

#[derive(Debug)]
struct FabricInner {
    version: u64,
    slices: BTreeMap<String, Value>,
    watchers: HashMap<String, watch::Sender<Value>>,
}

#[derive(Debug)]
pub struct StateFabric {
    inner: Mutex<FabricInner>,
    deltas: broadcast::Sender<StateDelta>,
}

impl Default for StateFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFabric {
    pub fn new() -> Self {
        let (deltas, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(FabricInner {
                version: 0,
                slices: BTreeMap::new(),
                watchers: HashMap::new(),
            }),
            deltas,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().expect("fabric lock");
        let mut data = Map::new();
        for (name, value) in &inner.slices {
            data.insert(name.clone(), value.clone());
        }
        StateSnapshot {
            version: inner.version,
            data: Value::Object(data),
        }
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().expect("fabric lock").version
    }

    pub fn slice(&self, name: &str) -> Option<Value> {
        self.inner.lock().expect("fabric lock").slices.get(name).cloned()
    }

    /// Replace a slice. Returns `None` when the value is unchanged (no
    /// version bump, no delta, watchers untouched).
    pub fn update(&self, name: &str, value: Value) -> Option<StateDelta> {
        let delta = {
            let mut inner = self.inner.lock().expect("fabric lock");
            let existed = inner.slices.get(name);
            if existed == Some(&value) {
                return None;
            }

            let op = if existed.is_some() {
                PatchOp::Replace {
                    path: format!("/{name}"),
                    value: value.clone(),
                }
            } else {
                PatchOp::Add {
                    path: format!("/{name}"),
                    value: value.clone(),
                }
            };

            inner.slices.insert(name.to_string(), value.clone());
            let from = inner.version;
            inner.version += 1;

            if let Some(sender) = inner.watchers.get(name) {
                let _ = sender.send(value);
            }

            StateDelta {
                from,
                to: inner.version,
                patch: vec![op],
            }
        };

        tracing::trace!(target: "state", slice = name, to = delta.to, "slice updated");
        let _ = self.deltas.send(delta.clone());
        Some(delta)
    }

    /// Drop a slice entirely; no-op when absent.
    pub fn remove(&self, name: &str) -> Option<StateDelta> {
        let delta = {
            let mut inner = self.inner.lock().expect("fabric lock");
            inner.slices.remove(name)?;
            let from = inner.version;
            inner.version += 1;

            if let Some(sender) = inner.watchers.get(name) {
                let _ = sender.send(Value::Null);
            }

            StateDelta {
                from,
                to: inner.version,
                patch: vec![PatchOp::Remove {
                    path: format!("/{name}"),
                }],
            }
        };
        let _ = self.deltas.send(delta.clone());
        Some(delta)
    }

    /// Ordered stream of deltas for the transport. A lagged receiver should
    /// resync from [`StateFabric::snapshot`].
    pub fn subscribe_deltas(&self) -> broadcast::Receiver<StateDelta> {
        self.deltas.subscribe()
    }

    /// Watch one slice. With `emit_initial` the receiver's first `changed()`
    /// resolves immediately with the current value.
    pub fn subscribe_slice(&self, name: &str, emit_initial: bool) -> watch::Receiver<Value> {
        let mut inner = self.inner.lock().expect("fabric lock");
        let current = inner.slices.get(name).cloned().unwrap_or(Value::Null);
        let sender = inner
            .watchers
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(current).0);
        let mut rx = sender.subscribe();
        if emit_initial {
            rx.mark_changed();
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_is_strictly_increasing() {
        let fabric = StateFabric::new();
        assert_eq!(fabric.version(), 0);

        let d1 = fabric.update("frontPanel", json!({"powerSense": "unknown"})).unwrap();
        assert_eq!((d1.from, d1.to), (0, 1));

        let d2 = fabric.update("frontPanel", json!({"powerSense": "on"})).unwrap();
        assert_eq!((d2.from, d2.to), (1, 2));
    }

    #[test]
    fn identical_update_is_suppressed() {
        let fabric = StateFabric::new();
        fabric.update("keyboard", json!({"held": []}));
        assert!(fabric.update("keyboard", json!({"held": []})).is_none());
        assert_eq!(fabric.version(), 1);
    }

    #[test]
    fn patch_stream_replays_onto_snapshot() {
        let fabric = StateFabric::new();
        let before = fabric.snapshot();
        let mut doc = before.data.clone();

        let deltas = vec![
            fabric.update("frontPanel", json!({"powerSense": "unknown"})).unwrap(),
            fabric.update("devices", json!({})).unwrap(),
            fabric.update("frontPanel", json!({"powerSense": "off"})).unwrap(),
            fabric.remove("devices").unwrap(),
        ];

        for delta in &deltas {
            apply_patch(&mut doc, &delta.patch).unwrap();
        }

        let after = fabric.snapshot();
        assert_eq!(doc, after.data);
        assert_eq!(after.version, before.version + deltas.len() as u64);
    }

    #[tokio::test]
    async fn slice_watcher_sees_updates() {
        let fabric = StateFabric::new();
        fabric.update("frontPanel", json!({"powerSense": "unknown"}));

        let mut rx = fabric.subscribe_slice("frontPanel", true);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update()["powerSense"], "unknown");

        fabric.update("frontPanel", json!({"powerSense": "off"}));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update()["powerSense"], "off");
    }
}
