//! JSON-patch style operations over the fabric document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BenchError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Replace { path: String, value: Value },
    Add { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Replace { path, .. } | Self::Add { path, .. } | Self::Remove { path } => path,
        }
    }
}

fn split_pointer(path: &str) -> Result<Vec<String>> {
    if !path.starts_with('/') {
        return Err(BenchError::Protocol(format!(
            "patch path must be a JSON pointer: {path}"
        )));
    }
    Ok(path[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn navigate<'a>(doc: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(token))
            .ok_or_else(|| BenchError::Protocol(format!("patch path missing: {token}")))?;
    }
    Ok(current)
}

/// Apply a patch in place. Paths address objects only; the fabric never
/// patches inside arrays.
pub fn apply_patch(doc: &mut Value, patch: &[PatchOp]) -> Result<()> {
    for op in patch {
        let tokens = split_pointer(op.path())?;
        let (parents, leaf) = tokens.split_at(tokens.len().saturating_sub(1));
        let leaf = leaf
            .first()
            .ok_or_else(|| BenchError::Protocol("empty patch path".into()))?;

        let parent = navigate(doc, parents)?;
        let map = parent
            .as_object_mut()
            .ok_or_else(|| BenchError::Protocol(format!("patch parent not an object: {}", op.path())))?;

        match op {
            PatchOp::Replace { value, .. } | PatchOp::Add { value, .. } => {
                map.insert(leaf.clone(), value.clone());
            }
            PatchOp::Remove { .. } => {
                map.remove(leaf);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_add_remove_round_trip() {
        let mut doc = json!({"frontPanel": {"powerSense": "unknown"}});
        let patch = vec![
            PatchOp::Replace {
                path: "/frontPanel".into(),
                value: json!({"powerSense": "on", "updatedAtMs": 5}),
            },
            PatchOp::Add {
                path: "/keyboard".into(),
                value: json!({"heldModifiers": []}),
            },
        ];
        apply_patch(&mut doc, &patch).unwrap();
        assert_eq!(doc["frontPanel"]["powerSense"], "on");
        assert!(doc["keyboard"]["heldModifiers"].as_array().unwrap().is_empty());

        apply_patch(
            &mut doc,
            &[PatchOp::Remove {
                path: "/keyboard".into(),
            }],
        )
        .unwrap();
        assert!(doc.get("keyboard").is_none());
    }

    #[test]
    fn nested_pointer_resolves() {
        let mut doc = json!({"imager": {"media": "none"}});
        apply_patch(
            &mut doc,
            &[PatchOp::Replace {
                path: "/imager/media".into(),
                value: json!("present"),
            }],
        )
        .unwrap();
        assert_eq!(doc["imager"]["media"], "present");
    }

    #[test]
    fn escaped_tokens_unescape() {
        let mut doc = json!({"a/b": 1});
        apply_patch(
            &mut doc,
            &[PatchOp::Replace {
                path: "/a~1b".into(),
                value: json!(2),
            }],
        )
        .unwrap();
        assert_eq!(doc["a/b"], 2);
    }

    #[test]
    fn relative_path_is_rejected() {
        let mut doc = json!({});
        let err = apply_patch(
            &mut doc,
            &[PatchOp::Remove {
                path: "frontPanel".into(),
            }],
        );
        assert!(err.is_err());
    }
}
