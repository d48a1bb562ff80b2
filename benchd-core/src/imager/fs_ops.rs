//! Bounded filesystem operations under the imager root.
//!
//! `<base>.img` + `<base>.part` pairs form a logical image group: rename,
//! move, and delete treat them as one unit. The `.img` leg is required, the
//! `.part` leg best-effort. Nothing here ever overwrites an existing target;
//! collisions and missing sources are silent no-ops.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::imager::paths::{check_safe_name, normalize_rel, resolve_within};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    /// Display name: trailing extension stripped for files.
    pub name: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsSnapshot {
    pub root_path: String,
    /// Relative, POSIX-slash.
    pub cwd: String,
    pub entries: Vec<FsEntry>,
}

fn display_name(file_name: &str, kind: EntryKind) -> String {
    if kind == EntryKind::Dir {
        return file_name.to_string();
    }
    match Path::new(file_name).file_stem() {
        Some(stem) if !stem.is_empty() => stem.to_string_lossy().into_owned(),
        _ => file_name.to_string(),
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// Snapshot one directory: alphabetical case-insensitive, dirs before files
/// on a name tie, `.part` sidecars hidden, optional extension filter,
/// bounded to `max_entries`.
pub async fn snapshot_dir(
    root: &Path,
    cwd_rel: &str,
    max_entries: usize,
    visible_extensions: &[String],
) -> Result<FsSnapshot> {
    let dir = resolve_within(root, cwd_rel)?;
    let cwd = normalize_rel(cwd_rel)?;

    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(".part") {
            continue;
        }

        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let kind = if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        if kind == EntryKind::File && !visible_extensions.is_empty() {
            let visible = extension_of(&file_name)
                .map(|ext| visible_extensions.contains(&ext))
                .unwrap_or(false);
            if !visible {
                continue;
            }
        }

        let modified_at = meta
            .modified()
            .ok()
            .map(|st| DateTime::<Utc>::from(st).to_rfc3339());

        entries.push(FsEntry {
            name: display_name(&file_name, kind),
            kind,
            size_bytes: (kind == EntryKind::File).then(|| meta.len()),
            modified_at,
        });
    }

    entries.sort_by(|a, b| {
        let name = a.name.to_lowercase().cmp(&b.name.to_lowercase());
        name.then_with(|| {
            // dirs first on equal names
            let rank = |k: EntryKind| if k == EntryKind::Dir { 0 } else { 1 };
            rank(a.kind).cmp(&rank(b.kind))
        })
    });
    entries.truncate(max_entries);

    Ok(FsSnapshot {
        root_path: root.display().to_string(),
        cwd,
        entries,
    })
}

/// Create a directory; an existing one is a no-op. Returns whether anything
/// changed.
pub async fn make_dir(root: &Path, cwd_rel: &str, name: &str) -> Result<bool> {
    check_safe_name(name)?;
    let dir = resolve_within(root, cwd_rel)?.join(name);
    if tokio::fs::try_exists(&dir).await? {
        return Ok(false);
    }
    tokio::fs::create_dir(&dir).await?;
    Ok(true)
}

struct GroupPaths {
    img: PathBuf,
    part: PathBuf,
}

fn group_paths(dir: &Path, base: &str) -> GroupPaths {
    GroupPaths {
        img: dir.join(format!("{base}.img")),
        part: dir.join(format!("{base}.part")),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Rename the image group `<from>.img`/`<from>.part` (or a plain entry) in
/// place. Never overwrites. Returns whether anything moved.
pub async fn rename_entry(root: &Path, cwd_rel: &str, from: &str, to: &str) -> Result<bool> {
    check_safe_name(from)?;
    check_safe_name(to)?;
    let dir = resolve_within(root, cwd_rel)?;
    relocate(&dir, from, &dir, to).await
}

/// Move the image group (or plain entry) into another directory under the
/// root, keeping its name.
pub async fn move_entry(root: &Path, cwd_rel: &str, from: &str, dest_dir_rel: &str) -> Result<bool> {
    check_safe_name(from)?;
    let dir = resolve_within(root, cwd_rel)?;
    let dest = resolve_within(root, dest_dir_rel)?;
    if !tokio::fs::metadata(&dest).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(crate::error::BenchError::NotFound(format!(
            "destination directory missing: {dest_dir_rel}"
        )));
    }
    relocate(&dir, from, &dest, from).await
}

async fn relocate(from_dir: &Path, from: &str, to_dir: &Path, to: &str) -> Result<bool> {
    let src = group_paths(from_dir, from);
    let dst = group_paths(to_dir, to);

    if exists(&src.img).await || exists(&src.part).await {
        if exists(&dst.img).await || exists(&dst.part).await {
            return Ok(false);
        }
        if exists(&src.img).await {
            tokio::fs::rename(&src.img, &dst.img).await?;
        }
        if exists(&src.part).await {
            if let Err(err) = tokio::fs::rename(&src.part, &dst.part).await {
                tracing::warn!(target: "imager", error = %err, part = %src.part.display(), "sidecar rename failed");
            }
        }
        return Ok(true);
    }

    // Plain entry fallback: exact names, same no-overwrite rule.
    let src_plain = from_dir.join(from);
    let dst_plain = to_dir.join(to);
    if !exists(&src_plain).await || exists(&dst_plain).await {
        return Ok(false);
    }
    tokio::fs::rename(&src_plain, &dst_plain).await?;
    Ok(true)
}

/// Delete `rel` (relative to the cwd). An image group goes as a unit,
/// best-effort; anything else falls back to unlink / recursive remove.
pub async fn delete_entry(root: &Path, cwd_rel: &str, rel: &str) -> Result<bool> {
    if matches!(rel, "" | "." | "..") {
        return Err(crate::error::BenchError::Protocol(format!(
            "refusing to delete: {rel:?}"
        )));
    }
    let joined = if cwd_rel.is_empty() {
        rel.to_string()
    } else {
        format!("{cwd_rel}/{rel}")
    };
    let target = resolve_within(root, &joined)?;

    let img = target.with_file_name(format!(
        "{}.img",
        target.file_name().unwrap_or_default().to_string_lossy()
    ));
    let part = target.with_file_name(format!(
        "{}.part",
        target.file_name().unwrap_or_default().to_string_lossy()
    ));

    if exists(&img).await || exists(&part).await {
        for path in [&img, &part] {
            if exists(path).await {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    tracing::warn!(target: "imager", error = %err, path = %path.display(), "group delete leg failed");
                }
            }
        }
        return Ok(true);
    }

    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => {
            tokio::fs::remove_dir_all(&target).await?;
            Ok(true)
        }
        Ok(_) => {
            tokio::fs::remove_file(&target).await?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}
