//! Root containment for externally supplied paths.
//!
//! Everything a client hands the imager is a POSIX-slash relative path.
//! Resolution is purely lexical so a rejected path provably never touches
//! the filesystem.

use std::path::{Path, PathBuf};

use crate::error::{BenchError, Result};

fn escape_error(rel: &str) -> BenchError {
    BenchError::Protocol(format!("path escapes root: {rel}"))
}

/// Normalize `rel` against `root`, rejecting anything that would step
/// outside it. Returns the absolute path; `""` and `"."` resolve to the
/// root itself.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.starts_with('/') || rel.contains('\0') {
        return Err(escape_error(rel));
    }

    let mut stack: Vec<&str> = Vec::new();
    for part in rel.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(escape_error(rel));
                }
            }
            other => stack.push(other),
        }
    }

    let mut resolved = root.to_path_buf();
    for part in stack {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Like [`resolve_within`], returning the normalized relative form.
pub fn normalize_rel(rel: &str) -> Result<String> {
    let resolved = resolve_within(Path::new(""), rel)?;
    Ok(resolved
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// A bare file name: no separators, no `.`/`..`, nothing empty.
pub fn check_safe_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(BenchError::Protocol(format!("unsafe file name: {name}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_paths_resolve() {
        let root = Path::new("/srv/images");
        assert_eq!(
            resolve_within(root, "dos/games").unwrap(),
            PathBuf::from("/srv/images/dos/games")
        );
        assert_eq!(resolve_within(root, "").unwrap(), PathBuf::from("/srv/images"));
        assert_eq!(resolve_within(root, ".").unwrap(), PathBuf::from("/srv/images"));
    }

    #[test]
    fn internal_dotdot_is_collapsed() {
        let root = Path::new("/srv/images");
        assert_eq!(
            resolve_within(root, "a/../b").unwrap(),
            PathBuf::from("/srv/images/b")
        );
    }

    #[test]
    fn escapes_are_rejected() {
        let root = Path::new("/srv/images");
        for bad in ["..", "../x", "a/../../x", "/etc/passwd", "a/../../../.."] {
            let err = resolve_within(root, bad).unwrap_err();
            assert!(err.to_string().contains("escapes root"), "{bad} -> {err}");
        }
    }

    #[test]
    fn safe_names_reject_separators_and_dots() {
        assert!(check_safe_name("boot").is_ok());
        assert!(check_safe_name("boot.img").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(check_safe_name(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn normalize_rel_flattens() {
        assert_eq!(normalize_rel("a/./b/../c").unwrap(), "a/c");
        assert_eq!(normalize_rel("").unwrap(), "");
    }
}
