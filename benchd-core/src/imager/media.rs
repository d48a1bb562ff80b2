//! Removable-media presence probing.

use serde::{Deserialize, Serialize};

use crate::device::UNMOUNTED_PATH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaState {
    Present,
    None,
    Unknown,
}

/// Sector-count file contents (`/sys/block/<dev>/size`, 512-byte units).
pub fn parse_sector_count(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

/// Pull `TotalSize` (fallback `Size`) out of a `diskutil info -plist` dump.
#[cfg(any(target_os = "macos", test))]
pub fn parse_diskutil_size(plist: &str) -> Option<u64> {
    for key in ["TotalSize", "Size"] {
        let pattern = format!(r"<key>{key}</key>\s*<integer>(\d+)</integer>");
        let re = regex::Regex::new(&pattern).ok()?;
        if let Some(caps) = re.captures(plist) {
            return caps[1].parse().ok();
        }
    }
    Option::None
}

fn state_from_size(size: Option<u64>) -> MediaState {
    match size {
        Some(0) => MediaState::None,
        Some(_) => MediaState::Present,
        Option::None => MediaState::Unknown,
    }
}

/// Probe whether the reader at `device_path` holds media. The synthetic
/// `unmounted` path short-circuits to `None`: hardware present, no card.
pub async fn probe_media(device_path: &str) -> MediaState {
    if device_path == UNMOUNTED_PATH {
        return MediaState::None;
    }

    #[cfg(target_os = "linux")]
    {
        let name = device_path.trim_start_matches("/dev/");
        let sysfs = format!("/sys/block/{name}/size");
        let size = match tokio::fs::read_to_string(&sysfs).await {
            Ok(raw) => parse_sector_count(&raw).map(|sectors| sectors * 512),
            Err(_) => Option::None,
        };
        state_from_size(size)
    }

    #[cfg(target_os = "macos")]
    {
        let output = tokio::process::Command::new("diskutil")
            .args(["info", "-plist", device_path])
            .output()
            .await;
        let size = match output {
            Ok(out) if out.status.success() => {
                parse_diskutil_size(&String::from_utf8_lossy(&out.stdout))
            }
            _ => Option::None,
        };
        state_from_size(size)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = state_from_size;
        MediaState::Unknown
    }
}
