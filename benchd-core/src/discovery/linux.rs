//! Linux USB enumeration: sysfs for functions, `lsblk -J` for disks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::discovery::{UsbDisk, UsbEnumerator, UsbInterface};
use crate::error::{BenchError, Result};

#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    sysfs_root: PathBuf,
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsEnumerator {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/bus/usb/devices"),
        }
    }

    pub fn with_root(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }
}

async fn read_attr(dir: &Path, name: &str) -> Option<String> {
    tokio::fs::read_to_string(dir.join(name))
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Collect `/dev/tty*` nodes exposed by a device's interface directories
/// (`<dev>:<config>.<iface>/ttyUSB0`, or nested under a `tty/` subdir).
async fn find_tty_nodes(device_dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(device_dir).await else {
        return found;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(':') {
            continue;
        }

        let iface_dir = entry.path();
        let Ok(mut iface_entries) = tokio::fs::read_dir(&iface_dir).await else {
            continue;
        };
        while let Ok(Some(node)) = iface_entries.next_entry().await {
            let node_name = node.file_name().to_string_lossy().into_owned();
            if node_name.starts_with("ttyUSB") || node_name.starts_with("ttyACM") {
                found.push(format!("/dev/{node_name}"));
            } else if node_name == "tty" {
                if let Ok(mut tty_entries) = tokio::fs::read_dir(node.path()).await {
                    while let Ok(Some(tty)) = tty_entries.next_entry().await {
                        found.push(format!("/dev/{}", tty.file_name().to_string_lossy()));
                    }
                }
            }
        }
    }

    found.sort();
    found
}

/// Pull USB whole-disks out of `lsblk -J` output.
pub fn parse_lsblk(raw: &str) -> Result<Vec<UsbDisk>> {
    let doc: Value = serde_json::from_str(raw)?;
    let mut disks = Vec::new();

    if let Some(devices) = doc.get("blockdevices").and_then(Value::as_array) {
        for dev in devices {
            let tran = dev.get("tran").and_then(Value::as_str);
            let kind = dev.get("type").and_then(Value::as_str);
            if tran != Some("usb") || kind != Some("disk") {
                continue;
            }
            let name = dev.get("name").and_then(Value::as_str).unwrap_or_default();
            let path = dev
                .get("path")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("/dev/{name}"));
            disks.push(UsbDisk {
                path,
                serial: dev
                    .get("serial")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    Ok(disks)
}

#[async_trait]
impl UsbEnumerator for SysfsEnumerator {
    async fn usb_interfaces(&self) -> Result<Vec<UsbInterface>> {
        let mut interfaces = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.sysfs_root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let Some(vid) = read_attr(&dir, "idVendor").await else {
                continue;
            };
            let Some(pid) = read_attr(&dir, "idProduct").await else {
                continue;
            };

            interfaces.push(UsbInterface {
                vid: vid.to_ascii_lowercase(),
                pid: pid.to_ascii_lowercase(),
                serial: read_attr(&dir, "serial").await,
                tty_paths: find_tty_nodes(&dir).await,
            });
        }
        Ok(interfaces)
    }

    async fn usb_disks(&self) -> Result<Vec<UsbDisk>> {
        let output = Command::new("lsblk")
            .args(["-J", "-o", "NAME,PATH,TRAN,TYPE,SERIAL"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(BenchError::Internal(format!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_lsblk(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsblk_filters_usb_whole_disks() {
        let raw = r#"{
            "blockdevices": [
                {"name": "sda", "path": "/dev/sda", "tran": "sata", "type": "disk", "serial": "X1"},
                {"name": "sdb", "path": "/dev/sdb", "tran": "usb", "type": "disk", "serial": "CF123"},
                {"name": "sdb1", "path": "/dev/sdb1", "tran": "usb", "type": "part", "serial": null}
            ]
        }"#;
        let disks = parse_lsblk(raw).unwrap();
        assert_eq!(
            disks,
            vec![UsbDisk {
                path: "/dev/sdb".into(),
                serial: Some("CF123".into())
            }]
        );
    }

    #[test]
    fn lsblk_without_path_column_falls_back_to_name() {
        let raw = r#"{"blockdevices": [{"name": "sdc", "tran": "usb", "type": "disk"}]}"#;
        let disks = parse_lsblk(raw).unwrap();
        assert_eq!(disks[0].path, "/dev/sdc");
        assert_eq!(disks[0].serial, None);
    }
}
