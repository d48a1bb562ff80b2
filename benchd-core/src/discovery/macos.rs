//! macOS USB enumeration: `system_profiler` for functions, `diskutil` for
//! disks.
//!
//! `system_profiler` does not report tty nodes, so every interface is
//! offered the full `/dev/tty.usb*` candidate list and the spec's
//! `path_regex` narrows it down.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::discovery::{UsbDisk, UsbEnumerator, UsbInterface};
use crate::error::{BenchError, Result};

#[derive(Debug, Clone, Default)]
pub struct SystemProfilerEnumerator;

impl SystemProfilerEnumerator {
    pub fn new() -> Self {
        Self
    }
}

fn strip_hex(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("0x")
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Recursively walk `SPUSBDataType` items collecting `(vid, pid, serial)`.
pub fn parse_system_profiler(raw: &str) -> Result<Vec<(String, String, Option<String>)>> {
    let doc: Value = serde_json::from_str(raw)?;
    let mut out = Vec::new();

    fn walk(node: &Value, out: &mut Vec<(String, String, Option<String>)>) {
        if let Some(items) = node.get("_items").and_then(Value::as_array) {
            for item in items {
                if let (Some(vid), Some(pid)) = (
                    item.get("vendor_id").and_then(Value::as_str),
                    item.get("product_id").and_then(Value::as_str),
                ) {
                    out.push((
                        strip_hex(vid),
                        strip_hex(pid),
                        item.get("serial_num")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    ));
                }
                walk(item, out);
            }
        }
    }

    if let Some(roots) = doc.get("SPUSBDataType").and_then(Value::as_array) {
        for root in roots {
            walk(root, &mut out);
        }
    }
    Ok(out)
}

/// Whole external USB disks from `diskutil info -plist` output.
pub fn diskutil_is_usb_whole_disk(plist: &str) -> bool {
    let has = |key: &str, value: &str| {
        let pattern = format!(r"<key>{key}</key>\s*<{value}/>");
        regex::Regex::new(&pattern)
            .map(|re| re.is_match(plist))
            .unwrap_or(false)
    };
    let bus_usb = regex::Regex::new(r"<key>BusProtocol</key>\s*<string>USB</string>")
        .map(|re| re.is_match(plist))
        .unwrap_or(false);
    bus_usb && has("WholeDisk", "true") && !has("Internal", "true")
}

async fn dev_tty_candidates() -> Vec<String> {
    let mut found = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir("/dev").await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("tty.usbserial") || name.starts_with("tty.usbmodem") {
                found.push(format!("/dev/{name}"));
            }
        }
    }
    found.sort();
    found
}

#[async_trait]
impl UsbEnumerator for SystemProfilerEnumerator {
    async fn usb_interfaces(&self) -> Result<Vec<UsbInterface>> {
        let output = Command::new("system_profiler")
            .args(["SPUSBDataType", "-json"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(BenchError::Internal("system_profiler failed".into()));
        }

        let tty_paths = dev_tty_candidates().await;
        let interfaces = parse_system_profiler(&String::from_utf8_lossy(&output.stdout))?
            .into_iter()
            .map(|(vid, pid, serial)| UsbInterface {
                vid,
                pid,
                serial,
                tty_paths: tty_paths.clone(),
            })
            .collect();
        Ok(interfaces)
    }

    async fn usb_disks(&self) -> Result<Vec<UsbDisk>> {
        let list = Command::new("diskutil")
            .args(["list", "-plist", "physical"])
            .output()
            .await?;
        if !list.status.success() {
            return Err(BenchError::Internal("diskutil list failed".into()));
        }

        let raw = String::from_utf8_lossy(&list.stdout).into_owned();
        let names = regex::Regex::new(r"<string>(disk\d+)</string>")
            .expect("static regex")
            .captures_iter(&raw)
            .map(|caps| caps[1].to_string())
            .collect::<std::collections::BTreeSet<_>>();

        let mut disks = Vec::new();
        for name in names {
            let info = Command::new("diskutil")
                .args(["info", "-plist", &name])
                .output()
                .await?;
            if !info.status.success() {
                continue;
            }
            let plist = String::from_utf8_lossy(&info.stdout);
            if diskutil_is_usb_whole_disk(&plist) {
                let serial = regex::Regex::new(
                    r"<key>IORegistryEntryName</key>\s*<string>([^<]+)</string>",
                )
                .ok()
                .and_then(|re| re.captures(&plist).map(|caps| caps[1].to_string()));
                disks.push(UsbDisk {
                    path: format!("/dev/{name}"),
                    serial,
                });
            }
        }
        Ok(disks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiler_items_flatten_recursively() {
        let raw = r#"{
            "SPUSBDataType": [{
                "_items": [{
                    "vendor_id": "0x1a86",
                    "product_id": "0x7523",
                    "serial_num": "A5069RR4",
                    "_items": [{
                        "vendor_id": "0x05ac (Apple Inc.)",
                        "product_id": "0x8006"
                    }]
                }]
            }]
        }"#;
        let devices = parse_system_profiler(raw).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].0, "1a86");
        assert_eq!(devices[0].2.as_deref(), Some("A5069RR4"));
        assert_eq!(devices[1].0, "05ac");
    }

    #[test]
    fn usb_whole_disk_predicate() {
        let plist = r#"<dict>
            <key>BusProtocol</key><string>USB</string>
            <key>WholeDisk</key><true/>
            <key>Internal</key><false/>
        </dict>"#;
        assert!(diskutil_is_usb_whole_disk(plist));

        let internal = r#"<dict>
            <key>BusProtocol</key><string>SATA</string>
            <key>WholeDisk</key><true/>
        </dict>"#;
        assert!(!diskutil_is_usb_whole_disk(internal));
    }
}
