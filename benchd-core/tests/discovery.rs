mod support;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use benchd_core::device::{DeviceSpec, UNMOUNTED_PATH};
use benchd_core::discovery::{
    DiscoveryPoller, DiscoveryUpdate, UsbDisk, UsbEnumerator, UsbInterface,
};
use benchd_core::error::Result;
use benchd_core::events::Events;

use support::CaptureSink;

#[derive(Debug, Default)]
struct MockEnumerator {
    interfaces: Mutex<Vec<UsbInterface>>,
    disks: Mutex<Vec<UsbDisk>>,
}

impl MockEnumerator {
    fn set_interfaces(&self, interfaces: Vec<UsbInterface>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }

    fn set_disks(&self, disks: Vec<UsbDisk>) {
        *self.disks.lock().unwrap() = disks;
    }
}

#[async_trait]
impl UsbEnumerator for MockEnumerator {
    async fn usb_interfaces(&self) -> Result<Vec<UsbInterface>> {
        Ok(self.interfaces.lock().unwrap().clone())
    }

    async fn usb_disks(&self) -> Result<Vec<UsbDisk>> {
        Ok(self.disks.lock().unwrap().clone())
    }
}

fn kb_interface(path: &str) -> UsbInterface {
    UsbInterface {
        vid: "1a86".into(),
        pid: "7523".into(),
        serial: Some("A5069RR4".into()),
        tty_paths: vec![path.to_string()],
    }
}

fn kb_spec() -> DeviceSpec {
    DeviceSpec {
        id_token: Some("KB".into()),
        kind: "ps2-keyboard".into(),
        vendor_id: Some("1a86".into()),
        product_id: Some("7523".into()),
        serial: None,
        path_regex: Some(r"ttyUSB\d+".into()),
        baud: Some(9600),
        block_device: false,
        identify_required: true,
        startup_required: true,
    }
}

fn reader_spec() -> DeviceSpec {
    DeviceSpec {
        id_token: None,
        kind: "cf-reader".into(),
        vendor_id: Some("0951".into()),
        product_id: Some("1624".into()),
        serial: Some("CF123".into()),
        path_regex: None,
        baud: None,
        block_device: true,
        identify_required: false,
        startup_required: false,
    }
}

fn rig(
    specs: Vec<DeviceSpec>,
) -> (
    Arc<MockEnumerator>,
    Arc<DiscoveryPoller>,
    tokio::sync::mpsc::Receiver<DiscoveryUpdate>,
    Arc<CaptureSink>,
) {
    let enumerator = Arc::new(MockEnumerator::default());
    let capture = CaptureSink::new();
    let events = Events::new(vec![capture.clone()]);
    let (poller, rx) = DiscoveryPoller::new(enumerator.clone(), specs, 1000, events);
    (enumerator, poller, rx, capture)
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<DiscoveryUpdate>) -> Vec<DiscoveryUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

#[tokio::test]
async fn arrival_fires_present_once() {
    let (enumerator, poller, mut rx, _capture) = rig(vec![kb_spec()]);
    enumerator.set_interfaces(vec![kb_interface("/dev/ttyUSB0")]);

    poller.poll_once().await.unwrap();
    let updates = drain(&mut rx);
    assert_eq!(updates.len(), 1);
    match &updates[0] {
        DiscoveryUpdate::Present(info) => {
            assert_eq!(info.id, "usb:1a86:7523:ps2-keyboard:/dev/ttyUSB0");
            assert_eq!(info.path, "/dev/ttyUSB0");
        }
        other => panic!("expected present, got {other:?}"),
    }

    // Steady state: no further updates.
    poller.poll_once().await.unwrap();
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn path_change_is_lost_then_present() {
    let (enumerator, poller, mut rx, _capture) = rig(vec![kb_spec()]);
    enumerator.set_interfaces(vec![kb_interface("/dev/ttyUSB0")]);
    poller.poll_once().await.unwrap();
    drain(&mut rx);

    enumerator.set_interfaces(vec![kb_interface("/dev/ttyUSB3")]);
    poller.poll_once().await.unwrap();
    let updates = drain(&mut rx);
    assert_eq!(updates.len(), 2, "reattach is lost-then-present: {updates:?}");
    assert_eq!(
        updates[0],
        DiscoveryUpdate::Lost {
            device_id: "usb:1a86:7523:ps2-keyboard:/dev/ttyUSB0".into()
        }
    );
    match &updates[1] {
        DiscoveryUpdate::Present(info) => assert_eq!(info.path, "/dev/ttyUSB3"),
        other => panic!("expected present second, got {other:?}"),
    }
}

#[tokio::test]
async fn absence_on_one_poll_reports_loss() {
    let (enumerator, poller, mut rx, capture) = rig(vec![kb_spec()]);
    enumerator.set_interfaces(vec![kb_interface("/dev/ttyUSB0")]);
    poller.poll_once().await.unwrap();
    drain(&mut rx);

    enumerator.set_interfaces(Vec::new());
    poller.poll_once().await.unwrap();
    let updates = drain(&mut rx);
    assert_eq!(
        updates,
        vec![DiscoveryUpdate::Lost {
            device_id: "usb:1a86:7523:ps2-keyboard:/dev/ttyUSB0".into()
        }]
    );
    assert_eq!(capture.count_tag("device-lost"), 1);
}

#[tokio::test]
async fn path_regex_filters_candidates() {
    let (enumerator, poller, mut rx, _capture) = rig(vec![kb_spec()]);
    let mut iface = kb_interface("/dev/ttyACM9");
    iface.tty_paths = vec!["/dev/ttyACM9".into()];
    enumerator.set_interfaces(vec![iface]);

    poller.poll_once().await.unwrap();
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn reader_prefers_serial_matched_disk() {
    let (enumerator, poller, mut rx, _capture) = rig(vec![reader_spec()]);
    enumerator.set_interfaces(vec![UsbInterface {
        vid: "0951".into(),
        pid: "1624".into(),
        serial: Some("CF123".into()),
        tty_paths: Vec::new(),
    }]);
    enumerator.set_disks(vec![
        UsbDisk {
            path: "/dev/sdx".into(),
            serial: Some("OTHER".into()),
        },
        UsbDisk {
            path: "/dev/sdb".into(),
            serial: Some("CF123".into()),
        },
    ]);

    poller.poll_once().await.unwrap();
    let updates = drain(&mut rx);
    match &updates[0] {
        DiscoveryUpdate::Present(info) => assert_eq!(info.path, "/dev/sdb"),
        other => panic!("expected present, got {other:?}"),
    }
}

#[tokio::test]
async fn reader_without_disk_surfaces_as_unmounted() {
    let (enumerator, poller, mut rx, _capture) = rig(vec![reader_spec()]);
    enumerator.set_interfaces(vec![UsbInterface {
        vid: "0951".into(),
        pid: "1624".into(),
        serial: Some("CF123".into()),
        tty_paths: Vec::new(),
    }]);

    poller.poll_once().await.unwrap();
    let updates = drain(&mut rx);
    match &updates[0] {
        DiscoveryUpdate::Present(info) => {
            assert_eq!(info.path, UNMOUNTED_PATH);
            assert_eq!(info.id, format!("usb:0951:1624:cf-reader:{UNMOUNTED_PATH}"));
        }
        other => panic!("expected present, got {other:?}"),
    }

    // Media arrives later: reattach from unmounted to the disk node.
    enumerator.set_disks(vec![UsbDisk {
        path: "/dev/sdb".into(),
        serial: Some("CF123".into()),
    }]);
    poller.poll_once().await.unwrap();
    let updates = drain(&mut rx);
    assert_eq!(updates.len(), 2);
    assert!(matches!(&updates[0], DiscoveryUpdate::Lost { .. }));
    match &updates[1] {
        DiscoveryUpdate::Present(info) => assert_eq!(info.path, "/dev/sdb"),
        other => panic!("expected present, got {other:?}"),
    }
}

#[tokio::test]
async fn enumeration_failure_is_retried_next_cycle() {
    struct FlakyEnumerator {
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl UsbEnumerator for FlakyEnumerator {
        async fn usb_interfaces(&self) -> Result<Vec<UsbInterface>> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(benchd_core::BenchError::Internal("sysfs hiccup".into()));
            }
            Ok(vec![kb_interface("/dev/ttyUSB0")])
        }

        async fn usb_disks(&self) -> Result<Vec<UsbDisk>> {
            Ok(Vec::new())
        }
    }

    let (poller, mut rx) = DiscoveryPoller::new(
        Arc::new(FlakyEnumerator {
            fail_first: Mutex::new(true),
        }),
        vec![kb_spec()],
        1000,
        Events::new(vec![]),
    );

    assert!(poller.poll_once().await.is_err());
    assert!(drain(&mut rx).is_empty());

    // Next cycle succeeds as if nothing happened.
    poller.poll_once().await.unwrap();
    assert_eq!(drain(&mut rx).len(), 1);
}
