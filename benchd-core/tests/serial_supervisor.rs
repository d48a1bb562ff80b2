mod support;

use std::sync::Arc;
use std::time::Duration;

use benchd_core::config::ReconnectConfig;
use benchd_core::events::Events;
use benchd_core::serial::{IdentifyOptions, LinkOptions, LinkPhase, SerialSupervisor};

use support::{CaptureSink, FirmwareConfig, ScriptedOpener, wait_until};

fn link_options(identify: Option<IdentifyOptions>, reconnect: ReconnectConfig) -> LinkOptions {
    LinkOptions {
        label: "ps2-keyboard".into(),
        baud: 9600,
        write_eol: "\n".into(),
        identify,
        reconnect,
        fault_history_limit: 50,
    }
}

fn kb_identify() -> IdentifyOptions {
    IdentifyOptions {
        expected_token: "KB".into(),
        request: "identify".into(),
        completion: "identify_complete".into(),
        timeout_ms: 2000,
        retries: 3,
    }
}

#[tokio::test]
async fn identify_success_reaches_ready() {
    let capture = CaptureSink::new();
    let events = Events::new(vec![capture.clone()]);
    let opener = ScriptedOpener::new(FirmwareConfig {
        identify_response: Some("KB".into()),
        greeting: Vec::new(),
        post_identify: Vec::new(),
    });
    let wire = Arc::clone(&opener.wire_log);

    let supervisor = SerialSupervisor::new(
        opener,
        link_options(Some(kb_identify()), ReconnectConfig::default()),
        events,
    );
    supervisor.attach("usb:1a86:7523:ps2-keyboard:/dev/ttyUSB0", "/dev/ttyUSB0");

    wait_until("ready", Duration::from_secs(2), || {
        supervisor.phase() == LinkPhase::Ready
    })
    .await;

    let tags = capture.tags();
    let expected = ["device-connected", "identify-start", "identify-success", "ready"];
    let mut found = tags.iter();
    for want in expected {
        assert!(
            found.any(|t| t == want),
            "missing {want} in order within {tags:?}"
        );
    }

    wait_until("completion on wire", Duration::from_secs(1), || {
        let log = wire.lock().unwrap();
        log.contains(&"identify".to_string()) && log.contains(&"identify_complete".to_string())
    })
    .await;

    supervisor.stop().await;
}

#[tokio::test]
async fn identify_mismatch_closes_and_reconnects() {
    let capture = CaptureSink::new();
    let events = Events::new(vec![capture.clone()]);
    let opener = ScriptedOpener::new(FirmwareConfig {
        identify_response: Some("XX".into()),
        greeting: Vec::new(),
        post_identify: Vec::new(),
    });
    let opens = Arc::clone(&opener.opens);

    let reconnect = ReconnectConfig {
        enabled: true,
        base_delay_ms: 30,
        max_delay_ms: 100,
        max_attempts: 0,
    };
    let supervisor = SerialSupervisor::new(
        opener,
        link_options(
            Some(IdentifyOptions {
                timeout_ms: 300,
                ..kb_identify()
            }),
            reconnect,
        ),
        events,
    );
    supervisor.attach("usb:1a86:7523:ps2-keyboard:/dev/ttyUSB0", "/dev/ttyUSB0");

    wait_until("identify failure", Duration::from_secs(2), || {
        capture.count_tag("identify-failed") >= 1
    })
    .await;
    wait_until("reconnect attempt", Duration::from_secs(2), || {
        opens.load(std::sync::atomic::Ordering::SeqCst) >= 2
    })
    .await;

    // Unknown token tears the port down before the retry.
    let events_seen = capture.all();
    let disconnect = events_seen.iter().find_map(|event| {
        match serde_json::to_value(event).unwrap() {
            v if v["type"] == "device-disconnected" => Some(v["reason"].clone()),
            _ => None,
        }
    });
    assert_eq!(disconnect.unwrap(), "unknown");
    assert!(capture.count_tag("reconnecting") >= 1);

    supervisor.stop().await;
}

#[tokio::test]
async fn bounded_attempts_end_in_fatal_error() {
    let capture = CaptureSink::new();
    let events = Events::new(vec![capture.clone()]);
    let opener = ScriptedOpener::new(FirmwareConfig {
        identify_response: None,
        greeting: Vec::new(),
        post_identify: Vec::new(),
    });

    let supervisor = SerialSupervisor::new(
        opener,
        link_options(
            Some(IdentifyOptions {
                timeout_ms: 50,
                retries: 1,
                ..kb_identify()
            }),
            ReconnectConfig {
                enabled: true,
                base_delay_ms: 10,
                max_delay_ms: 20,
                max_attempts: 2,
            },
        ),
        events,
    );
    supervisor.attach("usb:1a86:7523:ps2-keyboard:/dev/ttyUSB0", "/dev/ttyUSB0");

    wait_until("fatal error", Duration::from_secs(3), || {
        capture.count_tag("fatal-error") == 1
    })
    .await;
    assert_eq!(supervisor.phase(), LinkPhase::Error);

    supervisor.stop().await;
}

#[tokio::test]
async fn static_device_skips_identify() {
    let capture = CaptureSink::new();
    let events = Events::new(vec![capture.clone()]);
    let opener = ScriptedOpener::new(FirmwareConfig::default());
    let wire = Arc::clone(&opener.wire_log);

    let supervisor = SerialSupervisor::new(
        opener,
        link_options(None, ReconnectConfig::default()),
        events,
    );
    supervisor.attach("usb:0000:0000:static:/dev/ttyUSB9", "/dev/ttyUSB9");

    wait_until("ready", Duration::from_secs(2), || {
        supervisor.phase() == LinkPhase::Ready
    })
    .await;
    assert_eq!(capture.count_tag("identify-start"), 0);
    assert!(wire.lock().unwrap().is_empty());

    supervisor.stop().await;
}

#[tokio::test]
async fn inbound_lines_reach_subscribers_in_order() {
    let events = Events::new(vec![]);
    let opener = ScriptedOpener::new(FirmwareConfig {
        identify_response: None,
        greeting: vec!["sense:on".into(), "sense:off".into()],
        post_identify: Vec::new(),
    });

    let supervisor = SerialSupervisor::new(
        opener,
        link_options(None, ReconnectConfig::default()),
        events,
    );
    let mut lines = supervisor.subscribe_lines();
    supervisor.attach("usb:0000:0000:front-panel:/dev/ttyUSB1", "/dev/ttyUSB1");

    let first = tokio::time::timeout(Duration::from_secs(2), lines.recv())
        .await
        .expect("line timeout")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), lines.recv())
        .await
        .expect("line timeout")
        .unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("sense:on", "sense:off"));

    supervisor.stop().await;
}

#[tokio::test]
async fn write_line_fails_fast_without_port() {
    let events = Events::new(vec![]);
    let opener = ScriptedOpener::new(FirmwareConfig::default());
    let supervisor = SerialSupervisor::new(
        opener,
        link_options(None, ReconnectConfig::default()),
        events,
    );

    let err = supervisor.write_line("press 00:1c").await.unwrap_err();
    assert!(err.to_string().contains("port not open"));
}
