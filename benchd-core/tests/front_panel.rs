mod support;

use std::sync::Arc;
use std::time::Duration;

use benchd_core::config::{FrontPanelConfig, ReconnectConfig, SerialConfig};
use benchd_core::events::Events;
use benchd_core::front_panel::{FRONT_PANEL_SLICE, FrontPanelService};
use benchd_core::policy::PowerSense;
use benchd_core::state::StateFabric;

use support::{FirmwareConfig, ScriptedOpener, wait_until};

fn serial_config() -> SerialConfig {
    SerialConfig {
        required_devices: Vec::new(),
        rescan_ms: 1000,
        default_baud: 9600,
        identify_request: "identify".into(),
        identify_completion: "identify_complete".into(),
        parser_delim: "\n".into(),
        write_eol: "\n".into(),
        identify_timeout_ms: 2000,
        retries: 3,
        fail_on_missing: false,
        startup_timeout_ms: 30_000,
    }
}

fn panel_config() -> FrontPanelConfig {
    FrontPanelConfig {
        kind: "front-panel".into(),
        id_token: "FP".into(),
        baud: 9600,
        reconnect: ReconnectConfig::default(),
    }
}

#[tokio::test]
async fn sense_reports_flow_into_the_fabric() {
    let fabric = Arc::new(StateFabric::new());
    let opener = ScriptedOpener::new(FirmwareConfig {
        identify_response: Some("FP".into()),
        greeting: vec!["debug: booted".into()],
        post_identify: vec!["sense:on".into()],
    });

    let service = FrontPanelService::new(
        opener,
        &serial_config(),
        &panel_config(),
        Events::new(vec![]),
        Arc::clone(&fabric),
    );

    // Before any report the authoritative sense is unknown.
    let slice = fabric.slice(FRONT_PANEL_SLICE).unwrap();
    assert_eq!(PowerSense::from_slice(&slice), PowerSense::Unknown);

    service.attach("usb:0403:6001:front-panel:/dev/ttyUSB2", "/dev/ttyUSB2");
    wait_until("sense on", Duration::from_secs(2), || {
        fabric
            .slice(FRONT_PANEL_SLICE)
            .map(|v| PowerSense::from_slice(&v) == PowerSense::On)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(service.sense(), PowerSense::On);

    service.stop().await;
}

#[tokio::test]
async fn detach_resets_sense_to_unknown() {
    let fabric = Arc::new(StateFabric::new());
    let opener = ScriptedOpener::new(FirmwareConfig {
        identify_response: Some("FP".into()),
        greeting: Vec::new(),
        post_identify: vec!["sense:off".into()],
    });

    let service = FrontPanelService::new(
        opener,
        &serial_config(),
        &panel_config(),
        Events::new(vec![]),
        Arc::clone(&fabric),
    );
    service.attach("usb:0403:6001:front-panel:/dev/ttyUSB2", "/dev/ttyUSB2");

    wait_until("sense off", Duration::from_secs(2), || {
        service.sense() == PowerSense::Off
    })
    .await;

    service.detach("device-lost").await;
    wait_until("sense unknown", Duration::from_secs(1), || {
        service.sense() == PowerSense::Unknown
    })
    .await;
    let slice = fabric.slice(FRONT_PANEL_SLICE).unwrap();
    assert_eq!(PowerSense::from_slice(&slice), PowerSense::Unknown);

    service.stop().await;
}
