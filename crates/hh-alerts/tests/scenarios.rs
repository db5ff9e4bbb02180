//! End-to-end scenarios through decode → state → persistence → alerts.

use std::sync::Arc;

use hh_alerts::{AlertConfig, codes, evaluate};
use hh_codec::CodecRegistry;
use hh_common::clock::{Clock, ManualClock};
use hh_common::events::ChangeKind;
use hh_common::model::{DeviceStatus, DoorPosition};
use hh_state::StateStore;
use hh_store::TimeSeriesStore;

const T0: i64 = 1_700_000_000_000;

struct Harness {
    codec: CodecRegistry,
    clock: Arc<ManualClock>,
    state: Arc<StateStore>,
    store: TimeSeriesStore,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(T0);
        Self {
            codec: CodecRegistry::new(),
            clock: clock.clone(),
            state: StateStore::new(clock, 90_000),
            store: TimeSeriesStore::open(":memory:").unwrap(),
        }
    }

    /// Decode a bus message and apply it, mirroring what the persistence
    /// writer would do with the resulting changes.
    async fn ingest(&self, topic: &str, payload: &[u8]) {
        let event = self
            .codec
            .decode(topic, payload)
            .expect("decode")
            .expect("event");
        for change in self.state.apply(&event).await {
            match change.kind {
                ChangeKind::Sos => {
                    let sos: hh_common::events::SosChange =
                        serde_json::from_value(change.after).unwrap();
                    self.store
                        .upsert_incident(&change.device_id, &sos.code, &sos.message, sos.ts)
                        .unwrap();
                }
                ChangeKind::IncidentsCleared => {
                    self.store
                        .resolve_all_incidents(&change.device_id, "cleared by status")
                        .unwrap();
                }
                _ => {}
            }
        }
    }

    async fn alerts(&self) -> Vec<hh_common::model::ActiveAlert> {
        let snapshot = self.state.snapshot_all().await;
        let incidents = self.store.open_incidents().unwrap();
        evaluate(
            &snapshot,
            &incidents,
            self.clock.now_ms(),
            &AlertConfig::default(),
            true,
        )
    }
}

#[tokio::test]
async fn door_status_progression_reaches_queries() {
    let h = Harness::new();

    h.ingest("home/garage/door/status", b"opening").await;
    h.ingest("home/garage/door/status", b"open").await;

    let device = h.state.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.door.unwrap().state, DoorPosition::Open);
    assert_eq!(device.status, DeviceStatus::Online);
}

#[tokio::test]
async fn two_consecutive_freezer_highs_raise_the_alert() {
    let h = Harness::new();

    h.ingest("home/garage/freezer/temperature", b"12.0").await;
    let alerts = h.alerts().await;
    assert!(
        !alerts.iter().any(|a| a.code == codes::FREEZER_TEMP_HIGH),
        "single spike must not alert"
    );

    h.clock.advance(30_000);
    h.ingest("home/garage/freezer/temperature", b"12.5").await;
    let alerts = h.alerts().await;
    let alert = alerts
        .iter()
        .find(|a| a.code == codes::FREEZER_TEMP_HIGH)
        .expect("freezer alert after second high reading");
    assert_eq!(alert.device_id, "garage-controller");
    assert!(alert.message.contains("12.5°F"));
}

#[tokio::test]
async fn city_power_outage_alerts_and_clears() {
    let h = Harness::new();

    h.ingest("home/power/city/status", b"offline").await;
    let alerts = h.alerts().await;
    assert!(alerts.iter().any(|a| a.code == codes::CITY_POWER_OFFLINE));

    h.clock.advance(10_000);
    h.ingest("home/power/city/status", b"online").await;
    let alerts = h.alerts().await;
    assert!(!alerts.iter().any(|a| a.code == codes::CITY_POWER_OFFLINE));
}

#[tokio::test]
async fn sos_incident_lifecycle() {
    let h = Harness::new();

    let sos = format!(
        r#"{{"error":"ds18b20_read_error","message":"CRC mismatch","timestamp":{T0},"device_id":"house-monitor"}}"#
    );
    h.ingest("home/system/house-monitor/sos", sos.as_bytes()).await;

    let open = h.store.open_incidents().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].first_seen, T0);

    // A second report within 30s refreshes, not duplicates.
    h.clock.advance(20_000);
    let again = format!(
        r#"{{"error":"ds18b20_read_error","message":"CRC mismatch","timestamp":{},"device_id":"house-monitor"}}"#,
        T0 + 20_000
    );
    h.ingest("home/system/house-monitor/sos", again.as_bytes()).await;
    let open = h.store.open_incidents().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].last_seen, T0 + 20_000);

    let alerts = h.alerts().await;
    assert_eq!(
        alerts.iter().filter(|a| a.code == "ds18b20_read_error").count(),
        1
    );

    // Two consecutive clean consolidated statuses resolve the incident.
    for offset in [40_000, 70_000] {
        let status = format!(
            r#"{{"timestamp":{},"uptime_s":100,"health":"online","errors":[]}}"#,
            T0 + offset
        );
        h.ingest("home/house-monitor/status", status.as_bytes()).await;
    }
    assert!(h.store.open_incidents().unwrap().is_empty());

    let alerts = h.alerts().await;
    assert!(!alerts.iter().any(|a| a.code == "ds18b20_read_error"));
}

#[tokio::test]
async fn update_progression_returns_device_online() {
    let h = Harness::new();

    h.ingest("home/system/garage-controller/status", b"running").await;
    for token in [b"update_received".as_ref(), b"updating", b"updated"] {
        h.ingest("home/system/garage-controller/status", token).await;
        let device = h.state.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Updating);
    }

    // Telemetry that trickles in mid-update is not an update confirmation.
    h.clock.advance(1_000);
    h.ingest("home/garage/freezer/temperature", b"-1.0").await;
    let device = h.state.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Updating);

    h.ingest("home/system/garage-controller/health", b"online").await;
    let device = h.state.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
}

#[tokio::test]
async fn silent_device_goes_offline_and_recovers() {
    let h = Harness::new();

    h.ingest("home/garage/door/status", b"closed").await;
    h.clock.advance(91_000);
    h.state.sweep().await;

    let device = h.state.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);
    assert!(h.alerts().await.iter().any(|a| a.code == codes::DEVICE_SILENT));

    h.ingest("home/garage/door/status", b"closed").await;
    let device = h.state.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
}
