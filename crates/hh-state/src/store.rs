use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use hh_codec::Event;
use hh_common::clock::Clock;
use hh_common::events::{ChangeKind, DeviceRowChange, StateChange};
use hh_common::model::{DeviceState, DeviceStatus};

use crate::apply;

/// How long the bus loop may wait for apply-queue space before it starts
/// shedding reading events.
pub const APPLY_ENQUEUE_WAIT: Duration = Duration::from_millis(100);

/// Authoritative in-memory snapshot of all device state.
///
/// Exactly one writer task mutates it (the apply loop); readers clone
/// snapshots out from under a read lock and never hold references into the
/// writer's storage. Subscribers receive coarse [`StateChange`] records
/// over a bounded broadcast channel; a subscriber that lags loses the
/// oldest records first.
pub struct StateStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<StateChange>,
    clock: Arc<dyn Clock>,
    offline_timeout_ms: i64,
}

struct Inner {
    devices: HashMap<String, DeviceState>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>, offline_timeout_ms: i64) -> Arc<Self> {
        let (changes, _) = broadcast::channel(4096);
        Arc::new(Self {
            inner: RwLock::new(Inner {
                devices: HashMap::new(),
            }),
            changes,
            clock,
            offline_timeout_ms,
        })
    }

    /// Change stream for persistence and client fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Inject a change record into the stream without touching device
    /// state. Used by the alert runner to fan out alert-set transitions.
    pub fn emit(&self, change: StateChange) {
        let _ = self.changes.send(change);
    }

    /// Apply one decoded event, returning the change records it produced.
    /// Re-applying an event with an already-seen timestamp is a no-op.
    pub async fn apply(&self, event: &Event) -> Vec<StateChange> {
        let now = self.clock.now_ms();
        let changes = {
            let mut inner = self.inner.write().await;
            apply::apply_event(&mut inner.devices, event, now)
        };
        for change in &changes {
            let _ = self.changes.send(change.clone());
        }
        changes
    }

    pub async fn snapshot_device(&self, device_id: &str) -> Option<DeviceState> {
        self.inner.read().await.devices.get(device_id).cloned()
    }

    pub async fn snapshot_all(&self) -> HashMap<String, DeviceState> {
        self.inner.read().await.devices.clone()
    }

    pub async fn contains_device(&self, device_id: &str) -> bool {
        self.inner.read().await.devices.contains_key(device_id)
    }

    /// Single-writer loop: drains decoded events from the bus adapter and
    /// serializes every mutation. Performs no I/O.
    pub async fn run_apply_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        info!("State store apply loop started");
        while let Some(event) = rx.recv().await {
            self.apply(&event).await;
        }
        info!("State store apply loop stopped (event channel closed)");
    }

    /// One pass of offline detection: devices that were online but have
    /// been silent past the threshold flip to offline.
    pub async fn sweep(&self) -> Vec<StateChange> {
        let now = self.clock.now_ms();
        let changes = {
            let mut inner = self.inner.write().await;
            let mut changes = Vec::new();
            for device in inner.devices.values_mut() {
                if device.status != DeviceStatus::Online {
                    continue;
                }
                let Some(last_seen) = device.last_seen else {
                    continue;
                };
                if now - last_seen > self.offline_timeout_ms {
                    warn!(
                        "{}: silent for {}ms, marking offline",
                        device.device_id,
                        now - last_seen
                    );
                    let before = device.status;
                    device.status = DeviceStatus::Offline;
                    changes.push(StateChange::new(
                        &device.device_id,
                        ChangeKind::Status,
                        serde_json::json!({ "status": before.to_string() }),
                        apply::json_value(&DeviceRowChange {
                            status: device.status,
                            last_seen: device.last_seen,
                            version: device.version.clone(),
                            last_boot: device.last_boot,
                            last_error_code: device.last_error_code.clone(),
                            ip_address: device.ip_address.clone(),
                            rssi: device.rssi,
                        }),
                    ));
                }
            }
            changes
        };
        for change in &changes {
            let _ = self.changes.send(change.clone());
        }
        changes
    }

    /// Periodic sweeper task (1 Hz).
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let swept = self.sweep().await;
            if !swept.is_empty() {
                debug!("Sweeper marked {} device(s) offline", swept.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hh_codec::event::{HealthStatus, LifecycleStatus, SosReport};
    use hh_common::clock::ManualClock;
    use hh_common::model::DoorPosition;

    const T0: i64 = 1_700_000_000_000;

    fn store(clock: Arc<ManualClock>) -> Arc<StateStore> {
        StateStore::new(clock, 90_000)
    }

    fn door_event(state: DoorPosition) -> Event {
        Event::DoorState {
            device_id: "garage-controller".to_string(),
            state,
        }
    }

    #[tokio::test]
    async fn first_message_creates_device_online() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());

        let changes = store.apply(&door_event(DoorPosition::Closed)).await;
        assert!(changes.iter().any(|c| c.kind == ChangeKind::Status));
        assert!(changes.iter().any(|c| c.kind == ChangeKind::Door));

        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_seen, Some(T0));
        assert!(device.was_online);
    }

    #[tokio::test]
    async fn lwt_offline_maps_to_offline_without_touching_last_seen() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());

        store.apply(&door_event(DoorPosition::Closed)).await;
        clock.advance(5_000);
        store
            .apply(&Event::StatusUpdate {
                device_id: "garage-controller".to_string(),
                status: LifecycleStatus::Offline,
            })
            .await;

        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.last_seen, Some(T0));
    }

    #[tokio::test]
    async fn sos_marks_needs_help_and_records_error_code() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());

        let changes = store
            .apply(&Event::Sos {
                device_id: "house-monitor".to_string(),
                report: SosReport {
                    error: "ds18b20_read_error".to_string(),
                    message: Some("CRC mismatch".to_string()),
                    timestamp: T0,
                    device_id: "house-monitor".to_string(),
                },
            })
            .await;

        assert!(changes.iter().any(|c| c.kind == ChangeKind::Sos));
        let device = store.snapshot_device("house-monitor").await.unwrap();
        assert_eq!(device.status, DeviceStatus::NeedsHelp);
        assert_eq!(device.last_error_code.as_deref(), Some("ds18b20_read_error"));
    }

    #[tokio::test]
    async fn update_progression_holds_updating_until_next_message() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());
        let id = "garage-controller";

        for status in [
            LifecycleStatus::UpdateReceived,
            LifecycleStatus::Updating,
            LifecycleStatus::Updated,
        ] {
            store
                .apply(&Event::StatusUpdate {
                    device_id: id.to_string(),
                    status,
                })
                .await;
            let device = store.snapshot_device(id).await.unwrap();
            assert_eq!(device.status, DeviceStatus::Updating, "after {status:?}");
        }

        store
            .apply(&Event::Health {
                device_id: id.to_string(),
                health: HealthStatus::Online,
            })
            .await;
        let device = store.snapshot_device(id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn non_status_messages_do_not_end_an_update() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());
        let id = "garage-controller";

        store
            .apply(&Event::StatusUpdate {
                device_id: id.to_string(),
                status: LifecycleStatus::UpdateReceived,
            })
            .await;

        // Sensors keep reporting while the device updates; none of this
        // means the update finished.
        store
            .apply(&Event::TelemetryReading {
                device_id: id.to_string(),
                metric: "weather_temperature_f".to_string(),
                value: 70.0,
                ts: Some(T0 + 1_000),
            })
            .await;
        store.apply(&door_event(DoorPosition::Closed)).await;
        store
            .apply(&Event::Version {
                device_id: id.to_string(),
                version: "1.3.0".to_string(),
            })
            .await;

        let device = store.snapshot_device(id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Updating);
        assert_eq!(device.version.as_deref(), Some("1.3.0"));

        store
            .apply(&Event::StatusUpdate {
                device_id: id.to_string(),
                status: LifecycleStatus::Running,
            })
            .await;
        assert_eq!(
            store.snapshot_device(id).await.unwrap().status,
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn stale_readings_are_discarded() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());

        let newer = Event::TelemetryReading {
            device_id: "garage-controller".to_string(),
            metric: "weather_temperature_f".to_string(),
            value: 70.0,
            ts: Some(T0 + 10_000),
        };
        let older = Event::TelemetryReading {
            device_id: "garage-controller".to_string(),
            metric: "weather_temperature_f".to_string(),
            value: 65.0,
            ts: Some(T0 + 5_000),
        };

        store.apply(&newer).await;
        let changes = store.apply(&older).await;
        assert!(
            !changes.iter().any(|c| c.kind == ChangeKind::Reading),
            "out-of-order reading must be discarded"
        );

        let device = store.snapshot_device("garage-controller").await.unwrap();
        let sample = &device.metrics["weather_temperature_f"];
        assert_eq!(sample.value, 70.0);
        assert_eq!(sample.ts, T0 + 10_000);
    }

    #[tokio::test]
    async fn replaying_an_event_is_idempotent() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());

        let event = Event::TelemetryReading {
            device_id: "garage-controller".to_string(),
            metric: "weather_temperature_f".to_string(),
            value: 70.0,
            ts: Some(T0),
        };

        store.apply(&event).await;
        let first = store.snapshot_device("garage-controller").await.unwrap();
        let replay_changes = store.apply(&event).await;
        let second = store.snapshot_device("garage-controller").await.unwrap();

        assert!(!replay_changes.iter().any(|c| c.kind == ChangeKind::Reading));
        assert_eq!(first.metrics["weather_temperature_f"], second.metrics["weather_temperature_f"]);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn sweeper_flips_silent_online_devices_and_next_message_recovers() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());

        store.apply(&door_event(DoorPosition::Closed)).await;
        clock.advance(89_000);
        assert!(store.sweep().await.is_empty());

        clock.advance(2_000);
        let swept = store.sweep().await;
        assert_eq!(swept.len(), 1);
        assert_eq!(
            store.snapshot_device("garage-controller").await.unwrap().status,
            DeviceStatus::Offline
        );

        store.apply(&door_event(DoorPosition::Open)).await;
        assert_eq!(
            store.snapshot_device("garage-controller").await.unwrap().status,
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn change_stream_delivers_to_subscribers() {
        let clock = ManualClock::new(T0);
        let store = store(clock.clone());
        let mut rx = store.subscribe();

        store.apply(&door_event(DoorPosition::Opening)).await;

        let mut kinds = Vec::new();
        while let Ok(change) = rx.try_recv() {
            kinds.push(change.kind);
        }
        assert!(kinds.contains(&ChangeKind::Door));
        assert!(kinds.contains(&ChangeKind::Status));
    }
}
