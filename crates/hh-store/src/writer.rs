//! Persistence writer: drains the state-store change stream into SQLite
//! without ever blocking it.
//!
//! Intake and flushing are split so a slow database cannot stall the
//! change stream: the intake task only moves records into in-memory
//! queues, and the flusher does the actual writes. Readings are shed
//! oldest-first when their queue is full; device rows, incidents and
//! boots are never shed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

use hh_common::clock::Clock;
use hh_common::events::{
    BootChange, ChangeKind, DeviceRowChange, ReadingChange, SosChange, StateChange,
};

use crate::store::{ReadingRow, TimeSeriesStore};

const READINGS_QUEUE_CAP: usize = 4096;
const BATCH_MAX: usize = 128;
const BATCH_INTERVAL: Duration = Duration::from_millis(250);
const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(10);
const RETRY_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Default)]
pub struct WriterStats {
    /// Reading events dropped because the queue was full or the intake
    /// lagged the change stream.
    pub shed_readings: AtomicU64,
    pub write_errors: AtomicU64,
    /// Cleared after repeated write failures; the alert evaluator surfaces
    /// this as a system alert.
    pub store_healthy: AtomicBool,
}

impl WriterStats {
    pub fn new() -> Arc<Self> {
        let stats = Self::default();
        stats.store_healthy.store(true, Ordering::Relaxed);
        Arc::new(stats)
    }

    pub fn is_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::Relaxed)
    }
}

enum CriticalOp {
    Device {
        device_id: String,
        row: DeviceRowChange,
    },
    Boot {
        device_id: String,
        boot: BootChange,
    },
    Sos {
        device_id: String,
        sos: SosChange,
    },
    ResolveAll {
        device_id: String,
        note: String,
    },
}

#[derive(Default)]
struct QueueInner {
    readings: VecDeque<ReadingRow>,
    ops: VecDeque<CriticalOp>,
}

/// Bounded hand-off between the change stream and the flusher.
pub struct WriteQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    stats: Arc<WriterStats>,
}

impl WriteQueue {
    pub fn new(stats: Arc<WriterStats>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            stats,
        })
    }

    fn push(&self, change: StateChange) {
        let mut inner = self.inner.lock().unwrap();
        match change.kind {
            ChangeKind::Reading => {
                let Ok(reading) = serde_json::from_value::<ReadingChange>(change.after) else {
                    return;
                };
                if inner.readings.len() >= READINGS_QUEUE_CAP {
                    inner.readings.pop_front();
                    self.stats.shed_readings.fetch_add(1, Ordering::Relaxed);
                }
                inner.readings.push_back(ReadingRow {
                    device_id: change.device_id,
                    metric: reading.metric,
                    value: reading.value,
                    ts: reading.ts,
                });
            }
            ChangeKind::Status | ChangeKind::Version => {
                let Ok(row) = serde_json::from_value::<DeviceRowChange>(change.after) else {
                    return;
                };
                inner.ops.push_back(CriticalOp::Device {
                    device_id: change.device_id,
                    row,
                });
            }
            ChangeKind::Boot => {
                let Ok(boot) = serde_json::from_value::<BootChange>(change.after) else {
                    return;
                };
                inner.ops.push_back(CriticalOp::Boot {
                    device_id: change.device_id,
                    boot,
                });
            }
            ChangeKind::Sos => {
                let Ok(sos) = serde_json::from_value::<SosChange>(change.after) else {
                    return;
                };
                inner.ops.push_back(CriticalOp::Sos {
                    device_id: change.device_id,
                    sos,
                });
            }
            ChangeKind::IncidentsCleared => {
                inner.ops.push_back(CriticalOp::ResolveAll {
                    device_id: change.device_id,
                    note: "cleared by consecutive clean status reports".to_string(),
                });
            }
            // Derived views; their numeric content already arrives as
            // Reading changes.
            ChangeKind::Door
            | ChangeKind::Light
            | ChangeKind::Power
            | ChangeKind::Freezer
            | ChangeKind::Weather
            | ChangeKind::Alerts => return,
        }
        drop(inner);
        self.notify.notify_one();
    }

    fn take_ops(&self) -> Vec<CriticalOp> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.drain(..).collect()
    }

    fn take_readings(&self, max: usize) -> Vec<ReadingRow> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.readings.len().min(max);
        inner.readings.drain(..n).collect()
    }

    fn readings_len(&self) -> usize {
        self.inner.lock().unwrap().readings.len()
    }
}

/// Intake task: moves change records off the broadcast stream into the
/// write queue. Does no I/O, so the stream never backs up on the store.
pub async fn run_intake(queue: Arc<WriteQueue>, mut rx: broadcast::Receiver<StateChange>) {
    info!("Persistence intake started");
    loop {
        match rx.recv().await {
            Ok(change) => queue.push(change),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Persistence intake lagged, missed {} change records", n);
                queue.stats.shed_readings.fetch_add(n, Ordering::Relaxed);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Change stream closed, stopping persistence intake");
                break;
            }
        }
    }
}

/// Flusher task: applies critical ops immediately and readings in batches
/// (up to 128 rows or every 250 ms, whichever comes first).
pub async fn run_flusher(
    store: Arc<TimeSeriesStore>,
    queue: Arc<WriteQueue>,
    clock: Arc<dyn Clock>,
    retention_days: Option<u32>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Persistence flusher started");
    let mut last_flush = Instant::now();
    let mut last_prune_ms = clock.now_ms();

    loop {
        tokio::select! {
            _ = queue.notify.notified() => {}
            _ = tokio::time::sleep(BATCH_INTERVAL) => {}
            _ = shutdown.changed() => {
                drain_all(&store, &queue).await;
                info!("Persistence flusher drained and stopped");
                return;
            }
        }

        apply_ops(&store, &queue).await;

        if queue.readings_len() >= BATCH_MAX || last_flush.elapsed() >= BATCH_INTERVAL {
            flush_readings(&store, &queue).await;
            last_flush = Instant::now();
        }

        if let Some(days) = retention_days {
            let now = clock.now_ms();
            if now - last_prune_ms >= 86_400_000 {
                last_prune_ms = now;
                let cutoff = now - days as i64 * 86_400_000;
                match store.prune_readings_before(cutoff) {
                    Ok(0) => {}
                    Ok(n) => info!("Pruned {} readings older than {} days", n, days),
                    Err(e) => warn!("Retention prune failed: {e:#}"),
                }
            }
        }
    }
}

async fn apply_ops(store: &TimeSeriesStore, queue: &WriteQueue) {
    for op in queue.take_ops() {
        match op {
            CriticalOp::Device { device_id, row } => {
                retry_write(&queue.stats, || store.upsert_device(&device_id, &row)).await;
            }
            CriticalOp::Boot { device_id, boot } => {
                retry_write(&queue.stats, || {
                    store.record_boot(&device_id, boot.ts, &boot.reason, boot.success)
                })
                .await;
                retry_write(&queue.stats, || store.bump_last_seen(&device_id, boot.ts)).await;
            }
            CriticalOp::Sos { device_id, sos } => {
                retry_write(&queue.stats, || {
                    store.upsert_incident(&device_id, &sos.code, &sos.message, sos.ts)
                })
                .await;
            }
            CriticalOp::ResolveAll { device_id, note } => {
                retry_write(&queue.stats, || {
                    store.resolve_all_incidents(&device_id, &note).map(|n| {
                        if n > 0 {
                            info!("Resolved {} open incident(s) for {}", n, device_id);
                        }
                    })
                })
                .await;
            }
        }
    }
}

async fn flush_readings(store: &TimeSeriesStore, queue: &WriteQueue) {
    loop {
        let batch = queue.take_readings(BATCH_MAX);
        if batch.is_empty() {
            return;
        }
        retry_write(&queue.stats, || store.insert_readings_batch(&batch)).await;
        debug!("Inserted {} readings", batch.len());

        // The freshest sample per device also advances its last_seen.
        let mut latest: HashMap<&str, i64> = HashMap::new();
        for row in &batch {
            let entry = latest.entry(row.device_id.as_str()).or_insert(row.ts);
            *entry = (*entry).max(row.ts);
        }
        for (device_id, ts) in latest {
            retry_write(&queue.stats, || store.bump_last_seen(device_id, ts)).await;
        }
    }
}

async fn drain_all(store: &TimeSeriesStore, queue: &WriteQueue) {
    apply_ops(store, queue).await;
    flush_readings(store, queue).await;
}

/// Run one store operation with exponential backoff (100 ms doubling to a
/// 10 s cap, ±20% jitter). After repeated failures the op is abandoned and
/// the store is marked unhealthy; live state keeps serving.
async fn retry_write<F>(stats: &WriterStats, mut op: F)
where
    F: FnMut() -> anyhow::Result<()>,
{
    let mut delay = RETRY_INITIAL;
    for attempt in 1..=RETRY_MAX_ATTEMPTS {
        match op() {
            Ok(()) => {
                stats.store_healthy.store(true, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                stats.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Store write failed (attempt {attempt}/{RETRY_MAX_ATTEMPTS}): {e:#}");
                if attempt == RETRY_MAX_ATTEMPTS {
                    break;
                }
                let jitter = rand::rng().random_range(0.8..=1.2);
                let wait = delay.mul_f64(jitter).min(RETRY_CAP);
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(RETRY_CAP);
            }
        }
    }
    error!("Store write abandoned after {RETRY_MAX_ATTEMPTS} attempts; marking store unhealthy");
    stats.store_healthy.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hh_common::model::DeviceStatus;
    use serde_json::{Value, json};

    fn reading_change(device: &str, metric: &str, value: f64, ts: i64) -> StateChange {
        StateChange::new(
            device,
            ChangeKind::Reading,
            Value::Null,
            serde_json::to_value(ReadingChange {
                metric: metric.to_string(),
                value,
                ts,
            })
            .unwrap(),
        )
    }

    #[test]
    fn readings_queue_sheds_oldest_and_counts() {
        let stats = WriterStats::new();
        let queue = WriteQueue::new(stats.clone());

        for i in 0..(READINGS_QUEUE_CAP + 10) {
            queue.push(reading_change("d", "m", i as f64, i as i64));
        }

        assert_eq!(queue.readings_len(), READINGS_QUEUE_CAP);
        assert_eq!(stats.shed_readings.load(Ordering::Relaxed), 10);
        // The oldest rows are the ones that went.
        let first = queue.take_readings(1);
        assert_eq!(first[0].ts, 10);
    }

    #[test]
    fn critical_ops_survive_a_full_readings_queue() {
        let stats = WriterStats::new();
        let queue = WriteQueue::new(stats.clone());

        for i in 0..READINGS_QUEUE_CAP {
            queue.push(reading_change("d", "m", 0.0, i as i64));
        }
        queue.push(StateChange::new(
            "house-monitor",
            ChangeKind::Sos,
            Value::Null,
            serde_json::to_value(SosChange {
                code: "ds18b20_read_error".to_string(),
                message: "CRC mismatch".to_string(),
                ts: 1,
            })
            .unwrap(),
        ));

        assert_eq!(queue.take_ops().len(), 1);
    }

    #[test]
    fn view_changes_are_not_persisted() {
        let stats = WriterStats::new();
        let queue = WriteQueue::new(stats);
        queue.push(StateChange::new(
            "garage-controller",
            ChangeKind::Door,
            Value::Null,
            json!({"state": "open"}),
        ));
        assert_eq!(queue.readings_len(), 0);
        assert!(queue.take_ops().is_empty());
    }

    #[tokio::test]
    async fn flusher_writes_ops_and_batches() {
        use hh_common::clock::ManualClock;

        let store = Arc::new(TimeSeriesStore::open(":memory:").unwrap());
        let stats = WriterStats::new();
        let queue = WriteQueue::new(stats.clone());
        let clock = ManualClock::new(1_700_000_000_000);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue.push(reading_change("garage-controller", "weather_temperature_f", 70.0, 1_000));
        queue.push(StateChange::new(
            "garage-controller",
            ChangeKind::Status,
            json!({"status": "unknown"}),
            serde_json::to_value(DeviceRowChange {
                status: DeviceStatus::Online,
                last_seen: Some(1_000),
                version: None,
                last_boot: None,
                last_error_code: None,
                ip_address: None,
                rssi: None,
            })
            .unwrap(),
        ));
        queue.push(StateChange::new(
            "house-monitor",
            ChangeKind::Sos,
            Value::Null,
            serde_json::to_value(SosChange {
                code: "ds18b20_read_error".to_string(),
                message: "CRC mismatch".to_string(),
                ts: 2_000,
            })
            .unwrap(),
        ));

        let flusher = tokio::spawn(run_flusher(
            store.clone(),
            queue.clone(),
            clock,
            None,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();

        assert!(store.device_exists("garage-controller").unwrap());
        assert_eq!(store.open_incidents().unwrap().len(), 1);
        let points = store
            .reading_history(
                "garage-controller",
                "weather_temperature_f",
                0,
                10_000,
                crate::store::HistoryBucket::Minute,
            )
            .unwrap();
        assert_eq!(points.len(), 1);
        assert!(stats.is_healthy());
    }
}
