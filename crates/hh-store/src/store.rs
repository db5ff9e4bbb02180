use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

use hh_common::events::DeviceRowChange;
use hh_common::model::Incident;

/// One row destined for `sensor_readings`.
#[derive(Debug, Clone)]
pub struct ReadingRow {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub ts: i64,
}

/// Wall-clock-aligned aggregation bucket for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBucket {
    Minute,
    Hour,
    Day,
}

impl HistoryBucket {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    /// Bucket width in milliseconds. Epoch division aligns minute and hour
    /// buckets to :00 and day buckets to 00:00 UTC.
    pub fn width_ms(&self) -> i64 {
        match self {
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }
}

/// One aggregated history point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub ts: i64,
    pub value: f64,
}

/// SQLite-backed store for readings, incidents, boots and device rows.
pub struct TimeSeriesStore {
    conn: Arc<Mutex<Connection>>,
}

impl TimeSeriesStore {
    /// Open (or create) the database at `path`, enable WAL mode, and create
    /// all required tables and indexes.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path))?;

        // WAL mode for better concurrent read/write performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_seen INTEGER,
                version TEXT,
                last_error_code TEXT,
                last_boot INTEGER,
                ip TEXT,
                rssi INTEGER
            );

            CREATE TABLE IF NOT EXISTS sensor_readings (
                device_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                ts INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY,
                device_id TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution_note TEXT
            );

            CREATE TABLE IF NOT EXISTS device_boots (
                device_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                reason TEXT,
                success INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_readings_device_metric_ts
                ON sensor_readings(device_id, metric, ts);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open
                ON incidents(device_id, code) WHERE resolved = 0;
            CREATE INDEX IF NOT EXISTS idx_incidents_device
                ON incidents(device_id);
            CREATE INDEX IF NOT EXISTS idx_boots_device_ts
                ON device_boots(device_id, ts);
            ",
        )
        .context("Failed to create store tables")?;

        info!("Store opened at {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a batch of readings in a single transaction.
    pub fn insert_readings_batch(&self, rows: &[ReadingRow]) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sensor_readings (device_id, metric, value, ts)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![row.device_id, row.metric, row.value, row.ts])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Upsert a device row; a later writer wins on `last_seen`, and absent
    /// fields never null out what is already stored.
    pub fn upsert_device(&self, device_id: &str, row: &DeviceRowChange) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO devices (device_id, status, last_seen, version, last_error_code, last_boot, ip, rssi)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(device_id) DO UPDATE SET
                 status = excluded.status,
                 last_seen = COALESCE(excluded.last_seen, devices.last_seen),
                 version = COALESCE(excluded.version, devices.version),
                 last_error_code = COALESCE(excluded.last_error_code, devices.last_error_code),
                 last_boot = COALESCE(excluded.last_boot, devices.last_boot),
                 ip = COALESCE(excluded.ip, devices.ip),
                 rssi = COALESCE(excluded.rssi, devices.rssi)",
            rusqlite::params![
                device_id,
                row.status.to_string(),
                row.last_seen,
                row.version,
                row.last_error_code,
                row.last_boot,
                row.ip_address,
                row.rssi,
            ],
        )?;
        Ok(())
    }

    /// Advance a device's `last_seen` without touching other fields.
    pub fn bump_last_seen(&self, device_id: &str, ts: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE devices SET last_seen = MAX(COALESCE(last_seen, 0), ?2)
             WHERE device_id = ?1",
            rusqlite::params![device_id, ts],
        )?;
        Ok(())
    }

    pub fn record_boot(&self, device_id: &str, ts: i64, reason: &str, success: bool) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO device_boots (device_id, ts, reason, success)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![device_id, ts, reason, success as i32],
        )?;
        Ok(())
    }

    /// Open an incident, or refresh `last_seen` and `message` when one is
    /// already open for this `(device_id, code)` pair.
    pub fn upsert_incident(&self, device_id: &str, code: &str, message: &str, ts: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO incidents (device_id, code, message, first_seen, last_seen, resolved)
             VALUES (?1, ?2, ?3, ?4, ?4, 0)
             ON CONFLICT(device_id, code) WHERE resolved = 0 DO UPDATE SET
                 last_seen = MAX(incidents.last_seen, excluded.last_seen),
                 message = excluded.message",
            rusqlite::params![device_id, code, message, ts],
        )?;
        Ok(())
    }

    /// Resolve one open incident. Returns how many rows changed (0 or 1).
    pub fn resolve_incident(&self, device_id: &str, code: &str, note: Option<&str>) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE incidents SET resolved = 1, resolution_note = ?3
             WHERE device_id = ?1 AND code = ?2 AND resolved = 0",
            rusqlite::params![device_id, code, note],
        )?;
        Ok(n)
    }

    /// Resolve every open incident for a device.
    pub fn resolve_all_incidents(&self, device_id: &str, note: &str) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE incidents SET resolved = 1, resolution_note = ?2
             WHERE device_id = ?1 AND resolved = 0",
            rusqlite::params![device_id, note],
        )?;
        Ok(n)
    }

    pub fn open_incidents(&self) -> Result<Vec<Incident>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, device_id, code, message, first_seen, last_seen, resolved, resolution_note
             FROM incidents WHERE resolved = 0 ORDER BY device_id, code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Incident {
                id: row.get(0)?,
                device_id: row.get(1)?,
                code: row.get(2)?,
                message: row.get(3)?,
                first_seen: row.get(4)?,
                last_seen: row.get(5)?,
                resolved: row.get::<_, i64>(6)? != 0,
                resolution_note: row.get(7)?,
            })
        })?;

        let mut incidents = Vec::new();
        for row in rows {
            incidents.push(row?);
        }
        Ok(incidents)
    }

    pub fn device_exists(&self, device_id: &str) -> Result<bool> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM devices WHERE device_id = ?1 LIMIT 1")?;
        let found = stmt.exists(rusqlite::params![device_id])?;
        Ok(found)
    }

    /// Average a metric into wall-clock-aligned buckets over `[start, end)`.
    /// Empty buckets are omitted.
    pub fn reading_history(
        &self,
        device_id: &str,
        metric: &str,
        start: i64,
        end: i64,
        bucket: HistoryBucket,
    ) -> Result<Vec<HistoryPoint>> {
        let width = bucket.width_ms();
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT (ts / ?4) * ?4 AS bucket_ts, AVG(value)
             FROM sensor_readings
             WHERE device_id = ?1 AND metric = ?2 AND ts >= ?3 AND ts < ?5
             GROUP BY bucket_ts
             ORDER BY bucket_ts",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![device_id, metric, start, width, end],
            |row| {
                Ok(HistoryPoint {
                    ts: row.get(0)?,
                    value: row.get(1)?,
                })
            },
        )?;

        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }

    /// Delete readings older than `cutoff_ms`. Returns the number removed.
    pub fn prune_readings_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM sensor_readings WHERE ts < ?1",
            rusqlite::params![cutoff_ms],
        )?;
        Ok(n)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hh_common::model::DeviceStatus;

    fn store() -> TimeSeriesStore {
        TimeSeriesStore::open(":memory:").unwrap()
    }

    fn row(status: DeviceStatus, last_seen: i64) -> DeviceRowChange {
        DeviceRowChange {
            status,
            last_seen: Some(last_seen),
            version: None,
            last_boot: None,
            last_error_code: None,
            ip_address: None,
            rssi: None,
        }
    }

    #[test]
    fn upsert_device_keeps_known_fields() {
        let store = store();
        let mut first = row(DeviceStatus::Online, 1_000);
        first.version = Some("1.2.0".to_string());
        store.upsert_device("garage-controller", &first).unwrap();

        // A later row without a version must not erase it.
        store
            .upsert_device("garage-controller", &row(DeviceStatus::Offline, 2_000))
            .unwrap();

        store.with_test_conn(|conn| {
            let (status, last_seen, version): (String, i64, Option<String>) = conn
                .query_row(
                    "SELECT status, last_seen, version FROM devices WHERE device_id = 'garage-controller'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .unwrap();
            assert_eq!(status, "offline");
            assert_eq!(last_seen, 2_000);
            assert_eq!(version.as_deref(), Some("1.2.0"));
        });
    }

    #[test]
    fn at_most_one_open_incident_per_device_and_code() {
        let store = store();
        store
            .upsert_incident("house-monitor", "ds18b20_read_error", "CRC mismatch", 1_000)
            .unwrap();
        store
            .upsert_incident("house-monitor", "ds18b20_read_error", "CRC mismatch again", 2_000)
            .unwrap();

        let open = store.open_incidents().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].first_seen, 1_000);
        assert_eq!(open[0].last_seen, 2_000);
        assert_eq!(open[0].message, "CRC mismatch again");

        // Resolving then reporting again opens a fresh incident.
        let resolved = store
            .resolve_incident("house-monitor", "ds18b20_read_error", Some("sensor replaced"))
            .unwrap();
        assert_eq!(resolved, 1);
        store
            .upsert_incident("house-monitor", "ds18b20_read_error", "back", 3_000)
            .unwrap();
        let open = store.open_incidents().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].first_seen, 3_000);
    }

    #[test]
    fn history_buckets_align_to_wall_clock_and_omit_empty() {
        let store = store();
        // Two samples in minute 0, one in minute 2, none in minute 1.
        let base = 1_700_000_040_000 / 60_000 * 60_000;
        let rows = vec![
            ReadingRow {
                device_id: "garage-controller".into(),
                metric: "weather_temperature_f".into(),
                value: 70.0,
                ts: base + 1_000,
            },
            ReadingRow {
                device_id: "garage-controller".into(),
                metric: "weather_temperature_f".into(),
                value: 72.0,
                ts: base + 59_000,
            },
            ReadingRow {
                device_id: "garage-controller".into(),
                metric: "weather_temperature_f".into(),
                value: 68.0,
                ts: base + 121_000,
            },
        ];
        store.insert_readings_batch(&rows).unwrap();

        let points = store
            .reading_history(
                "garage-controller",
                "weather_temperature_f",
                base,
                base + 180_000,
                HistoryBucket::Minute,
            )
            .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].ts, base);
        assert_eq!(points[0].value, 71.0);
        assert_eq!(points[1].ts, base + 120_000);
        assert_eq!(points[1].value, 68.0);
    }

    #[test]
    fn prune_removes_only_old_readings() {
        let store = store();
        store
            .insert_readings_batch(&[
                ReadingRow {
                    device_id: "d".into(),
                    metric: "m".into(),
                    value: 1.0,
                    ts: 1_000,
                },
                ReadingRow {
                    device_id: "d".into(),
                    metric: "m".into(),
                    value: 2.0,
                    ts: 5_000,
                },
            ])
            .unwrap();

        let removed = store.prune_readings_before(2_000).unwrap();
        assert_eq!(removed, 1);
        let points = store
            .reading_history("d", "m", 0, 10_000, HistoryBucket::Minute)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 2.0);
    }

    impl TimeSeriesStore {
        fn with_test_conn<F: FnOnce(&Connection)>(&self, f: F) {
            let conn = self.lock();
            f(&conn);
        }
    }
}
