//! Append-only persistence (spec §4.8): a configuration store (read-mostly,
//! admin-owned, the timing checkpoint excepted) and a runtime capture store
//! (write-hot), both backed by `sqlx` against SQLite in WAL mode — the
//! project's existing data-layer dependency, here pointed at a single-file
//! store instead of Postgres, which is what §4.8 explicitly calls for.
//!
//! `shot_log` is a SQL `VIEW`, not a second write path, so "the view is the
//! sole read surface" holds without a materializer to keep in sync.
//!
//! Row ids for `timer_events` and `impacts` are the same `String` ids
//! `bridge_types::ImpactEvent::impact_id` already uses (generated by the
//! coordinator), not a second integer id space — `correlations` then
//! references them directly as `shot_id`/`impact_id` text foreign keys.

use std::time::Duration;

use bridge_types::{
    Correlation, CorrelationQuality, DeviceStatus, ImpactEvent, RawSample, ShotLogKind,
    ShotLogRow, TimerEvent, TimerEventKind, TimingModel,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::warn;

use crate::error::PersistenceError;

const CONFIG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bridges (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    stage_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS stages (
    id INTEGER PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS targets (
    id INTEGER PRIMARY KEY,
    stage_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sensors (
    mac TEXT PRIMARY KEY,
    bridge_id TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    label TEXT NOT NULL,
    battery_pct INTEGER
);
CREATE TABLE IF NOT EXISTS timer_assignment (
    bridge_id TEXT PRIMARY KEY,
    mac TEXT NOT NULL,
    vendor TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS timing_model_checkpoint (
    bridge_id TEXT PRIMARY KEY,
    mean_ms REAL NOT NULL,
    sigma_ms REAL NOT NULL,
    count INTEGER NOT NULL,
    last_updated_wall_ms INTEGER NOT NULL
);
"#;

const CAPTURE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS timer_events (
    id TEXT PRIMARY KEY,
    ts_mono_ns INTEGER NOT NULL,
    ts_wall_ms INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    shot_number INTEGER,
    split_cs INTEGER,
    total_cs INTEGER,
    raw_hex TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS impacts (
    id TEXT PRIMARY KEY,
    ts_onset_mono_ns INTEGER NOT NULL,
    ts_onset_wall_ms INTEGER NOT NULL,
    ts_peak_mono_ns INTEGER NOT NULL,
    sensor_id TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    peak_magnitude REAL NOT NULL,
    duration_ms REAL NOT NULL,
    confidence REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS correlations (
    shot_id TEXT PRIMARY KEY,
    impact_id TEXT NOT NULL UNIQUE,
    latency_ms REAL NOT NULL,
    residual_sigma REAL NOT NULL,
    quality TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bt50_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_id TEXT NOT NULL,
    ts_mono_ns INTEGER NOT NULL,
    ts_wall_ms INTEGER NOT NULL,
    vx_mg REAL NOT NULL,
    vy_mg REAL NOT NULL,
    vz_mg REAL NOT NULL,
    magnitude_mg REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS device_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    ts_wall_ms INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE VIEW IF NOT EXISTS shot_log AS
    SELECT
        t.ts_mono_ns AS ts_mono_ns,
        t.ts_wall_ms AS ts_wall_ms,
        CASE WHEN t.kind = 'SHOT' THEN 'shot' ELSE 'timer_control' END AS kind,
        t.device_id AS device_id,
        NULL AS sensor_id,
        NULL AS target_id,
        t.shot_number AS shot_number,
        t.split_cs AS split_cs,
        t.total_cs AS total_cs,
        NULL AS peak_magnitude,
        NULL AS duration_ms,
        NULL AS confidence,
        c.latency_ms AS latency_ms,
        c.residual_sigma AS residual_sigma,
        c.quality AS quality
    FROM timer_events t
    LEFT JOIN correlations c ON c.shot_id = t.id
    UNION ALL
    SELECT
        i.ts_onset_mono_ns AS ts_mono_ns,
        i.ts_onset_wall_ms AS ts_wall_ms,
        'impact' AS kind,
        NULL AS device_id,
        i.sensor_id AS sensor_id,
        i.target_id AS target_id,
        NULL AS shot_number,
        NULL AS split_cs,
        NULL AS total_cs,
        i.peak_magnitude AS peak_magnitude,
        i.duration_ms AS duration_ms,
        i.confidence AS confidence,
        c.latency_ms AS latency_ms,
        c.residual_sigma AS residual_sigma,
        c.quality AS quality
    FROM impacts i
    LEFT JOIN correlations c ON c.impact_id = i.id
    ORDER BY ts_mono_ns ASC;
"#;

async fn open_pool(path: &str) -> Result<SqlitePool, PersistenceError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    // A single shared ":memory:" database only survives across connections if
    // the pool never opens more than one (each new connection otherwise gets
    // its own empty in-memory database) — matters for tests, not file-backed
    // stores, which is the only place this path is used.
    let max_connections = if path == ":memory:" { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(PersistenceError::from)
}

/// Read-mostly store for bridge/sensor/stage assignments plus the one row
/// the core itself writes: the timing model checkpoint.
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    pub async fn connect(path: &str) -> Result<Self, PersistenceError> {
        let pool = open_pool(path).await?;
        sqlx::query(CONFIG_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn load_timing_checkpoint(&self, bridge_id: &str) -> Result<Option<TimingModel>, PersistenceError> {
        let row = sqlx::query(
            "SELECT mean_ms, sigma_ms, count, last_updated_wall_ms FROM timing_model_checkpoint WHERE bridge_id = ?",
        )
        .bind(bridge_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TimingModel {
            mean_ms: r.get("mean_ms"),
            sigma_ms: r.get("sigma_ms"),
            count: r.get::<i64, _>("count") as u64,
            last_updated_wall_ms: r.get("last_updated_wall_ms"),
        }))
    }

    /// Updated on a cadence by the coordinator (every 50 accepted
    /// correlations or every 10s, per spec §9), not on every correlation.
    pub async fn save_timing_checkpoint(&self, bridge_id: &str, model: &TimingModel) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO timing_model_checkpoint (bridge_id, mean_ms, sigma_ms, count, last_updated_wall_ms)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(bridge_id) DO UPDATE SET
                   mean_ms = excluded.mean_ms,
                   sigma_ms = excluded.sigma_ms,
                   count = excluded.count,
                   last_updated_wall_ms = excluded.last_updated_wall_ms"#,
        )
        .bind(bridge_id)
        .bind(model.mean_ms)
        .bind(model.sigma_ms)
        .bind(model.count as i64)
        .bind(model.last_updated_wall_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Write-hot capture store: one row per timer event, impact, and
/// correlation, plus optional verbose sample capture and device status.
pub struct CaptureStore {
    pool: SqlitePool,
    verbose_sample_capture: bool,
}

impl CaptureStore {
    pub async fn connect(path: &str, verbose_sample_capture: bool) -> Result<Self, PersistenceError> {
        let pool = open_pool(path).await?;
        for statement in CAPTURE_SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            verbose_sample_capture,
        })
    }

    pub async fn insert_timer_event(&self, id: &str, event: &TimerEvent) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO timer_events (id, ts_mono_ns, ts_wall_ms, device_id, kind, shot_number, split_cs, total_cs, raw_hex)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id)
        .bind(event.ts_mono_ns)
        .bind(event.ts_wall_ms)
        .bind(&event.device_id)
        .bind(timer_kind_str(event.kind))
        .bind(event.shot_number.map(|n| n as i64))
        .bind(event.split_cs.map(|n| n as i64))
        .bind(event.total_cs.map(|n| n as i64))
        .bind(&event.raw_hex)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_impact(&self, event: &ImpactEvent) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO impacts (id, ts_onset_mono_ns, ts_onset_wall_ms, ts_peak_mono_ns, sensor_id, target_id, peak_magnitude, duration_ms, confidence)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&event.impact_id)
        .bind(event.ts_onset_mono_ns)
        .bind(event.ts_onset_wall_ms)
        .bind(event.ts_peak_mono_ns)
        .bind(&event.sensor_id)
        .bind(event.target_id as i64)
        .bind(event.peak_magnitude)
        .bind(event.duration_ms)
        .bind(event.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_correlation(&self, correlation: &Correlation) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO correlations (shot_id, impact_id, latency_ms, residual_sigma, quality)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&correlation.shot_id)
        .bind(&correlation.impact_id)
        .bind(correlation.latency_ms)
        .bind(correlation.residual_sigma)
        .bind(quality_str(correlation.quality))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// No-op unless `verbose_sample_capture` is set (spec §6 env toggle).
    pub async fn insert_raw_sample(&self, sensor_id: &str, sample: &RawSample) -> Result<(), PersistenceError> {
        if !self.verbose_sample_capture {
            return Ok(());
        }
        sqlx::query(
            r#"INSERT INTO bt50_samples (sensor_id, ts_mono_ns, ts_wall_ms, vx_mg, vy_mg, vz_mg, magnitude_mg)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(sensor_id)
        .bind(sample.ts_mono_ns)
        .bind(sample.ts_wall_ms)
        .bind(sample.vx_mg)
        .bind(sample.vy_mg)
        .bind(sample.vz_mg)
        .bind(sample.magnitude_mg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_device_status(&self, status: &DeviceStatus) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO device_status (device_id, ts_wall_ms, kind, payload) VALUES (?, ?, ?, ?)"#,
        )
        .bind(&status.device_id)
        .bind(status.ts_wall_ms)
        .bind(format!("{:?}", status.kind))
        .bind(status.payload.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The sole read surface over the merged chronological log (spec §4.8).
    pub async fn shot_log(&self) -> Result<Vec<ShotLogRow>, PersistenceError> {
        let rows = sqlx::query("SELECT * FROM shot_log ORDER BY ts_mono_ns ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| ShotLogRow {
                ts_mono_ns: r.get("ts_mono_ns"),
                ts_wall_ms: r.get("ts_wall_ms"),
                kind: shot_log_kind_from_str(r.get::<String, _>("kind").as_str()),
                device_id: r.get("device_id"),
                sensor_id: r.get("sensor_id"),
                target_id: r.get::<Option<i64>, _>("target_id").map(|v| v as u32),
                shot_number: r.get::<Option<i64>, _>("shot_number").map(|v| v as u32),
                split_cs: r.get::<Option<i64>, _>("split_cs").map(|v| v as u32),
                total_cs: r.get::<Option<i64>, _>("total_cs").map(|v| v as u32),
                peak_magnitude: r.get("peak_magnitude"),
                duration_ms: r.get("duration_ms"),
                confidence: r.get("confidence"),
                latency_ms: r.get("latency_ms"),
                residual_sigma: r.get("residual_sigma"),
                quality: r
                    .get::<Option<String>, _>("quality")
                    .map(|s| quality_from_str(&s)),
            })
            .collect())
    }
}

fn timer_kind_str(kind: TimerEventKind) -> &'static str {
    match kind {
        TimerEventKind::Start => "START",
        TimerEventKind::Shot => "SHOT",
        TimerEventKind::Stop => "STOP",
    }
}

fn quality_str(quality: CorrelationQuality) -> &'static str {
    match quality {
        CorrelationQuality::Excellent => "excellent",
        CorrelationQuality::Good => "good",
        CorrelationQuality::Fair => "fair",
        CorrelationQuality::Poor => "poor",
        CorrelationQuality::Unmatched => "unmatched",
    }
}

fn quality_from_str(s: &str) -> CorrelationQuality {
    match s {
        "excellent" => CorrelationQuality::Excellent,
        "good" => CorrelationQuality::Good,
        "fair" => CorrelationQuality::Fair,
        "poor" => CorrelationQuality::Poor,
        _ => CorrelationQuality::Unmatched,
    }
}

fn shot_log_kind_from_str(s: &str) -> ShotLogKind {
    match s {
        "shot" => ShotLogKind::Shot,
        "impact" => ShotLogKind::Impact,
        _ => ShotLogKind::TimerControl,
    }
}

/// Retry a fallible write with exponential-ish backoff up to a bounded
/// budget (spec §7 "Persistence write failure"). Returns `Err` once the
/// budget is exhausted so the caller can fall back to the NDJSON log and
/// count `persistence_degraded`.
pub async fn write_with_retry<F, Fut>(budget: Duration, mut attempt: F) -> Result<(), PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), PersistenceError>>,
{
    let deadline = tokio::time::Instant::now() + budget;
    let mut backoff = Duration::from_millis(100);
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(err) if tokio::time::Instant::now() < deadline => {
                warn!(error = %err, "persistence write failed, retrying");
                tokio::time::sleep(backoff.min(deadline - tokio::time::Instant::now())).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
            Err(err) => {
                warn!(error = %err, budget_ms = budget.as_millis() as u64, "persistence write budget exhausted");
                return Err(PersistenceError::WriteBudgetExhausted(budget));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::{CorrelationQuality, TimerEventKind};

    async fn capture_store() -> CaptureStore {
        CaptureStore::connect(":memory:", true).await.unwrap()
    }

    fn timer_event() -> TimerEvent {
        TimerEvent {
            device_id: "timer-1".into(),
            ts_mono_ns: 1_000_000_000,
            ts_wall_ms: 1000,
            kind: TimerEventKind::Shot,
            shot_number: Some(1),
            split_cs: Some(100),
            total_cs: None,
            shot_id: Some("shot-1".into()),
            raw_hex: "0103".into(),
        }
    }

    fn impact_event() -> ImpactEvent {
        ImpactEvent {
            impact_id: "impact-1".into(),
            sensor_id: "sensor-1".into(),
            target_id: 1,
            ts_onset_mono_ns: 1_500_000_000,
            ts_onset_wall_ms: 1500,
            ts_peak_mono_ns: 1_520_000_000,
            peak_magnitude: 42.0,
            duration_ms: 20.0,
            confidence: 0.9,
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn shot_log_merges_timer_event_and_impact_chronologically() {
        let store = capture_store().await;
        store.insert_timer_event("shot-1", &timer_event()).await.unwrap();
        store.insert_impact(&impact_event()).await.unwrap();
        store
            .insert_correlation(&Correlation {
                shot_id: "shot-1".into(),
                impact_id: "impact-1".into(),
                latency_ms: 520.0,
                residual_sigma: -0.06,
                quality: CorrelationQuality::Excellent,
            })
            .await
            .unwrap();

        let rows = store.shot_log().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, ShotLogKind::Shot);
        assert_eq!(rows[0].quality, Some(CorrelationQuality::Excellent));
        assert_eq!(rows[1].kind, ShotLogKind::Impact);
        assert_eq!(rows[1].quality, Some(CorrelationQuality::Excellent));
    }

    #[tokio::test]
    async fn verbose_capture_disabled_skips_raw_sample_writes() {
        let store = CaptureStore::connect(":memory:", false).await.unwrap();
        let sample = RawSample {
            ts_mono_ns: 0,
            ts_wall_ms: 0,
            vx_mg: 1.0,
            vy_mg: 1.0,
            vz_mg: 1.0,
            magnitude_mg: 1.7,
        };
        store.insert_raw_sample("sensor-1", &sample).await.unwrap();
        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM bt50_samples")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn write_with_retry_gives_up_after_budget_exhausted() {
        let budget = Duration::from_millis(150);
        let result = write_with_retry(budget, || async {
            Err(PersistenceError::Sqlx(sqlx::Error::PoolClosed))
        })
        .await;
        assert!(matches!(result, Err(PersistenceError::WriteBudgetExhausted(b)) if b == budget));
    }
}
