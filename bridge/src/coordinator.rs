//! Bridge coordinator (spec §4.9): wires every other component from
//! [`Config`], drives startup calibration, arms detectors, and owns
//! orderly shutdown. One task per concurrent concern, shared state behind
//! a lock only where two tasks genuinely touch it, cooperative shutdown
//! via a `watch` channel — state kept in a map keyed by sensor id rather
//! than one global struct, so sensors stay independent of each other.
//!
//! No process-wide singletons: every component below is constructed here
//! and handed its dependencies explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_types::{
    BridgeAssignment, BusEvent, Correlation, DeviceStatus, DeviceStatusKind, ImpactEvent, RawSample,
    SensorBaseline, TimerEvent, TimerEventKind, TimerFrame, TimingModel,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calibrator::{CalibrationOutcome, Calibrator, CalibratorConfig};
use crate::config::Config;
use crate::correlator::{Correlator, CorrelatorConfig, CorrelationResult};
use crate::detector::{Detector, DetectorConfig};
use crate::error::PersistenceError;
use crate::event_bus::EventBus;
use crate::ndjson_logger::{NdjsonLogger, NdjsonRecordType};
use crate::persistence::{write_with_retry, CaptureStore, ConfigStore};
use crate::timing_calibrator::{TimingCalibrator, TimingCalibratorConfig};
use crate::transport::ble::{BleClient, BleClientConfig};
use crate::transport::{sensor_client, timer_client};

/// Per-sensor runtime state the coordinator owns: calibration progress, the
/// armed detector (present only once calibration completes), and the clock
/// used to detect a calibration timeout. Keyed by sensor MAC (spec §9
/// "All per-sensor state ... is stored in a map keyed by sensor id").
struct SensorState {
    target_id: u32,
    calibrator: Calibrator,
    detector: Option<Detector>,
    calibration_started_at: TokioInstant,
}

/// Monotonic clock abstraction so the hot path never calls `Instant::now()`
/// directly (spec §4.6 determinism note) — tests can substitute a fake.
pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> i64;
}

pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl MonotonicClock for SystemClock {
    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

pub struct Coordinator {
    config: Config,
    assignment: BridgeAssignment,
    bus: Arc<EventBus>,
    config_store: Arc<ConfigStore>,
    capture_store: Arc<CaptureStore>,
    ndjson: Arc<NdjsonLogger>,
    clock: Arc<dyn MonotonicClock>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let assignment = config.assignment();
        let config_store = ConfigStore::connect(&config.persistence.config_db_path).await?;
        let capture_store = CaptureStore::connect(
            &config.persistence.capture_db_path,
            config.persistence.verbose_sample_capture,
        )
        .await?;
        let ndjson = NdjsonLogger::open(&config.persistence.ndjson_path, config.persistence.ndjson_max_bytes).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            assignment,
            bus: Arc::new(EventBus::default()),
            config_store: Arc::new(config_store),
            capture_store: Arc::new(capture_store),
            ndjson: Arc::new(ndjson),
            clock: Arc::new(SystemClock::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Runs until `stop()` is called. Spawns one task per BLE client, one
    /// per subscriber loop (persistence, NDJSON), and one for the
    /// correlator/timing-calibrator pipeline, matching the single-threaded
    /// cooperative model of spec §5: nothing here shares mutable state
    /// across task boundaries except via bus channels.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let timing_checkpoint = self
            .config_store
            .load_timing_checkpoint(&self.assignment.bridge_id)
            .await?;

        let timing_config = TimingCalibratorConfig {
            prior_mean_ms: self.config.correlation.prior_mean_ms,
            prior_sigma_ms: self.config.correlation.prior_sigma_ms,
            n_min: self.config.correlation.n_min,
        };
        let timing_calibrator = Arc::new(Mutex::new(match timing_checkpoint {
            Some(checkpoint) => TimingCalibrator::from_checkpoint(timing_config, checkpoint),
            None => TimingCalibrator::new(timing_config),
        }));

        let correlator = Arc::new(Mutex::new(Correlator::new(CorrelatorConfig {
            window_sigma: self.config.correlation.window_sigma,
            late_arrival_hold_ms: self.config.correlation.late_arrival_hold_ms,
        })));

        let sensors: HashMap<String, Arc<Mutex<SensorState>>> = self
            .assignment
            .sensors
            .iter()
            .map(|s| {
                let state = SensorState {
                    target_id: s.target_id,
                    calibrator: Calibrator::new(
                        s.mac.clone(),
                        CalibratorConfig {
                            target_samples: self.config.calibration.target_samples,
                            timeout_s: self.config.calibration.timeout_s,
                        },
                    ),
                    detector: None,
                    calibration_started_at: TokioInstant::now(),
                };
                (s.mac.clone(), Arc::new(Mutex::new(state)))
            })
            .collect();
        let sensors = Arc::new(RwLock::new(sensors));

        for sensor in &self.assignment.sensors {
            self.bus
                .publish_status(DeviceStatus {
                    device_id: sensor.mac.clone(),
                    ts_wall_ms: chrono::Utc::now().timestamp_millis(),
                    kind: DeviceStatusKind::CalibrationStarted,
                    payload: serde_json::Value::Null,
                })
                .await;
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn({
            let bus = self.bus.clone();
            async move { bus.run_forwarders().await }
        }));
        tasks.push(tokio::spawn(self.clone().run_persistence_subscriber()));
        tasks.push(tokio::spawn(self.clone().run_ndjson_subscriber()));
        tasks.push(tokio::spawn(self.clone().run_correlator_pipeline(
            correlator.clone(),
            timing_calibrator.clone(),
        )));
        tasks.push(tokio::spawn(self.clone().run_timer_client()));

        for sensor in self.assignment.sensors.clone() {
            let sensors = sensors.clone();
            tasks.push(tokio::spawn(self.clone().run_sensor_client(sensor, sensors)));
        }

        // Block until asked to stop; each spawned task watches the same
        // `shutdown_rx` and drains cooperatively within spec §5's 2s budget.
        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow() {
            shutdown_rx.changed().await.ok();
        }

        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }

        let final_results = correlator.lock().await.finalize_all();
        self.apply_correlation_results(final_results, &timing_calibrator).await;

        info!(bridge_id = %self.assignment.bridge_id, "coordinator stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn ble_config(&self, device_id: String, service_uuid: &str, notify_uuid: &str) -> BleClientConfig {
        BleClientConfig {
            device_id,
            service_uuid: Uuid::parse_str(service_uuid).unwrap_or_else(|_| Uuid::nil()),
            notify_uuid: Uuid::parse_str(notify_uuid).unwrap_or_else(|_| Uuid::nil()),
            connect_deadline: Duration::from_secs(self.config.reconnect.connect_deadline_s),
            backoff_initial: Duration::from_millis(self.config.reconnect.backoff_initial_ms),
            backoff_cap: Duration::from_millis(self.config.reconnect.backoff_cap_ms),
        }
    }

    async fn run_timer_client(self: Arc<Self>) {
        let ble_config = self.ble_config(
            self.assignment.timer.mac.clone(),
            &self.config.timer_ble.service_uuid,
            &self.config.timer_ble.notify_characteristic_uuid,
        );
        let (status_tx, mut status_rx) = tokio::sync::mpsc::channel(64);
        let client = BleClient::new(ble_config, status_tx);
        let (parsed_tx, mut parsed_rx) = tokio::sync::mpsc::channel(256);
        let shutdown = self.shutdown_rx.clone();

        let bus = self.bus.clone();
        let status_forward = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                bus.publish_status(status).await;
            }
        });

        let run_fut = timer_client::run(client, parsed_tx, shutdown);
        tokio::pin!(run_fut);

        loop {
            tokio::select! {
                _ = &mut run_fut => break,
                Some(frame) = parsed_rx.recv() => {
                    self.handle_timer_frame(frame).await;
                }
            }
        }
        status_forward.abort();
    }

    async fn handle_timer_frame(&self, frame: TimerFrame) {
        let ts_mono_ns = self.clock.now_ns();
        let ts_wall_ms = chrono::Utc::now().timestamp_millis();
        let raw_hex = String::new();

        let event = match frame {
            TimerFrame::Start { string_number } => TimerEvent {
                device_id: self.assignment.timer.mac.clone(),
                ts_mono_ns,
                ts_wall_ms,
                kind: TimerEventKind::Start,
                shot_number: Some(string_number as u32),
                split_cs: None,
                total_cs: None,
                shot_id: None,
                raw_hex,
            },
            TimerFrame::Shot {
                current_time_cs,
                split_time_cs,
                first_shot_time_cs: _,
                opaque: _,
            } => TimerEvent {
                device_id: self.assignment.timer.mac.clone(),
                ts_mono_ns,
                ts_wall_ms,
                kind: TimerEventKind::Shot,
                shot_number: None,
                split_cs: Some(split_time_cs),
                total_cs: Some(current_time_cs),
                shot_id: Some(Uuid::new_v4().to_string()),
                raw_hex,
            },
            TimerFrame::Stop {
                string_number,
                total_time_cs,
            } => TimerEvent {
                device_id: self.assignment.timer.mac.clone(),
                ts_mono_ns,
                ts_wall_ms,
                kind: TimerEventKind::Stop,
                shot_number: Some(string_number as u32),
                split_cs: None,
                total_cs: Some(total_time_cs),
                shot_id: None,
                raw_hex,
            },
            // Batch/screen-data/unknown frames carry no timer-event
            // semantics of their own (spec §4.1); they're visible only in
            // the NDJSON debug stream via raw BLE logging upstream.
            _ => return,
        };

        self.bus.publish_timer(event).await;
    }

    async fn run_sensor_client(
        self: Arc<Self>,
        assignment: bridge_types::SensorAssignment,
        sensors: Arc<RwLock<HashMap<String, Arc<Mutex<SensorState>>>>>,
    ) {
        let ble_config = self.ble_config(
            assignment.mac.clone(),
            &self.config.sensor_ble.service_uuid,
            &self.config.sensor_ble.notify_characteristic_uuid,
        );
        let (status_tx, mut status_rx) = tokio::sync::mpsc::channel(64);
        let client = BleClient::new(ble_config, status_tx);
        let (parsed_tx, mut parsed_rx) = tokio::sync::mpsc::channel(256);
        let shutdown = self.shutdown_rx.clone();

        let bus = self.bus.clone();
        let recalibrate_on_reconnect = self.config.calibration.recalibrate_on_reconnect;
        let status_sensors = sensors.clone();
        let status_mac = assignment.mac.clone();
        let mut seen_connected_once = false;
        let status_forward = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                if status.kind == DeviceStatusKind::Connected {
                    // The first Connected is initial bring-up, not a reconnect;
                    // only a later one means the sensor dropped and came back.
                    if seen_connected_once && recalibrate_on_reconnect {
                        if let Some(state) = status_sensors.read().await.get(&status_mac) {
                            let mut state = state.lock().await;
                            state.calibrator.reset();
                            state.detector = None;
                            state.calibration_started_at = TokioInstant::now();
                        }
                        bus.publish_status(DeviceStatus {
                            device_id: status_mac.clone(),
                            ts_wall_ms: status.ts_wall_ms,
                            kind: DeviceStatusKind::CalibrationStarted,
                            payload: serde_json::Value::Null,
                        })
                        .await;
                    }
                    seen_connected_once = true;
                }
                bus.publish_status(status).await;
            }
        });

        let run_fut = sensor_client::run(client, parsed_tx, shutdown);
        tokio::pin!(run_fut);

        // Fires independently of sample arrival so a sensor that never sends
        // a single frame (dead radio, wrong MAC) still has its calibration
        // timeout enforced — `handle_sensor_frame` alone can't see that case,
        // since it only runs when a frame actually arrives.
        let mac = assignment.mac.clone();
        let mut watchdog = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = &mut run_fut => break,
                maybe_frame = parsed_rx.recv() => {
                    match maybe_frame {
                        Some(Some(frame)) => self.handle_sensor_frame(&mac, frame, &sensors).await,
                        Some(None) => {
                            if let Some(state) = sensors.read().await.get(&mac) {
                                state.lock().await.detector.as_mut().map(Detector::record_dropped_frame);
                            }
                        }
                        None => break,
                    }
                }
                _ = watchdog.tick() => {
                    self.check_calibration_timeout(&mac, &sensors).await;
                }
            }
        }
        status_forward.abort();
    }

    async fn handle_sensor_frame(
        &self,
        mac: &str,
        frame: bridge_types::SensorFrame,
        sensors: &Arc<RwLock<HashMap<String, Arc<Mutex<SensorState>>>>>,
    ) {
        let ts_mono_ns = self.clock.now_ns();
        let ts_wall_ms = chrono::Utc::now().timestamp_millis();

        let Some(state) = sensors.read().await.get(mac).cloned() else {
            return;
        };
        let mut state = state.lock().await;

        if self.config.persistence.verbose_sample_capture {
            self.bus
                .publish_raw_sample(RawSample {
                    ts_mono_ns,
                    ts_wall_ms,
                    vx_mg: frame.vx_mg as f64,
                    vy_mg: frame.vy_mg as f64,
                    vz_mg: frame.vz_mg as f64,
                    magnitude_mg: frame.magnitude_mg,
                })
                .await;
        }

        if let Some(detector) = state.detector.as_mut() {
            // calibration already complete: samples feed the detector only.
            if let Some(impact) = detector.push(ts_mono_ns, frame.magnitude_mg) {
                let event = ImpactEvent {
                    impact_id: Uuid::new_v4().to_string(),
                    sensor_id: mac.to_string(),
                    target_id: state.target_id,
                    ts_onset_mono_ns: impact.onset_ts_mono_ns,
                    ts_onset_wall_ms: ts_wall_ms
                        - ((ts_mono_ns - impact.onset_ts_mono_ns) / 1_000_000),
                    ts_peak_mono_ns: impact.peak_ts_mono_ns,
                    peak_magnitude: impact.peak_magnitude,
                    duration_ms: impact.duration_ms,
                    confidence: impact.confidence,
                    correlation_id: None,
                };
                self.bus.publish_impact(event).await;
            }
            return;
        }

        // Still calibrating: samples are consumed by the calibrator only
        // (spec §4.3: "detector must not run until calibration completes").
        // The timeout itself is enforced by the watchdog tick in
        // `run_sensor_client`, not here — this arm only needs to react to
        // the calibrator completing or going degenerate as samples land.
        match state.calibrator.push(frame) {
            CalibrationOutcome::Pending => {}
            CalibrationOutcome::Complete(baseline) => {
                self.arm_detector(mac, &baseline, &mut state, DeviceStatusKind::CalibrationComplete)
                    .await;
            }
            CalibrationOutcome::TimedOut(baseline) => {
                self.arm_detector(mac, &baseline, &mut state, DeviceStatusKind::CalibrationTimedOut)
                    .await;
            }
            CalibrationOutcome::Degenerate => {
                self.mark_calibration_degenerate(mac).await;
            }
        }
    }

    /// Runs on every watchdog tick, independent of whether this sensor has
    /// produced any samples at all. A sensor stuck at zero samples for the
    /// whole `timeout_s` window never feeds `handle_sensor_frame`, so without
    /// this the calibration phase would simply hang forever.
    async fn check_calibration_timeout(
        &self,
        mac: &str,
        sensors: &Arc<RwLock<HashMap<String, Arc<Mutex<SensorState>>>>>,
    ) {
        let Some(state) = sensors.read().await.get(mac).cloned() else {
            return;
        };
        let mut state = state.lock().await;
        if state.detector.is_some() || state.calibrator.is_complete() {
            return;
        }
        let elapsed = state.calibration_started_at.elapsed();
        if elapsed < Duration::from_secs(state.calibrator.timeout_s()) {
            return;
        }
        if let CalibrationOutcome::TimedOut(baseline) = state.calibrator.finish_on_timeout() {
            self.arm_detector(mac, &baseline, &mut state, DeviceStatusKind::CalibrationTimedOut)
                .await;
        }
    }

    async fn arm_detector(
        &self,
        mac: &str,
        baseline: &SensorBaseline,
        state: &mut SensorState,
        status_kind: DeviceStatusKind,
    ) {
        state.detector = Some(Detector::new(
            DetectorConfig {
                peak_threshold_mg: self.config.detector.peak_threshold_mg,
                onset_threshold_mg: self.config.detector.onset_threshold_mg,
                lookback_samples: self.config.detector.lookback_samples,
                rest_samples: self.config.detector.rest_samples,
                dead_time_ms: self.config.detector.dead_time_ms,
            },
            baseline.noise_sigma_mg,
        ));
        self.bus
            .publish_status(DeviceStatus {
                device_id: mac.to_string(),
                ts_wall_ms: chrono::Utc::now().timestamp_millis(),
                kind: status_kind,
                payload: serde_json::json!({
                    "sample_count": baseline.sample_count,
                    "noise_sigma_mg": baseline.noise_sigma_mg,
                }),
            })
            .await;
    }

    /// Spec §7: a degenerate calibration baseline leaves the detector
    /// disarmed — arming it would treat every sample as a peak. An admin
    /// must call `recalibrate(sensor_id)` explicitly; this only reports
    /// the status, it does not reset the calibrator itself.
    async fn mark_calibration_degenerate(&self, mac: &str) {
        self.bus
            .publish_status(DeviceStatus {
                device_id: mac.to_string(),
                ts_wall_ms: chrono::Utc::now().timestamp_millis(),
                kind: DeviceStatusKind::CalibrationDegenerate,
                payload: serde_json::Value::Null,
            })
            .await;
    }

    /// Subscribes to the bus, feeds timer/impact events into the correlator
    /// and timing calibrator, and periodically closes acceptance windows
    /// (spec §4.6 "window closure is driven by time, not by event arrival").
    async fn run_correlator_pipeline(
        self: Arc<Self>,
        correlator: Arc<Mutex<Correlator>>,
        timing_calibrator: Arc<Mutex<TimingCalibrator>>,
    ) {
        let mut rx = self.bus.subscribe();
        let mut watchdog = tokio::time::interval(Duration::from_millis(100));
        let mut shutdown = self.shutdown_rx.clone();
        let mut accepted_since_checkpoint = 0u32;
        let mut last_checkpoint_at = TokioInstant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = watchdog.tick() => {
                    let (mu, sigma) = timing_calibrator.lock().await.current_estimate();
                    let now_ns = self.clock.now_ns();
                    let results = correlator.lock().await.advance_to(now_ns, mu, sigma);
                    accepted_since_checkpoint += self
                        .apply_correlation_results(results, &timing_calibrator)
                        .await;
                    // Spec §4.8: checkpoint every 50 accepted correlations OR
                    // every 10s, whichever comes first — the count alone
                    // leaves a slow stage (fewer than 50 correlations in a
                    // session) never checkpointed at all.
                    if accepted_since_checkpoint >= 50 || last_checkpoint_at.elapsed() >= Duration::from_secs(10) {
                        self.checkpoint_timing_model(&timing_calibrator).await;
                        accepted_since_checkpoint = 0;
                        last_checkpoint_at = TokioInstant::now();
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(BusEvent::Timer(timer_event)) if timer_event.kind == TimerEventKind::Shot => {
                            if let Some(shot_id) = timer_event.shot_id.clone() {
                                correlator.lock().await.on_shot(shot_id, timer_event.ts_mono_ns);
                            }
                        }
                        Some(BusEvent::Impact(impact)) => {
                            let (mu, sigma) = timing_calibrator.lock().await.current_estimate();
                            let results = correlator
                                .lock()
                                .await
                                .on_impact(impact.impact_id.clone(), impact.ts_onset_mono_ns, mu, sigma);
                            self.apply_correlation_results(results, &timing_calibrator).await;
                        }
                        Some(_) => {}
                        None => return,
                    }
                }
            }
        }
    }

    /// Publishes each correlation result and returns the number of freshly
    /// accepted correlations (used to drive the checkpoint cadence).
    async fn apply_correlation_results(
        &self,
        results: Vec<CorrelationResult>,
        timing_calibrator: &Arc<Mutex<TimingCalibrator>>,
    ) -> u32 {
        let mut accepted = 0;
        for result in results {
            match result {
                CorrelationResult::Correlated(correlation) => {
                    timing_calibrator
                        .lock()
                        .await
                        .record(correlation.latency_ms, chrono::Utc::now().timestamp_millis());
                    self.bus.publish_correlation(correlation).await;
                    accepted += 1;
                }
                CorrelationResult::ImpactOnly { impact_id } => {
                    debug!(impact_id, "impact unmatched within acceptance window");
                }
                CorrelationResult::TimerOnly { shot_id } => {
                    debug!(shot_id, "shot orphaned, no impact within acceptance window");
                }
            }
        }
        accepted
    }

    async fn checkpoint_timing_model(&self, timing_calibrator: &Arc<Mutex<TimingCalibrator>>) {
        let checkpoint: TimingModel = timing_calibrator.lock().await.checkpoint();
        if let Err(err) = self
            .config_store
            .save_timing_checkpoint(&self.assignment.bridge_id, &checkpoint)
            .await
        {
            error!(error = %err, "failed to checkpoint timing model");
        }
        self.bus.publish_timing_update(checkpoint).await;
    }

    /// One subscriber loop per durable concern. Persistence and the NDJSON
    /// logger are peers on the same bus subscription, each responsible for
    /// its own durability budget, rather than one waiting on the other's ack.
    async fn run_persistence_subscriber(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let budget = Duration::from_millis(self.config.persistence.write_retry_budget_ms);
        loop {
            match rx.recv().await {
                Some(event) => self.persist_event(event, budget).await,
                None => return,
            }
        }
    }

    async fn persist_event(&self, event: BusEvent, budget: Duration) {
        let store = self.capture_store.clone();
        let result = match &event {
            BusEvent::Timer(timer_event) => {
                let id = timer_event
                    .shot_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let event = timer_event.clone();
                write_with_retry(budget, move || {
                    let store = store.clone();
                    let event = event.clone();
                    let id = id.clone();
                    async move { store.insert_timer_event(&id, &event).await }
                })
                .await
            }
            BusEvent::Impact(impact) => {
                let impact = impact.clone();
                write_with_retry(budget, move || {
                    let store = store.clone();
                    let impact = impact.clone();
                    async move { store.insert_impact(&impact).await }
                })
                .await
            }
            BusEvent::Correlation(correlation) => {
                let correlation = correlation.clone();
                write_with_retry(budget, move || {
                    let store = store.clone();
                    let correlation = correlation.clone();
                    async move { store.insert_correlation(&correlation).await }
                })
                .await
            }
            BusEvent::Status(status) => {
                let status = status.clone();
                write_with_retry(budget, move || {
                    let store = store.clone();
                    let status = status.clone();
                    async move { store.insert_device_status(&status).await }
                })
                .await
            }
            BusEvent::RawSample(_) | BusEvent::TimingUpdate(_) => Ok(()),
        };

        if let Err(err) = result {
            self.handle_persistence_degraded(event, err).await;
        }
    }

    /// Spec §7 "Persistence write failure": on retry-budget exhaustion, the
    /// event is written to the NDJSON log and counted as
    /// `persistence_degraded` instead of being lost.
    async fn handle_persistence_degraded(&self, event: BusEvent, err: PersistenceError) {
        error!(error = %err, "persistence write exhausted retry budget, degrading to NDJSON");
        self.bus
            .publish_status(DeviceStatus {
                device_id: self.assignment.bridge_id.clone(),
                ts_wall_ms: chrono::Utc::now().timestamp_millis(),
                kind: DeviceStatusKind::PersistenceDegraded,
                payload: serde_json::json!({ "error": err.to_string() }),
            })
            .await;
        let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.ndjson
            .log(NdjsonRecordType::Debug, self.clock.now_ns(), "persistence_degraded", data)
            .await;
    }

    async fn run_ndjson_subscriber(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Some(event) => {
                    let (kind, msg) = ndjson_record_kind(&event);
                    let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
                    self.ndjson.log(kind, self.clock.now_ns(), msg, data).await;
                }
                None => return,
            }
        }
    }
}

fn ndjson_record_kind(event: &BusEvent) -> (NdjsonRecordType, &'static str) {
    match event {
        BusEvent::Timer(_) => (NdjsonRecordType::Event, "timer_event"),
        BusEvent::RawSample(_) => (NdjsonRecordType::Debug, "raw_sample"),
        BusEvent::Impact(_) => (NdjsonRecordType::Event, "impact"),
        BusEvent::Correlation(_) => (NdjsonRecordType::Event, "correlation"),
        BusEvent::Status(_) => (NdjsonRecordType::Status, "status"),
        BusEvent::TimingUpdate(_) => (NdjsonRecordType::Debug, "timing_update"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock;
    impl MonotonicClock for FixedClock {
        fn now_ns(&self) -> i64 {
            0
        }
    }

    #[test]
    fn fixed_clock_is_send_sync_for_coordinator_use() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FixedClock>();
    }
}
