//! In-process fan-out of [`BusEvent`]s to persistence, the NDJSON logger,
//! and any external subscriber (spec §4.7).
//!
//! `Timer`, `Impact`, `Correlation`, and `TimingUpdate` publish onto a
//! per-subscriber bounded `mpsc` channel registered at `subscribe()` time.
//! `send` on a bounded `mpsc` backpressures the producer once a subscriber's
//! queue is full instead of dropping, which is what "impacts, correlations,
//! and timer events are never dropped" (spec §4.7) actually requires — a
//! `broadcast` channel can't give that guarantee, since a lagging subscriber
//! there just misses events instead of slowing the producer down.
//!
//! `RawSample` and `Status` are the droppable lane: bounded single-producer
//! queues where the oldest entry is evicted to make room for the newest
//! instead of rejecting the newest, so a slow consumer sees a moving window
//! of recent samples rather than a stale snapshot from the moment it fell
//! behind. [`EventBus::run_forwarders`] drains whatever survives that lane
//! onto the durable subscribers so `subscribe()` callers see every event
//! kind, not just the never-dropped ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bridge_types::{BusEvent, Correlation, DeviceStatus, ImpactEvent, RawSample, TimerEvent, TimingModel};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct BusMetrics {
    pub dropped_raw_samples: u64,
    pub dropped_status: u64,
}

/// Single producer-per-source, multi-subscriber event fan-out.
pub struct EventBus {
    durable_subs: Mutex<Vec<mpsc::Sender<BusEvent>>>,
    durable_capacity: usize,
    raw_sample_tx: mpsc::Sender<RawSample>,
    raw_sample_rx: AsyncMutex<mpsc::Receiver<RawSample>>,
    status_tx: mpsc::Sender<DeviceStatus>,
    status_rx: AsyncMutex<mpsc::Receiver<DeviceStatus>>,
    dropped_raw_samples: AtomicU64,
    dropped_status: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (raw_sample_tx, raw_sample_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(capacity);
        Self {
            durable_subs: Mutex::new(Vec::new()),
            durable_capacity: capacity,
            raw_sample_tx,
            raw_sample_rx: AsyncMutex::new(raw_sample_rx),
            status_tx,
            status_rx: AsyncMutex::new(status_rx),
            dropped_raw_samples: AtomicU64::new(0),
            dropped_status: AtomicU64::new(0),
        }
    }

    /// Registers a new durable subscriber. Must be called before any
    /// producer starts publishing — a subscriber only sees events published
    /// after it subscribes, there's no backlog replay.
    pub fn subscribe(&self) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(self.durable_capacity);
        self.durable_subs.lock().unwrap().push(tx);
        rx
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            dropped_raw_samples: self.dropped_raw_samples.load(Ordering::Relaxed),
            dropped_status: self.dropped_status.load(Ordering::Relaxed),
        }
    }

    pub async fn publish_timer(&self, event: TimerEvent) {
        self.publish_durable(BusEvent::Timer(event)).await;
    }

    pub async fn publish_impact(&self, event: ImpactEvent) {
        self.publish_durable(BusEvent::Impact(event)).await;
    }

    pub async fn publish_correlation(&self, event: Correlation) {
        self.publish_durable(BusEvent::Correlation(event)).await;
    }

    pub async fn publish_timing_update(&self, event: TimingModel) {
        self.publish_durable(BusEvent::TimingUpdate(event)).await;
    }

    /// Fans `event` out to every registered subscriber, awaiting each send.
    /// A full subscriber queue blocks this call (and so blocks whichever
    /// producer task called it) until that subscriber drains — the
    /// producer-side backpressure spec §4.7 requires for these event kinds.
    async fn publish_durable(&self, event: BusEvent) {
        let subs: Vec<mpsc::Sender<BusEvent>> = self.durable_subs.lock().unwrap().clone();
        if subs.is_empty() {
            warn!("event bus has no subscribers, event dropped");
            return;
        }
        for sub in &subs {
            let _ = sub.send(event.clone()).await;
        }
        self.durable_subs.lock().unwrap().retain(|s| !s.is_closed());
    }

    /// Drop-oldest-first lane for raw samples (spec §4.7 backpressure
    /// policy): a full queue evicts its oldest buffered sample to make room
    /// for the new one, rather than shedding the new one as a plain
    /// `try_send` would.
    pub async fn publish_raw_sample(&self, sample: RawSample) {
        self.publish_dropping_oldest(&self.raw_sample_tx, &self.raw_sample_rx, sample, &self.dropped_raw_samples)
            .await;
    }

    pub async fn publish_status(&self, status: DeviceStatus) {
        self.publish_dropping_oldest(&self.status_tx, &self.status_rx, status, &self.dropped_status)
            .await;
    }

    async fn publish_dropping_oldest<T>(
        &self,
        tx: &mpsc::Sender<T>,
        rx: &AsyncMutex<mpsc::Receiver<T>>,
        value: T,
        dropped: &AtomicU64,
    ) {
        match tx.try_send(value) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(value)) => {
                {
                    let mut rx = rx.lock().await;
                    let _ = rx.try_recv();
                }
                dropped.fetch_add(1, Ordering::Relaxed);
                if tx.try_send(value).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Re-publish a sample that survived the drop-oldest-first lane onto the
    /// durable subscribers. Called only by [`EventBus::run_forwarders`].
    async fn republish_raw_sample(&self, sample: RawSample) {
        self.publish_durable(BusEvent::RawSample(sample)).await;
    }

    async fn republish_status(&self, status: DeviceStatus) {
        self.publish_durable(BusEvent::Status(status)).await;
    }

    /// Drains the raw-sample and status queues and forwards survivors onto
    /// the durable subscribers. Run as its own task by the coordinator for
    /// the lifetime of the bridge process.
    pub async fn run_forwarders(&self) {
        loop {
            tokio::select! {
                maybe_sample = async { self.raw_sample_rx.lock().await.recv().await } => {
                    match maybe_sample {
                        Some(sample) => self.republish_raw_sample(sample).await,
                        None => return,
                    }
                }
                maybe_status = async { self.status_rx.lock().await.recv().await } => {
                    match maybe_status {
                        Some(status) => self.republish_status(status).await,
                        None => return,
                    }
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::{DeviceStatusKind, TimerEventKind};

    fn timer_event(n: u32) -> TimerEvent {
        TimerEvent {
            device_id: "timer-1".into(),
            ts_mono_ns: n as i64,
            ts_wall_ms: 0,
            kind: TimerEventKind::Shot,
            shot_number: Some(n),
            split_cs: None,
            total_cs: None,
            shot_id: Some(format!("shot-{n}")),
            raw_hex: String::new(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_timer_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish_timer(timer_event(1)).await;
        bus.publish_timer(timer_event(2)).await;

        match rx.recv().await.unwrap() {
            BusEvent::Timer(e) => assert_eq!(e.shot_number, Some(1)),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            BusEvent::Timer(e) => assert_eq!(e.shot_number, Some(2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_durable_blocks_the_producer_until_a_lagging_subscriber_drains() {
        let bus = std::sync::Arc::new(EventBus::new(1));
        let mut rx = bus.subscribe();

        // First publish fills the lone subscriber's one-slot queue.
        bus.publish_timer(timer_event(1)).await;

        // Second publish must block until the subscriber drains — if it
        // returned immediately (broadcast semantics), this task would
        // complete before the drain below ever runs.
        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish_timer(timer_event(2)).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "publish_durable did not backpressure on a full subscriber queue");

        match rx.recv().await.unwrap() {
            BusEvent::Timer(e) => assert_eq!(e.shot_number, Some(1)),
            other => panic!("unexpected event {other:?}"),
        }
        producer.await.unwrap();

        match rx.recv().await.unwrap() {
            BusEvent::Timer(e) => assert_eq!(e.shot_number, Some(2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn raw_sample_overflow_evicts_the_oldest_instead_of_the_newest() {
        let bus = EventBus::new(1);
        let sample = |n: i64| RawSample {
            ts_mono_ns: n,
            ts_wall_ms: 0,
            vx_mg: 0.0,
            vy_mg: 0.0,
            vz_mg: 0.0,
            magnitude_mg: 0.0,
        };

        bus.publish_raw_sample(sample(1)).await;
        bus.publish_raw_sample(sample(2)).await;
        assert_eq!(bus.metrics().dropped_raw_samples, 1);

        let mut rx = bus.raw_sample_rx.lock().await;
        let survivor = rx.try_recv().unwrap();
        assert_eq!(survivor.ts_mono_ns, 2, "oldest sample should have been evicted, not the newest");
    }

    #[tokio::test]
    async fn status_overflow_increments_dropped_counter() {
        let bus = EventBus::new(1);
        let status = DeviceStatus {
            device_id: "sensor-1".into(),
            ts_wall_ms: 0,
            kind: DeviceStatusKind::Connected,
            payload: serde_json::Value::Null,
        };
        bus.publish_status(status.clone()).await;
        bus.publish_status(status).await;
        assert_eq!(bus.metrics().dropped_status, 1);
    }

    #[tokio::test]
    async fn run_forwarders_makes_status_and_raw_samples_visible_to_subscribers() {
        let bus = std::sync::Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let forwarder = tokio::spawn({
            let bus = bus.clone();
            async move { bus.run_forwarders().await }
        });

        bus.publish_status(DeviceStatus {
            device_id: "sensor-1".into(),
            ts_wall_ms: 0,
            kind: DeviceStatusKind::Connected,
            payload: serde_json::Value::Null,
        })
        .await;

        match rx.recv().await.unwrap() {
            BusEvent::Status(s) => assert_eq!(s.device_id, "sensor-1"),
            other => panic!("unexpected event {other:?}"),
        }
        forwarder.abort();
    }
}
