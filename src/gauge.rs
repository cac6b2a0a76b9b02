//! 属性值滑动窗口计数 / "How many queries carried value V of attribute A in the
//! last N time units", published to a [`GaugeSink`].
//!
//! A single background task owns the counter map. Producers only touch a
//! bounded channel and never block: a full queue counts the increment as
//! dropped.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::attr::AttributeAssignment;
use crate::config::GaugeSettings;
use crate::counter::SlicedCounter;

/// Synthetic value key carrying the number of live values of an attribute.
pub const VALUES_COUNT: &str = "VALUES_COUNT";

pub trait GaugeSink: Send + Sync {
    fn set(&self, attr: &str, value: &str, count: u64);
    fn remove(&self, attr: &str, value: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GaugeState {
    Stopped = 0,
    Started = 1,
    Stopping = 2,
}

type ValueMap = FxHashMap<String, SlicedCounter>;

/// Everything the background task owns. Parked in `Inner` while stopped.
struct Worker {
    inc_rx: mpsc::Receiver<AttributeAssignment>,
    reg_rx: mpsc::UnboundedReceiver<String>,
    attrs: FxHashMap<String, ValueMap>,
}

struct Inner {
    state: AtomicU8,
    /// Bumped each time a worker run ends; `stop` waits on it.
    exits: watch::Sender<u64>,
    stop_signal: Notify,
    dropped: AtomicU64,
    inc_tx: mpsc::Sender<AttributeAssignment>,
    reg_tx: mpsc::UnboundedSender<String>,
    parked: Mutex<Option<Worker>>,
    window: u64,
    unit_ms: u64,
    tick: Duration,
    epoch: Instant,
    sink: Arc<dyn GaugeSink>,
}

/// Process-wide attribute gauge. Cheap to clone; every clone drives the same task.
#[derive(Clone)]
pub struct AttrGauge {
    inner: Arc<Inner>,
}

impl AttrGauge {
    pub fn new(settings: &GaugeSettings, sink: Arc<dyn GaugeSink>) -> Self {
        let (inc_tx, inc_rx) = mpsc::channel(settings.queue_size.max(1));
        let (reg_tx, reg_rx) = mpsc::unbounded_channel();
        let (exits, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(GaugeState::Stopped as u8),
                exits,
                stop_signal: Notify::new(),
                dropped: AtomicU64::new(0),
                inc_tx,
                reg_tx,
                parked: Mutex::new(Some(Worker {
                    inc_rx,
                    reg_rx,
                    attrs: FxHashMap::default(),
                })),
                window: settings.window,
                unit_ms: settings.unit_ms.max(1),
                tick: settings.tick(),
                epoch: Instant::now(),
                sink,
            }),
        }
    }

    pub fn state(&self) -> GaugeState {
        match self.inner.state.load(Ordering::Acquire) {
            1 => GaugeState::Started,
            2 => GaugeState::Stopping,
            _ => GaugeState::Stopped,
        }
    }

    /// Spawn the background task. Returns false unless the gauge was stopped.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                GaugeState::Stopped as u8,
                GaugeState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let worker = inner.parked.lock().ok().and_then(|mut slot| slot.take());
        let Some(worker) = worker else {
            inner.state.store(GaugeState::Stopped as u8, Ordering::Release);
            inner.exits.send_modify(|n| *n += 1);
            warn!(target = "gauge", "gauge worker missing, not started");
            return false;
        };
        tokio::spawn(run(Arc::clone(inner), worker));
        info!(target = "gauge", window = inner.window, unit_ms = inner.unit_ms, "attribute gauge started");
        true
    }

    /// Ask the background task to exit and wait until it has. A no-op unless started.
    pub async fn stop(&self) {
        let inner = &self.inner;
        // Subscribe before the transition so an exit that follows it is never missed.
        let mut exits = inner.exits.subscribe();
        let seen = *exits.borrow_and_update();
        if inner
            .state
            .compare_exchange(
                GaugeState::Started as u8,
                GaugeState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        inner.stop_signal.notify_one();
        let _ = exits.wait_for(|n| *n > seen).await;
        info!(target = "gauge", "attribute gauge stopped");
    }

    /// Track `attr` even before any value arrives.
    pub fn register(&self, attr: &str) {
        let _ = self.inner.reg_tx.send(attr.to_string());
    }

    /// Count one occurrence of the attribute's value. Never blocks.
    pub fn inc(&self, attr: AttributeAssignment) {
        if self.inner.inc_tx.try_send(attr).is_err() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn now_unit(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 / self.unit_ms
    }
}

async fn run(inner: Arc<Inner>, mut worker: Worker) {
    let mut ticker = interval(inner.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut errors = 0u64;

    while inner.state.load(Ordering::Acquire) == GaugeState::Started as u8 {
        tokio::select! {
            Some(name) = worker.reg_rx.recv() => {
                worker.attrs.entry(name).or_default();
            }
            Some(attr) = worker.inc_rx.recv() => {
                if !worker.inc(attr, inner.now_unit(), inner.window) {
                    errors += 1;
                }
            }
            _ = ticker.tick() => {
                worker.evict_and_publish(inner.now_unit(), inner.sink.as_ref());
                let total = errors + inner.dropped.swap(0, Ordering::Relaxed);
                if total > 0 {
                    warn!(target = "gauge", errors = total, "attribute gauge lost increments");
                }
                errors = 0;
            }
            _ = inner.stop_signal.notified() => {}
        }
    }

    debug!(target = "gauge", attrs = worker.attrs.len(), "gauge worker exiting");
    if let Ok(mut slot) = inner.parked.lock() {
        *slot = Some(worker);
    }
    inner.state.store(GaugeState::Stopped as u8, Ordering::Release);
    inner.exits.send_modify(|n| *n += 1);
}

impl Worker {
    fn inc(&mut self, attr: AttributeAssignment, now: u64, window: u64) -> bool {
        let values = self.attrs.entry(attr.id).or_default();
        values
            .entry(attr.value.to_string())
            .or_insert_with(|| SlicedCounter::new(window, now))
            .inc(now)
    }

    fn evict_and_publish(&mut self, now: u64, sink: &dyn GaugeSink) {
        for (attr, values) in self.attrs.iter_mut() {
            values.retain(|value, counter| {
                counter.erase_stale(now);
                match counter.total() {
                    0 => {
                        sink.remove(attr, value);
                        false
                    }
                    n => {
                        sink.set(attr, value, n);
                        true
                    }
                }
            });
            sink.set(attr, VALUES_COUNT, values.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::collections::HashMap;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct RecordingSink {
        values: Mutex<HashMap<(String, String), u64>>,
    }

    impl RecordingSink {
        fn get(&self, attr: &str, value: &str) -> Option<u64> {
            self.values
                .lock()
                .unwrap()
                .get(&(attr.to_string(), value.to_string()))
                .copied()
        }
    }

    impl GaugeSink for RecordingSink {
        fn set(&self, attr: &str, value: &str, count: u64) {
            self.values
                .lock()
                .unwrap()
                .insert((attr.to_string(), value.to_string()), count);
        }

        fn remove(&self, attr: &str, value: &str) {
            self.values
                .lock()
                .unwrap()
                .remove(&(attr.to_string(), value.to_string()));
        }
    }

    fn settings(window: u64, unit_ms: u64, tick_ms: u64, queue_size: usize) -> GaugeSettings {
        GaugeSettings {
            window,
            unit_ms,
            tick_ms,
            queue_size,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(3), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn start_then_double_stop_is_noop() {
        let gauge = AttrGauge::new(&settings(5, 100, 10, 8), Arc::new(RecordingSink::default()));
        assert_eq!(gauge.state(), GaugeState::Stopped);
        assert!(gauge.start());
        assert!(!gauge.start());
        assert_eq!(gauge.state(), GaugeState::Started);

        timeout(Duration::from_secs(1), gauge.stop()).await.expect("first stop hung");
        assert_eq!(gauge.state(), GaugeState::Stopped);
        timeout(Duration::from_secs(1), gauge.stop()).await.expect("second stop hung");
        assert_eq!(gauge.state(), GaugeState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_returns_immediately() {
        let gauge = AttrGauge::new(&settings(5, 100, 10, 8), Arc::new(RecordingSink::default()));
        timeout(Duration::from_millis(100), gauge.stop()).await.expect("stop hung");
        assert_eq!(gauge.state(), GaugeState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop_reuses_worker() {
        let sink = Arc::new(RecordingSink::default());
        let gauge = AttrGauge::new(&settings(20, 100, 10, 8), sink.clone());
        assert!(gauge.start());
        gauge.inc(AttributeAssignment::string("uid", "u1"));
        eventually(|| sink.get("uid", "u1") == Some(1)).await;
        gauge.stop().await;

        assert!(gauge.start());
        gauge.inc(AttributeAssignment::string("uid", "u1"));
        eventually(|| sink.get("uid", "u1") == Some(2)).await;
        gauge.stop().await;
    }

    #[tokio::test]
    async fn publishes_counts_then_evicts() {
        let sink = Arc::new(RecordingSink::default());
        let gauge = AttrGauge::new(&settings(2, 40, 10, 64), sink.clone());
        gauge.register("uid");
        gauge.register("idle");
        assert!(gauge.start());

        for _ in 0..3 {
            gauge.inc(AttributeAssignment::string("uid", "u1"));
        }
        gauge.inc(AttributeAssignment::string("uid", "u2"));

        eventually(|| sink.get("uid", "u1") == Some(3) && sink.get("uid", "u2") == Some(1)).await;
        assert_eq!(sink.get("uid", VALUES_COUNT), Some(2));
        assert_eq!(sink.get("idle", VALUES_COUNT), Some(0));

        // Two units later everything is stale.
        eventually(|| sink.get("uid", "u1").is_none() && sink.get("uid", VALUES_COUNT) == Some(0)).await;
        gauge.stop().await;
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let gauge = AttrGauge::new(&settings(5, 100, 10, 1), Arc::new(RecordingSink::default()));
        // Not started: nothing drains the queue.
        for _ in 0..5 {
            gauge.inc(AttributeAssignment::string("uid", "u1"));
        }
        assert_eq!(gauge.dropped(), 4);
    }

    #[tokio::test]
    async fn concurrent_producers_are_all_counted() {
        let sink = Arc::new(RecordingSink::default());
        let gauge = AttrGauge::new(&settings(30, 1000, 10, 1024), sink.clone());
        assert!(gauge.start());

        let tasks = (0..8).map(|_| {
            let gauge = gauge.clone();
            async move {
                for _ in 0..100 {
                    gauge.inc(AttributeAssignment::string("uid", "hot"));
                    tokio::task::yield_now().await;
                }
            }
        });
        join_all(tasks).await;

        eventually(|| sink.get("uid", "hot") == Some(800)).await;
        assert_eq!(sink.get("uid", VALUES_COUNT), Some(1));
        gauge.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stop_returns_under_racing_restarts() {
        let gauge = AttrGauge::new(&settings(5, 100, 1, 64), Arc::new(RecordingSink::default()));
        let producer = {
            let gauge = gauge.clone();
            tokio::spawn(async move {
                loop {
                    gauge.inc(AttributeAssignment::string("uid", "u1"));
                    tokio::task::yield_now().await;
                }
            })
        };

        for round in 0..20_000 {
            assert!(gauge.start(), "start failed at round {round}");
            if timeout(Duration::from_millis(500), gauge.stop()).await.is_err() {
                panic!("stop hung at round {round}, state={:?}", gauge.state());
            }
            assert_eq!(gauge.state(), GaugeState::Stopped);
        }
        producer.abort();
    }
}
