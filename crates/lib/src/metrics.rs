//! Metrics: counters, sums and gauges recorded through the [`metrics`] facade.
//!
//! A [`MetricManager`] is a [`metrics::Recorder`] whose handles write into poll-and-reset cells
//! named under a common prefix. Polling drains every cell into a [`MetricBatch`]; the
//! [`MetricsPublisher`] worker does this on an interval and publishes the batch on
//! [`METRICS_CHANNEL`](crate::bus::METRICS_CHANNEL). Counters and sums reset on poll, so each
//! batch reports activity since the previous one. Gauges keep their last value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::bus::{MessageBus, Subscription, METRICS_CHANNEL};
use crate::message::BusRecord;
use crate::worker::{Shutdown, Worker};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metric {0} is already registered as another kind")]
    AlreadyRegistered(String),
    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}

/// One polled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// All datapoints from one poll of a manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    pub datapoints: Vec<Datapoint>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event count since the last poll.
#[derive(Default)]
struct CountCell(AtomicU64);

impl CounterFn for CountCell {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Sum of recorded values since the last poll, or their mean when averaging.
struct SumCell {
    averaging: bool,
    acc: Mutex<(f64, u64)>,
}

impl HistogramFn for SumCell {
    fn record(&self, value: f64) {
        let mut acc = lock(&self.acc);
        acc.0 += value;
        acc.1 += 1;
    }
}

impl SumCell {
    fn drain(&self) -> f64 {
        let (value, count) = std::mem::take(&mut *lock(&self.acc));
        if !self.averaging {
            value
        } else if count == 0 {
            0.0
        } else {
            value / count as f64
        }
    }
}

struct GaugeCell(AtomicU64);

impl GaugeCell {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }
}

impl GaugeFn for GaugeCell {
    fn increment(&self, value: f64) {
        self.update(|v| v + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|v| v - value);
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Clone)]
enum Cell {
    Count(Arc<CountCell>),
    Sum(Arc<SumCell>),
    Gauge(Arc<GaugeCell>),
}

impl Cell {
    fn poll(&self) -> f64 {
        match self {
            Cell::Count(c) => c.0.swap(0, Ordering::Relaxed) as f64,
            Cell::Sum(s) => s.drain(),
            Cell::Gauge(g) => f64::from_bits(g.0.load(Ordering::Relaxed)),
        }
    }
}

/// Recorder for metrics sharing a name prefix (e.g. `courier.`).
///
/// Clones share the same cells. Registering a name again returns a handle on the existing
/// cell; registering it as a different kind fails. Label values are appended to the name
/// (`dispatcher.inbound` with `outcome=delivered` polls as `<prefix>dispatcher.inbound.delivered`).
#[derive(Clone)]
pub struct MetricManager {
    prefix: Arc<str>,
    cells: Arc<Mutex<Vec<(String, Cell)>>>,
}

impl MetricManager {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.into(),
            cells: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_name(&self, key: &Key) -> String {
        let mut name = format!("{}{}", self.prefix, key.name());
        for label in key.labels() {
            name.push('.');
            name.push_str(label.value());
        }
        name
    }

    /// The cell already named `name` if `pick` accepts its kind, otherwise a new one.
    fn cell<T>(
        &self,
        name: String,
        pick: fn(&Cell) -> Option<Arc<T>>,
        wrap: fn(Arc<T>) -> Cell,
        make: impl FnOnce() -> T,
    ) -> Result<Arc<T>, MetricsError> {
        let mut cells = lock(&self.cells);
        if let Some((_, existing)) = cells.iter().find(|(n, _)| *n == name) {
            return pick(existing).ok_or(MetricsError::AlreadyRegistered(name));
        }
        let cell = Arc::new(make());
        cells.push((name, wrap(cell.clone())));
        Ok(cell)
    }

    fn count_cell(&self, name: String) -> Result<Counter, MetricsError> {
        self.cell(
            name,
            |c| match c {
                Cell::Count(c) => Some(c.clone()),
                _ => None,
            },
            Cell::Count,
            CountCell::default,
        )
        .map(Counter::from_arc)
    }

    /// An existing sum keeps the averaging mode it was first registered with.
    fn sum_cell(&self, name: String, averaging: bool) -> Result<Histogram, MetricsError> {
        self.cell(
            name,
            |c| match c {
                Cell::Sum(s) => Some(s.clone()),
                _ => None,
            },
            Cell::Sum,
            || SumCell {
                averaging,
                acc: Mutex::new((0.0, 0)),
            },
        )
        .map(Histogram::from_arc)
    }

    fn gauge_cell(&self, name: String) -> Result<Gauge, MetricsError> {
        self.cell(
            name,
            |c| match c {
                Cell::Gauge(g) => Some(g.clone()),
                _ => None,
            },
            Cell::Gauge,
            || GaugeCell(AtomicU64::new(0f64.to_bits())),
        )
        .map(Gauge::from_arc)
    }

    pub fn counter(&self, suffix: &str) -> Result<Counter, MetricsError> {
        self.count_cell(format!("{}{}", self.prefix, suffix))
    }

    /// A histogram handle whose recorded values are summed per poll, or averaged.
    pub fn sum(&self, suffix: &str, averaging: bool) -> Result<Histogram, MetricsError> {
        self.sum_cell(format!("{}{}", self.prefix, suffix), averaging)
    }

    pub fn gauge(&self, suffix: &str) -> Result<Gauge, MetricsError> {
        self.gauge_cell(format!("{}{}", self.prefix, suffix))
    }

    /// Make this manager the process-wide recorder behind `metrics::counter!` and friends.
    pub fn install(&self) -> Result<(), MetricsError> {
        metrics::set_global_recorder(self.clone()).map_err(|_| MetricsError::RecorderInstalled)
    }

    pub fn poll_all(&self) -> MetricBatch {
        let now = Utc::now();
        let cells = lock(&self.cells).clone();
        MetricBatch {
            datapoints: cells
                .iter()
                .map(|(name, cell)| Datapoint {
                    name: name.clone(),
                    timestamp: now,
                    value: cell.poll(),
                })
                .collect(),
        }
    }
}

impl Recorder for MetricManager {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.count_cell(self.full_name(key)).unwrap_or_else(|e| {
            log::warn!("{}", e);
            Counter::noop()
        })
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.gauge_cell(self.full_name(key)).unwrap_or_else(|e| {
            log::warn!("{}", e);
            Gauge::noop()
        })
    }

    /// Histograms report the mean of the values recorded since the last poll.
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.sum_cell(self.full_name(key), true).unwrap_or_else(|e| {
            log::warn!("{}", e);
            Histogram::noop()
        })
    }
}

/// Records the seconds elapsed since [`TimerGuard::start`] into a histogram when dropped.
pub struct TimerGuard<'a> {
    histogram: &'a Histogram,
    started: Instant,
}

impl<'a> TimerGuard<'a> {
    pub fn start(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            started: Instant::now(),
        }
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.histogram.record(self.started.elapsed().as_secs_f64());
    }
}

/// Worker that polls a manager on an interval and publishes each batch on the metrics channel.
pub struct MetricsPublisher {
    manager: MetricManager,
    bus: Arc<dyn MessageBus>,
    interval: Duration,
}

impl MetricsPublisher {
    pub fn new(manager: MetricManager, bus: Arc<dyn MessageBus>, interval: Duration) -> Self {
        Self {
            manager,
            bus,
            interval,
        }
    }
}

#[async_trait]
impl Worker for MetricsPublisher {
    fn name(&self) -> &str {
        "metrics-publisher"
    }

    async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        // First tick completes immediately; skip it so the first batch covers a full interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let batch = self.manager.poll_all();
                    if batch.datapoints.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.bus.publish(METRICS_CHANNEL, &BusRecord::Metrics(batch)).await {
                        log::debug!("metrics publish failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Worker that consumes published batches and hands each datapoint to a callback.
pub struct MetricsConsumer {
    subscription: Subscription,
    callback: Box<dyn Fn(&Datapoint) + Send + Sync>,
}

impl MetricsConsumer {
    pub async fn new(
        bus: &dyn MessageBus,
        callback: impl Fn(&Datapoint) + Send + Sync + 'static,
    ) -> Self {
        Self {
            subscription: bus.subscribe(METRICS_CHANNEL).await,
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Worker for MetricsConsumer {
    fn name(&self) -> &str {
        "metrics-consumer"
    }

    async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = self.subscription.recv() => match next {
                    None => break,
                    Some(Ok(BusRecord::Metrics(batch))) => {
                        for dp in &batch.datapoints {
                            (self.callback)(dp);
                        }
                    }
                    Some(Ok(other)) => {
                        log::debug!("metrics consumer ignoring non-metrics record {:?}", other.id());
                    }
                    Some(Err(e)) => log::warn!("metrics consumer: undecodable record: {}", e),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(batch: &MetricBatch, name: &str) -> f64 {
        batch
            .datapoints
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value)
            .unwrap_or_else(|| panic!("no datapoint {}", name))
    }

    #[test]
    fn count_resets_on_poll() {
        let mm = MetricManager::new("courier.test.");
        let c = mm.counter("hits").unwrap();
        c.increment(1);
        c.increment(1);
        let batch = mm.poll_all();
        assert_eq!(batch.datapoints.len(), 1);
        assert_eq!(batch.datapoints[0].name, "courier.test.hits");
        assert_eq!(batch.datapoints[0].value, 2.0);
        assert_eq!(mm.poll_all().datapoints[0].value, 0.0);
    }

    #[test]
    fn sum_can_average() {
        let mm = MetricManager::new("");
        let total = mm.sum("total", false).unwrap();
        let avg = mm.sum("avg", true).unwrap();
        for v in [1.0, 0.5] {
            total.record(v);
            avg.record(v);
        }
        let batch = mm.poll_all();
        assert_eq!(value(&batch, "total"), 1.5);
        assert_eq!(value(&batch, "avg"), 0.75);
        assert_eq!(value(&mm.poll_all(), "avg"), 0.0);
    }

    #[test]
    fn gauge_keeps_last_value() {
        let mm = MetricManager::new("");
        let g = mm.gauge("depth").unwrap();
        g.set(3.0);
        g.increment(5.0);
        g.decrement(0.5);
        assert_eq!(value(&mm.poll_all(), "depth"), 7.5);
        assert_eq!(value(&mm.poll_all(), "depth"), 7.5);
    }

    #[test]
    fn timer_guard_records_elapsed_seconds() {
        let mm = MetricManager::new("");
        let h = mm.sum("work", false).unwrap();
        h.record(0.25);
        {
            let _guard = TimerGuard::start(&h);
        }
        assert!(value(&mm.poll_all(), "work") >= 0.25);
    }

    #[test]
    fn reregistering_shares_the_cell() {
        let mm = MetricManager::new("p.");
        mm.counter("x").unwrap().increment(2);
        mm.counter("x").unwrap().increment(3);
        let batch = mm.poll_all();
        assert_eq!(batch.datapoints.len(), 1);
        assert_eq!(value(&batch, "p.x"), 5.0);
    }

    #[test]
    fn name_held_by_another_kind_is_rejected() {
        let mm = MetricManager::new("p.");
        mm.counter("x").unwrap();
        assert_eq!(
            mm.gauge("x").err(),
            Some(MetricsError::AlreadyRegistered("p.x".to_string()))
        );
    }

    #[test]
    fn facade_macros_record_into_a_local_manager() {
        let mm = MetricManager::new("courier.");
        metrics::with_local_recorder(&mm, || {
            metrics::counter!("replies", "app" => "echo").increment(4);
            metrics::histogram!("latency").record(0.5);
            metrics::histogram!("latency").record(1.5);
            metrics::gauge!("queue").set(2.0);
            // Same name, different kind: handed a no-op handle.
            metrics::gauge!("latency").set(9.0);
        });
        let batch = mm.poll_all();
        assert_eq!(value(&batch, "courier.replies.echo"), 4.0);
        assert_eq!(value(&batch, "courier.latency"), 1.0);
        assert_eq!(value(&batch, "courier.queue"), 2.0);
        assert_eq!(batch.datapoints.len(), 3);
    }

    #[test]
    fn only_one_manager_can_be_installed_globally() {
        let first = MetricManager::new("global.");
        let second = MetricManager::new("other.");
        first.install().unwrap();
        assert_eq!(second.install(), Err(MetricsError::RecorderInstalled));

        metrics::counter!("hits").increment(1);
        assert_eq!(value(&first.poll_all(), "global.hits"), 1.0);
        assert!(second.poll_all().datapoints.is_empty());
    }

    #[tokio::test]
    async fn publisher_sends_non_empty_batches() {
        let bus = Arc::new(crate::bus::LocalBus::default());
        let mm = MetricManager::new("courier.");
        let hits = mm.counter("hits").unwrap();
        let sub = bus.subscribe(METRICS_CHANNEL).await;
        let publisher = MetricsPublisher::new(mm, bus.clone(), Duration::from_millis(20));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { publisher.run(rx).await });

        hits.increment(3);
        let record = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match record {
            BusRecord::Metrics(batch) => assert_eq!(value(&batch, "courier.hits"), 3.0),
            other => panic!("unexpected record {:?}", other.id()),
        }

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
