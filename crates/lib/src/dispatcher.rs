//! Dispatcher: moves messages between transports and applications.
//!
//! Every message walks `received -> middleware-processing -> routed` and ends `delivered`,
//! `dropped` or `failed`; the [`DispatchOutcome`] keeps the walk. Routing is looked up before
//! any middleware runs, so an unroutable message never touches the pipeline or the bus.
//! Each (message id, destination) pair is forwarded at most once per dispatcher instance.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use metrics::{counter, histogram, Counter, Histogram};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::audit::AuditLog;
use crate::bus::{event_channel, inbound_channel, outbound_channel, DeliveryError, MessageBus, Subscription};
use crate::config::DispatcherConfig;
use crate::message::{BusRecord, Direction, EnvelopeError, Event, Message};
use crate::metrics::{MetricManager, TimerGuard};
use crate::middleware::{Pipeline, PipelineError, Processed};
use crate::routing::{RoutingError, RoutingTable};
use crate::worker::{panic_message, Shutdown, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchState {
    Received,
    MiddlewareProcessing,
    Routed,
    Delivered,
    Dropped,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchState::Delivered | DispatchState::Dropped | DispatchState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Received => "received",
            DispatchState::MiddlewareProcessing => "middleware-processing",
            DispatchState::Routed => "routed",
            DispatchState::Delivered => "delivered",
            DispatchState::Dropped => "dropped",
            DispatchState::Failed => "failed",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Middleware(#[from] PipelineError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("expected an {expected} message, got {actual}")]
    WrongDirection { expected: Direction, actual: Direction },
    #[error("dispatch panicked: {0}")]
    Panicked(String),
}

/// How one message ended.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub message_id: String,
    /// Bus channel the message was (or would have been) published on.
    pub destination: Option<String>,
    /// Every state the message passed through, ending in a terminal state.
    pub history: Vec<DispatchState>,
    pub error: Option<DispatchError>,
    pub drop_reason: Option<String>,
}

impl DispatchOutcome {
    pub fn state(&self) -> DispatchState {
        self.history
            .last()
            .copied()
            .unwrap_or(DispatchState::Received)
    }

    pub fn is_delivered(&self) -> bool {
        self.state() == DispatchState::Delivered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Inbound,
    Outbound,
    Event,
}

impl Leg {
    fn as_str(&self) -> &'static str {
        match self {
            Leg::Inbound => "inbound",
            Leg::Outbound => "outbound",
            Leg::Event => "event",
        }
    }
}

struct Tracker {
    id: String,
    destination: Option<String>,
    history: Vec<DispatchState>,
}

impl Tracker {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            destination: None,
            history: vec![DispatchState::Received],
        }
    }

    fn advance(&mut self, state: DispatchState) {
        self.history.push(state);
    }

    fn finish(
        mut self,
        state: DispatchState,
        error: Option<DispatchError>,
        drop_reason: Option<String>,
    ) -> DispatchOutcome {
        self.history.push(state);
        DispatchOutcome {
            message_id: self.id,
            destination: self.destination,
            history: self.history,
            error,
            drop_reason,
        }
    }
}

/// Recently forwarded (id, destination) pairs; the oldest is forgotten once full.
struct SeenSet {
    capacity: usize,
    order: VecDeque<(String, String)>,
    set: HashSet<(String, String)>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Returns false if the pair was already present.
    fn insert(&mut self, id: &str, destination: &str) -> bool {
        let key = (id.to_string(), destination.to_string());
        if self.set.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(key.clone());
        self.set.insert(key);
        true
    }
}

struct LegCounters {
    delivered: Counter,
    dropped: Counter,
    failed: Counter,
}

impl LegCounters {
    /// Counters `<unit>.<leg>.<outcome>` on the current recorder.
    fn register(unit: &str, leg: Leg) -> Self {
        let name = format!("{}.{}", unit, leg.as_str());
        Self {
            delivered: counter!(name.clone(), "outcome" => "delivered"),
            dropped: counter!(name.clone(), "outcome" => "dropped"),
            failed: counter!(name, "outcome" => "failed"),
        }
    }

    fn observe(&self, state: DispatchState) {
        match state {
            DispatchState::Delivered => self.delivered.increment(1),
            DispatchState::Dropped => self.dropped.increment(1),
            DispatchState::Failed => self.failed.increment(1),
            _ => {}
        }
    }
}

struct DispatcherMetrics {
    inbound: LegCounters,
    outbound: LegCounters,
    event: LegCounters,
    processing_time: Histogram,
}

impl DispatcherMetrics {
    fn leg(&self, leg: Leg) -> &LegCounters {
        match leg {
            Leg::Inbound => &self.inbound,
            Leg::Outbound => &self.outbound,
            Leg::Event => &self.event,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel a record was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `<transport>.inbound`: messages from a transport.
    TransportInbound(String),
    /// `<transport>.event`: acks and delivery reports from a transport.
    TransportEvent(String),
    /// `<application>.outbound`: replies and pushes from an application.
    ApplicationOutbound(String),
}

impl Source {
    pub fn channel(&self) -> String {
        match self {
            Source::TransportInbound(t) => inbound_channel(t),
            Source::TransportEvent(t) => event_channel(t),
            Source::ApplicationOutbound(a) => outbound_channel(a),
        }
    }
}

pub struct Dispatcher {
    name: String,
    routes: Arc<RoutingTable>,
    pipeline: Pipeline,
    bus: Arc<dyn MessageBus>,
    audit: AuditLog,
    seen: Mutex<SeenSet>,
    metrics: Option<DispatcherMetrics>,
    in_flight: Mutex<Option<String>>,
}

impl Dispatcher {
    pub fn new(
        config: &DispatcherConfig,
        routes: Arc<RoutingTable>,
        pipeline: Pipeline,
        bus: Arc<dyn MessageBus>,
        audit: AuditLog,
    ) -> Self {
        Self {
            name: config.name.clone(),
            routes,
            pipeline,
            bus,
            audit,
            seen: Mutex::new(SeenSet::new(config.dedup_capacity)),
            metrics: None,
            in_flight: Mutex::new(None),
        }
    }

    /// Record per-leg outcome counters and the mean processing time under `<name>.` in
    /// `manager`.
    pub fn with_metrics(mut self, manager: &MetricManager) -> Self {
        let name = self.name.clone();
        self.metrics = Some(metrics::with_local_recorder(manager, || DispatcherMetrics {
            inbound: LegCounters::register(&name, Leg::Inbound),
            outbound: LegCounters::register(&name, Leg::Outbound),
            event: LegCounters::register(&name, Leg::Event),
            processing_time: histogram!(format!("{}.processing_time", name)),
        }));
        self
    }

    /// Channels the dispatcher consumes.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources = Vec::new();
        for t in self.routes.transports() {
            sources.push(Source::TransportInbound(t.clone()));
            sources.push(Source::TransportEvent(t.clone()));
        }
        for a in self.routes.applications() {
            sources.push(Source::ApplicationOutbound(a.clone()));
        }
        sources
    }

    /// Route a transport's inbound message to the owning application.
    pub async fn dispatch_inbound(&self, msg: Message) -> DispatchOutcome {
        let _timer = self.metrics.as_ref().map(|m| TimerGuard::start(&m.processing_time));
        let leg = Leg::Inbound;
        let mut t = Tracker::new(msg.message_id());
        if msg.direction() != Direction::Inbound {
            let err = DispatchError::WrongDirection {
                expected: Direction::Inbound,
                actual: msg.direction(),
            };
            return self.fail(leg, t, err);
        }
        let app = match self.routes.inbound_target(msg.transport_name(), msg.endpoint()) {
            Ok(app) => app.to_string(),
            Err(e) => return self.fail(leg, t, e.into()),
        };
        if !self.claim(&mut t, inbound_channel(&app)) {
            return self.duplicate(leg, t);
        }
        t.advance(DispatchState::MiddlewareProcessing);
        let processed = self.pipeline.run_inbound(msg).await;
        self.complete(leg, t, processed, BusRecord::Message).await
    }

    /// Route an application's outbound message back to the transport that owns its endpoint.
    pub async fn dispatch_outbound(&self, application: &str, msg: Message) -> DispatchOutcome {
        let _timer = self.metrics.as_ref().map(|m| TimerGuard::start(&m.processing_time));
        let leg = Leg::Outbound;
        let mut t = Tracker::new(msg.message_id());
        if msg.direction() != Direction::Outbound {
            let err = DispatchError::WrongDirection {
                expected: Direction::Outbound,
                actual: msg.direction(),
            };
            return self.fail(leg, t, err);
        }
        let transport = match self.routes.outbound_target(application, msg.endpoint()) {
            Ok(transport) => transport.to_string(),
            Err(e) => return self.fail(leg, t, e.into()),
        };
        if !self.claim(&mut t, outbound_channel(&transport)) {
            return self.duplicate(leg, t);
        }
        t.advance(DispatchState::MiddlewareProcessing);
        let processed = self.pipeline.run_outbound(msg).await;
        self.complete(leg, t, processed, BusRecord::Message).await
    }

    /// Route a transport event to the application owning its (transport, endpoint).
    pub async fn dispatch_event(&self, event: Event) -> DispatchOutcome {
        let _timer = self.metrics.as_ref().map(|m| TimerGuard::start(&m.processing_time));
        let leg = Leg::Event;
        let mut t = Tracker::new(event.event_id());
        let app = match self.routes.inbound_target(event.transport_name(), event.endpoint()) {
            Ok(app) => app.to_string(),
            Err(e) => return self.fail(leg, t, e.into()),
        };
        if !self.claim(&mut t, event_channel(&app)) {
            return self.duplicate(leg, t);
        }
        t.advance(DispatchState::MiddlewareProcessing);
        let processed = self.pipeline.run_event(event).await;
        self.complete(leg, t, processed, BusRecord::Event).await
    }

    /// Dispatch one record read from `source`. Records of the wrong kind for their channel are
    /// skipped and yield `None`.
    pub async fn dispatch_record(&self, source: &Source, record: BusRecord) -> Option<DispatchOutcome> {
        match (source, record) {
            (Source::TransportInbound(_), BusRecord::Message(m)) => Some(self.dispatch_inbound(m).await),
            (Source::TransportEvent(_), BusRecord::Event(e)) => Some(self.dispatch_event(e).await),
            (Source::ApplicationOutbound(app), BusRecord::Message(m)) => {
                Some(self.dispatch_outbound(app, m).await)
            }
            (source, other) => {
                log::warn!(
                    "{}: ignoring unexpected record {:?} on {}",
                    self.name,
                    other.id(),
                    source.channel()
                );
                None
            }
        }
    }

    /// Remember the destination; false if the pair was already forwarded.
    fn claim(&self, t: &mut Tracker, destination: String) -> bool {
        let fresh = lock(&self.seen).insert(&t.id, &destination);
        t.destination = Some(destination);
        fresh
    }

    fn duplicate(&self, leg: Leg, t: Tracker) -> DispatchOutcome {
        let reason = format!("duplicate for {}", t.destination.as_deref().unwrap_or(""));
        self.audit.dropped(&t.id, &self.name, reason.clone());
        self.observe(leg, t.finish(DispatchState::Dropped, None, Some(reason)))
    }

    async fn complete<T>(
        &self,
        leg: Leg,
        mut t: Tracker,
        processed: Result<Processed<T>, PipelineError>,
        wrap: fn(T) -> BusRecord,
    ) -> DispatchOutcome {
        let item = match processed {
            Ok(Processed::Continue(item)) => item,
            // Already audited by the pipeline.
            Ok(Processed::Dropped { stage, reason }) => {
                let reason = format!("{}: {}", stage, reason);
                return self.observe(leg, t.finish(DispatchState::Dropped, None, Some(reason)));
            }
            Err(e) => return self.fail(leg, t, e.into()),
        };
        t.advance(DispatchState::Routed);
        let destination = t.destination.clone().unwrap_or_default();
        match self.bus.publish(&destination, &wrap(item)).await {
            Ok(()) => {
                log::debug!("{}: {} {} -> {}", self.name, leg.as_str(), t.id, destination);
                self.observe(leg, t.finish(DispatchState::Delivered, None, None))
            }
            Err(e) => self.fail(leg, t, e.into()),
        }
    }

    fn fail(&self, leg: Leg, t: Tracker, err: DispatchError) -> DispatchOutcome {
        self.audit.failed(&t.id, &self.name, err.to_string());
        self.observe(leg, t.finish(DispatchState::Failed, Some(err), None))
    }

    fn observe(&self, leg: Leg, outcome: DispatchOutcome) -> DispatchOutcome {
        if let Some(m) = &self.metrics {
            m.leg(leg).observe(outcome.state());
        }
        outcome
    }

    async fn handle(&self, source: &Source, record: BusRecord) {
        let id = record.id().map(str::to_string);
        *lock(&self.in_flight) = id.clone();
        let result = AssertUnwindSafe(self.dispatch_record(source, record))
            .catch_unwind()
            .await;
        *lock(&self.in_flight) = None;
        if let Err(panic) = result {
            let err = DispatchError::Panicked(panic_message(panic.as_ref()));
            log::error!("{}: message on {} failed: {}", self.name, source.channel(), err);
            self.audit
                .failed(id.as_deref().unwrap_or("unknown"), &self.name, err.to_string());
        }
    }
}

type Feed = BoxStream<'static, (Source, Result<BusRecord, EnvelopeError>)>;

fn feed(source: Source, subscription: Subscription) -> Feed {
    stream::unfold(subscription, move |sub| {
        let source = source.clone();
        async move {
            let next = sub.recv().await?;
            Some(((source, next), sub))
        }
    })
    .boxed()
}

#[async_trait]
impl Worker for Dispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let mut feeds = Vec::new();
        for source in self.sources() {
            let sub = self.bus.subscribe(&source.channel()).await;
            feeds.push(feed(source, sub));
        }
        log::info!("{} consuming {} channel(s)", self.name, feeds.len());
        let mut merged = stream::select_all(feeds);
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = merged.next() => match next {
                    None => break,
                    Some((source, Ok(record))) => self.handle(&source, record).await,
                    Some((source, Err(e))) => {
                        log::warn!("{}: undecodable record on {}: {}", self.name, source.channel(), e);
                    }
                },
            }
        }
        Ok(())
    }

    fn take_in_flight(&self) -> Vec<String> {
        lock(&self.in_flight).take().into_iter().collect()
    }
}
