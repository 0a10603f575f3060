//! Applications: the business-logic end of a route.
//!
//! An [`ApplicationWorker`] consumes `<name>.inbound` and `<name>.event`, hands each record to
//! its [`Application`] and publishes any replies on `<name>.outbound`.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

use crate::audit::AuditLog;
use crate::bus::{event_channel, inbound_channel, outbound_channel, MessageBus};
use crate::config::{ApplicationConfig, ApplicationKind};
use crate::message::{BusRecord, Event, Message, SessionEvent};
use crate::worker::{Shutdown, Worker};

#[async_trait]
pub trait Application: Send + Sync {
    /// Handle one inbound message; returned messages are sent as outbound.
    async fn consume_message(&self, msg: Message) -> anyhow::Result<Vec<Message>>;

    async fn consume_event(&self, event: Event) -> anyhow::Result<()> {
        log::debug!(
            "event {} for message {}",
            event.status().as_str(),
            event.user_message_id()
        );
        Ok(())
    }
}

/// Replies with the content it receives. A closing session gets no reply.
#[derive(Debug, Default)]
pub struct EchoApplication;

#[async_trait]
impl Application for EchoApplication {
    async fn consume_message(&self, msg: Message) -> anyhow::Result<Vec<Message>> {
        if msg.session_event() == Some(SessionEvent::Close) {
            return Ok(Vec::new());
        }
        let content = msg.content().unwrap_or_default().to_string();
        Ok(vec![msg.reply(content)])
    }
}

/// The in-process implementation for a configured application, if it has one.
pub fn build_application(config: &ApplicationConfig) -> Option<Arc<dyn Application>> {
    match config.kind {
        ApplicationKind::Echo => Some(Arc::new(EchoApplication)),
        ApplicationKind::External => None,
    }
}

pub struct ApplicationWorker {
    name: String,
    app: Arc<dyn Application>,
    bus: Arc<dyn MessageBus>,
    audit: AuditLog,
    in_flight: Mutex<Option<String>>,
}

impl ApplicationWorker {
    pub fn new(
        name: impl Into<String>,
        app: Arc<dyn Application>,
        bus: Arc<dyn MessageBus>,
        audit: AuditLog,
    ) -> Self {
        Self {
            name: name.into(),
            app,
            bus,
            audit,
            in_flight: Mutex::new(None),
        }
    }

    fn set_in_flight(&self, id: Option<String>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    async fn handle_message(&self, msg: Message) {
        let id = msg.message_id().to_string();
        self.set_in_flight(Some(id.clone()));
        match self.app.consume_message(msg).await {
            Ok(replies) => {
                let channel = outbound_channel(&self.name);
                for reply in replies {
                    if let Err(e) = self.bus.publish(&channel, &BusRecord::Message(reply)).await {
                        self.audit.failed(&id, &self.name, format!("reply not sent: {}", e));
                    }
                }
            }
            Err(e) => self.audit.failed(&id, &self.name, format!("{:#}", e)),
        }
        self.set_in_flight(None);
    }

    async fn handle_event(&self, event: Event) {
        let id = event.event_id().to_string();
        self.set_in_flight(Some(id.clone()));
        if let Err(e) = self.app.consume_event(event).await {
            self.audit.failed(&id, &self.name, format!("{:#}", e));
        }
        self.set_in_flight(None);
    }
}

#[async_trait]
impl Worker for ApplicationWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let messages = self.bus.subscribe(&inbound_channel(&self.name)).await;
        let events = self.bus.subscribe(&event_channel(&self.name)).await;
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = messages.recv() => match next {
                    None => break,
                    Some(Ok(BusRecord::Message(msg))) => self.handle_message(msg).await,
                    Some(Ok(other)) => log::warn!("{}: unexpected record {:?} on inbound", self.name, other.id()),
                    Some(Err(e)) => log::warn!("{}: undecodable inbound record: {}", self.name, e),
                },
                next = events.recv() => match next {
                    None => break,
                    Some(Ok(BusRecord::Event(event))) => self.handle_event(event).await,
                    Some(Ok(other)) => log::warn!("{}: unexpected record {:?} on events", self.name, other.id()),
                    Some(Err(e)) => log::warn!("{}: undecodable event record: {}", self.name, e),
                },
            }
        }
        Ok(())
    }

    fn take_in_flight(&self) -> Vec<String> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .into_iter()
            .collect()
    }
}
