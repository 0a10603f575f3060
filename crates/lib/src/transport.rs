//! Bus-side handle for a transport adapter.
//!
//! Adapters (SMS, USSD, chat) run outside the routing core. They publish inbound messages on
//! `<name>.inbound`, report acks and delivery on `<name>.event`, and take outbound messages from
//! `<name>.outbound`.

use std::sync::Arc;

use crate::bus::{event_channel, inbound_channel, outbound_channel, DeliveryError, MessageBus, Subscription};
use crate::message::{BusRecord, EnvelopeError, Event, Message};

pub struct TransportHandle {
    name: String,
    bus: Arc<dyn MessageBus>,
    outbound: Subscription,
}

impl TransportHandle {
    pub async fn connect(name: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        let name = name.into();
        let outbound = bus.subscribe(&outbound_channel(&name)).await;
        Self { name, bus, outbound }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a message received from the outside world to the dispatcher.
    pub async fn submit(&self, msg: Message) -> Result<(), DeliveryError> {
        self.bus
            .publish(&inbound_channel(&self.name), &BusRecord::Message(msg))
            .await
    }

    pub async fn publish_event(&self, event: Event) -> Result<(), DeliveryError> {
        self.bus
            .publish(&event_channel(&self.name), &BusRecord::Event(event))
            .await
    }

    /// Acknowledge an outbound message as accepted for sending.
    pub async fn ack(&self, msg: &Message) -> Result<(), DeliveryError> {
        self.publish_event(Event::ack(msg)).await
    }

    /// Next outbound message to send. Returns `None` once the channel closes; records that are
    /// not messages are skipped.
    pub async fn next_outbound(&self) -> Option<Result<Message, EnvelopeError>> {
        loop {
            match self.outbound.recv().await? {
                Ok(BusRecord::Message(msg)) => return Some(Ok(msg)),
                Ok(other) => log::warn!("{}: skipping non-message record {:?}", self.name, other.id()),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
