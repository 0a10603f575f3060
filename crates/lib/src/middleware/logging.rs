//! Logs every message and event that passes the stage.

use async_trait::async_trait;

use super::{Flow, Middleware, MiddlewareError};
use crate::message::{Event, Message};

pub struct LoggingMiddleware {
    name: String,
}

impl LoggingMiddleware {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_inbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        log::info!(
            "{}: inbound {} from {} to {} via {}/{}: {:?}",
            self.name,
            msg.message_id(),
            msg.from_addr(),
            msg.to_addr(),
            msg.transport_name(),
            msg.endpoint(),
            msg.content().unwrap_or_default()
        );
        Ok(Flow::Continue(msg))
    }

    async fn process_outbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        log::info!(
            "{}: outbound {} from {} to {} via {}/{}: {:?}",
            self.name,
            msg.message_id(),
            msg.from_addr(),
            msg.to_addr(),
            msg.transport_name(),
            msg.endpoint(),
            msg.content().unwrap_or_default()
        );
        Ok(Flow::Continue(msg))
    }

    async fn process_event(&self, event: Event) -> Result<Flow<Event>, MiddlewareError> {
        log::info!(
            "{}: event {} ({}) for message {} via {}",
            self.name,
            event.event_id(),
            event.status().as_str(),
            event.user_message_id(),
            event.transport_name()
        );
        Ok(Flow::Continue(event))
    }
}
