//! Merges fixed metadata into every message and event.

use async_trait::async_trait;

use super::{Flow, Middleware, MiddlewareError};
use crate::message::{Event, Message, Metadata};

pub struct TagMiddleware {
    name: String,
    metadata: Metadata,
}

impl TagMiddleware {
    pub fn new(name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            metadata,
        }
    }
}

#[async_trait]
impl Middleware for TagMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_inbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        Ok(Flow::Continue(msg.with_metadata(self.metadata.clone())))
    }

    async fn process_outbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        Ok(Flow::Continue(msg.with_metadata(self.metadata.clone())))
    }

    async fn process_event(&self, event: Event) -> Result<Flow<Event>, MiddlewareError> {
        Ok(Flow::Continue(event.with_metadata(self.metadata.clone())))
    }
}
