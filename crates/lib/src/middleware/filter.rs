//! Drops messages by content prefix or sender address.

use async_trait::async_trait;
use std::collections::HashSet;

use super::{Flow, Middleware, MiddlewareError};
use crate::message::Message;

pub struct FilterMiddleware {
    name: String,
    content_prefix: Option<String>,
    case_insensitive: bool,
    blocked: HashSet<String>,
    outbound: bool,
}

impl FilterMiddleware {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_prefix: None,
            case_insensitive: false,
            blocked: HashSet::new(),
            outbound: false,
        }
    }

    pub fn with_content_prefix(mut self, prefix: Option<String>, case_insensitive: bool) -> Self {
        self.content_prefix = prefix
            .filter(|p| !p.is_empty())
            .map(|p| if case_insensitive { p.to_lowercase() } else { p });
        self.case_insensitive = case_insensitive;
        self
    }

    pub fn with_blocked_addresses(mut self, addresses: impl IntoIterator<Item = String>) -> Self {
        self.blocked.extend(addresses);
        self
    }

    /// Apply the filter to outbound messages too.
    pub fn filter_outbound(mut self, enabled: bool) -> Self {
        self.outbound = enabled;
        self
    }

    /// Reason to drop `msg`, if any.
    fn verdict(&self, msg: &Message) -> Option<String> {
        if self.blocked.contains(msg.from_addr()) {
            return Some(format!("sender {} is blocked", msg.from_addr()));
        }
        let prefix = self.content_prefix.as_deref()?;
        let content = msg.content().unwrap_or_default();
        let matches = if self.case_insensitive {
            content.to_lowercase().starts_with(prefix)
        } else {
            content.starts_with(prefix)
        };
        matches.then(|| format!("content matches filtered prefix {:?}", prefix))
    }

    fn apply(&self, msg: Message) -> Flow<Message> {
        match self.verdict(&msg) {
            Some(reason) => Flow::Drop(reason),
            None => Flow::Continue(msg),
        }
    }
}

#[async_trait]
impl Middleware for FilterMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_inbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        Ok(self.apply(msg))
    }

    async fn process_outbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        if self.outbound {
            Ok(self.apply(msg))
        } else {
            Ok(Flow::Continue(msg))
        }
    }
}
