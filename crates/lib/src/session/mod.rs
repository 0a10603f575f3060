//! Per-conversation session state.
//!
//! A session is keyed by (transport, from-address, to-address) in inbound orientation, so an
//! inbound message and the outbound reply to it resolve to the same session. Sessions live in a
//! [`DurableStore`] and are read through an optional [`Cache`]; all access goes through
//! [`SessionStore`].

mod cache;
mod durable;
mod store;

pub use cache::{Cache, CacheError, MemoryCache};
pub use durable::{CasOutcome, DurableStore, FileStore, MemoryStore, Versioned};
pub use store::{RetryPolicy, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Direction, Message, Metadata};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting concurrent updates to {key}; gave up after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },
    #[error("corrupt session record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub transport_name: String,
    pub from_addr: String,
    pub to_addr: String,
}

impl SessionKey {
    pub fn new(
        transport_name: impl Into<String>,
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
    ) -> Self {
        Self {
            transport_name: transport_name.into(),
            from_addr: from_addr.into(),
            to_addr: to_addr.into(),
        }
    }

    /// Key of the conversation a message belongs to; outbound messages are flipped back to
    /// the inbound orientation.
    pub fn for_message(msg: &Message) -> Self {
        match msg.direction() {
            Direction::Inbound => Self::new(msg.transport_name(), msg.from_addr(), msg.to_addr()),
            Direction::Outbound => Self::new(msg.transport_name(), msg.to_addr(), msg.from_addr()),
        }
    }

    /// Composite key used in the durable store and cache: `session:<transport>:<from>:<to>`,
    /// with `\` and `:` escaped inside each part.
    pub fn storage_key(&self) -> String {
        format!(
            "session:{}:{}:{}",
            escape(&self.transport_name),
            escape(&self.from_addr),
            escape(&self.to_addr)
        )
    }
}

fn escape(part: &str) -> String {
    part.replace('\\', "\\\\").replace(':', "\\:")
}

/// Conversation state plus bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    key: SessionKey,
    #[serde(default)]
    state: Metadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    /// Durable version this copy was read at or written as; 0 for a session never stored.
    #[serde(default)]
    version: u64,
}

impl Session {
    pub(crate) fn new(key: SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            state: Metadata::new(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            version: 0,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> &Metadata {
        &self.state
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.state.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.state.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.state.remove(field)
    }

    /// Integer field, 0 when absent or not an integer.
    pub fn counter(&self, field: &str) -> u64 {
        self.state.get(field).and_then(Value::as_u64).unwrap_or(0)
    }

    /// Add one to an integer field and return the new value.
    pub fn increment(&mut self, field: &str) -> u64 {
        let next = self.counter(field) + 1;
        self.set(field, Value::from(next));
        next
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn set_expires_at(&mut self, at: Option<DateTime<Utc>>) {
        self.expires_at = at;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True until the session has been written to the durable store.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Corrupt {
            key: self.key.storage_key(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn decode(storage_key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            key: storage_key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_maps_to_the_same_session() {
        let inbound = Message::inbound("+2783", "*120#", "ussd", "1").unwrap();
        let reply = inbound.reply("menu");
        assert_eq!(SessionKey::for_message(&inbound), SessionKey::for_message(&reply));
    }

    #[test]
    fn storage_key_escapes_separators() {
        let a = SessionKey::new("t", "a:b", "c").storage_key();
        let b = SessionKey::new("t", "a", "b:c").storage_key();
        assert_ne!(a, b);
        assert_eq!(a, "session:t:a\\:b:c");
    }

    #[test]
    fn counters_default_to_zero() {
        let mut s = Session::new(SessionKey::new("t", "a", "b"), Utc::now());
        assert_eq!(s.counter("n"), 0);
        assert_eq!(s.increment("n"), 1);
        assert_eq!(s.increment("n"), 2);
        assert!(s.is_new());
    }
}
