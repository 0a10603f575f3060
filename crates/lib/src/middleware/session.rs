//! Tracks conversations in the session store.
//!
//! Inbound messages open or resume the conversation's session and are annotated with a
//! `session` metadata entry (`event`, `inbound_count`). A `close` session event on either
//! direction deletes the session. When a TTL is configured, each message pushes the session's
//! expiry forward.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use super::{Flow, Middleware, MiddlewareError};
use crate::message::{Message, Metadata, SessionEvent};
use crate::session::{Session, SessionKey, SessionStore};

const INBOUND_COUNT: &str = "inbound_count";
const OUTBOUND_COUNT: &str = "outbound_count";
const METADATA_KEY: &str = "session";

pub struct SessionMiddleware {
    name: String,
    store: SessionStore,
    ttl: Option<Duration>,
}

impl SessionMiddleware {
    pub fn new(name: impl Into<String>, store: SessionStore, ttl: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            store,
            ttl,
        }
    }

    fn stamp_expiry(&self, session: &mut Session) {
        let at = self
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        session.set_expires_at(at);
    }

    async fn close(&self, key: &SessionKey) -> Result<(), MiddlewareError> {
        self.store.delete(key).await?;
        log::debug!("{}: closed session {}", self.name, key.storage_key());
        Ok(())
    }
}

#[async_trait]
impl Middleware for SessionMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_inbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        let key = SessionKey::for_message(&msg);
        if msg.session_event() == Some(SessionEvent::Close) {
            self.close(&key).await?;
            let annotation = Metadata::from([(
                METADATA_KEY.to_string(),
                json!({ "event": SessionEvent::Close.as_str() }),
            )]);
            return Ok(Flow::Continue(msg.with_metadata(annotation)));
        }

        // A transport-declared new session restarts the conversation counters; other state is kept.
        let restart = msg.session_event() == Some(SessionEvent::New);
        let mut created = false;
        let session = self
            .store
            .create_or_update(&key, |s| {
                created = s.is_new();
                if restart && !created {
                    s.remove(INBOUND_COUNT);
                    s.remove(OUTBOUND_COUNT);
                }
                s.increment(INBOUND_COUNT);
                self.stamp_expiry(s);
            })
            .await?;

        let event = if created || restart {
            SessionEvent::New
        } else {
            SessionEvent::Resume
        };
        let annotation = Metadata::from([(
            METADATA_KEY.to_string(),
            json!({
                "event": event.as_str(),
                "inbound_count": session.counter(INBOUND_COUNT),
            }),
        )]);
        Ok(Flow::Continue(msg.with_metadata(annotation)))
    }

    async fn process_outbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        let key = SessionKey::for_message(&msg);
        if msg.session_event() == Some(SessionEvent::Close) {
            self.close(&key).await?;
        } else {
            self.store
                .create_or_update(&key, |s| {
                    s.increment(OUTBOUND_COUNT);
                    self.stamp_expiry(s);
                })
                .await?;
        }
        Ok(Flow::Continue(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStore;
    use std::sync::Arc;

    fn annotation(flow: Flow<Message>) -> serde_json::Value {
        match flow {
            Flow::Continue(m) => m.metadata().get(METADATA_KEY).cloned().unwrap_or_default(),
            Flow::Drop(r) => panic!("unexpected drop: {}", r),
        }
    }

    #[tokio::test]
    async fn inbound_opens_then_resumes() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let mw = SessionMiddleware::new("session", store.clone(), Some(Duration::from_secs(60)));

        let first = Message::inbound("+2783", "*120#", "ussd", "hi").unwrap();
        let a = annotation(mw.process_inbound(first.clone()).await.unwrap());
        assert_eq!(a["event"], json!("new"));
        assert_eq!(a["inbound_count"], json!(1));

        let second = Message::inbound("+2783", "*120#", "ussd", "1").unwrap();
        let a = annotation(mw.process_inbound(second).await.unwrap());
        assert_eq!(a["event"], json!("resume"));
        assert_eq!(a["inbound_count"], json!(2));

        let session = store.get(&SessionKey::for_message(&first)).await.unwrap().unwrap();
        assert!(session.expires_at().is_some());
    }

    #[tokio::test]
    async fn close_reply_deletes_session() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let mw = SessionMiddleware::new("session", store.clone(), None);
        let msg = Message::inbound("+2783", "*120#", "ussd", "hi").unwrap();
        mw.process_inbound(msg.clone()).await.unwrap();
        let key = SessionKey::for_message(&msg);
        assert!(store.get(&key).await.unwrap().is_some());

        let bye = msg.reply("bye").with_session_event(SessionEvent::Close);
        mw.process_outbound(bye).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_new_event_resets_counters_only() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let mw = SessionMiddleware::new("session", store.clone(), None);
        let msg = Message::inbound("+2783", "*120#", "ussd", "hi").unwrap();
        mw.process_inbound(msg.clone()).await.unwrap();
        mw.process_inbound(msg.clone()).await.unwrap();
        let key = SessionKey::for_message(&msg);
        store
            .create_or_update(&key, |s| s.set("language", json!("zu")))
            .await
            .unwrap();

        let restart = Message::inbound("+2783", "*120#", "ussd", "")
            .unwrap()
            .with_session_event(SessionEvent::New);
        let a = annotation(mw.process_inbound(restart).await.unwrap());
        assert_eq!(a["event"], json!("new"));
        assert_eq!(a["inbound_count"], json!(1));

        let session = store.get(&key).await.unwrap().unwrap();
        assert_eq!(session.get("language"), Some(&json!("zu")));
        assert_eq!(session.counter("inbound_count"), 1);
    }
}
