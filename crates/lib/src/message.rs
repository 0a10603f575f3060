//! Message and event envelopes exchanged between transports, the dispatcher and applications.
//!
//! Envelopes are immutable once built: enrichment returns a new envelope with merged metadata.
//! The wire form is canonical JSON (fixed field order, sorted metadata keys), so encoding a
//! decoded envelope reproduces the original bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::metrics::MetricBatch;

/// Endpoint used when a transport or application does not name one.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Envelope metadata: string keys to arbitrary JSON values, kept sorted for a canonical encoding.
pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("unknown direction `{0}` (expected inbound or outbound)")]
    InvalidDirection(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

impl FromStr for Direction {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(EnvelopeError::InvalidDirection(other.to_string())),
        }
    }
}

/// Conversation lifecycle marker carried by session-oriented transports (e.g. USSD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEvent {
    New,
    Resume,
    Close,
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::New => "new",
            SessionEvent::Resume => "resume",
            SessionEvent::Close => "close",
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One user message crossing the system boundary, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_id: String,
    direction: Direction,
    from_addr: String,
    to_addr: String,
    transport_name: String,
    #[serde(default = "default_endpoint")]
    endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_event: Option<SessionEvent>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: Metadata,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh id and the current time. Empty addresses or transport are rejected.
    pub fn new(
        direction: Direction,
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
        transport_name: impl Into<String>,
        content: Option<String>,
    ) -> Result<Self, EnvelopeError> {
        let msg = Self {
            message_id: new_id(),
            direction,
            from_addr: from_addr.into(),
            to_addr: to_addr.into(),
            transport_name: transport_name.into(),
            endpoint: default_endpoint(),
            content,
            in_reply_to: None,
            session_event: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn inbound(
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
        transport_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        Self::new(
            Direction::Inbound,
            from_addr,
            to_addr,
            transport_name,
            Some(content.into()),
        )
    }

    pub fn outbound(
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
        transport_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        Self::new(
            Direction::Outbound,
            from_addr,
            to_addr,
            transport_name,
            Some(content.into()),
        )
    }

    /// Route through a named endpoint instead of `default`. An empty name keeps `default`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        if !endpoint.trim().is_empty() {
            self.endpoint = endpoint;
        }
        self
    }

    pub fn with_session_event(mut self, event: SessionEvent) -> Self {
        self.session_event = Some(event);
        self
    }

    /// Return a copy with `extra` merged into the metadata (keys in `extra` win). `self` is untouched.
    pub fn with_metadata(&self, extra: Metadata) -> Self {
        let mut next = self.clone();
        next.metadata.extend(extra);
        next
    }

    /// Outbound reply to this message: addresses swapped, same transport and endpoint.
    pub fn reply(&self, content: impl Into<String>) -> Self {
        Self {
            message_id: new_id(),
            direction: Direction::Outbound,
            from_addr: self.to_addr.clone(),
            to_addr: self.from_addr.clone(),
            transport_name: self.transport_name.clone(),
            endpoint: self.endpoint.clone(),
            content: Some(content.into()),
            in_reply_to: Some(self.message_id.clone()),
            session_event: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn from_addr(&self) -> &str {
        &self.from_addr
    }

    pub fn to_addr(&self) -> &str {
        &self.to_addr
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.in_reply_to.as_deref()
    }

    pub fn session_event(&self) -> Option<SessionEvent> {
        self.session_event
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        require("message_id", &self.message_id)?;
        require("from_addr", &self.from_addr)?;
        require("to_addr", &self.to_addr)?;
        require("transport_name", &self.transport_name)?;
        require("endpoint", &self.endpoint)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Decode and re-validate a wire envelope.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let msg: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

fn require(field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        Err(EnvelopeError::EmptyField(field))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Transport accepted the message for delivery.
    Ack,
    /// Transport refused the message.
    Nack,
    DeliverySucceeded,
    DeliveryFailed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ack => "ack",
            EventStatus::Nack => "nack",
            EventStatus::DeliverySucceeded => "delivery_succeeded",
            EventStatus::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Outcome report for a previously sent outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    user_message_id: String,
    transport_name: String,
    #[serde(default = "default_endpoint")]
    endpoint: String,
    status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: Metadata,
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        user_message_id: impl Into<String>,
        transport_name: impl Into<String>,
        status: EventStatus,
        reason: Option<String>,
    ) -> Result<Self, EnvelopeError> {
        let event = Self {
            event_id: new_id(),
            user_message_id: user_message_id.into(),
            transport_name: transport_name.into(),
            endpoint: default_endpoint(),
            status,
            reason,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    fn for_message(message: &Message, status: EventStatus, reason: Option<String>) -> Self {
        Self {
            event_id: new_id(),
            user_message_id: message.message_id.clone(),
            transport_name: message.transport_name.clone(),
            endpoint: message.endpoint.clone(),
            status,
            reason,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn ack(message: &Message) -> Self {
        Self::for_message(message, EventStatus::Ack, None)
    }

    pub fn nack(message: &Message, reason: impl Into<String>) -> Self {
        Self::for_message(message, EventStatus::Nack, Some(reason.into()))
    }

    /// Delivery report; a failed report may carry the transport's reason.
    pub fn delivery_report(message: &Message, delivered: bool, reason: Option<String>) -> Self {
        let status = if delivered {
            EventStatus::DeliverySucceeded
        } else {
            EventStatus::DeliveryFailed
        };
        Self::for_message(message, status, reason)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        if !endpoint.trim().is_empty() {
            self.endpoint = endpoint;
        }
        self
    }

    pub fn with_metadata(&self, extra: Metadata) -> Self {
        let mut next = self.clone();
        next.metadata.extend(extra);
        next
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        require("event_id", &self.event_id)?;
        require("user_message_id", &self.user_message_id)?;
        require("transport_name", &self.transport_name)?;
        require("endpoint", &self.endpoint)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let event: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

/// Wire record carried on bus channels: `{ "kind": "message" | "event" | "metrics", "body": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum BusRecord {
    Message(Message),
    Event(Event),
    Metrics(MetricBatch),
}

impl BusRecord {
    /// Message or event id, if the record carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            BusRecord::Message(m) => Some(m.message_id()),
            BusRecord::Event(e) => Some(e.event_id()),
            BusRecord::Metrics(_) => None,
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let record: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        match &record {
            BusRecord::Message(m) => m.validate()?,
            BusRecord::Event(e) => e.validate()?,
            BusRecord::Metrics(_) => {}
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message::inbound("+27831234567", "*120#", "sms1", "hello")
            .unwrap()
            .with_endpoint("default")
            .with_session_event(SessionEvent::New)
            .with_metadata(Metadata::from([
                ("zeta".to_string(), json!(1.25)),
                ("alpha".to_string(), json!({"nested": [1, 2, 3]})),
            ]))
    }

    #[test]
    fn rejects_empty_required_fields() {
        assert_eq!(
            Message::inbound("", "b", "sms1", "x").unwrap_err(),
            EnvelopeError::EmptyField("from_addr")
        );
        assert_eq!(
            Message::inbound("a", " ", "sms1", "x").unwrap_err(),
            EnvelopeError::EmptyField("to_addr")
        );
        assert_eq!(
            Message::inbound("a", "b", "", "x").unwrap_err(),
            EnvelopeError::EmptyField("transport_name")
        );
    }

    #[test]
    fn direction_parsing_rejects_unknown_values() {
        assert_eq!("inbound".parse::<Direction>().unwrap(), Direction::Inbound);
        assert_eq!("outbound".parse::<Direction>().unwrap(), Direction::Outbound);
        assert!(matches!(
            "sideways".parse::<Direction>(),
            Err(EnvelopeError::InvalidDirection(_))
        ));
    }

    #[test]
    fn with_metadata_merges_without_touching_original() {
        let original = Message::inbound("a", "b", "sms1", "x")
            .unwrap()
            .with_metadata(Metadata::from([("k".to_string(), json!("old"))]));
        let enriched = original.with_metadata(Metadata::from([
            ("k".to_string(), json!("new")),
            ("extra".to_string(), json!(true)),
        ]));
        assert_eq!(original.metadata().get("k"), Some(&json!("old")));
        assert_eq!(original.metadata().len(), 1);
        assert_eq!(enriched.metadata().get("k"), Some(&json!("new")));
        assert_eq!(enriched.metadata().get("extra"), Some(&json!(true)));
        assert_eq!(enriched.message_id(), original.message_id());
        assert_eq!(enriched.content(), original.content());
    }

    fn messages() -> Vec<Message> {
        let first = sample();
        vec![
            first.clone(),
            Message::new(Direction::Outbound, "*120#", "+2783", "ussd", None).unwrap(),
            first
                .reply("bye")
                .with_session_event(SessionEvent::Close),
            Message::inbound(
                "Zoë ☎",
                "客服",
                "chat-ü",
                "héllo 🌍 \"quoted\" back\\slash\nline\ttab \u{0} \u{2028}",
            )
            .unwrap()
            .with_endpoint("опрос/1")
            .with_metadata(Metadata::from([
                ("ключ".to_string(), json!("значение \"в кавычках\"")),
                ("emoji".to_string(), json!(["🙂", "\u{1F600}", "</script>"])),
                ("big".to_string(), json!(u64::MAX)),
                ("tiny".to_string(), json!(0.1 + 0.2)),
            ])),
        ]
    }

    fn events(msg: &Message) -> Vec<Event> {
        vec![
            Event::ack(msg),
            Event::nack(msg, "throttled: \"slow down\" ⏳"),
            Event::delivery_report(msg, true, None),
            Event::delivery_report(msg, false, Some("expired".into())),
            Event::delivery_report(msg, false, None)
                .with_endpoint("dlr")
                .with_metadata(Metadata::from([("carrier".to_string(), json!("mtn"))])),
        ]
    }

    #[test]
    fn wire_round_trip_is_byte_identical() {
        for msg in messages() {
            let bytes = msg.to_wire().unwrap();
            let decoded = Message::from_wire(&bytes).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(decoded.to_wire().unwrap(), bytes);

            for event in events(&msg) {
                let bytes = event.to_wire().unwrap();
                let decoded = Event::from_wire(&bytes).unwrap();
                assert_eq!(decoded, event);
                assert_eq!(decoded.to_wire().unwrap(), bytes);
            }
        }
    }

    #[test]
    fn every_event_status_survives_the_wire() {
        let msg = sample();
        let statuses: Vec<EventStatus> = events(&msg)
            .into_iter()
            .map(|e| Event::from_wire(&e.to_wire().unwrap()).unwrap().status())
            .collect();
        for status in [
            EventStatus::Ack,
            EventStatus::Nack,
            EventStatus::DeliverySucceeded,
            EventStatus::DeliveryFailed,
        ] {
            assert!(statuses.contains(&status), "{:?} missing", status);
        }
    }

    #[test]
    fn optional_fields_round_trip_as_absent() {
        let msg = Message::new(Direction::Outbound, "*120#", "+2783", "ussd", None).unwrap();
        let decoded = Message::from_wire(&msg.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.content(), None);
        assert_eq!(decoded.in_reply_to(), None);
        assert_eq!(decoded.session_event(), None);

        let reply = sample().reply("pong");
        let decoded = Message::from_wire(&reply.to_wire().unwrap()).unwrap();
        assert!(decoded.in_reply_to().is_some());
        assert_eq!(decoded.in_reply_to(), reply.in_reply_to());
    }

    #[test]
    fn from_wire_revalidates_fields() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["from_addr"] = json!("");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert_eq!(
            Message::from_wire(&bytes).unwrap_err(),
            EnvelopeError::EmptyField("from_addr")
        );

        value["from_addr"] = json!("a");
        value["direction"] = json!("sideways");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Message::from_wire(&bytes),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn reply_swaps_addresses_and_links_original() {
        let msg = sample();
        let reply = msg.reply("pong");
        assert_eq!(reply.direction(), Direction::Outbound);
        assert_eq!(reply.from_addr(), msg.to_addr());
        assert_eq!(reply.to_addr(), msg.from_addr());
        assert_eq!(reply.in_reply_to(), Some(msg.message_id()));
        assert_eq!(reply.transport_name(), "sms1");
        assert_ne!(reply.message_id(), msg.message_id());
    }

    #[test]
    fn bus_record_carries_kind_tag() {
        let msg = sample();
        let record = BusRecord::Message(msg.clone());
        let value: serde_json::Value = serde_json::from_slice(&record.to_wire().unwrap()).unwrap();
        assert_eq!(value["kind"], json!("message"));
        let decoded = BusRecord::from_wire(&record.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.id(), Some(msg.message_id()));
    }
}
