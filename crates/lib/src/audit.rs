//! Audit trail for messages that end without delivery: drops, failures and losses.
//!
//! Every record is logged. When built with [`AuditLog::with_channel`], records are also sent
//! to a receiver so callers (and tests) can inspect them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    /// Discarded on purpose (middleware drop, duplicate).
    Dropped,
    /// Terminal error while processing.
    Failed,
    /// Owned by a unit that failed before finishing it.
    Lost,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub message_id: String,
    pub unit: String,
    pub kind: AuditKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct AuditLog {
    tx: Option<mpsc::UnboundedSender<AuditRecord>>,
}

impl AuditLog {
    /// Log-only audit trail.
    pub fn new() -> Self {
        Self { tx: None }
    }

    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn record(&self, record: AuditRecord) {
        match record.kind {
            AuditKind::Dropped => log::info!(
                "audit: {} dropped message {}: {}",
                record.unit,
                record.message_id,
                record.reason
            ),
            AuditKind::Failed => log::warn!(
                "audit: {} failed message {}: {}",
                record.unit,
                record.message_id,
                record.reason
            ),
            AuditKind::Lost => log::error!(
                "audit: {} lost in-flight message {}: {}",
                record.unit,
                record.message_id,
                record.reason
            ),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(record);
        }
    }

    fn emit(&self, kind: AuditKind, message_id: &str, unit: &str, reason: impl Into<String>) {
        self.record(AuditRecord {
            message_id: message_id.to_string(),
            unit: unit.to_string(),
            kind,
            reason: reason.into(),
            at: Utc::now(),
        });
    }

    pub fn dropped(&self, message_id: &str, unit: &str, reason: impl Into<String>) {
        self.emit(AuditKind::Dropped, message_id, unit, reason);
    }

    pub fn failed(&self, message_id: &str, unit: &str, reason: impl Into<String>) {
        self.emit(AuditKind::Failed, message_id, unit, reason);
    }

    pub fn lost(&self, message_id: &str, unit: &str, reason: impl Into<String>) {
        self.emit(AuditKind::Lost, message_id, unit, reason);
    }
}
