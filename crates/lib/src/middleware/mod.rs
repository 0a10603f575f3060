//! Middleware: ordered processing stages applied to every message and event.
//!
//! Inbound messages and events pass through the stages in declared order; outbound messages
//! pass in reverse, so the stage nearest the transport sees inbound traffic first and outbound
//! traffic last. A stage can drop a message (audited, not propagated). A stage that errors or
//! panics aborts only the message it was handling.

mod filter;
mod logging;
mod session;
mod tag;

pub use filter::FilterMiddleware;
pub use logging::LoggingMiddleware;
pub use session::SessionMiddleware;
pub use tag::TagMiddleware;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::config::{ConfigError, MiddlewareConfig};
use crate::message::{Event, Message};
use crate::session::{SessionStore, StoreError};
use crate::worker::panic_message;

/// What a stage decided for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    Continue(T),
    /// Discard with a reason; later stages do not run.
    Drop(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("panicked: {0}")]
    Panicked(String),
}

/// Error from one stage, tagged with the stage name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("middleware {stage}: {source}")]
pub struct PipelineError {
    pub stage: String,
    #[source]
    pub source: MiddlewareError,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn process_inbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        Ok(Flow::Continue(msg))
    }

    async fn process_outbound(&self, msg: Message) -> Result<Flow<Message>, MiddlewareError> {
        Ok(Flow::Continue(msg))
    }

    async fn process_event(&self, event: Event) -> Result<Flow<Event>, MiddlewareError> {
        Ok(Flow::Continue(event))
    }
}

/// Result of running the pipeline on one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed<T> {
    Continue(T),
    Dropped { stage: String, reason: String },
}

type StageCall<T> =
    for<'a> fn(&'a dyn Middleware, T) -> BoxFuture<'a, Result<Flow<T>, MiddlewareError>>;

fn inbound_call(m: &dyn Middleware, msg: Message) -> BoxFuture<'_, Result<Flow<Message>, MiddlewareError>> {
    m.process_inbound(msg)
}

fn outbound_call(m: &dyn Middleware, msg: Message) -> BoxFuture<'_, Result<Flow<Message>, MiddlewareError>> {
    m.process_outbound(msg)
}

fn event_call(m: &dyn Middleware, event: Event) -> BoxFuture<'_, Result<Flow<Event>, MiddlewareError>> {
    m.process_event(event)
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    audit: AuditLog,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Middleware>>, audit: AuditLog) -> Self {
        Self { stages, audit }
    }

    pub fn empty(audit: AuditLog) -> Self {
        Self::new(Vec::new(), audit)
    }

    /// Stage names in declared order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run_inbound(&self, msg: Message) -> Result<Processed<Message>, PipelineError> {
        let id = msg.message_id().to_string();
        self.run(self.stages.iter(), &id, msg, inbound_call).await
    }

    pub async fn run_outbound(&self, msg: Message) -> Result<Processed<Message>, PipelineError> {
        let id = msg.message_id().to_string();
        self.run(self.stages.iter().rev(), &id, msg, outbound_call)
            .await
    }

    pub async fn run_event(&self, event: Event) -> Result<Processed<Event>, PipelineError> {
        let id = event.event_id().to_string();
        self.run(self.stages.iter(), &id, event, event_call).await
    }

    async fn run<'s, T, I>(
        &'s self,
        order: I,
        id: &str,
        mut item: T,
        call: StageCall<T>,
    ) -> Result<Processed<T>, PipelineError>
    where
        T: Send,
        I: Iterator<Item = &'s Arc<dyn Middleware>>,
    {
        for stage in order {
            let fut = call(stage.as_ref(), item);
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(r) => r,
                Err(panic) => Err(MiddlewareError::Panicked(panic_message(panic.as_ref()))),
            };
            match result {
                Ok(Flow::Continue(next)) => item = next,
                Ok(Flow::Drop(reason)) => {
                    self.audit.dropped(id, stage.name(), reason.clone());
                    return Ok(Processed::Dropped {
                        stage: stage.name().to_string(),
                        reason,
                    });
                }
                Err(source) => {
                    return Err(PipelineError {
                        stage: stage.name().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(Processed::Continue(item))
    }
}

/// Instantiate the configured stages in order.
pub fn build_pipeline(
    configs: &[MiddlewareConfig],
    store: &SessionStore,
    audit: AuditLog,
) -> Result<Pipeline, ConfigError> {
    let mut seen = HashSet::new();
    let mut stages: Vec<Arc<dyn Middleware>> = Vec::with_capacity(configs.len());
    for config in configs {
        let name = config.name();
        if !seen.insert(name.clone()) {
            return Err(ConfigError::DuplicateMiddleware(name));
        }
        let stage: Arc<dyn Middleware> = match config {
            MiddlewareConfig::Logging { .. } => Arc::new(LoggingMiddleware::new(name)),
            MiddlewareConfig::Tag { metadata, .. } => {
                Arc::new(TagMiddleware::new(name, metadata.clone()))
            }
            MiddlewareConfig::Filter {
                content_prefix,
                blocked_addresses,
                case_insensitive,
                outbound,
                ..
            } => {
                if content_prefix.as_deref().map_or(true, str::is_empty) && blocked_addresses.is_empty()
                {
                    return Err(ConfigError::InvalidMiddleware {
                        name,
                        reason: "filter needs contentPrefix or blockedAddresses".to_string(),
                    });
                }
                Arc::new(
                    FilterMiddleware::new(name)
                        .with_content_prefix(content_prefix.clone(), *case_insensitive)
                        .with_blocked_addresses(blocked_addresses.iter().cloned())
                        .filter_outbound(*outbound),
                )
            }
            MiddlewareConfig::Session { ttl_secs, .. } => Arc::new(SessionMiddleware::new(
                name,
                store.clone(),
                ttl_secs.map(Duration::from_secs),
            )),
        };
        stages.push(stage);
    }
    Ok(Pipeline::new(stages, audit))
}
