//! Worker units and the runtime that supervises them.
//!
//! Each unit runs as its own tokio task. A unit that returns an error or panics is restarted
//! on its own, with doubling backoff, until it exhausts `max_restarts`; other units keep running.
//! Shutdown is broadcast on a `watch` channel and [`Runtime::shutdown`] waits for every unit.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::config::RuntimeConfig;

/// Flips to `true` when the runtime is shutting down.
pub type Shutdown = watch::Receiver<bool>;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Read-process-write loop. Return `Ok(())` once `shutdown` fires.
    async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()>;

    /// Ids of messages the unit had taken but not finished. Called after a failure so the
    /// runtime can account for them.
    fn take_in_flight(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    /// Delay before restart number `restart` (1-based).
    pub fn delay(&self, restart: u32) -> Duration {
        let factor = 1u32.checked_shl(restart.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for RestartPolicy {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            backoff: config.restart_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// Returned normally (shutdown or end of input).
    Stopped,
    /// Failed more often than the restart policy allows.
    GaveUp { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub name: String,
    pub restarts: u32,
    pub exit: UnitExit,
}

pub struct Runtime {
    policy: RestartPolicy,
    audit: AuditLog,
    shutdown_tx: watch::Sender<bool>,
    units: Vec<(String, JoinHandle<UnitReport>)>,
}

impl Runtime {
    pub fn new(policy: RestartPolicy, audit: AuditLog) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            policy,
            audit,
            shutdown_tx,
            units: Vec::new(),
        }
    }

    /// Start supervising `worker` on its own task.
    pub fn spawn(&mut self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        log::info!("starting unit {}", name);
        let handle = tokio::spawn(supervise(
            worker,
            self.policy,
            self.audit.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.units.push((name, handle));
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.units.iter().map(|(n, _)| n.clone()).collect()
    }

    /// A receiver that observes this runtime's shutdown.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown_tx.subscribe()
    }

    /// Signal every unit to stop and wait for all of them.
    pub async fn shutdown(self) -> Vec<UnitReport> {
        log::info!("stopping {} unit(s)", self.units.len());
        let _ = self.shutdown_tx.send(true);
        let mut reports = Vec::with_capacity(self.units.len());
        for (name, handle) in self.units {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    log::error!("supervisor for {} failed: {}", name, e);
                    reports.push(UnitReport {
                        name,
                        restarts: 0,
                        exit: UnitExit::GaveUp {
                            reason: e.to_string(),
                        },
                    });
                }
            }
        }
        reports
    }
}

async fn supervise(
    worker: Arc<dyn Worker>,
    policy: RestartPolicy,
    audit: AuditLog,
    mut shutdown: Shutdown,
) -> UnitReport {
    let name = worker.name().to_string();
    let mut restarts = 0;
    loop {
        let task = {
            let worker = worker.clone();
            let rx = shutdown.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };
        let reason = match task.await {
            Ok(Ok(())) => {
                log::info!("unit {} stopped", name);
                return UnitReport {
                    name,
                    restarts,
                    exit: UnitExit::Stopped,
                };
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) if e.is_panic() => format!("panicked: {}", panic_message(e.into_panic().as_ref())),
            Err(e) => e.to_string(),
        };

        for id in worker.take_in_flight() {
            audit.lost(&id, &name, reason.clone());
        }

        if *shutdown.borrow() {
            log::warn!("unit {} failed during shutdown: {}", name, reason);
            return UnitReport {
                name,
                restarts,
                exit: UnitExit::Stopped,
            };
        }
        if restarts >= policy.max_restarts {
            log::error!("unit {} failed {} time(s), giving up: {}", name, restarts + 1, reason);
            return UnitReport {
                name,
                restarts,
                exit: UnitExit::GaveUp { reason },
            };
        }

        restarts += 1;
        let delay = policy.delay(restarts);
        log::warn!(
            "unit {} failed: {}; restart {}/{} in {:?}",
            name,
            reason,
            restarts,
            policy.max_restarts,
            delay
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                return UnitReport {
                    name,
                    restarts,
                    exit: UnitExit::Stopped,
                };
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails its first `failures` runs (alternating error and panic), then waits for shutdown.
    struct Flaky {
        failures: u32,
        runs: AtomicU32,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, mut shutdown: Shutdown) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                if run % 2 == 0 {
                    anyhow::bail!("run {} failed", run);
                }
                panic!("run {} panicked", run);
            }
            let _ = shutdown.changed().await;
            Ok(())
        }

        fn take_in_flight(&self) -> Vec<String> {
            vec![format!("msg-{}", self.runs.load(Ordering::SeqCst))]
        }
    }

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RestartPolicy {
            max_restarts: 10,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn failed_unit_restarts_and_audits_lost_messages() {
        let (audit, mut records) = AuditLog::with_channel();
        let mut runtime = Runtime::new(policy(5), audit);
        let flaky = Arc::new(Flaky {
            failures: 2,
            runs: AtomicU32::new(0),
        });
        runtime.spawn(flaky.clone());

        for _ in 0..200 {
            if flaky.runs.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reports = runtime.shutdown().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].restarts, 2);
        assert_eq!(reports[0].exit, UnitExit::Stopped);

        let lost: Vec<_> = std::iter::from_fn(|| records.try_recv().ok()).collect();
        assert_eq!(lost.len(), 2);
        assert!(lost.iter().all(|r| r.kind == AuditKind::Lost && r.unit == "flaky"));
    }

    #[tokio::test]
    async fn unit_gives_up_after_max_restarts() {
        let mut runtime = Runtime::new(policy(1), AuditLog::new());
        runtime.spawn(Arc::new(Flaky {
            failures: u32::MAX,
            runs: AtomicU32::new(0),
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reports = runtime.shutdown().await;
        assert_eq!(reports[0].restarts, 1);
        assert!(matches!(reports[0].exit, UnitExit::GaveUp { .. }));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");
    }
}
