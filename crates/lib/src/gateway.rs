//! Gateway: builds every unit from the config and runs them on one [`Runtime`].

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::application::{build_application, ApplicationWorker};
use crate::audit::AuditLog;
use crate::bus::{LocalBus, MessageBus};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::metrics::{MetricManager, MetricsConsumer, MetricsPublisher};
use crate::middleware::build_pipeline;
use crate::routing::RoutingTable;
use crate::session::SessionStore;
use crate::worker::{RestartPolicy, Runtime, UnitExit};

pub struct Gateway {
    config: Config,
    bus: Arc<LocalBus>,
    store: SessionStore,
    audit: AuditLog,
    metrics: MetricManager,
    routes: Arc<RoutingTable>,
    stages: Vec<String>,
    dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    /// Validate the config and wire up the bus, store, pipeline and dispatcher.
    /// Nothing runs until [`Gateway::start`].
    pub fn new(config: Config, audit: AuditLog) -> Result<Self> {
        let routes = Arc::new(config.routing_table().context("invalid routes")?);
        let bus = Arc::new(LocalBus::new(
            config.runtime.bus_capacity,
            config.runtime.publish_timeout(),
        ));
        let store = SessionStore::from_config(&config.store);
        let pipeline = build_pipeline(&config.middleware, &store, audit.clone())
            .context("invalid middleware")?;
        let stages = pipeline.stage_names();
        let metrics = MetricManager::new(config.metrics.prefix.clone());
        let mut dispatcher = Dispatcher::new(
            &config.dispatcher,
            routes.clone(),
            pipeline,
            bus.clone(),
            audit.clone(),
        );
        if config.metrics.enabled {
            dispatcher = dispatcher.with_metrics(&metrics);
        }
        Ok(Self {
            config,
            bus,
            store,
            audit,
            metrics,
            routes,
            stages,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    pub fn local_bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Middleware stage names in declared order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn metrics(&self) -> &MetricManager {
        &self.metrics
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Spawn the dispatcher, the in-process applications and the metrics units.
    pub async fn start(&self) -> Runtime {
        let mut runtime = Runtime::new(RestartPolicy::from(&self.config.runtime), self.audit.clone());
        runtime.spawn(self.dispatcher.clone());
        for app in &self.config.applications {
            match build_application(app) {
                Some(imp) => runtime.spawn(Arc::new(ApplicationWorker::new(
                    app.name.clone(),
                    imp,
                    self.bus(),
                    self.audit.clone(),
                ))),
                None => log::info!("application {} is external; routing only", app.name),
            }
        }
        if self.config.metrics.enabled {
            runtime.spawn(Arc::new(MetricsPublisher::new(
                self.metrics.clone(),
                self.bus(),
                self.config.metrics.publish_interval(),
            )));
            let consumer = MetricsConsumer::new(&*self.bus, |dp| {
                log::debug!("metric {} = {} at {}", dp.name, dp.value, dp.timestamp);
            })
            .await;
            runtime.spawn(Arc::new(consumer));
        }
        runtime
    }
}

/// Run the gateway until SIGINT or SIGTERM, then stop every unit. With metrics enabled the
/// gateway's manager also becomes the global recorder, so applications can use
/// `metrics::counter!` and friends.
pub async fn run_gateway(config: Config) -> Result<()> {
    let metrics_enabled = config.metrics.enabled;
    let gateway = Gateway::new(config, AuditLog::new())?;
    if metrics_enabled {
        if let Err(e) = gateway.metrics().install() {
            log::warn!("metrics: {}", e);
        }
    }
    for (transport, endpoint, app) in gateway.routes().inbound_routes() {
        log::info!("route {}/{} -> {}", transport, endpoint, app);
    }
    let runtime = gateway.start().await;
    log::info!("gateway running units: {}", runtime.unit_names().join(", "));

    shutdown_signal().await;
    log::info!("shutdown signal received, stopping units");

    for report in runtime.shutdown().await {
        match report.exit {
            UnitExit::Stopped => log::info!("{} stopped after {} restart(s)", report.name, report.restarts),
            UnitExit::GaveUp { reason } => log::error!("{} had given up: {}", report.name, reason),
        }
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
