//! Static routing table: (transport, endpoint) -> application for inbound traffic, and the
//! reverse (application, endpoint) -> transport for outbound traffic.
//!
//! Built once at startup. Any gap or ambiguity is a [`ConfigError`]; at message time the only
//! possible miss is an endpoint no rule names, which is a per-message [`RoutingError`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::ConfigError;
use crate::message::DEFAULT_ENDPOINT;

/// One configured route. Also implies the reverse outbound route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub transport: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub application: String,
}

impl RouteRule {
    pub fn new(
        transport: impl Into<String>,
        endpoint: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        Self {
            transport: transport.into(),
            endpoint: endpoint.into(),
            application: application.into(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no route for transport {transport} endpoint {endpoint}")]
    NoInboundRoute { transport: String, endpoint: String },
    #[error("no route for application {application} endpoint {endpoint}")]
    NoOutboundRoute {
        application: String,
        endpoint: String,
    },
}

/// Key for one side of a route: unit name + endpoint name.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct EndpointKey {
    unit: String,
    endpoint: String,
}

impl EndpointKey {
    fn new(unit: &str, endpoint: &str) -> Self {
        Self {
            unit: unit.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    inbound: HashMap<EndpointKey, String>,
    outbound: HashMap<EndpointKey, String>,
    transports: Vec<String>,
    applications: Vec<String>,
}

impl RoutingTable {
    /// Validate units and rules and build both lookup directions.
    pub fn build(
        transports: &[String],
        applications: &[String],
        rules: &[RouteRule],
    ) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for (kind, list) in [("transport", transports), ("application", applications)] {
            for name in list {
                if name.trim().is_empty() {
                    return Err(ConfigError::EmptyName { kind });
                }
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::DuplicateUnit(name.clone()));
                }
            }
        }

        let mut inbound: HashMap<EndpointKey, String> = HashMap::new();
        let mut outbound: HashMap<EndpointKey, String> = HashMap::new();
        for rule in rules {
            if !transports.contains(&rule.transport) {
                return Err(ConfigError::UnknownTransport(rule.transport.clone()));
            }
            if !applications.contains(&rule.application) {
                return Err(ConfigError::UnknownApplication(rule.application.clone()));
            }
            let endpoint = if rule.endpoint.trim().is_empty() {
                DEFAULT_ENDPOINT
            } else {
                rule.endpoint.as_str()
            };

            let key = EndpointKey::new(&rule.transport, endpoint);
            match inbound.get(&key) {
                Some(existing) if existing != &rule.application => {
                    return Err(ConfigError::AmbiguousInbound {
                        transport: rule.transport.clone(),
                        endpoint: endpoint.to_string(),
                        first: existing.clone(),
                        second: rule.application.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    inbound.insert(key, rule.application.clone());
                }
            }

            let key = EndpointKey::new(&rule.application, endpoint);
            match outbound.get(&key) {
                Some(existing) if existing != &rule.transport => {
                    return Err(ConfigError::AmbiguousOutbound {
                        application: rule.application.clone(),
                        endpoint: endpoint.to_string(),
                        first: existing.clone(),
                        second: rule.transport.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    outbound.insert(key, rule.transport.clone());
                }
            }
        }

        for t in transports {
            if !inbound.keys().any(|k| &k.unit == t) {
                return Err(ConfigError::UnroutedTransport(t.clone()));
            }
        }
        for a in applications {
            if !outbound.keys().any(|k| &k.unit == a) {
                return Err(ConfigError::UnroutedApplication(a.clone()));
            }
        }

        Ok(Self {
            inbound,
            outbound,
            transports: transports.to_vec(),
            applications: applications.to_vec(),
        })
    }

    /// Application that receives inbound traffic (and events) from this transport endpoint.
    pub fn inbound_target(&self, transport: &str, endpoint: &str) -> Result<&str, RoutingError> {
        self.inbound
            .get(&EndpointKey::new(transport, endpoint))
            .map(String::as_str)
            .ok_or_else(|| RoutingError::NoInboundRoute {
                transport: transport.to_string(),
                endpoint: endpoint.to_string(),
            })
    }

    /// Transport that carries replies from this application endpoint.
    pub fn outbound_target(&self, application: &str, endpoint: &str) -> Result<&str, RoutingError> {
        self.outbound
            .get(&EndpointKey::new(application, endpoint))
            .map(String::as_str)
            .ok_or_else(|| RoutingError::NoOutboundRoute {
                application: application.to_string(),
                endpoint: endpoint.to_string(),
            })
    }

    pub fn transports(&self) -> &[String] {
        &self.transports
    }

    pub fn applications(&self) -> &[String] {
        &self.applications
    }

    /// Inbound routes as (transport, endpoint, application), sorted for display.
    pub fn inbound_routes(&self) -> Vec<(String, String, String)> {
        let mut routes: Vec<_> = self
            .inbound
            .iter()
            .map(|(k, app)| (k.unit.clone(), k.endpoint.clone(), app.clone()))
            .collect();
        routes.sort();
        routes
    }
}
