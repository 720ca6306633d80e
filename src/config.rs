//! Configuration types for dns-masquerade.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::names::NameValidator;
use crate::resolver::Endpoint;
use crate::tunnel::WorkloadRef;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reconciliation settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Convergence checker settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Intents to seed into the store at startup.
    #[serde(default)]
    pub intents: Vec<IntentConfig>,

    /// Ingresses to seed into the store at startup; annotated ones get
    /// dependent intents.
    #[serde(default)]
    pub ingresses: Vec<IngressConfig>,
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace of the resource holding the artifact.
    #[serde(default = "default_artifact_namespace")]
    pub artifact_namespace: String,

    /// Name of the resource holding the artifact.
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// Data key under which the artifact is stored.
    #[serde(default = "default_artifact_key")]
    pub artifact_key: String,

    /// Finalizer this controller puts on intents.
    #[serde(default = "default_finalizer")]
    pub finalizer: String,

    /// Number of parallel reconciliation workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Minimum seconds between two artifact writes (0 disables debouncing).
    #[serde(default)]
    pub debounce_secs: u64,

    /// Mirror the artifact into this file after every change.
    #[serde(default)]
    pub artifact_file: Option<PathBuf>,
}

impl ControllerConfig {
    /// Debounce delay as a duration.
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            artifact_namespace: default_artifact_namespace(),
            artifact_name: default_artifact_name(),
            artifact_key: default_artifact_key(),
            finalizer: default_finalizer(),
            workers: default_workers(),
            debounce_secs: 0,
            artifact_file: None,
        }
    }
}

fn default_artifact_namespace() -> String {
    "kube-system".to_string()
}

fn default_artifact_name() -> String {
    "coredns-custom".to_string()
}

fn default_artifact_key() -> String {
    "masquerading-operator.override".to_string()
}

fn default_finalizer() -> String {
    "dns.cs.sap.com/masquerading-operator".to_string()
}

fn default_workers() -> usize {
    4
}

/// Convergence checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Whether this process runs inside the cluster (no tunnels needed).
    #[serde(default)]
    pub in_cluster: bool,

    /// DNS servers to check; when empty, the endpoints of the discovery
    /// service are checked instead.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Namespace of the cluster DNS service.
    #[serde(default = "default_discovery_namespace")]
    pub discovery_namespace: String,

    /// Name of the cluster DNS service.
    #[serde(default = "default_discovery_service")]
    pub discovery_service: String,

    /// Timeout for dialing a DNS server, in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Timeout for establishing a tunnel, in seconds.
    #[serde(default = "default_tunnel_timeout")]
    pub tunnel_timeout_secs: u64,

    /// Routable addresses of in-cluster workloads, used by the TCP relay.
    #[serde(default)]
    pub tunnel_routes: Vec<TunnelRouteConfig>,
}

impl ResolverConfig {
    /// Dial timeout as a duration.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Tunnel timeout as a duration.
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(EndpointConfig::to_endpoint).collect()
    }

    /// Relay routes keyed by workload.
    pub fn tunnel_routes(&self) -> HashMap<WorkloadRef, IpAddr> {
        self.tunnel_routes
            .iter()
            .map(|r| (WorkloadRef::new(&r.namespace, &r.name), r.upstream))
            .collect()
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            in_cluster: false,
            endpoints: Vec::new(),
            discovery_namespace: default_discovery_namespace(),
            discovery_service: default_discovery_service(),
            dial_timeout_secs: default_dial_timeout(),
            tunnel_timeout_secs: default_tunnel_timeout(),
            tunnel_routes: Vec::new(),
        }
    }
}

fn default_discovery_namespace() -> String {
    "kube-system".to_string()
}

fn default_discovery_service() -> String {
    "kube-dns".to_string()
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_tunnel_timeout() -> u64 {
    10
}

/// A DNS server to check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Server address.
    pub address: IpAddr,

    /// Server port.
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Whether the server is only reachable from inside the cluster.
    #[serde(default)]
    pub in_cluster: bool,

    /// Namespace of the serving workload (in-cluster only).
    #[serde(default)]
    pub namespace: Option<String>,

    /// Name of the serving workload (in-cluster only).
    #[serde(default)]
    pub name: Option<String>,
}

impl EndpointConfig {
    fn to_endpoint(&self) -> Endpoint {
        let workload = match (&self.namespace, &self.name) {
            (Some(namespace), Some(name)) => Some(WorkloadRef::new(namespace, name)),
            _ => None,
        };
        Endpoint {
            address: self.address,
            port: self.port,
            in_cluster: self.in_cluster,
            workload,
        }
    }
}

fn default_dns_port() -> u16 {
    53
}

/// Route from an in-cluster workload to an address this process can reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRouteConfig {
    /// Namespace of the workload.
    pub namespace: String,
    /// Name of the workload.
    pub name: String,
    /// Address to relay to.
    pub upstream: IpAddr,
}

/// An intent declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Namespace of the intent.
    #[serde(default = "default_intent_namespace")]
    pub namespace: String,
    /// Name of the intent.
    pub name: String,
    /// Source host name.
    pub from: String,
    /// Target host name or address.
    pub to: String,
}

fn default_intent_namespace() -> String {
    "default".to_string()
}

/// An ingress declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Namespace of the ingress.
    #[serde(default = "default_intent_namespace")]
    pub namespace: String,
    /// Name of the ingress.
    pub name: String,
    /// Rule hosts.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Value of the masquerade-to annotation, if any.
    #[serde(default)]
    pub masquerade_to: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dns_masquerade=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Print the module path of the emitting code (the tracing target) in
    /// each log line.
    #[serde(default = "default_log_targets")]
    pub log_targets: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_targets: default_log_targets(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_targets() -> bool {
    true
}

impl Config {
    /// Check settings that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.controller;
        if c.workers == 0 {
            return Err(ConfigError::Invalid("controller.workers must be at least 1".into()));
        }
        for (field, value) in [
            ("artifact_namespace", &c.artifact_namespace),
            ("artifact_name", &c.artifact_name),
            ("artifact_key", &c.artifact_key),
            ("finalizer", &c.finalizer),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("controller.{field} must not be empty")));
            }
        }

        let r = &self.resolver;
        if r.dial_timeout_secs == 0 || r.tunnel_timeout_secs == 0 {
            return Err(ConfigError::Invalid("resolver timeouts must be positive".into()));
        }
        if r.endpoints.is_empty() && (r.discovery_namespace.is_empty() || r.discovery_service.is_empty()) {
            return Err(ConfigError::Invalid(
                "resolver needs endpoints or a discovery service".into(),
            ));
        }
        for endpoint in &r.endpoints {
            if endpoint.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} has port 0",
                    endpoint.address
                )));
            }
            if endpoint.in_cluster && (endpoint.namespace.is_none() || endpoint.name.is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "in-cluster endpoint {} needs namespace and name",
                    endpoint.address
                )));
            }
        }

        let validator = NameValidator::strict();
        let names = self
            .intents
            .iter()
            .map(|i| ("intent", &i.name))
            .chain(self.ingresses.iter().map(|i| ("ingress", &i.name)));
        for (kind, name) in names {
            if !validator.is_valid(name, false) {
                return Err(ConfigError::Invalid(format!(
                    "{kind} name {name:?} is not a valid object name"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.controller.artifact_namespace, "kube-system");
        assert_eq!(config.controller.artifact_name, "coredns-custom");
        assert_eq!(config.controller.artifact_key, "masquerading-operator.override");
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.controller.debounce_delay(), Duration::ZERO);
        assert_eq!(config.resolver.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.resolver.tunnel_timeout(), Duration::from_secs(10));
        assert_eq!(config.resolver.discovery_namespace, "kube-system");
        assert_eq!(config.resolver.discovery_service, "kube-dns");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = Config::default();
        config.controller.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoints_or_discovery_required() {
        let mut config = Config::default();
        config.resolver.discovery_service.clear();
        assert!(config.validate().is_err());

        config.resolver.endpoints.push(EndpointConfig {
            address: "10.0.0.10".parse().unwrap(),
            port: 53,
            in_cluster: false,
            namespace: None,
            name: None,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_invalid_object_names() {
        let mut config = Config::default();
        config.ingresses.push(IngressConfig {
            namespace: "default".into(),
            name: "Shop_1".into(),
            hosts: vec!["shop.example.com".into()],
            masquerade_to: Some("lb.example.com".into()),
        });
        assert!(config.validate().is_err());

        config.ingresses[0].name = "shop".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_in_cluster_endpoint_needs_workload() {
        let mut config = Config::default();
        config.resolver.endpoints.push(EndpointConfig {
            address: "10.0.0.10".parse().unwrap(),
            port: 53,
            in_cluster: true,
            namespace: Some("kube-system".into()),
            name: None,
        });
        assert!(config.validate().is_err());

        config.resolver.endpoints[0].name = Some("coredns-0".into());
        assert!(config.validate().is_ok());
        let endpoints = config.resolver.endpoints();
        assert_eq!(
            endpoints[0].workload,
            Some(WorkloadRef::new("kube-system", "coredns-0"))
        );
    }
}
