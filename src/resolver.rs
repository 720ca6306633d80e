//! Convergence checking against the cluster DNS servers.
//!
//! [`Resolver::check_record`] asks every known DNS server, concurrently,
//! whether `host` resolves to the same addresses as the expected result. The
//! check is fail-closed: one mismatch or one technical error on any server
//! makes the whole check inactive, and every technical error is reported.
//!
//! ```text
//!                        ┌──────────────┐
//!   check_record ──────► │EndpointSource│ ─► [e1, e2, ..., eN]
//!                        └──────────────┘
//!        │ JoinSet: one probe per endpoint
//!        ▼
//!   probe(e) ─┬─ direct:   lookup(host @ e), lookup(expected @ e)
//!             └─ tunneled: TunnelGuard ─► lookup(host @ 127.0.0.1:p), ...
//!        │
//!        ▼
//!   fan-in in endpoint order: active = AND, errors = concatenation
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{LookupIpStrategy, NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CheckError, LookupError, ProbeError, TunnelError};
use crate::metrics::{self, ProbeResult, Timer};
use crate::resources::{PortProtocol, ServiceEndpoints};
use crate::store::{ObjectKey, ObjectStore};
use crate::tunnel::{TunnelGuard, TunnelProvider, WorkloadRef};

/// A DNS server to check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Server address.
    pub address: IpAddr,
    /// Server port.
    pub port: u16,
    /// Whether the server is only reachable from inside the cluster.
    pub in_cluster: bool,
    /// Workload serving the endpoint; required to tunnel to in-cluster servers.
    pub workload: Option<WorkloadRef>,
}

impl Endpoint {
    /// A server reachable from anywhere.
    pub fn direct(address: SocketAddr) -> Self {
        Self {
            address: address.ip(),
            port: address.port(),
            in_cluster: false,
            workload: None,
        }
    }

    /// A server only reachable through the given workload.
    pub fn in_cluster(address: SocketAddr, workload: WorkloadRef) -> Self {
        Self {
            address: address.ip(),
            port: address.port(),
            in_cluster: true,
            workload: Some(workload),
        }
    }

    /// Server socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workload {
            Some(workload) if self.in_cluster => write!(f, "{}:{} ({workload})", self.address, self.port),
            _ => write!(f, "{}", self.socket_addr()),
        }
    }
}

/// Resolves a name against one specific server.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Sorted addresses of `host` as answered by `server`; a name without
    /// records yields an empty list, not an error.
    async fn lookup(&self, host: &str, server: SocketAddr) -> Result<Vec<IpAddr>, LookupError>;
}

/// [`Lookup`] over a fresh, cache-less hickory resolver per query, pinned to
/// the given server over TCP.
#[derive(Debug, Clone)]
pub struct HickoryLookup {
    dial_timeout: Duration,
}

impl HickoryLookup {
    /// Create a lookup with the given per-query timeout.
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for HickoryLookup {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Lookup for HickoryLookup {
    async fn lookup(&self, host: &str, server: SocketAddr) -> Result<Vec<IpAddr>, LookupError> {
        if let Ok(address) = host.parse::<IpAddr>() {
            return Ok(vec![address]);
        }

        let config = ResolverConfig::from_parts(
            None,
            vec![],
            vec![NameServerConfig::new(server, Protocol::Tcp)],
        );
        let mut opts = ResolverOpts::default();
        opts.timeout = self.dial_timeout;
        opts.attempts = 1;
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        let resolver = hickory_resolver::Resolver::builder_with_config(
            config,
            TokioConnectionProvider::default(),
        )
        .with_options(opts)
        .build();

        match resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let mut addresses: Vec<IpAddr> = lookup.iter().collect();
                addresses.sort();
                addresses.dedup();
                Ok(addresses)
            }
            Err(e) if e.is_no_records_found() => Ok(Vec::new()),
            Err(e) => Err(LookupError {
                host: host.to_string(),
                server: server.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Supplies the set of DNS servers to check.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Current endpoints; failures surface as [`CheckError::Discovery`].
    async fn endpoints(&self) -> Result<Vec<Endpoint>, CheckError>;
}

/// Fixed, explicitly configured endpoints.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints(Vec<Endpoint>);

impl StaticEndpoints {
    /// Wrap a list of endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self(endpoints)
    }
}

#[async_trait]
impl EndpointSource for StaticEndpoints {
    async fn endpoints(&self) -> Result<Vec<Endpoint>, CheckError> {
        Ok(self.0.clone())
    }
}

/// Endpoints of the cluster DNS service, looked up on every check.
///
/// The service must expose TCP port 53; the matching endpoint port of each
/// subset is used for every address backed by a pod. Addresses without a pod
/// reference are skipped, as they cannot be tunneled to.
#[derive(Clone)]
pub struct ClusterEndpoints {
    services: Arc<dyn ObjectStore<ServiceEndpoints>>,
    service: ObjectKey,
}

impl ClusterEndpoints {
    /// Discover the endpoints of `namespace/name`.
    pub fn new(services: Arc<dyn ObjectStore<ServiceEndpoints>>, namespace: &str, name: &str) -> Self {
        Self {
            services,
            service: ObjectKey::new(namespace, name),
        }
    }
}

#[async_trait]
impl EndpointSource for ClusterEndpoints {
    async fn endpoints(&self) -> Result<Vec<Endpoint>, CheckError> {
        let service = self
            .services
            .get(&self.service)
            .await
            .map_err(|e| CheckError::Discovery(e.to_string()))?
            .ok_or_else(|| CheckError::Discovery(format!("service {} not found", self.service)))?;

        let port_name = service
            .ports
            .iter()
            .find(|p| p.protocol == PortProtocol::Tcp && p.port == 53)
            .map(|p| p.name.as_str())
            .ok_or_else(|| {
                CheckError::Discovery(format!("service {} does not have port tcp/53", self.service))
            })?;

        let mut endpoints: Vec<Endpoint> = Vec::new();
        for subset in &service.subsets {
            let Some(port) = subset.ports.iter().find(|p| p.name == port_name).map(|p| p.port) else {
                continue;
            };
            for (address, target) in &subset.addresses {
                let Some(target) = target.as_ref().filter(|t| t.kind == "Pod") else {
                    continue;
                };
                let endpoint = Endpoint::in_cluster(
                    SocketAddr::new(*address, port),
                    WorkloadRef::new(&target.namespace, &target.name),
                );
                if !endpoints.contains(&endpoint) {
                    endpoints.push(endpoint);
                }
            }
        }

        debug!(service = %self.service, endpoints = endpoints.len(), "discovered DNS endpoints");
        Ok(endpoints)
    }
}

/// Configured endpoints if there are any, otherwise discovery of the
/// configured cluster DNS service.
pub fn endpoint_source(
    config: &crate::config::ResolverConfig,
    services: Arc<dyn ObjectStore<ServiceEndpoints>>,
) -> Arc<dyn EndpointSource> {
    let endpoints = config.endpoints();
    if endpoints.is_empty() {
        Arc::new(ClusterEndpoints::new(
            services,
            &config.discovery_namespace,
            &config.discovery_service,
        ))
    } else {
        Arc::new(StaticEndpoints::new(endpoints))
    }
}

/// Something that can tell whether a rewrite has taken effect.
#[async_trait]
pub trait RecordChecker: Send + Sync {
    /// Whether every DNS server resolves `host` like `expected`; an empty
    /// `expected` means `host` must not resolve at all.
    async fn check_record(&self, host: &str, expected: &str) -> Result<bool, CheckError>;
}

/// Result of probing one endpoint.
#[derive(Debug, Default)]
struct Probe {
    active: bool,
    errors: Vec<ProbeError>,
}

impl Probe {
    fn failed(error: ProbeError) -> Self {
        Self {
            active: false,
            errors: vec![error],
        }
    }
}

/// Multi-endpoint convergence checker.
#[derive(Clone)]
pub struct Resolver {
    lookup: Arc<dyn Lookup>,
    endpoints: Arc<dyn EndpointSource>,
    tunnels: Option<Arc<dyn TunnelProvider>>,
    in_cluster: bool,
    tunnel_timeout: Duration,
    shutdown: CancellationToken,
}

impl Resolver {
    /// Create a resolver that runs outside the cluster, without tunnels.
    pub fn new(lookup: Arc<dyn Lookup>, endpoints: Arc<dyn EndpointSource>) -> Self {
        Self {
            lookup,
            endpoints,
            tunnels: None,
            in_cluster: false,
            tunnel_timeout: Duration::from_secs(10),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `provider` to reach in-cluster endpoints.
    pub fn with_tunnels(mut self, provider: Arc<dyn TunnelProvider>) -> Self {
        self.tunnels = Some(provider);
        self
    }

    /// Declare whether this process runs inside the cluster.
    pub fn in_cluster(mut self, in_cluster: bool) -> Self {
        self.in_cluster = in_cluster;
        self
    }

    /// Bound tunnel establishment.
    pub fn with_tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_timeout = timeout;
        self
    }

    /// Abort in-flight probes when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn probe(&self, endpoint: &Endpoint, host: &str, expected: &str) -> Probe {
        let tunneled = endpoint.in_cluster && !self.in_cluster;
        let timer = Timer::start();

        let probe = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => Probe::failed(ProbeError::Cancelled {
                endpoint: endpoint.to_string(),
            }),

            probe = self.probe_inner(endpoint, tunneled, host, expected) => probe,
        };

        let result = if probe.errors.iter().any(|e| matches!(e, ProbeError::Cancelled { .. })) {
            ProbeResult::Cancelled
        } else if !probe.errors.is_empty() {
            ProbeResult::Error
        } else if probe.active {
            ProbeResult::Active
        } else {
            ProbeResult::Inactive
        };
        metrics::record_probe(result, tunneled, timer.elapsed());
        probe
    }

    async fn probe_inner(&self, endpoint: &Endpoint, tunneled: bool, host: &str, expected: &str) -> Probe {
        // Held until the probe ends.
        let mut _tunnel = None;
        let server = if tunneled {
            match self.open_tunnel(endpoint).await {
                Ok(guard) => {
                    let local = guard.local_addr();
                    _tunnel = Some(guard);
                    local
                }
                Err(e) => return Probe::failed(e.into()),
            }
        } else {
            endpoint.socket_addr()
        };

        debug!(%endpoint, %server, host, expected, "starting lookup");

        let mut errors = Vec::new();
        let addresses = match self.lookup.lookup(host, server).await {
            Ok(addresses) => addresses,
            Err(e) => {
                errors.push(ProbeError::from(e));
                Vec::new()
            }
        };

        let active = if expected.is_empty() {
            errors.is_empty() && addresses.is_empty()
        } else {
            let expected_addresses = match self.lookup.lookup(expected, server).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    errors.push(ProbeError::from(e));
                    Vec::new()
                }
            };
            errors.is_empty() && !addresses.is_empty() && addresses == expected_addresses
        };

        debug!(%endpoint, host, active, errors = errors.len(), "lookup finished");
        Probe { active, errors }
    }

    async fn open_tunnel(&self, endpoint: &Endpoint) -> Result<TunnelGuard, TunnelError> {
        let workload = endpoint
            .workload
            .as_ref()
            .ok_or_else(|| TunnelError::MissingWorkload {
                address: endpoint.socket_addr().to_string(),
            })?;
        let provider = self.tunnels.as_deref().ok_or_else(|| TunnelError::Unavailable {
            target: format!("{workload}:{}", endpoint.port),
        })?;
        TunnelGuard::open(provider, workload, endpoint.port, self.tunnel_timeout).await
    }
}

#[async_trait]
impl RecordChecker for Resolver {
    async fn check_record(&self, host: &str, expected: &str) -> Result<bool, CheckError> {
        let endpoints = self.endpoints.endpoints().await?;
        if endpoints.is_empty() {
            debug!(host, "no DNS endpoints; check is vacuously active");
            return Ok(true);
        }

        let mut tasks = JoinSet::new();
        let mut indices = HashMap::with_capacity(endpoints.len());
        for (index, endpoint) in endpoints.iter().cloned().enumerate() {
            let this = self.clone();
            let host = host.to_string();
            let expected = expected.to_string();
            let handle = tasks.spawn(async move { this.probe(&endpoint, &host, &expected).await });
            indices.insert(handle.id(), index);
        }

        let mut outcomes: Vec<Option<Result<Probe, String>>> = endpoints.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, probe)) => (id, Ok(probe)),
                Err(e) => (e.id(), Err(e.to_string())),
            };
            if let Some(&index) = indices.get(&id) {
                outcomes[index] = Some(outcome);
            }
        }

        let mut active = true;
        let mut errors = Vec::new();
        for (endpoint, outcome) in endpoints.iter().zip(outcomes) {
            let probe = match outcome {
                Some(Ok(probe)) => probe,
                Some(Err(reason)) => Probe::failed(ProbeError::Aborted {
                    endpoint: endpoint.to_string(),
                    reason,
                }),
                None => Probe::failed(ProbeError::Aborted {
                    endpoint: endpoint.to_string(),
                    reason: "task terminated abnormally".to_string(),
                }),
            };
            active &= probe.active && probe.errors.is_empty();
            errors.extend(probe.errors);
        }

        if errors.is_empty() {
            Ok(active)
        } else {
            warn!(host, errors = errors.len(), "DNS check failed");
            Err(CheckError::Probes(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{EndpointPort, EndpointSubset, ServicePort, TargetRef};
    use crate::store::MemoryStore;
    use crate::tunnel::Tunnel;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Per-server answer tables; unknown servers fail.
    #[derive(Default)]
    struct FakeLookup {
        answers: HashMap<SocketAddr, HashMap<String, Vec<IpAddr>>>,
        queried: Mutex<Vec<(String, SocketAddr)>>,
    }

    impl FakeLookup {
        fn answer(mut self, server: SocketAddr, host: &str, addresses: &[&str]) -> Self {
            self.answers
                .entry(server)
                .or_default()
                .insert(host.to_string(), addresses.iter().map(|a| a.parse().unwrap()).collect());
            self
        }
    }

    #[async_trait]
    impl Lookup for FakeLookup {
        async fn lookup(&self, host: &str, server: SocketAddr) -> Result<Vec<IpAddr>, LookupError> {
            self.queried.lock().push((host.to_string(), server));
            if let Ok(address) = host.parse::<IpAddr>() {
                return Ok(vec![address]);
            }
            match self.answers.get(&server) {
                Some(table) => Ok(table.get(host).cloned().unwrap_or_default()),
                None => Err(LookupError {
                    host: host.to_string(),
                    server: server.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }
    }

    struct LocalTunnel {
        local: SocketAddr,
        closes: Arc<AtomicUsize>,
    }

    impl Tunnel for LocalTunnel {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opens tunnels to a fixed local address, or fails for unknown workloads.
    struct FakeTunnels {
        local: SocketAddr,
        known: Vec<WorkloadRef>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TunnelProvider for FakeTunnels {
        async fn open(&self, workload: &WorkloadRef, port: u16) -> Result<Box<dyn Tunnel>, TunnelError> {
            if !self.known.contains(workload) {
                return Err(TunnelError::Open {
                    target: format!("{workload}:{port}"),
                    reason: "pod not found".into(),
                });
            }
            Ok(Box::new(LocalTunnel {
                local: self.local,
                closes: self.closes.clone(),
            }))
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 53)
    }

    fn resolver(lookup: FakeLookup, endpoints: Vec<Endpoint>) -> Resolver {
        Resolver::new(Arc::new(lookup), Arc::new(StaticEndpoints::new(endpoints)))
    }

    #[tokio::test]
    async fn test_no_endpoints_is_active() {
        let r = resolver(FakeLookup::default(), vec![]);
        assert!(r.check_record("a.example.com", "1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_all_endpoints_agree() {
        let lookup = FakeLookup::default()
            .answer(addr(1), "a.example.com", &["10.1.1.1", "10.1.1.2"])
            .answer(addr(1), "target.example.com", &["10.1.1.2", "10.1.1.1"])
            .answer(addr(2), "a.example.com", &["10.1.1.1", "10.1.1.2"])
            .answer(addr(2), "target.example.com", &["10.1.1.1", "10.1.1.2"]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1)), Endpoint::direct(addr(2))]);
        assert!(r.check_record("a.example.com", "target.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_address_target() {
        let lookup = FakeLookup::default().answer(addr(1), "a.example.com", &["1.2.3.4"]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1))]);
        assert!(r.check_record("a.example.com", "1.2.3.4").await.unwrap());
        assert!(!r.check_record("a.example.com", "1.2.3.5").await.unwrap());
    }

    #[tokio::test]
    async fn test_one_mismatch_is_inactive_without_error() {
        let lookup = FakeLookup::default()
            .answer(addr(1), "a.example.com", &["1.2.3.4"])
            .answer(addr(2), "a.example.com", &["9.9.9.9"]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1)), Endpoint::direct(addr(2))]);
        assert_eq!(r.check_record("a.example.com", "1.2.3.4").await, Ok(false));
    }

    #[tokio::test]
    async fn test_unresolved_host_is_inactive() {
        let lookup = FakeLookup::default().answer(addr(1), "target.example.com", &[]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1))]);
        // Both sides empty still counts as not converged.
        assert_eq!(r.check_record("a.example.com", "target.example.com").await, Ok(false));
    }

    #[tokio::test]
    async fn test_empty_expectation() {
        let lookup = FakeLookup::default()
            .answer(addr(1), "gone.example.com", &[])
            .answer(addr(2), "gone.example.com", &["1.2.3.4"]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1))]);
        assert!(r.check_record("gone.example.com", "").await.unwrap());

        let lookup = FakeLookup::default()
            .answer(addr(1), "gone.example.com", &[])
            .answer(addr(2), "gone.example.com", &["1.2.3.4"]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1)), Endpoint::direct(addr(2))]);
        assert!(!r.check_record("gone.example.com", "").await.unwrap());
    }

    #[tokio::test]
    async fn test_technical_error_fails_closed_and_queries_everyone() {
        let lookup = Arc::new(FakeLookup::default().answer(addr(1), "a.example.com", &["1.2.3.4"]));
        let r = Resolver::new(
            lookup.clone(),
            Arc::new(StaticEndpoints::new(vec![
                Endpoint::direct(addr(1)),
                Endpoint::direct(addr(2)),
            ])),
        );
        let err = r.check_record("a.example.com", "1.2.3.4").await.unwrap_err();
        match err {
            CheckError::Probes(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(&errors[0], ProbeError::Lookup(e) if e.server == "10.0.0.2:53"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let queried = lookup.queried.lock();
        assert!(queried.iter().any(|(_, s)| *s == addr(1)));
        assert!(queried.iter().any(|(_, s)| *s == addr(2)));
    }

    #[tokio::test]
    async fn test_tunnel_failure_is_reported() {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10053);
        let lookup = FakeLookup::default()
            .answer(addr(1), "a.example.com", &["1.2.3.4"])
            .answer(local, "a.example.com", &["1.2.3.4"]);
        let closes = Arc::new(AtomicUsize::new(0));
        let tunnels = FakeTunnels {
            local,
            known: vec![],
            closes: closes.clone(),
        };
        let r = resolver(
            lookup,
            vec![
                Endpoint::direct(addr(1)),
                Endpoint::in_cluster(addr(2), WorkloadRef::new("kube-system", "coredns-b")),
            ],
        )
        .with_tunnels(Arc::new(tunnels));

        match r.check_record("a.example.com", "1.2.3.4").await {
            Err(CheckError::Probes(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], ProbeError::Tunnel(TunnelError::Open { .. })));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tunnel_is_used_and_released() {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10053);
        let lookup = FakeLookup::default().answer(local, "a.example.com", &["1.2.3.4"]);
        let closes = Arc::new(AtomicUsize::new(0));
        let workload = WorkloadRef::new("kube-system", "coredns-a");
        let tunnels = FakeTunnels {
            local,
            known: vec![workload.clone()],
            closes: closes.clone(),
        };
        let r = resolver(lookup, vec![Endpoint::in_cluster(addr(1), workload)])
            .with_tunnels(Arc::new(tunnels));

        assert!(r.check_record("a.example.com", "1.2.3.4").await.unwrap());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_cluster_process_dials_directly() {
        let lookup = FakeLookup::default().answer(addr(1), "a.example.com", &["1.2.3.4"]);
        let r = resolver(
            lookup,
            vec![Endpoint::in_cluster(addr(1), WorkloadRef::new("kube-system", "coredns-a"))],
        )
        .in_cluster(true);
        assert!(r.check_record("a.example.com", "1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_tunnel_provider() {
        let r = resolver(
            FakeLookup::default(),
            vec![Endpoint::in_cluster(addr(1), WorkloadRef::new("kube-system", "coredns-a"))],
        );
        match r.check_record("a.example.com", "1.2.3.4").await {
            Err(CheckError::Probes(errors)) => {
                assert!(matches!(errors[0], ProbeError::Tunnel(TunnelError::Unavailable { .. })));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_probes() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let lookup = FakeLookup::default().answer(addr(1), "a.example.com", &["1.2.3.4"]);
        let r = resolver(lookup, vec![Endpoint::direct(addr(1))]).with_shutdown(shutdown);
        match r.check_record("a.example.com", "1.2.3.4").await {
            Err(CheckError::Probes(errors)) => {
                assert!(matches!(errors[0], ProbeError::Cancelled { .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    /// Panics for every server it is asked about, naming the server.
    struct PanickingLookup;

    #[async_trait]
    impl Lookup for PanickingLookup {
        async fn lookup(&self, _host: &str, server: SocketAddr) -> Result<Vec<IpAddr>, LookupError> {
            tokio::task::yield_now().await;
            panic!("lookup blew up at {server}");
        }
    }

    #[tokio::test]
    async fn test_aborted_lookups_keep_their_endpoint() {
        let endpoints: Vec<Endpoint> = (1..=4).map(|i| Endpoint::direct(addr(i))).collect();
        let r = Resolver::new(Arc::new(PanickingLookup), Arc::new(StaticEndpoints::new(endpoints.clone())));
        let Err(CheckError::Probes(errors)) = r.check_record("a.example.com", "b.example.com").await else {
            panic!("expected probe errors");
        };
        assert_eq!(errors.len(), 4);
        for (endpoint, error) in endpoints.iter().zip(&errors) {
            match error {
                ProbeError::Aborted { endpoint: name, reason } => {
                    assert_eq!(name, &endpoint.to_string());
                    assert!(reason.contains(&endpoint.to_string()), "{reason}");
                }
                other => panic!("unexpected probe error {other:?}"),
            }
        }
    }

    fn pod(ip: &str, name: &str) -> (IpAddr, Option<TargetRef>) {
        let target = TargetRef {
            kind: "Pod".into(),
            namespace: "kube-system".into(),
            name: name.into(),
        };
        (ip.parse().unwrap(), Some(target))
    }

    fn kube_dns() -> ServiceEndpoints {
        let mut service = ServiceEndpoints::new("kube-system", "kube-dns");
        service.ports = vec![
            ServicePort {
                name: "dns".into(),
                protocol: PortProtocol::Udp,
                port: 53,
            },
            ServicePort {
                name: "dns-tcp".into(),
                protocol: PortProtocol::Tcp,
                port: 53,
            },
        ];
        service.subsets = vec![
            EndpointSubset {
                addresses: vec![pod("100.64.0.10", "coredns-a"), pod("100.64.0.11", "coredns-b")],
                ports: vec![
                    EndpointPort {
                        name: "dns".into(),
                        port: 8053,
                    },
                    EndpointPort {
                        name: "dns-tcp".into(),
                        port: 8054,
                    },
                ],
            },
            // No port named like the TCP service port.
            EndpointSubset {
                addresses: vec![pod("100.64.0.12", "coredns-c")],
                ports: vec![EndpointPort {
                    name: "metrics".into(),
                    port: 9153,
                }],
            },
            EndpointSubset {
                addresses: vec![("100.64.0.13".parse().unwrap(), None), pod("100.64.0.10", "coredns-a")],
                ports: vec![EndpointPort {
                    name: "dns-tcp".into(),
                    port: 8054,
                }],
            },
        ];
        service
    }

    #[tokio::test]
    async fn test_cluster_endpoints_discovery() {
        let services = MemoryStore::<ServiceEndpoints>::new();
        services.create(kube_dns()).await.unwrap();
        let source = ClusterEndpoints::new(Arc::new(services), "kube-system", "kube-dns");

        let endpoints = source.endpoints().await.unwrap();
        assert_eq!(
            endpoints,
            vec![
                Endpoint::in_cluster("100.64.0.10:8054".parse().unwrap(), WorkloadRef::new("kube-system", "coredns-a")),
                Endpoint::in_cluster("100.64.0.11:8054".parse().unwrap(), WorkloadRef::new("kube-system", "coredns-b")),
            ]
        );
    }

    #[tokio::test]
    async fn test_cluster_endpoints_errors() {
        let services = MemoryStore::<ServiceEndpoints>::new();
        let source = ClusterEndpoints::new(Arc::new(services.clone()), "kube-system", "kube-dns");
        assert_eq!(
            source.endpoints().await,
            Err(CheckError::Discovery("service kube-system/kube-dns not found".into()))
        );

        let mut service = kube_dns();
        service.ports.retain(|p| p.protocol == PortProtocol::Udp);
        services.create(service).await.unwrap();
        assert_eq!(
            source.endpoints().await,
            Err(CheckError::Discovery(
                "service kube-system/kube-dns does not have port tcp/53".into()
            ))
        );

        // A failed discovery fails the check instead of passing it vacuously.
        let r = Resolver::new(Arc::new(FakeLookup::default()), Arc::new(source));
        assert!(matches!(
            r.check_record("a.example.com", "1.2.3.4").await,
            Err(CheckError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_endpoint_source_prefers_configured_endpoints() {
        let services = MemoryStore::<ServiceEndpoints>::new();
        services.create(kube_dns()).await.unwrap();
        let services: Arc<dyn ObjectStore<ServiceEndpoints>> = Arc::new(services);

        let mut config = crate::config::ResolverConfig::default();
        let discovered = endpoint_source(&config, services.clone()).endpoints().await.unwrap();
        assert_eq!(discovered.len(), 2);
        assert!(discovered.iter().all(|e| e.in_cluster));

        config.endpoints.push(crate::config::EndpointConfig {
            address: "10.0.0.1".parse().unwrap(),
            port: 53,
            in_cluster: false,
            namespace: None,
            name: None,
        });
        let configured = endpoint_source(&config, services).endpoints().await.unwrap();
        assert_eq!(configured, vec![Endpoint::direct(addr(1))]);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::direct(addr(1)).to_string(), "10.0.0.1:53");
        assert_eq!(
            Endpoint::in_cluster(addr(1), WorkloadRef::new("kube-system", "coredns-a")).to_string(),
            "10.0.0.1:53 (kube-system/coredns-a)"
        );
    }
}
