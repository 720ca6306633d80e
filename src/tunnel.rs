//! Tunnels to DNS servers that are only reachable from inside the cluster.
//!
//! When the checker runs outside the cluster, each in-cluster endpoint is
//! probed through a short-lived local relay. [`TunnelGuard`] ties the relay's
//! lifetime to the probe: it is closed when the guard drops, whatever the
//! probe's outcome.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TunnelError;

/// Identity of the in-cluster workload serving an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    /// Namespace of the workload.
    pub namespace: String,
    /// Name of the workload.
    pub name: String,
}

impl WorkloadRef {
    /// Build a reference from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// An open tunnel.
pub trait Tunnel: Send + Sync {
    /// Local address that relays to the remote target.
    fn local_addr(&self) -> SocketAddr;

    /// Release the tunnel. Must be safe to call more than once.
    fn close(&self);
}

/// Opens tunnels to in-cluster workloads.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel to `port` of `workload`, bound to an ephemeral local port.
    async fn open(&self, workload: &WorkloadRef, port: u16) -> Result<Box<dyn Tunnel>, TunnelError>;
}

/// Closes the wrapped tunnel on drop.
pub struct TunnelGuard {
    tunnel: Box<dyn Tunnel>,
}

impl TunnelGuard {
    /// Open a tunnel, failing with [`TunnelError::Timeout`] if it is not ready within `timeout`.
    pub async fn open(
        provider: &dyn TunnelProvider,
        workload: &WorkloadRef,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, TunnelError> {
        match tokio::time::timeout(timeout, provider.open(workload, port)).await {
            Ok(Ok(tunnel)) => {
                debug!(target = %workload, port, local = %tunnel.local_addr(), "tunnel opened");
                Ok(Self { tunnel })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TunnelError::Timeout {
                target: format!("{workload}:{port}"),
            }),
        }
    }

    /// Local address of the tunnel.
    pub fn local_addr(&self) -> SocketAddr {
        self.tunnel.local_addr()
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.tunnel.close();
    }
}

// --- TCP relay ---

/// Tunnel provider relaying loopback TCP connections to a routable address
/// configured per workload.
///
/// Each tunnel binds `127.0.0.1:0` and forwards every accepted connection to
/// `<upstream>:<port>` until closed.
#[derive(Debug, Clone, Default)]
pub struct TcpRelayProvider {
    routes: Arc<HashMap<WorkloadRef, IpAddr>>,
}

impl TcpRelayProvider {
    /// Build a provider from workload → upstream address routes.
    pub fn new(routes: HashMap<WorkloadRef, IpAddr>) -> Self {
        Self {
            routes: Arc::new(routes),
        }
    }
}

#[async_trait]
impl TunnelProvider for TcpRelayProvider {
    async fn open(&self, workload: &WorkloadRef, port: u16) -> Result<Box<dyn Tunnel>, TunnelError> {
        let target = format!("{workload}:{port}");
        let upstream = match self.routes.get(workload) {
            Some(address) => SocketAddr::new(*address, port),
            None => {
                return Err(TunnelError::Open {
                    target,
                    reason: "no route configured for workload".to_string(),
                })
            }
        };

        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .map_err(|e| TunnelError::Open {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| TunnelError::Open {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        let shutdown = CancellationToken::new();
        tokio::spawn(run_relay(listener, upstream, shutdown.clone()));

        Ok(Box::new(TcpRelay {
            local_addr,
            shutdown,
        }))
    }
}

struct TcpRelay {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Tunnel for TcpRelay {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn run_relay(listener: TcpListener, upstream: SocketAddr, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(%upstream, "relay closed");
                return;
            }

            accepted = listener.accept() => {
                let (mut inbound, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "relay accept failed");
                        continue;
                    }
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut outbound = match TcpStream::connect(upstream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(%upstream, %peer, error = %e, "relay connect failed");
                            return;
                        }
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
                            if let Err(e) = result {
                                debug!(%upstream, %peer, error = %e, "relay connection ended");
                            }
                        }
                    }
                });
            }
        }
    }
}
