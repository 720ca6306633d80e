//! DNS Masquerade - declarative DNS rewrites for a shared resolver configuration.
//!
//! Independently owned rewrite intents ("resolve `a.example.com` as
//! `lb.example.com`") are merged into a single rule artifact read by a DNS
//! server, and each intent is watched until every server answers it the
//! rewritten way.
//!
//! ## Features
//!
//! - Clash-free rule sets: no host name is ever matched by rules of two owners
//! - Bit-exact text codec for the shared artifact (hosts block + rewrite lines)
//! - Watch-driven reconcile loop with finalizers, states and events
//! - Debounced artifact writes for servers that reload on a polling cycle
//! - Convergence checks against every DNS endpoint, tunneled when in-cluster
//! - Endpoint discovery from the cluster DNS service when none are configured
//! - Dependent intents for annotated ingresses, with an owner finalizer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        dns-masquerade                           │
//! │                                                                 │
//! │  ┌──────────────────┐    ┌──────────────────┐                  │
//! │  │ Object Store     │───▶│   Work Queue     │                  │
//! │  │ (watch intents)  │    │   (dedup/delay)  │                  │
//! │  └──────────────────┘    └────────┬─────────┘                  │
//! │         ▲                         │                             │
//! │         │ status,                 ▼                             │
//! │         │ artifact          ┌──────────────────┐              │
//! │         │                   │   Reconciler     │──▶ Resolver  │
//! │         └───────────────────│ (rule set/codec) │    (fan-out) │
//! │                             └──────────────────┘              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Artifact
//!
//! ```text
//! hosts /dev/null {
//!   # owner: 1c0ffee0 (default/a)
//!   # from: a.example.com
//!   # to: 10.0.0.1
//!   10.0.0.1 a.example.com
//!   ttl 10
//!   fallthrough
//! }
//! # owner: 5eed0000 (default/b)
//! # from: *.b.example.com
//! # to: lb.example.com
//! rewrite name regex .*\.b\.example\.com lb.example.com
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dns_masquerade::{Controller, HickoryLookup, MemoryStore, Reconciler, Resolver, StaticEndpoints};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let intents = Arc::new(MemoryStore::new());
//!     let configs = Arc::new(MemoryStore::new());
//!     let endpoints = StaticEndpoints::new(vec![]);
//!     let resolver = Resolver::new(Arc::new(HickoryLookup::default()), Arc::new(endpoints));
//!
//!     let reconciler = Reconciler::new(intents.clone(), configs, Arc::new(resolver), Default::default());
//!     let controller = Controller::new(intents, reconciler, 4);
//!     controller.run(CancellationToken::new()).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod admission;
pub mod codec;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod dependents;
pub mod error;
pub mod events;
pub mod metrics;
pub mod names;
pub mod queue;
pub mod reconcile;
pub mod resolver;
pub mod resources;
pub mod rule;
pub mod ruleset;
pub mod store;
pub mod telemetry;
pub mod tunnel;

// Re-export main types
pub use admission::IntentAdmission;
pub use config::{Config, ControllerConfig, ResolverConfig, TelemetryConfig};
pub use controller::Controller;
pub use dependents::{DependentController, DependentManager, HostOwner};
pub use error::{CheckError, ConflictError, ParseError, ReconcileError, StoreError, ValidationError};
pub use names::NameValidator;
pub use reconcile::{Reconciler, ReconcilerSettings, Requeue};
pub use resolver::{ClusterEndpoints, Endpoint, HickoryLookup, RecordChecker, Resolver, StaticEndpoints};
pub use resources::{ConfigResource, Ingress, IntentState, RewriteIntent, ServiceEndpoints};
pub use rule::RewriteRule;
pub use ruleset::RewriteRuleSet;
pub use store::{MemoryStore, ObjectKey, ObjectStore};
pub use tunnel::{TcpRelayProvider, TunnelProvider};
