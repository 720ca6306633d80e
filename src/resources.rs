//! Stored object kinds: the rewrite intent, the artifact holder and the DNS
//! service whose endpoints are checked.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::store::{Object, ObjectMeta};

/// API group and version of [`RewriteIntent`].
pub const INTENT_API_VERSION: &str = "dns.cs.sap.com/v1alpha1";

/// Declared mapping of a host name onto a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentSpec {
    /// Source host name, possibly wildcarded.
    pub from: String,
    /// Target host name or IP address.
    pub to: String,
}

/// Lifecycle state of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentState {
    /// First seen.
    New,
    /// Rule written, or waiting for convergence.
    Processing,
    /// Deletion waits for foreign finalizers.
    DeletionBlocked,
    /// Rule removed, waiting for removal of the intent.
    Deleting,
    /// Rule active on every DNS server.
    Ready,
    /// Reconciliation failed.
    Error,
}

impl IntentState {
    /// State name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Processing => "Processing",
            Self::DeletionBlocked => "DeletionBlocked",
            Self::Deleting => "Deleting",
            Self::Ready => "Ready",
            Self::Error => "Error",
        }
    }

    fn condition_status(&self) -> ConditionStatus {
        match self {
            Self::Ready => ConditionStatus::True,
            Self::Error => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds.
    True,
    /// Condition does not hold.
    False,
    /// Not determined yet.
    Unknown,
}

/// The `Ready` condition of an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCondition {
    /// Current value.
    pub status: ConditionStatus,
    /// State name that produced the value.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// Last time `status` changed.
    pub last_transition_time: DateTime<Utc>,
    /// Last time the condition was written.
    pub last_update_time: DateTime<Utc>,
}

/// Observed state of an intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentStatus {
    /// Generation the status refers to.
    pub observed_generation: u64,
    /// Lifecycle state; `None` until first seen.
    pub state: Option<IntentState>,
    /// Ready condition.
    pub ready: Option<ReadyCondition>,
}

/// A declared rewrite, the unit of reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteIntent {
    /// Metadata.
    pub meta: ObjectMeta,
    /// Desired mapping.
    pub spec: IntentSpec,
    /// Observed state.
    pub status: IntentStatus,
}

impl RewriteIntent {
    /// New intent with a fixed name.
    pub fn new(namespace: &str, name: &str, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::named(namespace, name),
            spec: IntentSpec {
                from: from.into(),
                to: to.into(),
            },
            status: IntentStatus::default(),
        }
    }

    /// Current state, if any.
    pub fn state(&self) -> Option<IntentState> {
        self.status.state
    }

    /// Set the state along with the `Ready` condition.
    pub fn set_state(&mut self, state: IntentState, message: impl Into<String>) {
        self.set_state_at(state, message, Utc::now());
    }

    fn set_state_at(&mut self, state: IntentState, message: impl Into<String>, now: DateTime<Utc>) {
        let status = state.condition_status();
        let last_transition_time = match &self.status.ready {
            Some(cond) if cond.status == status => cond.last_transition_time,
            _ => now,
        };
        self.status.ready = Some(ReadyCondition {
            status,
            reason: state.as_str().to_string(),
            message: message.into(),
            last_transition_time,
            last_update_time: now,
        });
        self.status.state = Some(state);
    }

    /// Message of the `Ready` condition.
    pub fn message(&self) -> Option<&str> {
        self.status.ready.as_ref().map(|c| c.message.as_str())
    }

    /// Rule owner identity: `<uid> (<namespace>/<name>)`.
    pub fn owner_id(&self) -> String {
        format!("{} ({}/{})", self.meta.uid, self.meta.namespace, self.meta.name)
    }
}

impl Object for RewriteIntent {
    const KIND: &'static str = "RewriteIntent";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

/// Key/value resource holding the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigResource {
    /// Metadata.
    pub meta: ObjectMeta,
    /// Data entries.
    pub data: BTreeMap<String, String>,
}

impl ConfigResource {
    /// Empty resource.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            meta: ObjectMeta::named(namespace, name),
            data: BTreeMap::new(),
        }
    }
}

impl Object for ConfigResource {
    const KIND: &'static str = "ConfigResource";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// A port exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    /// Port name, referenced by endpoint ports.
    pub name: String,
    /// Transport protocol.
    pub protocol: PortProtocol,
    /// Service port number.
    pub port: u16,
}

/// Object backing an endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    /// Kind of the object, e.g. `Pod`.
    pub kind: String,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

/// Named port on the backing addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    /// Name of the matching service port.
    pub name: String,
    /// Port number on the backing addresses.
    pub port: u16,
}

/// Addresses sharing one set of ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    /// Ready addresses.
    pub addresses: Vec<(IpAddr, Option<TargetRef>)>,
    /// Ports served on every address.
    pub ports: Vec<EndpointPort>,
}

/// A service and the addresses currently backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    /// Metadata.
    pub meta: ObjectMeta,
    /// Ports exposed by the service.
    pub ports: Vec<ServicePort>,
    /// Backing addresses.
    pub subsets: Vec<EndpointSubset>,
}

impl ServiceEndpoints {
    /// Service without ports or backing addresses.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            meta: ObjectMeta::named(namespace, name),
            ports: Vec::new(),
            subsets: Vec::new(),
        }
    }
}

impl Object for ServiceEndpoints {
    const KIND: &'static str = "ServiceEndpoints";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.ports == other.ports && self.subsets == other.subsets
    }
}

/// API group and version of [`Ingress`].
pub const INGRESS_API_VERSION: &str = "networking.k8s.io/v1";

/// An HTTP entry point exposing one or more host names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingress {
    /// Metadata.
    pub meta: ObjectMeta,
    /// Host of each routing rule; empty hosts match any name.
    pub rules: Vec<String>,
}

impl Ingress {
    /// Ingress with the given rule hosts.
    pub fn new(namespace: &str, name: &str, rules: Vec<String>) -> Self {
        Self {
            meta: ObjectMeta::named(namespace, name),
            rules,
        }
    }
}

impl Object for Ingress {
    const KIND: &'static str = "Ingress";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.rules == other.rules
    }
}
