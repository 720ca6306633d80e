//! Error types for dns-masquerade.

use std::fmt::Write;

use thiserror::Error;

/// A host name or rule combination that is not acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The owner cannot be written on a single comment line.
    #[error("invalid owner {owner:?}: must be non-empty, single-line and without surrounding whitespace")]
    InvalidOwner {
        /// Offending owner.
        owner: String,
    },

    /// The rule source is not a valid (optionally wildcarded) DNS name.
    #[error("invalid source {from:?}: not a valid DNS name")]
    InvalidSource {
        /// Offending source name.
        from: String,
    },

    /// The rule target is neither an IP address nor a valid DNS name.
    #[error("invalid target {to:?}: not a valid DNS name")]
    InvalidTarget {
        /// Offending target name.
        to: String,
    },

    /// Wildcard sources cannot be mapped onto a single address.
    #[error("wildcard source {from:?} is not allowed with IP address target {to:?}")]
    WildcardToAddress {
        /// Wildcard source name.
        from: String,
        /// IP address target.
        to: String,
    },
}

/// A candidate rule overlaps the match-set of a rule held by another owner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rule {from} -> {to} ({owner}) conflicts with rule {existing_from} -> {existing_to} ({existing_owner})")]
pub struct ConflictError {
    /// Owner of the rejected rule.
    pub owner: String,
    /// Source of the rejected rule.
    pub from: String,
    /// Target of the rejected rule.
    pub to: String,
    /// Owner of the rule already in the set.
    pub existing_owner: String,
    /// Source of the rule already in the set.
    pub existing_from: String,
    /// Target of the rule already in the set.
    pub existing_to: String,
}

/// The persisted artifact does not follow the rewrite rule grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A line does not have the shape expected at its position (1-based).
    #[error("error parsing rewrite rules (at line {line})")]
    Syntax {
        /// 1-based line number.
        line: usize,
    },

    /// Input ended in the middle of a rule or of the hosts block.
    #[error("error parsing rewrite rules (premature end of input)")]
    PrematureEnd,

    /// A well-formed rule failed validation.
    #[error("invalid rewrite rule ending at line {line}: {source}")]
    Invalid {
        /// 1-based line number of the directive line.
        line: usize,
        /// Validation failure.
        source: ValidationError,
    },

    /// A well-formed rule clashes with an earlier rule in the same artifact.
    #[error("clashing rewrite rule ending at line {line}: {source}")]
    Clash {
        /// 1-based line number of the directive line.
        line: usize,
        /// Conflict details.
        source: ConflictError,
    },
}

/// Errors reported by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name`.
        key: String,
    },

    /// An object with that key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name`.
        key: String,
    },

    /// Optimistic concurrency failure: the object changed since it was read.
    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name`.
        key: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error is a stale-write race that a retry resolves.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }
}

/// Technical failure while resolving a name against one server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lookup of {host} via {server} failed: {reason}")]
pub struct LookupError {
    /// Name being resolved.
    pub host: String,
    /// Server address used.
    pub server: String,
    /// Underlying failure.
    pub reason: String,
}

/// Failure while establishing a tunnel to an in-cluster server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// No tunnel provider is configured.
    #[error("no tunnel provider configured to reach {target}")]
    Unavailable {
        /// `namespace/name:port`.
        target: String,
    },

    /// The endpoint lacks the workload identity needed for a tunnel.
    #[error("endpoint {address} is in-cluster but has no workload reference")]
    MissingWorkload {
        /// Endpoint address.
        address: String,
    },

    /// Opening the tunnel failed.
    #[error("error opening tunnel to {target}: {reason}")]
    Open {
        /// `namespace/name:port`.
        target: String,
        /// Underlying failure.
        reason: String,
    },

    /// Opening the tunnel did not finish in time.
    #[error("error opening tunnel to {target}: timeout")]
    Timeout {
        /// `namespace/name:port`.
        target: String,
    },
}

/// A technical failure recorded for one endpoint during a convergence check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Name resolution failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// Tunnel setup failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The check was aborted by shutdown.
    #[error("probe of {endpoint} cancelled")]
    Cancelled {
        /// Endpoint description.
        endpoint: String,
    },

    /// The probe task terminated abnormally.
    #[error("probe of {endpoint} aborted: {reason}")]
    Aborted {
        /// Endpoint description.
        endpoint: String,
        /// Join failure.
        reason: String,
    },
}

/// Failure of a whole convergence check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    /// The server set could not be discovered.
    #[error("error discovering DNS endpoints: {0}")]
    Discovery(String),

    /// One or more endpoints failed technically.
    #[error("{}", render_probe_errors(.0))]
    Probes(Vec<ProbeError>),
}

fn render_probe_errors(errors: &[ProbeError]) -> String {
    let mut out = format!("{} error(s) occurred during DNS check:", errors.len());
    for err in errors {
        let _ = write!(out, "\n\t* {err}");
    }
    out
}

/// Errors raised by one reconciliation attempt.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Declared `from`/`to` are invalid.
    #[error("error building rewrite rule: {0}")]
    Validation(#[from] ValidationError),

    /// Declared rule clashes with another owner's rule.
    #[error("error adding rewrite rule: {0}")]
    Conflict(#[from] ConflictError),

    /// The persisted artifact could not be decoded.
    #[error("error loading rewrite rules from {artifact}: {source}")]
    Parse {
        /// `namespace/name[key]`.
        artifact: String,
        /// Parser failure.
        source: ParseError,
    },

    /// Store read/write failed.
    #[error("{action}: {source}")]
    Store {
        /// What was attempted.
        action: &'static str,
        /// Store failure.
        source: StoreError,
    },

    /// The convergence check failed technically.
    #[error("error checking DNS record: {0}")]
    Check(#[from] CheckError),
}

impl ReconcileError {
    pub(crate) fn store(action: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { action, source }
    }

    /// Transient failures are rescheduled silently instead of surfacing as `Error`.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_write_conflict())
    }
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting is out of range or malformed.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
