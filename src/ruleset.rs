//! Conflict-free set of rewrite rules, one per owner.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ConflictError;
use crate::rule::RewriteRule;

/// Rewrite rules keyed by owner.
///
/// Invariants, enforced by [`add_rule`](Self::add_rule):
/// - at most one rule per owner;
/// - no two rules of different owners match a common host name, so every
///   host is matched by at most one rule.
///
/// Owners iterate in byte-wise ascending order, which is also the canonical
/// order of the serialized artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteRuleSet {
    rules: BTreeMap<String, RewriteRule>,
}

impl RewriteRuleSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in owner order.
    pub fn iter(&self) -> impl Iterator<Item = &RewriteRule> {
        self.rules.values()
    }

    /// The rule held by `owner`, if any.
    pub fn get_rule(&self, owner: &str) -> Option<&RewriteRule> {
        self.rules.get(owner)
    }

    /// Insert or replace the owner's rule.
    ///
    /// Returns whether the set changed. Fails without touching the set if the
    /// rule's match-set overlaps a rule held by a different owner.
    pub fn add_rule(&mut self, rule: RewriteRule) -> Result<bool, ConflictError> {
        if let Some(existing) = self
            .rules
            .values()
            .find(|existing| existing.owner() != rule.owner() && existing.clashes_with(&rule))
        {
            return Err(ConflictError {
                owner: rule.owner().to_string(),
                from: rule.from().to_string(),
                to: rule.to().to_string(),
                existing_owner: existing.owner().to_string(),
                existing_from: existing.from().to_string(),
                existing_to: existing.to().to_string(),
            });
        }

        match self.rules.get(rule.owner()) {
            Some(current) if current.same_mapping(&rule) => Ok(false),
            _ => {
                debug!(owner = %rule.owner(), from = %rule.from(), to = %rule.to(), "storing rewrite rule");
                self.rules.insert(rule.owner().to_string(), rule);
                Ok(true)
            }
        }
    }

    /// Drop the owner's rule; returns whether one was present.
    pub fn remove_rule(&mut self, owner: &str) -> bool {
        let removed = self.rules.remove(owner).is_some();
        if removed {
            debug!(owner, "removed rewrite rule");
        }
        removed
    }

    /// The rule matching `host`; unique by the clash-freeness invariant.
    pub fn find_matching_rule(&self, host: &str) -> Option<&RewriteRule> {
        self.rules.values().find(|rule| rule.matches(host))
    }

    /// Number of rules targeting IP literals and host names, respectively.
    pub fn counts(&self) -> (usize, usize) {
        let addresses = self.rules.values().filter(|r| r.targets_address()).count();
        (addresses, self.rules.len() - addresses)
    }
}
