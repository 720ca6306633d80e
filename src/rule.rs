//! A single owner-tagged rewrite rule.

use crate::error::ValidationError;
use crate::names::{self, NameValidator};

/// Maps a source host name (optionally `*.`-wildcarded) onto a target host
/// name or IP address, on behalf of exactly one owner.
///
/// Rules are validated on construction and never mutated afterwards; changing
/// an owner's rule means replacing it in its [`RewriteRuleSet`](crate::RewriteRuleSet).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RewriteRule {
    owner: String,
    from: String,
    to: String,
}

impl RewriteRule {
    /// Validate and build a rule.
    ///
    /// `owner` must be non-empty, on a single line and free of surrounding
    /// whitespace. `from` must be a host name, possibly with a leading wildcard label.
    /// `to` must be an IP literal or a plain host name; an IP target is only
    /// allowed for non-wildcard sources.
    pub fn new(
        validator: &NameValidator,
        owner: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let (owner, from, to) = (owner.into(), from.into(), to.into());

        if !is_valid_owner(&owner) {
            return Err(ValidationError::InvalidOwner { owner });
        }

        if !validator.is_valid(&from, true) {
            return Err(ValidationError::InvalidSource { from });
        }
        if names::is_ip_literal(&to) {
            if names::is_wildcard(&from) {
                return Err(ValidationError::WildcardToAddress { from, to });
            }
        } else if !validator.is_valid(&to, false) {
            return Err(ValidationError::InvalidTarget { to });
        }

        Ok(Self { owner, from, to })
    }

    /// Opaque identity of the contributor.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Source host name or wildcard pattern.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Target host name or IP literal.
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Whether the source carries a wildcard label.
    pub fn is_wildcard(&self) -> bool {
        names::is_wildcard(&self.from)
    }

    /// Whether the target is an IP literal (rendered into the hosts block).
    pub fn targets_address(&self) -> bool {
        names::is_ip_literal(&self.to)
    }

    /// Whether this rule applies to `host`.
    ///
    /// A `*.suffix` source matches every name ending in `.suffix`, including
    /// narrower wildcard patterns; any other source matches only itself.
    pub fn matches(&self, host: &str) -> bool {
        match self.from.strip_prefix('*') {
            Some(suffix) => host.ends_with(suffix),
            None => host == self.from,
        }
    }

    /// Whether the match-sets of both rules overlap.
    pub fn clashes_with(&self, other: &RewriteRule) -> bool {
        self.matches(&other.from) || other.matches(&self.from)
    }

    /// Same source and target, regardless of owner.
    pub(crate) fn same_mapping(&self, other: &RewriteRule) -> bool {
        self.from == other.from && self.to == other.to
    }
}

fn is_valid_owner(owner: &str) -> bool {
    !owner.is_empty() && owner.trim() == owner && !owner.contains(['\n', '\r'])
}
