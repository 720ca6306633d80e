//! DNS name predicates.
//!
//! Host names follow RFC 1123: dot-separated labels of 1-63 alphanumerics or
//! hyphens that neither start nor end with a hyphen, at most 255 characters in
//! total. A source name may additionally carry a single leading `*` label.

use std::net::IpAddr;

/// Maximum length of a host name.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length of a single label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Label substituted for the leading `*` when a wildcard must be queried or validated.
pub const WILDCARD_LABEL: &str = "wildcard";

/// Checks host names.
///
/// Carries no state beyond its case policy; construct it once and pass it to
/// every consumer (rule construction, artifact parsing, admission).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameValidator {
    allow_uppercase: bool,
}

impl Default for NameValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl NameValidator {
    /// Validator accepting upper- and lowercase labels, as the rule engine does.
    pub const fn new() -> Self {
        Self {
            allow_uppercase: true,
        }
    }

    /// Validator accepting lowercase labels only, as admission does.
    pub const fn strict() -> Self {
        Self {
            allow_uppercase: false,
        }
    }

    /// Whether `name` is a valid host name; with `allow_wildcard`, the first
    /// label may be `*`.
    pub fn is_valid(&self, name: &str, allow_wildcard: bool) -> bool {
        let rest = match name.strip_prefix("*.") {
            Some(rest) if allow_wildcard => {
                // The substituted label counts towards the length limit.
                if WILDCARD_LABEL.len() + 1 + rest.len() > MAX_NAME_LENGTH {
                    return false;
                }
                rest
            }
            _ => {
                if name.len() > MAX_NAME_LENGTH {
                    return false;
                }
                name
            }
        };
        !rest.is_empty() && rest.split('.').all(|label| self.is_valid_label(label))
    }

    fn is_valid_label(&self, label: &str) -> bool {
        let bytes = label.as_bytes();
        let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
            return false;
        };
        if bytes.len() > MAX_LABEL_LENGTH || *first == b'-' || *last == b'-' {
            return false;
        }
        bytes.iter().all(|b| match b {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => true,
            b'A'..=b'Z' => self.allow_uppercase,
            _ => false,
        })
    }
}

/// Whether `name` starts with a wildcard label.
pub fn is_wildcard(name: &str) -> bool {
    name.starts_with('*')
}

/// Whether `s` is an IPv4 or IPv6 address literal.
pub fn is_ip_literal(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Turn a wildcard name into a concrete, queryable host name
/// (`*.foo.example` becomes `wildcard.foo.example`); other names pass through.
pub fn wildcard_query_name(name: &str) -> String {
    match name.strip_prefix('*') {
        Some(rest) => format!("{WILDCARD_LABEL}{rest}"),
        None => name.to_string(),
    }
}
