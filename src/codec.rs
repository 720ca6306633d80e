//! Text form of a [`RewriteRuleSet`], as consumed by the cluster DNS resolver.
//!
//! Rules targeting IP literals go into a single `hosts` block, the rest become
//! `rewrite name` directives. Every rule is preceded by `# owner:`, `# from:`
//! and `# to:` comment lines, which are what the parser reads back; the
//! directive lines are only checked for shape.
//!
//! ```text
//! hosts /dev/null {
//!   # owner: o1
//!   # from: a.example.com
//!   # to: 1.2.3.4
//!   1.2.3.4 a.example.com
//!   ttl 10
//!   fallthrough
//! }
//! # owner: o2
//! # from: *.foo.com
//! # to: bar.com
//! rewrite name regex .*\.foo\.com bar.com
//! ```
//!
//! Lines are joined with `\n`, without a trailing newline.

use std::fmt;
use std::iter::Enumerate;
use std::str::Split;

use crate::error::ParseError;
use crate::names::NameValidator;
use crate::rule::RewriteRule;
use crate::ruleset::RewriteRuleSet;

const HOSTS_OPEN: &str = "hosts /dev/null {";
const HOSTS_TTL: &str = "  ttl 10";
const HOSTS_FALLTHROUGH: &str = "  fallthrough";
const HOSTS_CLOSE: &str = "}";

impl fmt::Display for RewriteRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<String> = Vec::with_capacity(4 * self.len() + 4);

        let mut hosts = self.iter().filter(|r| r.targets_address()).peekable();
        if hosts.peek().is_some() {
            lines.push(HOSTS_OPEN.to_string());
            for rule in hosts {
                lines.push(format!("  # owner: {}", rule.owner()));
                lines.push(format!("  # from: {}", rule.from()));
                lines.push(format!("  # to: {}", rule.to()));
                lines.push(format!("  {} {}", rule.to(), rule.from()));
            }
            lines.push(HOSTS_TTL.to_string());
            lines.push(HOSTS_FALLTHROUGH.to_string());
            lines.push(HOSTS_CLOSE.to_string());
        }

        for rule in self.iter().filter(|r| !r.targets_address()) {
            lines.push(format!("# owner: {}", rule.owner()));
            lines.push(format!("# from: {}", rule.from()));
            lines.push(format!("# to: {}", rule.to()));
            if rule.is_wildcard() {
                let pattern = rule.from().replace('.', r"\.").replace('*', ".*");
                lines.push(format!("rewrite name regex {} {}", pattern, rule.to()));
            } else {
                lines.push(format!("rewrite name exact {} {}", rule.from(), rule.to()));
            }
        }

        f.write_str(&lines.join("\n"))
    }
}

impl RewriteRuleSet {
    /// Decode an artifact produced by the `Display` implementation.
    ///
    /// The empty string decodes to an empty set. Every rule is validated and
    /// added in order, so an artifact holding invalid names or clashing rules
    /// is rejected as a whole.
    pub fn parse(validator: &NameValidator, text: &str) -> Result<Self, ParseError> {
        let mut set = RewriteRuleSet::new();
        if text.is_empty() {
            return Ok(set);
        }

        let mut lines = Lines(text.split('\n').enumerate());
        let mut in_hosts = false;
        let mut seen_hosts = false;

        while let Some((n, line)) = lines.0.next() {
            let n = n + 1;

            if !in_hosts && !seen_hosts && line == HOSTS_OPEN {
                in_hosts = true;
                seen_hosts = true;
                continue;
            }
            if in_hosts && line == HOSTS_TTL {
                lines.expect_exact(HOSTS_FALLTHROUGH)?;
                lines.expect_exact(HOSTS_CLOSE)?;
                in_hosts = false;
                continue;
            }

            let owner = comment_value(line, "# owner: ").ok_or(ParseError::Syntax { line: n })?;
            let from = lines.expect_comment("# from: ")?;
            let to = lines.expect_comment("# to: ")?;

            let (n, directive) = lines.next_line()?;
            let well_formed = if in_hosts {
                is_hosts_entry(directive)
            } else {
                is_rewrite_directive(directive)
            };
            if !well_formed {
                return Err(ParseError::Syntax { line: n });
            }

            let rule = RewriteRule::new(validator, owner, from, to)
                .map_err(|source| ParseError::Invalid { line: n, source })?;
            set.add_rule(rule)
                .map_err(|source| ParseError::Clash { line: n, source })?;
        }

        if in_hosts {
            return Err(ParseError::PrematureEnd);
        }
        Ok(set)
    }
}

struct Lines<'a>(Enumerate<Split<'a, char>>);

impl<'a> Lines<'a> {
    fn next_line(&mut self) -> Result<(usize, &'a str), ParseError> {
        self.0
            .next()
            .map(|(i, line)| (i + 1, line))
            .ok_or(ParseError::PrematureEnd)
    }

    fn expect_exact(&mut self, expected: &str) -> Result<(), ParseError> {
        let (n, line) = self.next_line()?;
        if line == expected {
            Ok(())
        } else {
            Err(ParseError::Syntax { line: n })
        }
    }

    fn expect_comment(&mut self, prefix: &str) -> Result<&'a str, ParseError> {
        let (n, line) = self.next_line()?;
        comment_value(line, prefix).ok_or(ParseError::Syntax { line: n })
    }
}

/// Value of a `<indent># key: value` line.
fn comment_value<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.trim_start()
        .strip_prefix(prefix)
        .filter(|value| !value.is_empty())
}

/// `<indent><address> <name>`
fn is_hosts_entry(line: &str) -> bool {
    let body = line.trim_start();
    body.len() == body.trim_end().len() && body.split_whitespace().count() == 2
}

/// `<indent>rewrite name (exact|regex) <token> <token>`
fn is_rewrite_directive(line: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix("rewrite name ") else {
        return false;
    };
    let parts: Vec<&str> = rest.split(' ').collect();
    match parts.as_slice() {
        [kind, pattern, target] => {
            matches!(*kind, "exact" | "regex")
                && [pattern, target]
                    .iter()
                    .all(|t| !t.is_empty() && !t.contains(char::is_whitespace))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn rule(owner: &str, from: &str, to: &str) -> RewriteRule {
        RewriteRule::new(&NameValidator::new(), owner, from, to).unwrap()
    }

    fn parse(text: &str) -> Result<RewriteRuleSet, ParseError> {
        RewriteRuleSet::parse(&NameValidator::new(), text)
    }

    const MIXED: &str = "hosts /dev/null {
  # owner: owner1
  # from: from1.example.io
  # to: 10.0.0.1
  10.0.0.1 from1.example.io
  # owner: owner4
  # from: from4.example.io
  # to: fd00::4
  fd00::4 from4.example.io
  ttl 10
  fallthrough
}
# owner: owner2
# from: from2.example.io
# to: to2.example.io
rewrite name exact from2.example.io to2.example.io
# owner: owner3
# from: *.other.io
# to: to3.example.io
rewrite name regex .*\\.other\\.io to3.example.io";

    #[test]
    fn test_serialize_single_address_rule() {
        let mut set = RewriteRuleSet::new();
        assert!(set.add_rule(rule("o1", "a.example.com", "1.2.3.4")).unwrap());
        assert_eq!(
            set.to_string(),
            "hosts /dev/null {\n  # owner: o1\n  # from: a.example.com\n  # to: 1.2.3.4\n  1.2.3.4 a.example.com\n  ttl 10\n  fallthrough\n}"
        );
    }

    #[test]
    fn test_serialize_orders_by_owner_and_partitions() {
        let mut set = RewriteRuleSet::new();
        // Insert out of order; output is sorted by owner within each section.
        set.add_rule(rule("owner3", "*.other.io", "to3.example.io")).unwrap();
        set.add_rule(rule("owner4", "from4.example.io", "fd00::4")).unwrap();
        set.add_rule(rule("owner2", "from2.example.io", "to2.example.io")).unwrap();
        set.add_rule(rule("owner1", "from1.example.io", "10.0.0.1")).unwrap();
        assert_eq!(set.to_string(), MIXED);
    }

    #[test]
    fn test_serialize_names_only_has_no_hosts_block() {
        let mut set = RewriteRuleSet::new();
        set.add_rule(rule("o2", "*.foo.com", "bar.com")).unwrap();
        assert_eq!(
            set.to_string(),
            "# owner: o2\n# from: *.foo.com\n# to: bar.com\nrewrite name regex .*\\.foo\\.com bar.com"
        );
        assert_eq!(RewriteRuleSet::new().to_string(), "");
    }

    #[test]
    fn test_parse_reproduces_serialized_text() {
        let set = parse(MIXED).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.get_rule("owner3").unwrap().from(), "*.other.io");
        assert_eq!(set.to_string(), MIXED);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_missing_from_line() {
        let text = "# owner: o1\n# to: bar.com\nrewrite name exact foo.com bar.com";
        assert_eq!(parse(text), Err(ParseError::Syntax { line: 2 }));
    }

    #[test]
    fn test_parse_premature_end() {
        assert_eq!(parse("# owner: o1\n# from: foo.com"), Err(ParseError::PrematureEnd));
        assert_eq!(
            parse("hosts /dev/null {\n  # owner: o1\n  # from: a.com\n  # to: 1.2.3.4\n  1.2.3.4 a.com"),
            Err(ParseError::PrematureEnd)
        );
        assert_eq!(
            parse("hosts /dev/null {\n  ttl 10\n  fallthrough"),
            Err(ParseError::PrematureEnd)
        );
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        // Trailing newline leaves an empty line where a rule is expected.
        let mut text = MIXED.to_string();
        text.push('\n');
        assert_eq!(parse(&text), Err(ParseError::Syntax { line: 21 }));

        let text = "# owner: o1\n# from: foo.com\n# to: bar.com\nrewrite name prefix foo.com bar.com";
        assert_eq!(parse(text), Err(ParseError::Syntax { line: 4 }));

        let text = "hosts /dev/null {\n  # owner: o1\n  # from: a.com\n  # to: 1.2.3.4\n  1.2.3.4\n  ttl 10\n  fallthrough\n}";
        assert_eq!(parse(text), Err(ParseError::Syntax { line: 5 }));

        let text = "hosts /dev/null {\n  ttl 10\n  fallthrough\n)";
        assert_eq!(parse(text), Err(ParseError::Syntax { line: 4 }));

        assert_eq!(parse("garbage"), Err(ParseError::Syntax { line: 1 }));
    }

    #[test]
    fn test_parse_rejects_second_hosts_block() {
        let text = "hosts /dev/null {\n  ttl 10\n  fallthrough\n}\nhosts /dev/null {";
        assert_eq!(parse(text), Err(ParseError::Syntax { line: 5 }));
    }

    #[test]
    fn test_parse_rejects_invalid_rule() {
        let text = "# owner: o1\n# from: *.foo.com\n# to: 1.2.3.4\nrewrite name exact foo.com bar.com";
        assert!(matches!(
            parse(text),
            Err(ParseError::Invalid {
                line: 4,
                source: ValidationError::WildcardToAddress { .. }
            })
        ));
    }

    #[test]
    fn test_parse_rejects_clashing_rules() {
        let text = "# owner: o2\n# from: *.foo.com\n# to: bar.com\nrewrite name regex .*\\.foo\\.com bar.com\n\
                    # owner: o3\n# from: x.foo.com\n# to: baz.com\nrewrite name exact x.foo.com baz.com";
        match parse(text) {
            Err(ParseError::Clash { line, source }) => {
                assert_eq!(line, 8);
                assert_eq!(source.existing_owner, "o2");
            }
            other => panic!("expected clash, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_keeps_owner_text() {
        let mut set = RewriteRuleSet::new();
        set.add_rule(rule("3f2a (default/a)", "a.example.com", "1.2.3.4")).unwrap();
        set.add_rule(rule("owner: #2", "b.example.com", "c.example.com")).unwrap();
        assert_eq!(parse(&set.to_string()).unwrap(), set);

        // Owners that would not survive a single comment line never enter a set.
        for owner in ["", "o1\n# from: x", " o1"] {
            assert!(RewriteRule::new(&NameValidator::new(), owner, "a.example.com", "1.2.3.4").is_err());
        }
    }

    #[test]
    fn test_round_trip_after_updates() {
        let mut set = parse(MIXED).unwrap();
        set.remove_rule("owner1");
        set.add_rule(rule("owner0", "zzz.example.io", "10.9.9.9")).unwrap();
        set.add_rule(rule("owner2", "from2.example.io", "elsewhere.io")).unwrap();
        let text = set.to_string();
        assert_eq!(parse(&text).unwrap(), set);
    }
}
