//! Registrable-domain derivation from the public suffix list.
//!
//! Politeness limits are keyed by registrable domain (eTLD+1) so that
//! `shop.example.co.uk` and `cdn.example.co.uk` share one budget. The
//! index parses a public-suffix rule file (exact rules, `*.` wildcards,
//! `!` exceptions) and walks host labels right to left for the longest
//! match.
//!
//! The rule file itself is external data: hosts point
//! `PUBLIC_SUFFIX_LIST_PATH` at a copy of the published list. Without
//! one, a minimal built-in fallback keeps the limiter keying sane and a
//! warning is logged.

use std::collections::HashSet;

use tracing::warn;
use url::{Host, Url};

/// Environment variable naming an external public-suffix rule file.
pub const PUBLIC_SUFFIX_LIST_PATH_VAR: &str = "PUBLIC_SUFFIX_LIST_PATH";

/// An external rule file is accepted only when it has at least this many
/// non-empty lines; anything shorter is assumed to be truncated.
const MIN_EXTERNAL_LIST_LINES: usize = 100;

/// Minimal rule set used when no real list is available.
const FALLBACK_RULES: &[&str] = &["com", "net", "org", "uk", "co.uk"];

/// Immutable public-suffix rule index.
///
/// Initialised once at host startup and shared read-only.
///
/// # Example
///
/// ```
/// use apiary_runtime::domain::PublicSuffixIndex;
///
/// let index = PublicSuffixIndex::fallback();
/// assert_eq!(
///     index.registrable_domain("https://shop.example.co.uk/cart"),
///     Some("example.co.uk".to_string())
/// );
/// ```
#[derive(Debug, Clone)]
pub struct PublicSuffixIndex {
    /// Exact suffix rules (`co.uk`).
    exact: HashSet<String>,
    /// Wildcard rule bases: `*.ck` is stored as `ck`.
    wildcard: HashSet<String>,
    /// Exception rules without their `!`: `!www.ck` is stored as `www.ck`.
    exception: HashSet<String>,
}

impl PublicSuffixIndex {
    /// Parses a rule file in the published public-suffix list format.
    ///
    /// Blank lines and `//` comments are ignored. Rules are lower-cased.
    #[must_use]
    pub fn parse(rules: &str) -> Self {
        let mut index = Self {
            exact: HashSet::new(),
            wildcard: HashSet::new(),
            exception: HashSet::new(),
        };
        for line in rules.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            // The published list annotates sections with full-line
            // comments only, but be tolerant of trailing junk.
            let rule = line.split_whitespace().next().unwrap_or("").to_lowercase();
            if rule.is_empty() {
                continue;
            }
            if let Some(exception) = rule.strip_prefix('!') {
                index.exception.insert(exception.to_string());
            } else if let Some(base) = rule.strip_prefix("*.") {
                index.wildcard.insert(base.to_string());
            } else {
                index.exact.insert(rule);
            }
        }
        index
    }

    /// Builds the minimal fallback index and logs that it is in use.
    #[must_use]
    pub fn fallback() -> Self {
        warn!(
            "no public suffix list available; falling back to built-in rules ({:?})",
            FALLBACK_RULES
        );
        Self::parse(&FALLBACK_RULES.join("\n"))
    }

    /// Loads the index from `PUBLIC_SUFFIX_LIST_PATH`, falling back to
    /// the built-in rules when the variable is unset, the file is
    /// unreadable, or it has fewer than 100 non-empty lines.
    #[must_use]
    pub fn from_env() -> Self {
        let Ok(path) = std::env::var(PUBLIC_SUFFIX_LIST_PATH_VAR) else {
            return Self::fallback();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
                if lines < MIN_EXTERNAL_LIST_LINES {
                    warn!(
                        path,
                        lines, "public suffix list too short, using built-in fallback"
                    );
                    return Self::fallback();
                }
                Self::parse(&text)
            }
            Err(err) => {
                warn!(path, %err, "failed to read public suffix list, using built-in fallback");
                Self::fallback()
            }
        }
    }

    /// Derives the registrable domain (eTLD+1) of a URL or bare host.
    ///
    /// Returns `None` for empty/whitespace input and for hosts that are
    /// pure public suffixes. Returns the input unchanged (lower-cased)
    /// when it is not a DNS name: IP literals and single labels such as
    /// `localhost`.
    ///
    /// Idempotent: feeding a registrable domain back in returns it as-is.
    #[must_use]
    pub fn registrable_domain(&self, input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let host = match extract_host(input) {
            HostForm::Dns(name) => name,
            HostForm::NotDns(raw) => return Some(raw),
        };

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 2 {
            return Some(host.clone());
        }

        let suffix_len = self.matching_suffix_len(&labels);
        if suffix_len >= labels.len() {
            // The host itself is a public suffix; nothing is registrable
            // under it.
            return None;
        }
        Some(labels[labels.len() - suffix_len - 1..].join("."))
    }

    /// Number of labels, counted from the right, covered by the longest
    /// matching suffix rule.
    fn matching_suffix_len(&self, labels: &[&str]) -> usize {
        let mut best = 1; // prevailing rule "*": the rightmost label
        for take in 1..=labels.len() {
            let candidate = labels[labels.len() - take..].join(".");
            if self.exception.contains(&candidate) {
                // An exception rule is itself registrable: the suffix is
                // one label shorter than the rule.
                return take - 1;
            }
            if self.exact.contains(&candidate) && take > best {
                best = take;
            }
            // "*.ck" covers one more label than its base.
            if take < labels.len() && self.wildcard.contains(&candidate) && take + 1 > best {
                best = take + 1;
            }
        }
        best
    }
}

enum HostForm {
    /// Lower-cased, punycoded DNS name.
    Dns(String),
    /// Not a DNS name; passed through unchanged apart from lower-casing.
    NotDns(String),
}

/// Extracts the host from a URL or bare-host input.
fn extract_host(input: &str) -> HostForm {
    let parsed = if input.contains("://") {
        Url::parse(input)
    } else {
        // A bare host; borrow url's host parsing (lower-casing and
        // punycode included) by giving it a scheme.
        Url::parse(&format!("http://{input}"))
    };

    match parsed {
        Ok(url) => match url.host() {
            Some(Host::Domain(domain)) => {
                HostForm::Dns(domain.trim_end_matches('.').to_string())
            }
            // IP literals have no registrable domain; key limits by the
            // address itself.
            Some(Host::Ipv4(ip)) => HostForm::NotDns(ip.to_string()),
            Some(Host::Ipv6(ip)) => HostForm::NotDns(ip.to_string()),
            None => HostForm::NotDns(input.to_lowercase()),
        },
        Err(_) => HostForm::NotDns(input.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> PublicSuffixIndex {
        PublicSuffixIndex::parse(
            "// test rules\n\
             com\n\
             net\n\
             org\n\
             uk\n\
             co.uk\n\
             jp\n\
             kobe.jp\n\
             *.kobe.jp\n\
             !city.kobe.jp\n",
        )
    }

    #[test]
    fn empty_input_is_none() {
        assert_eq!(index().registrable_domain(""), None);
        assert_eq!(index().registrable_domain("   "), None);
    }

    #[test]
    fn simple_exact_rule() {
        assert_eq!(
            index().registrable_domain("example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            index().registrable_domain("deep.sub.example.com"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn longest_rule_wins() {
        assert_eq!(
            index().registrable_domain("shop.example.co.uk"),
            Some("example.co.uk".to_string())
        );
        // "uk" alone also matches but "co.uk" is longer.
        assert_eq!(
            index().registrable_domain("example.uk"),
            Some("example.uk".to_string())
        );
    }

    #[test]
    fn wildcard_rule() {
        // *.kobe.jp makes {anything}.kobe.jp a suffix.
        assert_eq!(
            index().registrable_domain("www.a.north.kobe.jp"),
            Some("a.north.kobe.jp".to_string())
        );
    }

    #[test]
    fn exception_rule_subtracts_a_label() {
        // !city.kobe.jp: city.kobe.jp is registrable despite *.kobe.jp.
        assert_eq!(
            index().registrable_domain("www.city.kobe.jp"),
            Some("city.kobe.jp".to_string())
        );
        assert_eq!(
            index().registrable_domain("city.kobe.jp"),
            Some("city.kobe.jp".to_string())
        );
    }

    #[test]
    fn pure_suffix_has_no_registrable_domain() {
        assert_eq!(index().registrable_domain("com"), Some("com".to_string()));
        assert_eq!(index().registrable_domain("co.uk"), None);
    }

    #[test]
    fn unknown_tld_uses_prevailing_rule() {
        assert_eq!(
            index().registrable_domain("foo.bar.example"),
            Some("bar.example".to_string())
        );
    }

    #[test]
    fn url_input_is_reduced_to_host() {
        assert_eq!(
            index().registrable_domain("https://shop.example.co.uk/cart?x=1"),
            Some("example.co.uk".to_string())
        );
    }

    #[test]
    fn casing_and_trailing_dot_are_normalised() {
        assert_eq!(
            index().registrable_domain("WWW.Example.COM."),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn non_dns_hosts_pass_through() {
        assert_eq!(
            index().registrable_domain("127.0.0.1"),
            Some("127.0.0.1".to_string())
        );
        assert_eq!(
            index().registrable_domain("localhost"),
            Some("localhost".to_string())
        );
        // A URL with an IP host reduces to the address, not the URL.
        assert_eq!(
            index().registrable_domain("http://10.0.0.8:8080/admin"),
            Some("10.0.0.8".to_string())
        );
    }

    #[test]
    fn idempotent_on_registrable_hosts() {
        let idx = index();
        let first = idx
            .registrable_domain("a.b.example.co.uk")
            .expect("registrable");
        let second = idx.registrable_domain(&first).expect("still registrable");
        assert_eq!(first, second);
    }

    #[test]
    fn fallback_rules_cover_common_cases() {
        let idx = PublicSuffixIndex::parse(&["com", "net", "org", "uk", "co.uk"].join("\n"));
        assert_eq!(
            idx.registrable_domain("news.example.org"),
            Some("example.org".to_string())
        );
        assert_eq!(
            idx.registrable_domain("a.example.co.uk"),
            Some("example.co.uk".to_string())
        );
    }

    #[test]
    fn unicode_hosts_are_punycoded() {
        let got = index().registrable_domain("https://bücher.example.com/");
        assert_eq!(got, Some("example.com".to_string()));
    }
}
