use regex::Regex;
use rustc_hash::FxHashSet;

/// Outcome of matching a bare host against the configured whitelist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Exact,
    Regex(String),
    None,
}

impl Match {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Match::None)
    }
}

/// Administrator-configured set of origins eligible for interception and caching.
///
/// Entries are either literal hosts (compared case-sensitively) or patterns
/// prefixed with `regex:` (compiled case-insensitive). Lookup order for
/// patterns follows configuration order.
pub struct Whitelist {
    literals: FxHashSet<String>,
    patterns: Vec<(String, Regex)>,
}

impl Whitelist {
    pub fn from_entries<I, S>(entries: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut literals = FxHashSet::default();
        let mut patterns = Vec::new();

        for entry in entries {
            let entry = entry.as_ref();
            if let Some(src) = entry.strip_prefix("regex:") {
                let compiled = Regex::new(&format!("(?i){src}"))?;
                patterns.push((src.to_string(), compiled));
            } else {
                literals.insert(entry.to_string());
            }
        }

        Ok(Self { literals, patterns })
    }

    /// Strip an optional `:port` suffix and classify the bare host.
    pub fn is_eligible(&self, host: &str) -> Match {
        let bare = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        if bare.is_empty() {
            return Match::None;
        }
        if self.literals.contains(bare) {
            return Match::Exact;
        }
        for (src, re) in &self.patterns {
            if re.is_match(bare) {
                return Match::Regex(src.clone());
            }
        }
        Match::None
    }

    pub fn literal_domains(&self) -> Vec<String> {
        let mut v: Vec<String> = self.literals.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn regex_patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|(src, _)| src.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_case_sensitive() {
        let wl = Whitelist::from_entries(["example.com"]).unwrap();
        assert_eq!(wl.is_eligible("example.com"), Match::Exact);
        assert_eq!(wl.is_eligible("EXAMPLE.COM"), Match::None);
    }

    #[test]
    fn strips_port_suffix() {
        let wl = Whitelist::from_entries(["example.com"]).unwrap();
        assert_eq!(wl.is_eligible("example.com:443"), Match::Exact);
    }

    #[test]
    fn regex_match_is_case_insensitive() {
        let wl = Whitelist::from_entries(["regex:.*\\.example\\.com"]).unwrap();
        match wl.is_eligible("api.EXAMPLE.com") {
            Match::Regex(_) => {}
            other => panic!("expected Regex match, got {other:?}"),
        }
    }

    #[test]
    fn empty_host_never_matches() {
        let wl = Whitelist::from_entries(["example.com"]).unwrap();
        assert_eq!(wl.is_eligible(""), Match::None);
    }

    #[test]
    fn unlisted_host_is_none() {
        let wl = Whitelist::from_entries(["example.com"]).unwrap();
        assert_eq!(wl.is_eligible("httpbin.org"), Match::None);
    }
}
