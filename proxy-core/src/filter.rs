use crate::config::CaptureConfig;
use wildmatch::WildMatch;

/// Decides which hosts get captured and run through the rule pipeline.
#[derive(Debug, Clone, Default)]
pub struct ScopeMatcher {
    include: Vec<WildMatch>,
    exclude: Vec<WildMatch>,
}

impl ScopeMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().map(|p| WildMatch::new(p)).collect(),
            exclude: exclude.iter().map(|p| WildMatch::new(p)).collect(),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(&config.include_hosts, &config.exclude_hosts)
    }

    /// Check if a host is in scope
    ///
    /// Logic:
    /// 1. If an exclude pattern matches, return false.
    /// 2. If the include list is empty, return true.
    /// 3. Otherwise return true only if an include pattern matches.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if self.exclude.iter().any(|p| p.matches(host)) {
            return false;
        }

        self.include.is_empty() || self.include.iter().any(|p| p.matches(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(include: &[&str], exclude: &[&str]) -> ScopeMatcher {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        ScopeMatcher::new(&include, &exclude)
    }

    #[test]
    fn test_scope_matching() {
        // Empty lists = capture everything
        assert!(matcher(&[], &[]).is_allowed("api.example.test"));

        let m = matcher(&[], &["*.analytics.test"]);
        assert!(!m.is_allowed("cdn.analytics.test"));
        assert!(m.is_allowed("example.test"));

        let m = matcher(&["*.example.test"], &[]);
        assert!(m.is_allowed("api.example.test"));
        assert!(!m.is_allowed("other.test"));

        // Exclusion wins
        let m = matcher(&["*.example.test"], &["ads.example.test"]);
        assert!(m.is_allowed("api.example.test"));
        assert!(!m.is_allowed("ads.example.test"));
    }

    #[test]
    fn test_ipv6_brackets_ignored() {
        let m = matcher(&["::1"], &[]);
        assert!(m.is_allowed("[::1]"));
    }

    #[test]
    fn test_from_config() {
        let config = CaptureConfig {
            exclude_hosts: vec!["blocked.test".into()],
            ..CaptureConfig::default()
        };
        let m = ScopeMatcher::from_config(&config);
        assert!(!m.is_allowed("blocked.test"));
        assert!(m.is_allowed("fine.test"));
    }
}
