//! Environment filtering for sandboxed processes.
//!
//! Processes start from an empty environment. Host variables pass only when
//! allow-listed and not deny-listed; explicit invocation variables always
//! pass and win over host values.

use std::collections::{BTreeMap, HashSet};

/// Host variables the TeX toolchain may see.
const DEFAULT_ALLOWED: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TZ",
    "SOURCE_DATE_EPOCH",
    "FORCE_SOURCE_DATE",
    "TEXMFVAR",
    "TEXMFCONFIG",
];

/// Host variables that never reach a sandboxed process.
const DEFAULT_DENIED: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "SSH_AUTH_SOCK",
    "SSH_AGENT_PID",
    "SUDO_USER",
    "SUDO_UID",
    "SUDO_GID",
    "SUDO_COMMAND",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
];

/// Variables set for every engine invocation.
///
/// The line-length settings keep error messages on one line so the log
/// classifier can match them.
pub const ENGINE_ENV: &[(&str, &str)] = &[
    ("max_print_line", "4096"),
    ("error_line", "254"),
    ("half_error_line", "238"),
];

/// Allow/deny filter over host environment variables.
#[derive(Debug, Clone)]
pub struct EnvFilter {
    allowed_keys: HashSet<String>,
    denied_keys: HashSet<String>,
    pass_unlisted: bool,
}

impl Default for EnvFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvFilter {
    pub fn new() -> Self {
        Self {
            allowed_keys: DEFAULT_ALLOWED.iter().map(|k| k.to_string()).collect(),
            denied_keys: DEFAULT_DENIED.iter().map(|k| k.to_string()).collect(),
            pass_unlisted: false,
        }
    }

    /// Filter that passes nothing from the host.
    pub fn closed() -> Self {
        Self {
            allowed_keys: HashSet::new(),
            denied_keys: HashSet::new(),
            pass_unlisted: false,
        }
    }

    pub fn allow(mut self, key: impl Into<String>) -> Self {
        self.allowed_keys.insert(key.into());
        self
    }

    pub fn deny(mut self, key: impl Into<String>) -> Self {
        self.denied_keys.insert(key.into());
        self
    }

    pub fn pass_unlisted(mut self, pass: bool) -> Self {
        self.pass_unlisted = pass;
        self
    }

    /// Denylist takes precedence over the allowlist.
    pub fn should_pass(&self, key: &str) -> bool {
        if self.denied_keys.contains(key) {
            return false;
        }
        self.allowed_keys.contains(key) || self.pass_unlisted
    }

    /// Builds the final environment from host variables plus explicit ones.
    ///
    /// Explicit variables bypass the filter. The result is sorted by key.
    pub fn build(
        &self,
        host: impl IntoIterator<Item = (String, String)>,
        explicit: &[(String, String)],
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = host
            .into_iter()
            .filter(|(key, _)| self.should_pass(key))
            .collect();
        for (key, value) in explicit {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "x".to_string()),
            ("EDITOR".to_string(), "vi".to_string()),
            ("SOURCE_DATE_EPOCH".to_string(), "1700000000".to_string()),
        ]
    }

    #[test]
    fn test_default_filter() {
        let env = EnvFilter::new().build(host(), &[]);
        let keys: Vec<&str> = env.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["HOME", "PATH", "SOURCE_DATE_EPOCH"]);
    }

    #[test]
    fn test_deny_beats_allow() {
        let filter = EnvFilter::new().allow("AWS_SECRET_ACCESS_KEY");
        assert!(!filter.should_pass("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_pass_unlisted_keeps_denylist() {
        let filter = EnvFilter::new().pass_unlisted(true);
        assert!(filter.should_pass("EDITOR"));
        assert!(!filter.should_pass("SSH_AUTH_SOCK"));
    }

    #[test]
    fn test_explicit_overrides_host() {
        let explicit = vec![
            ("HOME".to_string(), "/work".to_string()),
            ("max_print_line".to_string(), "4096".to_string()),
        ];
        let env = EnvFilter::closed().build(host(), &explicit);
        assert_eq!(env.len(), 2);
        assert_eq!(env["HOME"], "/work");
        assert_eq!(env["max_print_line"], "4096");
    }
}
