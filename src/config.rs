//! TOML configuration loading, `serde` + `toml` with
//! `#[serde(deny_unknown_fields, default)]` throughout so a typo or a
//! stale key fails fast at startup instead of being silently ignored.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::coordinator::CoordinatorConfig;
use crate::executor::TestCommand;
use crate::kill::KillSwitchConfig;
use crate::retry::RetryConfig;
use crate::validator::ProtectedBranches;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_percent: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_retries: d.max_retries,
            initial_delay_ms: d.initial_delay.as_millis() as u64,
            max_delay_ms: d.max_delay.as_millis() as u64,
            backoff_multiplier: d.backoff_multiplier,
            jitter_percent: d.jitter_percent,
        }
    }
}

impl From<RetrySettings> for RetryConfig {
    fn from(s: RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            backoff_multiplier: s.backoff_multiplier,
            jitter_percent: s.jitter_percent,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CascadeSettings {
    pub max_depth: usize,
    pub max_branches_per_cascade: usize,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        let d = KillSwitchConfig::default();
        Self {
            max_depth: d.max_depth,
            max_branches_per_cascade: d.max_branches_per_cascade,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub window_size: usize,
    pub max_bypass_slots: usize,
    pub default_depth: usize,
    pub min_adaptive_depth: usize,
    pub high_pass_rate_threshold: f64,
    pub low_pass_rate_threshold: f64,
    pub process_queue_tick_interval_ms: u64,
    pub kill_switch_timeout_ms: u64,
    pub test_timeout_secs: u64,
    pub conflict_depth: usize,
    pub retry: RetrySettings,
    pub cascade: CascadeSettings,
    pub protected_branches: Vec<String>,
    pub system_agents: Vec<String>,
    pub lock_ttl_secs: u64,
    pub lock_renewal_interval_secs: u64,
    /// The command run against each speculative batch. `None` means the
    /// coordinator is wired up without a production test runner (e.g. a
    /// dry-run or a test harness supplies its own `TestRunner`).
    pub test_command: Option<TestCommand>,
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: 5,
            max_bypass_slots: 3,
            default_depth: 5,
            min_adaptive_depth: 1,
            high_pass_rate_threshold: 0.90,
            low_pass_rate_threshold: 0.70,
            process_queue_tick_interval_ms: 100,
            kill_switch_timeout_ms: 500,
            test_timeout_secs: 300,
            conflict_depth: 1,
            retry: RetrySettings::default(),
            cascade: CascadeSettings::default(),
            protected_branches: vec!["main".into(), "master".into(), "release/*".into(), "hotfix/*".into(), "production/*".into()],
            system_agents: vec!["system".into(), "admin".into(), "coordinator".into()],
            lock_ttl_secs: 900,
            lock_renewal_interval_secs: 300,
            test_command: None,
            listen_addr: "127.0.0.1:7878".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("couldn't read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("couldn't parse config")?;
        Ok(config)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tick_interval: Duration::from_millis(self.process_queue_tick_interval_ms),
            default_depth: self.default_depth,
            min_adaptive_depth: self.min_adaptive_depth,
            high_pass_rate_threshold: self.high_pass_rate_threshold,
            low_pass_rate_threshold: self.low_pass_rate_threshold,
        }
    }

    pub fn kill_switch_config(&self) -> KillSwitchConfig {
        KillSwitchConfig {
            timeout: Duration::from_millis(self.kill_switch_timeout_ms),
            max_depth: self.cascade.max_depth,
            max_branches_per_cascade: self.cascade.max_branches_per_cascade,
            retry: RetryConfig::from(RetrySettings {
                max_retries: self.retry.max_retries,
                initial_delay_ms: self.retry.initial_delay_ms,
                max_delay_ms: self.retry.max_delay_ms,
                backoff_multiplier: self.retry.backoff_multiplier,
                jitter_percent: self.retry.jitter_percent,
            }),
        }
    }

    pub fn protected_branches(&self) -> ProtectedBranches {
        if self.protected_branches.is_empty() {
            ProtectedBranches::default()
        } else {
            ProtectedBranches::new(self.protected_branches.clone())
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_renewal_interval(&self) -> Duration {
        Duration::from_secs(self.lock_renewal_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.window_size, 5);
        assert_eq!(config.max_bypass_slots, 3);
        assert_eq!(config.high_pass_rate_threshold, 0.90);
        assert_eq!(config.low_pass_rate_threshold, 0.70);
        assert_eq!(config.kill_switch_config().max_branches_per_cascade, 1000);
    }

    #[test]
    fn parses_minimal_toml_with_defaults_filled_in() {
        let toml_str = r#"
            default_depth = 8
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_depth, 8);
        assert_eq!(config.max_bypass_slots, 3);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let toml_str = r#"
            not_a_real_field = 1
        "#;
        let result: Result<Config, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn shell_test_command_parses() {
        let toml_str = r#"
            test_command = "cargo test"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.test_command, Some(TestCommand::Shell(_))));
    }

    #[test]
    fn raw_test_command_parses() {
        let toml_str = r#"
            test_command = ["cargo", "test"]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.test_command, Some(TestCommand::Raw(_))));
    }
}
