//! Controller configuration.
//!
//! Resolution order, lowest to highest priority:
//! 1. Built-in defaults
//! 2. JSON config file (`--config` / `GPUOPS_CONFIG`)
//! 3. Environment variables (`GPUOPS_*`)
//! 4. CLI arguments

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// HTTP bind address.
    pub listen_addr: String,
    /// SQLite database file. Defaults to `~/.gpuops/controller.db`.
    pub database_path: Option<PathBuf>,

    /// Balance seeded on first-sight billing users.
    pub default_balance: f64,
    /// Balance at or below this is `warning`. Must be >= `limited_threshold`.
    pub warning_threshold: f64,
    /// Balance at or below this is `limited`. Must be >= 0.
    pub limited_threshold: f64,
    /// Seconds a user must have been blocked before kill_process is emitted.
    pub kill_grace_period_seconds: u64,
    /// Billing interval used when a report omits (or exaggerates) its own.
    pub sample_interval_seconds: i64,

    /// Fallback price when the `CPU_CORE` row is missing.
    pub cpu_price_per_core_minute: f64,
    /// Fallback price when a GPU model has no entry and no fuzzy match.
    pub default_price_per_minute: f64,

    /// Emit set_cpu_quota actions on limited/blocked transitions.
    pub enable_cpu_control: bool,
    pub cpu_limit_percent_limited: u32,
    pub cpu_limit_percent_blocked: u32,

    /// Shared secret the agents present in `X-Agent-Token`.
    pub agent_token: String,
    /// Bearer token for scripted admin access. Bypasses CSRF.
    pub admin_token: String,
    /// HMAC key for session cookies. Sessions are disabled when empty.
    pub auth_secret: String,
    /// Session lifetime in hours; 0 disables cookie authentication.
    pub session_hours: i64,

    /// Compute costs and actions but never debit balances.
    pub dry_run: bool,

    /// Mail relay settings, consumed by the external web/mail tier.
    pub smtp: SmtpConfig,
}

/// SMTP settings. Recognized here; delivery happens outside the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub from_email: String,
    pub from_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: None,
            default_balance: 100.0,
            warning_threshold: 20.0,
            limited_threshold: 5.0,
            kill_grace_period_seconds: 300,
            sample_interval_seconds: 60,
            cpu_price_per_core_minute: 0.0,
            default_price_per_minute: 0.0,
            enable_cpu_control: false,
            cpu_limit_percent_limited: 50,
            cpu_limit_percent_blocked: 10,
            agent_token: String::new(),
            admin_token: String::new(),
            auth_secret: String::new(),
            session_hours: 72,
            dry_run: false,
            smtp: SmtpConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("failed to read config file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ConfigError::new(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    fn apply_env_overrides(&mut self) {
        env_string("GPUOPS_LISTEN_ADDR", &mut self.listen_addr);
        if let Ok(val) = std::env::var("GPUOPS_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(val));
        }
        env_parse("GPUOPS_DEFAULT_BALANCE", &mut self.default_balance);
        env_parse("GPUOPS_WARNING_THRESHOLD", &mut self.warning_threshold);
        env_parse("GPUOPS_LIMITED_THRESHOLD", &mut self.limited_threshold);
        env_parse(
            "GPUOPS_KILL_GRACE_PERIOD_SECONDS",
            &mut self.kill_grace_period_seconds,
        );
        env_parse(
            "GPUOPS_SAMPLE_INTERVAL_SECONDS",
            &mut self.sample_interval_seconds,
        );
        env_parse(
            "GPUOPS_CPU_PRICE_PER_CORE_MINUTE",
            &mut self.cpu_price_per_core_minute,
        );
        env_parse(
            "GPUOPS_DEFAULT_PRICE_PER_MINUTE",
            &mut self.default_price_per_minute,
        );
        env_parse("GPUOPS_ENABLE_CPU_CONTROL", &mut self.enable_cpu_control);
        env_parse(
            "GPUOPS_CPU_LIMIT_PERCENT_LIMITED",
            &mut self.cpu_limit_percent_limited,
        );
        env_parse(
            "GPUOPS_CPU_LIMIT_PERCENT_BLOCKED",
            &mut self.cpu_limit_percent_blocked,
        );
        env_string("GPUOPS_AGENT_TOKEN", &mut self.agent_token);
        env_string("GPUOPS_ADMIN_TOKEN", &mut self.admin_token);
        env_string("GPUOPS_AUTH_SECRET", &mut self.auth_secret);
        env_parse("GPUOPS_SESSION_HOURS", &mut self.session_hours);
        env_parse("GPUOPS_DRY_RUN", &mut self.dry_run);

        env_string("GPUOPS_SMTP_HOST", &mut self.smtp.smtp_host);
        env_parse("GPUOPS_SMTP_PORT", &mut self.smtp.smtp_port);
        env_string("GPUOPS_SMTP_USER", &mut self.smtp.smtp_user);
        env_string("GPUOPS_SMTP_PASS", &mut self.smtp.smtp_pass);
        env_string("GPUOPS_FROM_EMAIL", &mut self.smtp.from_email);
        env_string("GPUOPS_FROM_NAME", &mut self.smtp.from_name);
    }

    /// Reject configurations the billing pipeline cannot run on.
    pub fn validate(&self) -> Result<()> {
        if self.limited_threshold < 0.0 {
            return Err(ConfigError::new("limited_threshold must be >= 0"));
        }
        if self.warning_threshold < self.limited_threshold {
            return Err(ConfigError::new(
                "warning_threshold must be >= limited_threshold",
            ));
        }
        if self.sample_interval_seconds <= 0 {
            return Err(ConfigError::new("sample_interval_seconds must be > 0"));
        }
        Ok(())
    }

    /// Resolved SQLite path, defaulting under the home directory.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".gpuops")
                .join("controller.db")
        })
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(val) = std::env::var(key) {
        if !val.trim().is_empty() {
            *target = val.trim().to_string();
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(parsed) = val.trim().parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.warning_threshold >= config.limited_threshold);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let config = ControllerConfig {
            warning_threshold: 1.0,
            limited_threshold: 5.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_limited_threshold_rejected() {
        let config = ControllerConfig {
            limited_threshold: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
