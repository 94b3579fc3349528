use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::provider::ProviderKind;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Tunnels to establish and keep alive
    pub tunnels: Vec<TunnelSpec>,
    #[serde(default)]
    pub health: HealthCheckPolicy,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Local status server port (disabled when unset)
    #[serde(default)]
    pub status_port: Option<u16>,
}

/// One tunnel to supervise
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSpec {
    /// Unique name for this tunnel
    pub name: String,
    /// Provider ring, in failover order. A single entry disables rotation.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderKind>,
    /// Local port the tunnel forwards to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Provider-specific options, passed through to the backend
    #[serde(default)]
    pub options: ProviderOptions,
}

fn default_providers() -> Vec<ProviderKind> {
    vec![ProviderKind::Ngrok]
}

fn default_port() -> u16 {
    3000
}

/// Opaque option bag for provider backends
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderOptions {
    /// Full command-line override for the ngrok invocation (replaces `http <port>`)
    #[serde(default)]
    pub command: Option<String>,
    /// ngrok region (us, eu, ap, au, sa, jp, in)
    #[serde(default)]
    pub region: Option<String>,
    /// ngrok reserved subdomain
    #[serde(default)]
    pub subdomain: Option<String>,
    /// ngrok basic-auth credentials (user:password)
    #[serde(default)]
    pub auth: Option<String>,
}

/// Health check policy, shared by all tunnels
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between probe cycles in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Timeout for a single probe request in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before the critical signal fires
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    15_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_max_failures() -> u32 {
    3
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

/// Restart and failover tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Start attempts per provider before advancing the ring
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,
    /// Pause between stopping a failed tunnel and restarting it, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Overall timeout for one provider start attempt, in milliseconds
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

fn default_max_start_attempts() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    2_000
}

fn default_start_timeout_ms() -> u64 {
    30_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_start_attempts: default_max_start_attempts(),
            cooldown_ms: default_cooldown_ms(),
            start_timeout_ms: default_start_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from the default file and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None::<&Path>)
    }

    /// Load configuration from a specific TOML file, falling back to
    /// `tunnelkeeper.toml` in the working directory when none is given.
    /// Environment variables (TUNNELKEEPER_HEALTH__INTERVAL_MS, etc.)
    /// override file values.
    pub fn load_from<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        builder = match path {
            Some(p) => builder.add_source(File::from(p.as_ref())),
            None => builder.add_source(File::with_name("tunnelkeeper").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("TUNNELKEEPER")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values; fails fast before any process is spawned
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.tunnels.is_empty() {
            errors.push("at least one tunnel must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for spec in &self.tunnels {
            if spec.name.trim().is_empty() {
                errors.push("tunnel name must not be empty".to_string());
            }
            if !seen.insert(spec.name.as_str()) {
                errors.push(format!("duplicate tunnel name: \"{}\"", spec.name));
            }
            if spec.providers.is_empty() {
                errors.push(format!(
                    "tunnel \"{}\" must list at least one provider",
                    spec.name
                ));
            }
        }

        if self.health.interval_ms == 0 {
            errors.push("health.interval_ms must be positive".to_string());
        }

        if self.health.max_consecutive_failures == 0 {
            errors.push("health.max_consecutive_failures must be at least 1".to_string());
        }

        if self.supervisor.max_start_attempts == 0 {
            errors.push("supervisor.max_start_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
