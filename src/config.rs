//! TOML service configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable that overrides `database.path`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Provider names the service knows how to talk to.
pub const KNOWN_PROVIDERS: &[&str] = &["electricitymaps", "energycharts"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level service configuration parsed from TOML.
///
/// Every section has defaults, so an empty file yields a simulation-only
/// service on `0.0.0.0:8000` with no providers enabled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// SQLite database.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upstream providers keyed by lower-case name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Background ingestion.
    #[serde(default)]
    pub cron: CronConfig,
    /// Log filtering.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database file.
    pub path: PathBuf,
    /// How long a writer waits for the database lock (ms).
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/elephant.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Busy timeout as a `Duration`.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Settings for one upstream provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Whether the provider is polled and queried.
    pub enabled: bool,
    /// API token, sent as the provider expects.
    pub api_token: Option<String>,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
}

/// One region/provider pair polled by the scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// ISO 3166-1 alpha-2 region code.
    pub region: String,
    /// Provider name, one of [`KNOWN_PROVIDERS`].
    pub provider: String,
    /// Marks the provider served by `/carbon-intensity/current/primary`.
    #[serde(default)]
    pub primary: bool,
}

/// Background polling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CronConfig {
    /// Seconds between ingestion passes (must be > 0).
    pub interval_seconds: u64,
    /// Sources polled on every pass.
    pub sources: Vec<SourceConfig>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            sources: Vec::new(),
        }
    }
}

impl CronConfig {
    /// Poll interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter level; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"cron.interval_seconds"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl AppConfig {
    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Replaces `database.path` with `value` when it is set and non-empty.
    ///
    /// A `sqlite://` prefix is stripped.
    pub fn apply_database_url(&mut self, value: Option<String>) {
        if let Some(url) = value.filter(|v| !v.trim().is_empty()) {
            let path = url.strip_prefix("sqlite://").unwrap_or(&url);
            self.database.path = PathBuf::from(path);
        }
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_database_url(std::env::var(DATABASE_URL_ENV).ok());
    }

    /// Settings for `name` when that provider is enabled.
    pub fn enabled_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name).filter(|p| p.enabled)
    }

    /// Provider marked primary for `region`, if any.
    pub fn primary_provider(&self, region: &str) -> Option<&str> {
        self.cron
            .sources
            .iter()
            .find(|s| s.primary && s.region.eq_ignore_ascii_case(region))
            .map(|s| s.provider.as_str())
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push(ConfigError {
                field: "server.host".into(),
                message: "must not be empty".into(),
            });
        }

        if self.database.path.as_os_str().is_empty() {
            errors.push(ConfigError {
                field: "database.path".into(),
                message: "must not be empty".into(),
            });
        } else if let Some(scheme) = self.database.path.to_str().and_then(url_scheme) {
            errors.push(ConfigError {
                field: "database.path".into(),
                message: format!(
                    "unsupported database URL scheme '{scheme}://', expected a file path or sqlite://"
                ),
            });
        }

        for (name, provider) in &self.providers {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                errors.push(ConfigError {
                    field: format!("providers.{name}"),
                    message: format!("unknown provider, available: {}", KNOWN_PROVIDERS.join(", ")),
                });
                continue;
            }
            if provider.enabled && name == "electricitymaps" {
                match provider.api_token.as_deref().map(str::trim) {
                    None | Some("") => errors.push(ConfigError {
                        field: format!("providers.{name}.api_token"),
                        message: "required when the provider is enabled".into(),
                    }),
                    Some(token) if token.starts_with("your-") => errors.push(ConfigError {
                        field: format!("providers.{name}.api_token"),
                        message: "placeholder token must be replaced with a real one".into(),
                    }),
                    Some(_) => {}
                }
            }
        }

        if self.cron.interval_seconds == 0 {
            errors.push(ConfigError {
                field: "cron.interval_seconds".into(),
                message: "must be > 0".into(),
            });
        }

        for (i, source) in self.cron.sources.iter().enumerate() {
            if !is_region_code(&source.region) {
                errors.push(ConfigError {
                    field: format!("cron.sources[{i}].region"),
                    message: format!("must be a two-letter code, got \"{}\"", source.region),
                });
            }
            if !KNOWN_PROVIDERS.contains(&source.provider.to_lowercase().as_str()) {
                errors.push(ConfigError {
                    field: format!("cron.sources[{i}].provider"),
                    message: format!("unknown provider \"{}\"", source.provider),
                });
            }
        }

        let mut primaries = BTreeMap::new();
        for source in self.cron.sources.iter().filter(|s| s.primary) {
            *primaries.entry(source.region.to_uppercase()).or_insert(0) += 1;
        }
        for (region, count) in primaries {
            if count > 1 {
                errors.push(ConfigError {
                    field: "cron.sources".into(),
                    message: format!("region {region} has {count} primary providers"),
                });
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            errors.push(ConfigError {
                field: "logging.level".into(),
                message: format!(
                    "must be one of {}, got \"{}\"",
                    LOG_LEVELS.join(", "),
                    self.logging.level
                ),
            });
        }

        errors
    }
}

/// Scheme of a `scheme://...` URL, if `s` looks like one.
fn url_scheme(s: &str) -> Option<&str> {
    let (scheme, _) = s.split_once("://")?;
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// `true` for two ASCII letters, in either case.
pub fn is_region_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic())
}
