//! TOML-based configuration for branchgate.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration: blacklist mode with an empty list, references followed,
//! built-in probers only.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::hosting::format::ProberRegistry;
use crate::hosting::opener::DEFAULT_MAX_HOPS;
use crate::hosting::urlutils;
use crate::policy::PolicyMode;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Access policy applied when opening branches.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Diff rendering and storage limits.
    #[serde(default)]
    pub diff: DiffConfig,
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level used when `RUST_LOG` is unset (default `info`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the database and stored diff text.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/branchgate")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl GeneralConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("branchgate.db")
    }

    pub fn diff_dir(&self) -> PathBuf {
        self.data_dir.join("diffs")
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Access policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: PolicyMode,

    /// URLs denied (blacklist) or allowed (whitelist).
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default = "default_true")]
    pub follow_references: bool,

    /// Schemes a URL must use; empty allows any.
    #[serde(default)]
    pub allowed_schemes: Vec<String>,

    /// Names of the format probers consulted while opening.
    #[serde(default = "default_probers")]
    pub probers: Vec<String>,

    /// Bound on reference plus stacking hops per open.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

fn default_true() -> bool {
    true
}
fn default_probers() -> Vec<String> {
    vec!["branch".into(), "reference".into()]
}
fn default_max_hops() -> usize {
    DEFAULT_MAX_HOPS
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::default(),
            urls: Vec::new(),
            follow_references: true,
            allowed_schemes: Vec::new(),
            probers: default_probers(),
            max_hops: default_max_hops(),
        }
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Stored diffs larger than this many bytes are not read back.
    #[serde(default = "default_max_read_size")]
    pub max_read_size: u64,

    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
}

fn default_max_read_size() -> u64 {
    1024 * 1024
}
fn default_context_lines() -> usize {
    3
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_read_size: default_max_read_size(),
            context_lines: default_context_lines(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate against the built-in prober set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with(&ProberRegistry::with_builtin())
    }

    /// Validate, accepting any prober known to `registry`.
    pub fn validate_with(&self, registry: &ProberRegistry) -> Result<(), ConfigError> {
        if self.general.data_dir.as_os_str().is_empty() {
            return Err(invalid("general.data_dir", "data directory must not be empty"));
        }
        if self.policy.max_hops == 0 {
            return Err(invalid("policy.max_hops", "must be at least 1"));
        }
        if self.diff.max_read_size == 0 {
            return Err(invalid("diff.max_read_size", "must be greater than 0"));
        }
        if self.policy.probers.is_empty() {
            return Err(invalid("policy.probers", "at least one prober is required"));
        }
        if let Err(unknown) = registry.select(&self.policy.probers) {
            return Err(invalid(
                "policy.probers",
                &format!(
                    "unknown prober '{}' (known: {})",
                    unknown,
                    registry.names().join(", ")
                ),
            ));
        }
        if self.policy.mode == PolicyMode::Whitelist && self.policy.urls.is_empty() {
            return Err(invalid("policy.urls", "whitelist mode requires at least one URL"));
        }
        if let Some(url) = self.policy.urls.iter().find(|url| !urlutils::is_absolute(url)) {
            return Err(invalid(
                "policy.urls",
                &format!("'{}' is not an absolute URL", url),
            ));
        }
        let bad_scheme = self.policy.allowed_schemes.iter().find(|scheme| {
            scheme.is_empty()
                || !scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        });
        if let Some(scheme) = bad_scheme {
            return Err(invalid(
                "policy.allowed_schemes",
                &format!("'{}' is not a valid scheme", scheme),
            ));
        }
        Ok(())
    }

    /// Load and validate in one step.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[general]
log_level = "debug"
data_dir = "/tmp/branchgate"

[policy]
mode = "whitelist"
urls = ["https://code.example.com/trunk", "https://code.example.com/feature"]
follow_references = false
allowed_schemes = ["https"]
max_hops = 8

[diff]
max_read_size = 4096
"#
    }

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::parse(sample_toml()).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.database_path(), PathBuf::from("/tmp/branchgate/branchgate.db"));
        assert_eq!(config.policy.mode, PolicyMode::Whitelist);
        assert_eq!(config.policy.urls.len(), 2);
        assert!(!config.policy.follow_references);
        assert_eq!(config.policy.probers, vec!["branch", "reference"]);
        assert_eq!(config.policy.max_hops, 8);
        assert_eq!(config.diff.max_read_size, 4096);
        assert_eq!(config.diff.context_lines, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.data_dir, PathBuf::from("/var/lib/branchgate"));
        assert_eq!(config.policy.mode, PolicyMode::Blacklist);
        assert!(config.policy.follow_references);
        assert_eq!(config.policy.max_hops, DEFAULT_MAX_HOPS);
        assert_eq!(config.diff.max_read_size, 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();
        let config = AppConfig::load_and_validate(file.path()).unwrap();
        assert_eq!(config.policy.allowed_schemes, vec!["https"]);
    }

    #[test]
    fn test_missing_file() {
        let result = AppConfig::load_from_file("/nonexistent/branchgate.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = AppConfig::parse("[policy]\nmode = \"greylist\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_prober() {
        let config = AppConfig::parse("[policy]\nprobers = [\"branch\", \"svn\"]\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown prober 'svn'"));
    }

    #[test]
    fn test_validate_rejects_empty_whitelist() {
        let config = AppConfig::parse("[policy]\nmode = \"whitelist\"\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "policy.urls"
        ));
    }

    #[test]
    fn test_validate_rejects_relative_url() {
        let config = AppConfig::parse("[policy]\nurls = [\"../trunk\"]\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = AppConfig::parse("[policy]\nmax_hops = 0\n").unwrap();
        assert!(config.validate().is_err());
        let config = AppConfig::parse("[diff]\nmax_read_size = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
