//! Configuration module for mixtrack.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [mixpanel]
//! token = "${MIXPANEL_TOKEN}"
//! consumer = "PoliteBufferedConsumer"
//! profile_properties = "AppProfileProperties"
//!
//! [customerio]
//! site_id = "${CUSTOMERIO_SITE_ID}"
//! api_key = "${CUSTOMERIO_API_KEY}"
//! region = "eu"
//! ```

use crate::vocabulary::VocabularyKind;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Mixpanel ingestion API
pub const DEFAULT_API_HOST: &str = "https://api.mixpanel.com";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    /// An override was given as a table, array or number instead of a name
    #[error("{setting} must be an identifier, not an instance (found {found})")]
    NotAnIdentifier {
        setting: &'static str,
        found: &'static str,
    },

    #[error("{setting}: '{identifier}' is not registered")]
    UnknownIdentifier {
        setting: &'static str,
        identifier: String,
    },

    #[error("'{identifier}' must be based on {base}")]
    NotBasedOn { identifier: String, base: String },

    #[error("Unknown customer.io region '{0}', expected 'eu' or 'us'")]
    UnknownRegion(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrackConfig {
    #[serde(default)]
    pub mixpanel: MixpanelConfig,

    #[serde(default)]
    pub customerio: CustomerIoConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Mixpanel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MixpanelConfig {
    /// Project token; without one nothing is ever sent
    #[serde(default)]
    pub token: Option<String>,

    /// API secret, only needed by the query path
    #[serde(default)]
    pub api_secret: Option<String>,

    #[serde(default)]
    pub testing: bool,

    /// Registry identifier of the consumer
    #[serde(default)]
    pub consumer: Option<toml::Value>,

    // Registry identifiers of vocabulary overrides. Kept as raw values so
    // tables and arrays can be rejected with a precise error.
    #[serde(default)]
    pub events: Option<toml::Value>,

    #[serde(default)]
    pub event_properties: Option<toml::Value>,

    #[serde(default)]
    pub profile_properties: Option<toml::Value>,

    #[serde(default)]
    pub profile_meta_properties: Option<toml::Value>,

    #[serde(default = "default_api_host")]
    pub api_host: String,

    /// Make the in-memory consumer drop bookkeeping fields
    #[serde(default)]
    pub strip_bookkeeping: bool,
}

impl Default for MixpanelConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_secret: None,
            testing: false,
            consumer: None,
            events: None,
            event_properties: None,
            profile_properties: None,
            profile_meta_properties: None,
            api_host: default_api_host(),
            strip_bookkeeping: false,
        }
    }
}

fn default_api_host() -> String {
    DEFAULT_API_HOST.to_string()
}

/// A usable value: set, non-empty and with no unsubstituted placeholder.
fn usable(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.contains("${"))
}

impl MixpanelConfig {
    pub fn token(&self) -> Option<&str> {
        usable(&self.token)
    }

    pub fn api_secret(&self) -> Option<&str> {
        usable(&self.api_secret)
    }

    /// Whether messages are recorded in memory instead of sent.
    pub fn is_testing(&self) -> bool {
        self.testing || self.token().is_none()
    }

    /// The override setting for one vocabulary kind.
    pub fn vocabulary_setting(&self, kind: VocabularyKind) -> Option<&toml::Value> {
        match kind {
            VocabularyKind::Events => self.events.as_ref(),
            VocabularyKind::EventProperties => self.event_properties.as_ref(),
            VocabularyKind::ProfileProperties => self.profile_properties.as_ref(),
            VocabularyKind::ProfileMetaProperties => self.profile_meta_properties.as_ref(),
        }
    }
}

/// customer.io configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CustomerIoConfig {
    #[serde(default)]
    pub site_id: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// "eu" or "us"
    #[serde(default)]
    pub region: Option<String>,

    /// Base URL override, e.g. for a proxy
    #[serde(default)]
    pub url: Option<String>,
}

impl CustomerIoConfig {
    /// Site id, API key and region, if all three are configured.
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        Some((
            usable(&self.site_id)?,
            usable(&self.api_key)?,
            usable(&self.region)?,
        ))
    }
}

/// Log output format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Server configuration (demo binary)
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

impl TrackConfig {
    /// Load configuration from the default path or MIXTRACK_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("MIXTRACK_CONFIG").unwrap_or_else(|_| "config/mixtrack.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;

        info!(
            testing = config.mixpanel.is_testing(),
            customerio = config.customerio.credentials().is_some(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate configuration text, substituting `${VAR}`s first.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: TrackConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        let host = &self.mixpanel.api_host;
        if !host.starts_with("http://") && !host.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "mixpanel.api_host '{}' must start with http:// or https://",
                host
            )));
        }

        if self
            .mixpanel
            .token
            .as_deref()
            .is_some_and(|t| t.contains("${"))
        {
            warn!("Mixpanel token contains unsubstituted environment variable");
        }

        if let Some(region) = usable(&self.customerio.region) {
            region.parse::<crate::customerio::Region>()?;
        }

        if let Some(url) = &self.customerio.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "customerio.url '{}' must start with http:// or https://",
                    url
                )));
            }
        }

        let partial = [
            &self.customerio.site_id,
            &self.customerio.api_key,
            &self.customerio.region,
        ]
        .iter()
        .filter(|v| usable(v).is_some())
        .count();
        if partial > 0 && partial < 3 {
            warn!("customer.io needs site_id, api_key and region; mirroring disabled");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    });

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("MIXTRACK_TEST_TOKEN", "substituted_value");
        let input = "token = \"${MIXTRACK_TEST_TOKEN}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "token = \"substituted_value\"");
        env::remove_var("MIXTRACK_TEST_TOKEN");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "token = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "token = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = TrackConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.mixpanel.api_host, DEFAULT_API_HOST);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.mixpanel.is_testing());
        assert!(config.customerio.credentials().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            token = "secret"
            consumer = "QueuedConsumer"
            profile_properties = "AppProfileProperties"

            [customerio]
            site_id = "site"
            api_key = "key"
            region = "us"

            [logging]
            format = "json"

            [server]
            port = 4000
        "#,
        )
        .unwrap();

        assert_eq!(config.mixpanel.token(), Some("secret"));
        assert!(!config.mixpanel.is_testing());
        assert_eq!(
            config.mixpanel.consumer.as_ref().and_then(|v| v.as_str()),
            Some("QueuedConsumer")
        );
        assert_eq!(
            config
                .mixpanel
                .vocabulary_setting(VocabularyKind::ProfileProperties)
                .and_then(|v| v.as_str()),
            Some("AppProfileProperties")
        );
        assert!(config
            .mixpanel
            .vocabulary_setting(VocabularyKind::Events)
            .is_none());
        assert_eq!(config.customerio.credentials(), Some(("site", "key", "us")));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn test_testing_flag_and_placeholder_token() {
        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            token = "secret"
            testing = true
        "#,
        )
        .unwrap();
        assert!(config.mixpanel.is_testing());

        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            token = "${MIXTRACK_SURELY_UNSET_TOKEN}"
        "#,
        )
        .unwrap();
        assert!(config.mixpanel.token().is_none());
        assert!(config.mixpanel.is_testing());
    }

    #[test]
    fn test_override_kept_as_raw_value() {
        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel.events]
            page_viewed = "Page Viewed"
        "#,
        )
        .unwrap();

        assert!(config.mixpanel.events.as_ref().unwrap().is_table());
    }

    #[test]
    fn test_validation_unknown_region() {
        let result = TrackConfig::from_toml_str(
            r#"
            [customerio]
            region = "asia"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::UnknownRegion(r)) if r == "asia"));
    }

    #[test]
    fn test_validation_invalid_api_host() {
        let result = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            api_host = "api.mixpanel.com"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = TrackConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::NotAnIdentifier {
            setting: "mixpanel.events",
            found: "table",
        };
        assert_eq!(
            err.to_string(),
            "mixpanel.events must be an identifier, not an instance (found table)"
        );

        let err = ConfigError::NotBasedOn {
            identifier: "Foo".into(),
            base: "Events".into(),
        };
        assert_eq!(err.to_string(), "'Foo' must be based on Events");
    }
}
