// ABOUTME: Client configuration for the sandbox control plane and per-sandbox endpoints
// ABOUTME: Loads credentials and tuning from the environment with builder-style overrides

use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API key not found. Set E2B_API_KEY or provide it explicitly")]
    MissingApiKey,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration shared by every request a client issues
#[derive(Clone)]
pub struct ClientConfig {
    api_key: String,
    /// Control plane URL (sandbox lifecycle, metrics, logs)
    pub base_url: String,
    /// Domain under which sandbox endpoints are published
    pub domain: String,
    /// Deadline for a single unary request; streams are not bounded by it
    pub request_timeout: Duration,
    /// Retry budget for transient failures
    pub max_retries: u32,
    pub retry_initial_interval: Duration,
    /// Route everything to local development endpoints
    pub debug: bool,
    /// Fixed URL for the per-sandbox agent and interpreter endpoints
    pub sandbox_url: Option<String>,
}

impl ClientConfig {
    /// Load configuration from the process environment.
    ///
    /// Fails when `E2B_API_KEY` is absent or empty.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup(E2B_API_KEY)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let mut config = Self::defaults(api_key, &lookup);

        if let Some(url) = lookup(E2B_API_URL).filter(|v| !v.trim().is_empty()) {
            config.base_url = url.trim().trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup(E2B_SANDBOX_URL).filter(|v| !v.trim().is_empty()) {
            config.sandbox_url = Some(url.trim().trim_end_matches('/').to_string());
        }

        if let Some(secs) = lookup(SKIFF_REQUEST_TIMEOUT_SECS) {
            let secs = secs.trim().parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("{SKIFF_REQUEST_TIMEOUT_SECS} must be an integer"))
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(retries) = lookup(SKIFF_MAX_RETRIES) {
            config.max_retries = retries.trim().parse::<u32>().map_err(|_| {
                ConfigError::Invalid(format!("{SKIFF_MAX_RETRIES} must be an integer"))
            })?;
        }

        config.validate()?;
        debug!(base_url = %config.base_url, domain = %config.domain, "Loaded client configuration");
        Ok(config)
    }

    /// Build a configuration around an explicit API key.
    ///
    /// Domain and debug mode still honour the environment.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::defaults(api_key.into(), &|name: &str| env::var(name).ok())
    }

    fn defaults<F>(api_key: String, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup(E2B_DEBUG)
            .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
            .unwrap_or(false);

        let domain = lookup(E2B_SANDBOX_DOMAIN)
            .or_else(|| lookup(E2B_DOMAIN))
            .and_then(|d| normalize_domain(&d))
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());

        Self {
            api_key,
            base_url: if debug {
                DEBUG_API_URL.to_string()
            } else {
                DEFAULT_API_URL.to_string()
            },
            domain,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            debug,
            sandbox_url: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        if let Some(domain) = normalize_domain(&domain.into()) {
            self.domain = domain;
        }
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_initial_interval(mut self, interval: Duration) -> Self {
        self.retry_initial_interval = interval;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn sandbox_url(mut self, url: impl Into<String>) -> Self {
        self.sandbox_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.api_key.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(ConfigError::Invalid(
                "API key contains whitespace or control characters".to_string(),
            ));
        }
        if !is_http_url(&self.base_url) {
            return Err(ConfigError::Invalid(format!(
                "Base URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if let Some(url) = &self.sandbox_url {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(format!(
                    "Sandbox URL must start with http:// or https://, got '{url}'"
                )));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Request timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "Retry budget {} exceeds the limit of {MAX_RETRIES_LIMIT}",
                self.max_retries
            )));
        }
        Ok(())
    }

    /// URL of a service port inside one sandbox.
    ///
    /// `domain` is the domain the control plane reported for the sandbox, if any.
    pub fn sandbox_endpoint(&self, port: u16, sandbox_id: &str, domain: Option<&str>) -> String {
        if let Some(url) = &self.sandbox_url {
            return url.clone();
        }
        if self.debug {
            return format!("http://localhost:{port}");
        }
        let domain = domain
            .and_then(normalize_domain)
            .unwrap_or_else(|| self.domain.clone());
        format!("https://{port}-{sandbox_id}.{domain}")
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("domain", &self.domain)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_interval", &self.retry_initial_interval)
            .field("debug", &self.debug)
            .field("sandbox_url", &self.sandbox_url)
            .finish()
    }
}

fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches("api.").trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_missing_api_key_fails_fast() {
        let result = ClientConfig::from_lookup(lookup_from(&[]));
        assert_eq!(result.unwrap_err(), ConfigError::MissingApiKey);
    }

    #[test]
    fn test_blank_api_key_is_missing() {
        let result = ClientConfig::from_lookup(lookup_from(&[(E2B_API_KEY, "   ")]));
        assert_eq!(result.unwrap_err(), ConfigError::MissingApiKey);
    }

    #[test]
    fn test_defaults_from_env() {
        let config = ClientConfig::from_lookup(lookup_from(&[(E2B_API_KEY, "key-123")])).unwrap();
        assert_eq!(config.api_key(), "key-123");
        assert_eq!(config.base_url, DEFAULT_API_URL);
        assert_eq!(config.domain, DEFAULT_DOMAIN);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(
            config.request_timeout,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
        assert!(!config.debug);
        assert!(config.sandbox_url.is_none());
    }

    #[test]
    fn test_debug_mode_uses_local_endpoints() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (E2B_API_KEY, "key"),
            (E2B_DEBUG, "TRUE"),
        ]))
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.base_url, DEBUG_API_URL);
        assert_eq!(
            config.sandbox_endpoint(ENVD_PORT, "sbx1", Some("other.dev")),
            "http://localhost:49983"
        );
    }

    #[test]
    fn test_sandbox_domain_precedence_and_normalization() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (E2B_API_KEY, "key"),
            (E2B_DOMAIN, "ignored.dev"),
            (E2B_SANDBOX_DOMAIN, " api.custom.dev "),
        ]))
        .unwrap();
        assert_eq!(config.domain, "custom.dev");
    }

    #[test]
    fn test_tuning_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (E2B_API_KEY, "key"),
            (SKIFF_REQUEST_TIMEOUT_SECS, "5"),
            (SKIFF_MAX_RETRIES, "0"),
            (E2B_API_URL, "http://127.0.0.1:9000/"),
        ]))
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_unparseable_tuning_is_rejected() {
        let result = ClientConfig::from_lookup(lookup_from(&[
            (E2B_API_KEY, "key"),
            (SKIFF_MAX_RETRIES, "lots"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    #[case::base_url(ClientConfig::with_api_key("k").base_url("ftp://host"))]
    #[case::sandbox_url(ClientConfig::with_api_key("k").sandbox_url("localhost:1"))]
    #[case::zero_timeout(ClientConfig::with_api_key("k").request_timeout(Duration::ZERO))]
    #[case::retry_budget(ClientConfig::with_api_key("k").max_retries(MAX_RETRIES_LIMIT + 1))]
    #[case::key_whitespace(ClientConfig::with_api_key("bad key"))]
    fn test_validate_rejects(#[case] config: ClientConfig) {
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_sandbox_endpoint_resolution() {
        let config = ClientConfig::with_api_key("k").debug(false).domain("e2b.dev");
        assert_eq!(
            config.sandbox_endpoint(ENVD_PORT, "abc", None),
            "https://49983-abc.e2b.dev"
        );
        assert_eq!(
            config.sandbox_endpoint(INTERPRETER_PORT, "abc", Some("eu.e2b.dev")),
            "https://49999-abc.eu.e2b.dev"
        );

        let pinned = config.sandbox_url("http://127.0.0.1:4000/");
        assert_eq!(
            pinned.sandbox_endpoint(ENVD_PORT, "abc", None),
            "http://127.0.0.1:4000"
        );
    }

    #[test]
    fn test_debug_output_redacts_key() {
        let config = ClientConfig::with_api_key("super-secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
