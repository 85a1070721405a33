//! Configuration management

use std::{collections::HashSet, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::join::policy::Policy;
use crate::join::{circleci, github};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` expansion.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Join pipeline configuration
    pub join: JoinConfig,
    /// Identity provider configuration
    pub providers: ProvidersConfig,
    /// Admin endpoint configuration
    pub admin: AdminConfig,
    /// Join policies loaded into the policy store at startup
    pub policies: Vec<Policy>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or declares invalid policies.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // CI_JOIN_SERVER__PORT=8080 -> server.port
        figment = figment.merge(Env::prefixed("CI_JOIN_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must land before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in policy organization ids and
    /// the GitHub audience.
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Config(e.to_string()))?;

        for policy in &mut self.policies {
            policy.organization_id = Self::expand_string(&re, &policy.organization_id);
        }
        self.providers.github.audience = Self::expand_string(&re, &self.providers.github.audience);
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check policies and durations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for policy in &self.policies {
            policy.validate().map_err(|e| Error::Config(e.to_string()))?;
            if !seen.insert(policy.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate policy name: {:?}",
                    policy.name
                )));
            }
        }
        if self.join.validation_timeout.is_zero() {
            return Err(Error::Config(
                "join.validation_timeout must be greater than zero".to_string(),
            ));
        }
        if self.join.reaper_interval.is_zero() {
            return Err(Error::Config(
                "join.reaper_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3025,
            request_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Join pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Upper bound on one provider validation call
    #[serde(with = "humantime_serde")]
    pub validation_timeout: Duration,
    /// Lifetime of issued credentials
    #[serde(with = "humantime_serde")]
    pub credential_ttl: Duration,
    /// How often expired policies and credentials are reaped
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            validation_timeout: Duration::from_secs(10),
            credential_ttl: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

/// Identity provider configuration shared by the built-in validators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// How long fetched signing keys are trusted before refetching
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Timeout for one JWKS fetch
    #[serde(with = "humantime_serde")]
    pub jwks_fetch_timeout: Duration,
    /// CircleCI settings
    pub circleci: CircleCiConfig,
    /// GitHub Actions settings
    pub github: GitHubConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            jwks_cache_ttl: Duration::from_secs(3600),
            jwks_fetch_timeout: Duration::from_secs(5),
            circleci: CircleCiConfig::default(),
            github: GitHubConfig::default(),
        }
    }
}

/// CircleCI provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircleCiConfig {
    /// Issuer prefix; the organization id is appended
    pub issuer_base: String,
}

impl Default for CircleCiConfig {
    fn default() -> Self {
        Self {
            issuer_base: circleci::DEFAULT_ISSUER_BASE.to_string(),
        }
    }
}

/// GitHub Actions provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Issuer; an enterprise slug from the policy is appended when set
    pub issuer_base: String,
    /// Audience tokens must be minted for (normally the cluster name)
    pub audience: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            issuer_base: github::DEFAULT_ISSUER_BASE.to_string(),
            audience: "ci-join".to_string(),
        }
    }
}

/// Admin endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for admin endpoints.
    /// Supports: literal value or `env:VAR_NAME`. Unset disables them.
    pub bearer_token: Option<String>,
}

impl AdminConfig {
    /// Resolve the bearer token (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        self.bearer_token.as_ref().and_then(|token| {
            if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).ok()
            } else {
                Some(token.clone())
            }
        })
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
