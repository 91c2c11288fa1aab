use std::env;
use std::path::PathBuf;
use std::time::Duration;

use artforge_contracts::backends::BackendCatalog;

pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o-mini";

/// Read-only service configuration, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub replicate_api_token: Option<String>,
    pub replicate_api_base: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub text_model: String,
    pub catalog_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub network_retries: u32,
    pub http_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replicate_api_token: None,
            replicate_api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            openai_api_key: None,
            openai_api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            catalog_path: None,
            poll_interval: Duration::from_millis(1500),
            poll_attempts: 30,
            network_retries: 1,
            http_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Resolves every setting through `lookup`; values that fail to parse
    /// fall back to defaults, numeric values are clamped.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let first = |keys: &[&str]| keys.iter().find_map(|key| lookup(key));

        let poll_interval = lookup("ARTFORGE_POLL_INTERVAL")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|seconds| Duration::from_secs_f64(seconds.clamp(0.2, 5.0)))
            .unwrap_or(defaults.poll_interval);
        let poll_attempts = lookup("ARTFORGE_POLL_ATTEMPTS")
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(|value| value.clamp(1, 600))
            .unwrap_or(defaults.poll_attempts);
        let network_retries = lookup("ARTFORGE_NETWORK_RETRIES")
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(|value| value.min(5))
            .unwrap_or(defaults.network_retries);
        let http_timeout = lookup("ARTFORGE_HTTP_TIMEOUT")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|seconds| Duration::from_secs_f64(seconds.clamp(5.0, 600.0)))
            .unwrap_or(defaults.http_timeout);

        Self {
            replicate_api_token: first(&["REPLICATE_API_TOKEN", "REPLICATE_API_KEY"]),
            replicate_api_base: base_url(lookup("REPLICATE_API_BASE"), DEFAULT_REPLICATE_API_BASE),
            openai_api_key: lookup("OPENAI_API_KEY"),
            openai_api_base: base_url(lookup("OPENAI_API_BASE"), DEFAULT_OPENAI_API_BASE),
            text_model: lookup("ARTFORGE_TEXT_MODEL").unwrap_or(defaults.text_model),
            catalog_path: lookup("ARTFORGE_BACKENDS").map(PathBuf::from),
            poll_interval,
            poll_attempts,
            network_retries,
            http_timeout,
        }
    }

    /// Built-in catalog, overlaid with `catalog_path` when set.
    pub fn load_catalog(&self) -> anyhow::Result<BackendCatalog> {
        match &self.catalog_path {
            Some(path) => BackendCatalog::load(path),
            None => Ok(BackendCatalog::defaults()),
        }
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn base_url(raw: Option<String>, default: &str) -> String {
    raw.map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}
