use std::env;
use std::str::FromStr;

use tracing::info;

use crate::error::AftersError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBackend {
    /// Hit the platform directly with rotating identities.
    Direct,
    /// Run the Apify scraper actor.
    Apify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionBackend {
    Claude,
    Http,
}

/// Credentials and endpoints, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Registry
    pub venues_file: String,

    // Fetching
    pub fetch_backend: FetchBackend,
    pub apify_api_token: Option<String>,
    pub user_agents: Vec<String>,
    pub proxy_urls: Vec<String>,

    // Classification
    pub vision_backend: VisionBackend,
    pub anthropic_api_key: Option<String>,
    pub vision_model: String,
    pub vision_endpoint: Option<String>,

    // Persistence
    pub database_url: Option<String>,

    // Operator alerts
    pub slack_webhook_url: Option<String>,
}

const DEFAULT_VISION_MODEL: &str = "claude-sonnet-4-20250514";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AftersError> {
        let fetch_backend = match env::var("FETCH_BACKEND").as_deref() {
            Ok("apify") => FetchBackend::Apify,
            Ok("direct") | Err(_) => FetchBackend::Direct,
            Ok(other) => {
                return Err(AftersError::Config(format!(
                    "FETCH_BACKEND must be `direct` or `apify`, got `{other}`"
                )))
            }
        };
        let vision_backend = match env::var("VISION_BACKEND").as_deref() {
            Ok("http") => VisionBackend::Http,
            Ok("claude") | Err(_) => VisionBackend::Claude,
            Ok(other) => {
                return Err(AftersError::Config(format!(
                    "VISION_BACKEND must be `claude` or `http`, got `{other}`"
                )))
            }
        };

        let mut user_agents = env_list("USER_AGENTS");
        if user_agents.is_empty() {
            user_agents.push(DEFAULT_USER_AGENT.to_string());
        }

        let config = Self {
            venues_file: required_env("VENUES_FILE")?,
            fetch_backend,
            apify_api_token: optional_env("APIFY_API_TOKEN"),
            user_agents,
            proxy_urls: env_list("PROXY_URLS"),
            vision_backend,
            anthropic_api_key: optional_env("ANTHROPIC_API_KEY"),
            vision_model: env::var("VISION_MODEL")
                .unwrap_or_else(|_| DEFAULT_VISION_MODEL.to_string()),
            vision_endpoint: optional_env("VISION_ENDPOINT"),
            database_url: optional_env("DATABASE_URL"),
            slack_webhook_url: optional_env("SLACK_WEBHOOK_URL"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AftersError> {
        if self.fetch_backend == FetchBackend::Apify && self.apify_api_token.is_none() {
            return Err(AftersError::Config(
                "APIFY_API_TOKEN is required when FETCH_BACKEND=apify".to_string(),
            ));
        }
        match self.vision_backend {
            VisionBackend::Claude if self.anthropic_api_key.is_none() => Err(AftersError::Config(
                "ANTHROPIC_API_KEY is required when VISION_BACKEND=claude".to_string(),
            )),
            VisionBackend::Http if self.vision_endpoint.is_none() => Err(AftersError::Config(
                "VISION_ENDPOINT is required when VISION_BACKEND=http".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Log the loaded configuration with secrets reduced to presence flags.
    pub fn log_redacted(&self) {
        info!(
            venues_file = %self.venues_file,
            fetch_backend = ?self.fetch_backend,
            apify_token = self.apify_api_token.is_some(),
            user_agents = self.user_agents.len(),
            proxies = self.proxy_urls.len(),
            vision_backend = ?self.vision_backend,
            vision_model = %self.vision_model,
            anthropic_key = self.anthropic_api_key.is_some(),
            database = self.database_url.is_some(),
            slack = self.slack_webhook_url.is_some(),
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> Result<String, AftersError> {
    env::var(key).map_err(|_| AftersError::Config(format!("{key} environment variable is required")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Comma-separated list; blank entries dropped.
pub fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `key` if set, otherwise fall back to `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, AftersError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AftersError::Config(format!("{key} has an invalid value: `{raw}`"))),
        Err(_) => Ok(default),
    }
}
