//! Pipeline configuration for the orchestrator.
//!
//! This module provides configuration options for the outreach pipeline,
//! including service endpoints and credentials, cache settings, concurrency
//! limits, per-call timeouts and retry backoff.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default image-to-image endpoint for rendering and composition.
pub const DEFAULT_IMAGE_API_URL: &str = "https://media.datail.ai/image-to-image";

/// Default image model.
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";

/// Reference image used when neither the magnet nor the creator provides one.
pub const DEFAULT_REFERENCE_IMAGE_URL: &str = "https://substackcdn.com/image/fetch/$s_!8MSN!,w_80,h_80,c_fill,f_webp,q_auto:good,fl_progressive:steep,g_auto/https%3A%2F%2Fsubstack-post-media.s3.amazonaws.com%2Fpublic%2Fimages%2F441213db-4824-4e48-9d28-a3a18952cbfc_592x592.png";

/// Scene template the three rendered magnets are composed onto.
pub const DEFAULT_SCENE_TEMPLATE_URL: &str = "https://amzn-s3-fc-bucket.s3.sa-east-1.amazonaws.com/images/2025/12/18/82ce9e656b6b437e9a3277d3dae16d07.png";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Entity store
    /// Base URL of the REST entity store.
    pub store_url: Option<String>,
    /// API key sent as both `apikey` and bearer token.
    pub store_api_key: Option<String>,

    // Prompt service
    /// Base URL of the chat-style prompt service.
    pub prompt_url: Option<String>,
    /// Bearer token for the prompt service.
    pub prompt_api_key: Option<String>,
    /// User tag attached to prompt requests.
    pub prompt_user: String,

    // Image service
    /// Endpoint used to render single magnets.
    pub image_api_url: String,
    /// Endpoint used to compose the cover scene.
    pub scene_api_url: String,
    /// Model name passed to both image endpoints.
    pub image_model: String,
    /// Last-resort reference image for rendering.
    pub default_image_url: String,
    /// Candidate scene templates; one is picked per creator.
    pub scene_template_urls: Vec<String>,

    // Cache
    /// Directory holding one JSON file per (creator, stage).
    pub cache_dir: PathBuf,
    /// Whether stages consult and populate the cache.
    pub use_cache: bool,

    // Concurrency
    /// Creators processed at once in concurrent mode.
    pub max_concurrent_creators: usize,
    /// Concurrent external calls within one stage.
    pub max_concurrent_calls: usize,
    /// Images requested per magnet in the render stage.
    pub images_per_magnet: usize,

    // Timeouts and backoff
    /// Timeout for entity store calls.
    pub store_timeout: Duration,
    /// Timeout for prompt generation calls.
    pub prompt_timeout: Duration,
    /// Timeout for image generation calls.
    pub image_timeout: Duration,
    /// Wait between early render attempts.
    pub short_backoff: Duration,
    /// Wait before the final render or compose attempt.
    pub long_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            store_api_key: None,

            prompt_url: None,
            prompt_api_key: None,
            prompt_user: "task-executor".to_string(),

            image_api_url: DEFAULT_IMAGE_API_URL.to_string(),
            scene_api_url: DEFAULT_IMAGE_API_URL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            default_image_url: DEFAULT_REFERENCE_IMAGE_URL.to_string(),
            scene_template_urls: vec![DEFAULT_SCENE_TEMPLATE_URL.to_string()],

            cache_dir: PathBuf::from("cache"),
            use_cache: true,

            max_concurrent_creators: 3,
            max_concurrent_calls: 10,
            images_per_magnet: 1,

            store_timeout: Duration::from_secs(30),
            prompt_timeout: Duration::from_secs(60),
            image_timeout: Duration::from_secs(600), // 10 minutes
            short_backoff: Duration::from_secs(2),
            long_backoff: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SUPABASE_URL`, `SUPABASE_API_KEY`: entity store location and key
    /// - `DIFY_URL`, `DIFY_API_KEY`: prompt service location and key
    /// - `DIFY_USER`: prompt request user tag (default: task-executor)
    /// - `IMAGE_API_URL`: render endpoint (default: media.datail.ai image-to-image)
    /// - `SCENE_API_URL`: compose endpoint (default: same as `IMAGE_API_URL`)
    /// - `SCENE_MODEL`: image model (default: gemini-3-pro-image-preview)
    /// - `DEFAULT_IMAGE_URL`: fallback reference image
    /// - `SCENE_TEMPLATE_URLS`: comma-separated scene templates
    /// - `OUTREACH_CACHE_DIR`: cache directory (default: cache)
    /// - `OUTREACH_USE_CACHE`: enable the result cache (default: true)
    /// - `OUTREACH_CONCURRENCY`: creators processed at once (default: 3)
    /// - `OUTREACH_FANOUT`: concurrent calls within a stage (default: 10)
    /// - `OUTREACH_IMAGES_PER_MAGNET`: images per magnet (default: 1)
    /// - `OUTREACH_STORE_TIMEOUT_SECS`: store call timeout (default: 30)
    /// - `OUTREACH_PROMPT_TIMEOUT_SECS`: prompt call timeout (default: 60)
    /// - `OUTREACH_IMAGE_TIMEOUT_SECS`: image call timeout (default: 600)
    /// - `OUTREACH_RENDER_SHORT_BACKOFF_SECS`: early retry wait (default: 2)
    /// - `OUTREACH_RENDER_LONG_BACKOFF_SECS`: final retry wait (default: 10)
    ///
    /// Credentials are optional here; the stages that need them fail their
    /// own validation when they are absent.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Entity store
        config.store_url = non_empty_env("SUPABASE_URL");
        config.store_api_key = non_empty_env("SUPABASE_API_KEY");

        // Prompt service
        config.prompt_url = non_empty_env("DIFY_URL");
        config.prompt_api_key = non_empty_env("DIFY_API_KEY");
        if let Some(val) = non_empty_env("DIFY_USER") {
            config.prompt_user = val;
        }

        // Image service
        if let Some(val) = non_empty_env("IMAGE_API_URL") {
            config.image_api_url = val;
        }

        config.scene_api_url =
            non_empty_env("SCENE_API_URL").unwrap_or_else(|| config.image_api_url.clone());

        if let Some(val) = non_empty_env("SCENE_MODEL") {
            config.image_model = val;
        }

        if let Some(val) = non_empty_env("DEFAULT_IMAGE_URL") {
            config.default_image_url = val;
        }

        if let Ok(val) = std::env::var("SCENE_TEMPLATE_URLS") {
            config.scene_template_urls = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Cache
        if let Some(val) = non_empty_env("OUTREACH_CACHE_DIR") {
            config.cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("OUTREACH_USE_CACHE") {
            config.use_cache = parse_env_bool(&val, "OUTREACH_USE_CACHE")?;
        }

        // Concurrency
        if let Ok(val) = std::env::var("OUTREACH_CONCURRENCY") {
            config.max_concurrent_creators = parse_env_value(&val, "OUTREACH_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("OUTREACH_FANOUT") {
            config.max_concurrent_calls = parse_env_value(&val, "OUTREACH_FANOUT")?;
        }

        if let Ok(val) = std::env::var("OUTREACH_IMAGES_PER_MAGNET") {
            config.images_per_magnet = parse_env_value(&val, "OUTREACH_IMAGES_PER_MAGNET")?;
        }

        // Timeouts and backoff
        if let Ok(val) = std::env::var("OUTREACH_STORE_TIMEOUT_SECS") {
            config.store_timeout = parse_env_secs(&val, "OUTREACH_STORE_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("OUTREACH_PROMPT_TIMEOUT_SECS") {
            config.prompt_timeout = parse_env_secs(&val, "OUTREACH_PROMPT_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("OUTREACH_IMAGE_TIMEOUT_SECS") {
            config.image_timeout = parse_env_secs(&val, "OUTREACH_IMAGE_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("OUTREACH_RENDER_SHORT_BACKOFF_SECS") {
            config.short_backoff = parse_env_secs(&val, "OUTREACH_RENDER_SHORT_BACKOFF_SECS")?;
        }

        if let Ok(val) = std::env::var("OUTREACH_RENDER_LONG_BACKOFF_SECS") {
            config.long_backoff = parse_env_secs(&val, "OUTREACH_RENDER_LONG_BACKOFF_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Concurrency validation
        if self.max_concurrent_creators == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_creators must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_calls must be greater than 0".to_string(),
            ));
        }

        if self.images_per_magnet == 0 {
            return Err(ConfigError::ValidationFailed(
                "images_per_magnet must be greater than 0".to_string(),
            ));
        }

        // Timeout validation
        for (name, timeout) in [
            ("store_timeout", self.store_timeout),
            ("prompt_timeout", self.prompt_timeout),
            ("image_timeout", self.image_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.short_backoff > self.long_backoff {
            return Err(ConfigError::ValidationFailed(
                "short_backoff cannot exceed long_backoff".to_string(),
            ));
        }

        // Image service validation
        if self.image_api_url.is_empty() || self.scene_api_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "image_api_url and scene_api_url cannot be empty".to_string(),
            ));
        }

        if self.image_model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "image_model cannot be empty".to_string(),
            ));
        }

        if self.scene_template_urls.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "scene_template_urls must contain at least one URL".to_string(),
            ));
        }

        Ok(())
    }

    /// Store credentials, when both are configured.
    pub fn store_credentials(&self) -> Option<(&str, &str)> {
        match (&self.store_url, &self.store_api_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }

    /// Builder method to set the entity store location and key.
    pub fn with_store(mut self, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self.store_api_key = Some(api_key.into());
        self
    }

    /// Builder method to set the prompt service location and key.
    pub fn with_prompt_service(mut self, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.prompt_url = Some(url.into());
        self.prompt_api_key = Some(api_key.into());
        self
    }

    /// Builder method to set the render and compose endpoints.
    pub fn with_image_api_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.scene_api_url = url.clone();
        self.image_api_url = url;
        self
    }

    /// Builder method to set the scene templates.
    pub fn with_scene_templates(mut self, urls: Vec<String>) -> Self {
        self.scene_template_urls = urls;
        self
    }

    /// Builder method to set the cache directory.
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = path.into();
        self
    }

    /// Builder method to enable or disable the result cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Builder method to set how many creators run at once.
    pub fn with_max_concurrent_creators(mut self, max: usize) -> Self {
        self.max_concurrent_creators = max;
        self
    }

    /// Builder method to set the per-stage call fan-out.
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Builder method to set images per magnet.
    pub fn with_images_per_magnet(mut self, count: usize) -> Self {
        self.images_per_magnet = count;
        self
    }

    /// Builder method to set render and compose backoff.
    pub fn with_backoff(mut self, short: Duration, long: Duration) -> Self {
        self.short_backoff = short;
        self.long_backoff = long;
        self
    }

    /// Builder method to set the image call timeout.
    pub fn with_image_timeout(mut self, timeout: Duration) -> Self {
        self.image_timeout = timeout;
        self
    }
}

/// Read an environment variable, treating blank values as unset.
fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
