use image::Rgba;
use std::time::Duration;

use crate::error::{Result, TryOnError};
use crate::prefs::{Preferences, RETRY_MAX_RANGE};
use crate::retry::BackoffPolicy;
use crate::signature::SignatureMode;
use crate::types::PollOptions;

/// Base URL used when nothing else is configured (debug builds only).
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9090";

/// Environment variables consulted for the base URL, in order.
pub const BASE_URL_ENV_VARS: [&str; 4] = [
    "TRYON_API_HOST",
    "VITE_API_HOST",
    "VITE_BACKEND_BASE_URL",
    "VITE_BASE_URL",
];

/// Stage-1 directive sent with the subject image.
pub const DEFAULT_FLUX_PROMPT: &str = "remove clothes";

/// Stage-2 directive used when the user has not saved their own.
pub const DEFAULT_NANO_PROMPT: &str = "Directly generate the image and do not return any text. \
Dress the person in the clothing from the reference image. Keep the pose and camera angle \
unchanged and do not alter the original facial features or hairstyle. Remove white borders \
from the image. Keep the result tasteful and suitable for all ages.";

/// Strip trailing slashes; reject empty URLs.
pub(crate) fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(TryOnError::Config("Invalid baseUrl: empty".into()));
    }
    Ok(trimmed.to_string())
}

/// Resolve the backend base URL.
///
/// Precedence: explicit value > stored preference > environment > local
/// default. Release builds refuse the local default.
pub fn resolve_base_url<F>(explicit: Option<&str>, stored: Option<&str>, env: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let candidate = explicit
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| stored.filter(|s| !s.trim().is_empty()).map(str::to_string))
        .or_else(|| {
            BASE_URL_ENV_VARS
                .iter()
                .find_map(|var| env(var).filter(|v| !v.trim().is_empty()))
        });

    match candidate {
        Some(url) => normalize_base_url(&url),
        None if cfg!(debug_assertions) => Ok(DEFAULT_BASE_URL.to_string()),
        None => Err(TryOnError::Config(format!(
            "No backend URL configured; set one of {}",
            BASE_URL_ENV_VARS.join(", ")
        ))),
    }
}

/// Configuration for [`TryOnClient`](crate::TryOnClient).
///
/// Use [`ClientConfig::builder()`] for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Explicit base URL; wins over preferences and environment.
    pub base_url: Option<String>,

    /// Base URL remembered in the user's preferences.
    pub stored_base_url: Option<String>,

    /// Timeout for multipart submissions (uploads can be large).
    pub submit_timeout: Duration,

    /// Timeout for status polls and small JSON requests.
    pub request_timeout: Duration,

    /// Retry schedule for submissions that hit a cold backend.
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            stored_base_url: None,
            submit_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Resolve the effective base URL against the process environment.
    pub fn resolve_base_url(&self) -> Result<String> {
        resolve_base_url(
            self.base_url.as_deref(),
            self.stored_base_url.as_deref(),
            |var| std::env::var(var).ok(),
        )
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the backend base URL explicitly.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Take the stored API host from saved preferences.
    pub fn with_preferences(mut self, prefs: &Preferences) -> Self {
        self.config.stored_base_url = prefs.api_host.clone();
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.config.submit_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Tunables for the [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Submit+poll attempts per stage-2 run.
    pub max_attempts: u32,
    /// Cadence of nano result polling.
    pub poll: PollOptions,
    /// Cadence of upscale result polling.
    pub upscale_poll: PollOptions,
    /// Box the display preview must fit in.
    pub preview_box: (u32, u32),
    /// JPEG quality of previews.
    pub preview_quality: u8,
    /// How input files are keyed in the caches.
    pub signature_mode: SignatureMode,
    /// Working images smaller than this are assumed to be thumbnails.
    pub min_payload_bytes: usize,
    /// Largest file accepted for upscaling.
    pub max_upload_bytes: usize,
    pub flux_prompt: String,
    pub flux_steps: u32,
    pub nano_prompt: String,
    /// Fill colour of the padded garment canvas.
    pub padding_background: Rgba<u8>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            poll: PollOptions::default(),
            upscale_poll: PollOptions::upscale(),
            preview_box: (1024, 768),
            preview_quality: 90,
            signature_mode: SignatureMode::default(),
            min_payload_bytes: 1024,
            max_upload_bytes: 50 * 1024 * 1024,
            flux_prompt: DEFAULT_FLUX_PROMPT.to_string(),
            flux_steps: 8,
            nano_prompt: DEFAULT_NANO_PROMPT.to_string(),
            padding_background: Rgba([255, 255, 255, 255]),
        }
    }
}

impl FlowConfig {
    /// Overlay the saved prompt and attempt budget. A hand-edited budget is
    /// clamped to [`RETRY_MAX_RANGE`] like one stored through the setter.
    pub fn with_preferences(mut self, prefs: &Preferences) -> Self {
        if let Some(prompt) = prefs.nano_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            self.nano_prompt = prompt.clone();
        }
        if let Some(max) = prefs.retry_max {
            self.max_attempts = max.clamp(RETRY_MAX_RANGE.0, RETRY_MAX_RANGE.1);
        }
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_poll(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_upscale_poll(mut self, poll: PollOptions) -> Self {
        self.upscale_poll = poll;
        self
    }

    pub fn with_preview_box(mut self, width: u32, height: u32) -> Self {
        self.preview_box = (width.max(1), height.max(1));
        self
    }

    pub fn with_signature_mode(mut self, mode: SignatureMode) -> Self {
        self.signature_mode = mode;
        self
    }

    pub fn with_min_payload_bytes(mut self, bytes: usize) -> Self {
        self.min_payload_bytes = bytes;
        self
    }

    pub fn with_nano_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.nano_prompt = prompt.into();
        self
    }
}
