use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Bounds applied to a user-chosen attempt budget.
pub const RETRY_MAX_RANGE: (u32, u32) = (1, 10);

/// User preferences that survive between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// Backend base URL chosen by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_host: Option<String>,

    /// Saved stage-2 prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nano_prompt: Option<String>,

    /// Saved attempt budget for stage-2 submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
}

impl Preferences {
    /// `<config dir>/tryon-client/preferences.json`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tryon-client").join("preferences.json"))
    }

    /// Load from `path`. A missing file yields empty preferences.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load from the default location, falling back to empty preferences.
    pub fn load_default() -> Self {
        Self::default_path()
            .and_then(|p| match Self::load(&p) {
                Ok(prefs) => Some(prefs),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "ignoring unreadable preferences");
                    None
                }
            })
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Store an attempt budget, clamped to [`RETRY_MAX_RANGE`].
    pub fn set_retry_max(&mut self, value: u32) -> u32 {
        let clamped = value.clamp(RETRY_MAX_RANGE.0, RETRY_MAX_RANGE.1);
        self.retry_max = Some(clamped);
        clamped
    }

    pub fn set_api_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        self.api_host = if host.trim().is_empty() { None } else { Some(host) };
    }
}
