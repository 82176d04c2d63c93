use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Pipeline stage that owns a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Flux,
    Nano,
    Refine,
    Upscale,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Flux => "flux",
            Stage::Nano => "nano",
            Stage::Refine => "refine",
            Stage::Upscale => "upscale",
        }
    }
}

/// Remote task lifecycle as reported by the result endpoints.
///
/// `Done` is the upscale backend's success sentinel; the nano backend uses
/// `Succeeded`. Anything unrecognised is kept as `Other` and treated as
/// still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Done,
    Failed,
    Error,
    #[serde(untagged)]
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Error => "error",
            TaskStatus::Other(s) => s,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Done)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Error)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

/// Response of `POST /flux/run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxRunResponse {
    #[serde(default)]
    pub half_image_url: Option<String>,
    #[serde(default)]
    pub half_image_base64: Option<String>,
}

/// Response of `POST /flux/refine`. The backend either finishes inline or
/// hands back a task to poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineResponse {
    #[serde(default, alias = "task_id")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Handle returned by the async submission endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
}

/// Body of `GET /nano/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NanoResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub debug: Option<Value>,
}

impl NanoResult {
    /// An inline image settles the task even if the status lags behind.
    pub fn has_image(&self) -> bool {
        self.image_base64.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Body of `GET /upscale/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Options for `POST /flux/run`.
#[derive(Debug, Clone)]
pub struct FluxOptions {
    pub steps: u32,
    pub lora_names: Vec<String>,
    pub lora_strengths: Vec<f32>,
}

impl Default for FluxOptions {
    fn default() -> Self {
        Self {
            steps: 8,
            lora_names: Vec::new(),
            lora_strengths: Vec::new(),
        }
    }
}

impl FluxOptions {
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Attach a LoRA by name with its strength.
    pub fn lora(mut self, name: impl Into<String>, strength: f32) -> Self {
        self.lora_names.push(name.into());
        self.lora_strengths.push(strength);
        self
    }
}

/// Options for `POST /flux/refine`.
#[derive(Debug, Clone)]
pub struct RefineOptions {
    pub strength: f32,
    pub steps: u32,
    pub cfg: f32,
    pub denoise: f32,
    pub prompt_text: String,
    pub base: String,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            strength: 0.85,
            steps: 8,
            cfg: 1.0,
            denoise: 0.4,
            prompt_text: "nnps".to_string(),
            base: String::new(),
        }
    }
}

/// Cadence and budget of a result-polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Hard ceiling on status requests, independent of `timeout`.
    pub max_polls: Option<u32>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(600),
            max_polls: None,
        }
    }
}

impl PollOptions {
    /// Cadence used by the upscale backend: every 5 s, at most 120 polls.
    pub fn upscale() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            max_polls: Some(120),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_polls(mut self, polls: u32) -> Self {
        self.max_polls = Some(polls);
        self
    }
}

/// A remote unit of work tracked for one flow run. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub task_id: String,
    pub stage: Stage,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub debug: Option<Value>,
}

impl GenerationTask {
    pub fn new(task_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            task_id: task_id.into(),
            stage,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            debug: None,
        }
    }

    /// Fold a nano poll response into the task.
    pub fn apply_nano(&mut self, result: &NanoResult) {
        self.status = result.status.clone();
        if let Some(img) = &result.image_base64 {
            self.result = Some(img.clone());
        }
        if result.error.is_some() {
            self.error = result.error.clone();
        }
        if result.debug.is_some() {
            self.debug = result.debug.clone();
        }
    }

    /// Fold an upscale poll response into the task.
    pub fn apply_upscale(&mut self, result: &UpscaleResult) {
        self.status = result.status.clone();
        if let Some(url) = &result.result_url {
            self.result = Some(url.clone());
        }
        if result.error.is_some() {
            self.error = result.error.clone();
        }
    }
}

/// Signed-in user as returned by `GET /me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}
