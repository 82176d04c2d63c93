use anyhow::Context;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::artifact::{sniff_mime, ImageArtifact, InputImage};
use crate::backend::GenerationBackend;
use crate::config::{normalize_base_url, ClientConfig};
use crate::error::{Result, TryOnError};
use crate::form::FormSpec;
use crate::padding;
use crate::poll;
use crate::retry::{with_backoff, BackoffPolicy};
use crate::types::*;

/// Async client for the try-on generation backend.
///
/// Covers the Flux half-image stage, NanoBanana garment transfer, refine and
/// upscale jobs, plus the cookie-session auth endpoints. Submissions are
/// retried on cold-start failures according to the configured
/// [`BackoffPolicy`]; status polls and auth calls are not.
///
/// The base URL can be changed at any time with
/// [`set_base_url`](Self::set_base_url) and is shared by all clones.
///
/// # Example
/// ```no_run
/// use tryon_client::{TryOnClient, InputImage, FluxOptions};
///
/// # async fn example() -> tryon_client::Result<()> {
/// let client = TryOnClient::new("http://127.0.0.1:9090");
/// let person = InputImage::from_path("person.png".as_ref())?;
/// let half = client.run_flux(&person, "remove clothes", &FluxOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TryOnClient {
    http: Client,
    base_url: Arc<RwLock<String>>,
    submit_timeout: Duration,
    request_timeout: Duration,
    backoff: BackoffPolicy,
}

impl TryOnClient {
    /// Create a client for `base_url` with default timeouts and retries.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base: String = base_url.into();
        let config = ClientConfig::default();
        Self {
            http: session_client(),
            base_url: Arc::new(RwLock::new(base.trim_end_matches('/').to_string())),
            submit_timeout: config.submit_timeout,
            request_timeout: config.request_timeout,
            backoff: config.backoff,
        }
    }

    /// Create a client from a [`ClientConfig`], resolving the base URL from
    /// the explicit value, stored preference, environment or default.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let base = config.resolve_base_url()?;
        tracing::info!(base_url = %base, "try-on client configured");
        Ok(Self {
            http: session_client(),
            base_url: Arc::new(RwLock::new(base)),
            submit_timeout: config.submit_timeout,
            request_timeout: config.request_timeout,
            backoff: config.backoff,
        })
    }

    /// Use a custom `reqwest::Client`. Enable its cookie store if the auth
    /// endpoints are used.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current base URL.
    pub fn base_url(&self) -> String {
        match self.base_url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Point this client (and its clones) at a different backend. Applies to
    /// every request issued afterwards.
    pub fn set_base_url(&self, url: &str) -> Result<()> {
        let normalized = normalize_base_url(url)?;
        match self.base_url.write() {
            Ok(mut guard) => *guard = normalized,
            Err(poisoned) => *poisoned.into_inner() = normalized,
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    // ── Transport ───────────────────────────────────────────────────

    async fn post_form_once(&self, path: &str, form: &FormSpec) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(path))
            .timeout(self.submit_timeout)
            .multipart(form.to_multipart()?)
            .send()
            .await
            .map_err(|e| TryOnError::Network {
                context: format!(
                    "Cannot reach backend at {}; is the service running?",
                    self.base_url()
                ),
                source: e,
            })?;
        read_json("POST", path, resp).await
    }

    /// Multipart POST with cold-start retries.
    async fn post_form(&self, path: &str, form: &FormSpec) -> Result<Value> {
        with_backoff(&self.backoff, path, || self.post_form_once(path, form)).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| TryOnError::Network {
                context: format!("Failed to send {}", path),
                source: e,
            })?;
        read_json("POST", path, resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| TryOnError::Network {
                context: format!("Failed to fetch {}", path),
                source: e,
            })?;
        let value = read_json("GET", path, resp).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ── Flux ────────────────────────────────────────────────────────

    /// Stage 1: `POST /flux/run`. Returns the half image as a URL or inline
    /// base64.
    pub async fn run_flux(
        &self,
        main_image: &InputImage,
        prompt: &str,
        options: &FluxOptions,
    ) -> Result<FluxRunResponse> {
        let form = flux_run_form(main_image, prompt, options)?;
        let json = self.post_form("/flux/run", &form).await?;
        Ok(serde_json::from_value(json)?)
    }

    /// `POST /flux/refine` with strength/steps/cfg/denoise and a prompt.
    pub async fn refine_flux(
        &self,
        image: &ImageArtifact,
        options: &RefineOptions,
    ) -> Result<RefineResponse> {
        let bytes = self.materialize(image).await?;
        let mime = sniff_mime(&bytes).unwrap_or(image.mime()).to_string();
        let form = refine_form(bytes, &mime, options)?;
        let json = self.post_form("/flux/refine", &form).await?;
        Ok(serde_json::from_value(json)?)
    }

    // ── NanoBanana ──────────────────────────────────────────────────

    /// Stage 2: `POST /nano/process_async`. A remote-URL half image is sent
    /// as `half_image_url` so the backend fetches it itself.
    pub async fn start_nano_process(
        &self,
        half_image: &ImageArtifact,
        ref_images: &[InputImage],
        prompt: &str,
    ) -> Result<TaskHandle> {
        let form = nano_form(half_image, ref_images, prompt)?;
        let json = self.post_form("/nano/process_async", &form).await?;
        task_handle(json)
    }

    /// One `GET /nano/result` query.
    pub async fn nano_result(&self, task_id: &str) -> Result<NanoResult> {
        self.get_json(&format!("/nano/result?task_id={}", encode_query(task_id)))
            .await
    }

    /// Poll a nano task until it settles; see [`poll::poll_nano_result`].
    pub async fn poll_nano_result<F>(
        &self,
        task_id: &str,
        on_progress: F,
        options: PollOptions,
    ) -> Result<NanoResult>
    where
        F: FnMut(&NanoResult),
    {
        poll::poll_nano_result(self, task_id, on_progress, options).await
    }

    // ── Upscale ─────────────────────────────────────────────────────

    /// `POST /upscale/process_async`.
    pub async fn start_upscale(&self, image: &InputImage) -> Result<TaskHandle> {
        let form = upscale_form(image)?;
        let json = self.post_form("/upscale/process_async", &form).await?;
        task_handle(json)
    }

    /// One `GET /upscale/result` query.
    pub async fn upscale_result(&self, task_id: &str) -> Result<UpscaleResult> {
        self.get_json(&format!("/upscale/result?task_id={}", encode_query(task_id)))
            .await
    }

    /// Poll an upscale task until it settles. Returns the absolute result URL.
    pub async fn poll_upscale_result<F>(
        &self,
        task_id: &str,
        on_progress: F,
        options: PollOptions,
    ) -> Result<String>
    where
        F: FnMut(&UpscaleResult),
    {
        poll::poll_upscale_result(self, task_id, on_progress, options).await
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Download an image. Relative URLs are resolved against the base URL.
    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let absolute = self.resolve_url(url);
        let resp = self
            .http
            .get(&absolute)
            .timeout(self.submit_timeout)
            .send()
            .await
            .map_err(|e| TryOnError::Network {
                context: format!("Failed to fetch image {}", absolute),
                source: e,
            })?;
        if !resp.status().is_success() {
            return Err(TryOnError::from_status(
                "GET",
                &absolute,
                resp.status().as_u16(),
                format!("fetch {} failed", absolute),
            ));
        }
        let bytes = resp.bytes().await.map_err(|e| TryOnError::Network {
            context: "Failed to read image bytes".into(),
            source: e,
        })?;
        Ok(bytes.to_vec())
    }

    /// Bytes of any artifact, downloading URLs.
    pub async fn materialize(&self, artifact: &ImageArtifact) -> Result<Vec<u8>> {
        match artifact {
            ImageArtifact::Url(url) => self.fetch_image(url).await,
            other => other
                .local_bytes()?
                .ok_or_else(|| TryOnError::Validation("image is required".into())),
        }
    }

    /// Letterbox an image to `target_w × target_h` over a `#rrggbb`
    /// background. Pure; no network.
    pub fn resize_image_with_padding(
        &self,
        image: &[u8],
        target_w: u32,
        target_h: u32,
        background: &str,
    ) -> Result<Vec<u8>> {
        padding::resize_image_with_padding(image, target_w, target_h, padding::parse_hex_color(background)?)
    }

    // ── Auth ────────────────────────────────────────────────────────

    /// `GET /me`. Returns `None` when no session is active.
    pub async fn get_me(&self) -> Result<Option<UserProfile>> {
        match self.get_json::<UserProfile>("/me").await {
            Ok(user) => Ok(Some(user)),
            Err(TryOnError::Auth { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// URL the browser should navigate to in order to sign in.
    pub fn login_url(&self, redirect: Option<&str>) -> Result<String> {
        self.auth_url("/auth/login", redirect)
    }

    /// URL starting an OAuth sign-in with `provider` (e.g. `google`).
    pub fn oauth_url(&self, provider: &str, redirect: Option<&str>) -> Result<String> {
        if provider.trim().is_empty() {
            return Err(TryOnError::Validation("OAuth provider is required".into()));
        }
        self.auth_url(&format!("/auth/oauth/{}", encode_query(provider)), redirect)
    }

    fn auth_url(&self, path: &str, redirect: Option<&str>) -> Result<String> {
        let base = self.url(path);
        let url = match redirect {
            Some(r) => reqwest::Url::parse_with_params(&base, &[("redirect", r)]),
            None => reqwest::Url::parse(&base),
        }
        .map_err(|e| TryOnError::Config(format!("Bad auth URL {}: {}", base, e)))?;
        Ok(url.to_string())
    }

    /// `POST /auth/logout`.
    pub async fn logout(&self) -> Result<()> {
        self.post_json("/auth/logout", &json!({})).await?;
        Ok(())
    }

    /// `POST /auth/email/send`: mail a one-time code.
    pub async fn send_email_code(&self, email: &str) -> Result<()> {
        if !email.contains('@') {
            return Err(TryOnError::Validation(format!("Invalid email '{}'", email)));
        }
        self.post_json("/auth/email/send", &json!({ "email": email }))
            .await?;
        Ok(())
    }

    /// `POST /auth/email/verify`: exchange the code for a session.
    pub async fn verify_email_code(&self, email: &str, code: &str) -> Result<UserProfile> {
        if code.trim().is_empty() {
            return Err(TryOnError::Validation("Verification code is required".into()));
        }
        let json = self
            .post_json(
                "/auth/email/verify",
                &json!({ "email": email, "code": code.trim() }),
            )
            .await?;
        let user = json.get("user").cloned().unwrap_or(json);
        Ok(serde_json::from_value(user)?)
    }
}

impl GenerationBackend for TryOnClient {
    async fn run_flux(
        &self,
        main_image: &InputImage,
        prompt: &str,
        options: &FluxOptions,
    ) -> Result<FluxRunResponse> {
        TryOnClient::run_flux(self, main_image, prompt, options).await
    }

    async fn start_nano_process(
        &self,
        half_image: &ImageArtifact,
        ref_images: &[InputImage],
        prompt: &str,
    ) -> Result<TaskHandle> {
        TryOnClient::start_nano_process(self, half_image, ref_images, prompt).await
    }

    async fn nano_result(&self, task_id: &str) -> Result<NanoResult> {
        TryOnClient::nano_result(self, task_id).await
    }

    async fn start_upscale(&self, image: &InputImage) -> Result<TaskHandle> {
        TryOnClient::start_upscale(self, image).await
    }

    async fn upscale_result(&self, task_id: &str) -> Result<UpscaleResult> {
        TryOnClient::upscale_result(self, task_id).await
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        TryOnClient::fetch_image(self, url).await
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            self.url(url)
        } else {
            format!("{}/{}", self.base_url(), url)
        }
    }
}

fn session_client() -> Client {
    Client::builder()
        .cookie_store(true)
        .build()
        .unwrap_or_default()
}

fn encode_query(value: &str) -> String {
    reqwest::Url::parse_with_params("http://q/", &[("v", value)])
        .ok()
        .and_then(|u| u.query().map(|q| q.trim_start_matches("v=").to_string()))
        .unwrap_or_else(|| value.to_string())
}

async fn read_json(method: &'static str, path: &str, resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| TryOnError::Network {
        context: format!("Failed to read {} {} response", method, path),
        source: e,
    })?;
    if !status.is_success() {
        tracing::debug!(method, path, status = status.as_u16(), "backend error response");
        return Err(TryOnError::from_status(method, path, status.as_u16(), text));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|_| {
        let snippet: String = text.chars().take(200).collect();
        TryOnError::InvalidResponse(format!("{} {} returned non-JSON body: {}", method, path, snippet))
    })
}

fn task_handle(json: Value) -> Result<TaskHandle> {
    let task_id = json
        .get("task_id")
        .or_else(|| json.get("taskId"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .context("No task ID returned")?;
    Ok(TaskHandle {
        task_id: task_id.to_string(),
    })
}

fn mime_of(bytes: &[u8]) -> &'static str {
    sniff_mime(bytes).unwrap_or("application/octet-stream")
}

/// Form for `POST /flux/run`.
pub fn flux_run_form(main_image: &InputImage, prompt: &str, options: &FluxOptions) -> Result<FormSpec> {
    if main_image.bytes.is_empty() {
        return Err(TryOnError::Validation("mainImageFile is required".into()));
    }
    let mut form = FormSpec::new()
        .file(
            "main_image",
            main_image.bytes.clone(),
            &main_image.name,
            mime_of(&main_image.bytes),
        )
        .text("flux_prompt", prompt)
        .text("steps", options.steps);
    if !options.lora_names.is_empty() {
        form = form.set("lora_names", options.lora_names.join(","));
    }
    if !options.lora_strengths.is_empty() {
        let strengths: Vec<String> = options.lora_strengths.iter().map(|s| s.to_string()).collect();
        form = form.set("lora_strengths", strengths.join(","));
    }
    Ok(form)
}

/// Form for `POST /flux/refine`.
pub fn refine_form(image: Vec<u8>, mime: &str, options: &RefineOptions) -> Result<FormSpec> {
    if image.is_empty() {
        return Err(TryOnError::Validation("imageBlob is required".into()));
    }
    Ok(FormSpec::new()
        .file("image", Arc::new(image), "image.png", mime)
        .text("strength", options.strength)
        .text("steps", options.steps)
        .text("cfg", options.cfg)
        .text("denoise", options.denoise)
        .text("prompt_text", &options.prompt_text)
        .text("base", &options.base))
}

/// Form for `POST /nano/process_async`. `half_image` and `half_image_url`
/// are mutually exclusive.
pub fn nano_form(half_image: &ImageArtifact, ref_images: &[InputImage], prompt: &str) -> Result<FormSpec> {
    let mut form = FormSpec::new();
    form = match half_image {
        ImageArtifact::Url(url) if !url.is_empty() => form.text("half_image_url", url),
        other => {
            let bytes = other
                .local_bytes()?
                .filter(|b| !b.is_empty())
                .ok_or_else(|| TryOnError::Validation("halfImageBlob is required".into()))?;
            let mime = other.mime().to_string();
            form.file("half_image", Arc::new(bytes), "half.png", &mime)
        }
    };
    for (i, reference) in ref_images.iter().enumerate() {
        let name = if reference.name.is_empty() {
            format!("ref_{}.png", i + 1)
        } else {
            reference.name.clone()
        };
        form = form.file(
            "ref_images",
            reference.bytes.clone(),
            &name,
            mime_of(&reference.bytes),
        );
    }
    Ok(form.text("prompt", prompt))
}

/// Form for `POST /upscale/process_async`.
pub fn upscale_form(image: &InputImage) -> Result<FormSpec> {
    if image.bytes.is_empty() {
        return Err(TryOnError::Validation("Please upload an image first".into()));
    }
    Ok(FormSpec::new().file("image", image.bytes.clone(), &image.name, mime_of(&image.bytes)))
}
