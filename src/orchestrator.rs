use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifact::{encode_data_uri, sniff_mime, DownloadHandle, ImageArtifact, InputImage};
use crate::backend::GenerationBackend;
use crate::cache::ArtifactCache;
use crate::config::FlowConfig;
use crate::error::{Result, TryOnError};
use crate::events::{debug_preview, prompt_preview, EventSink, FlowEvent, FlowState, Timer};
use crate::padding;
use crate::poll;
use crate::signature::{PairSignature, Signature};
use crate::types::{FluxOptions, GenerationTask, NanoResult, Stage, UpscaleResult};

/// A finished flow's deliverables.
#[derive(Debug, Clone)]
pub struct FlowResult {
    /// Full-resolution output.
    pub image: ImageArtifact,
    /// JPEG data URI sized for the surface, when one could be rendered.
    pub preview: Option<String>,
    /// Download bound to `image`, never to the preview.
    pub download: DownloadHandle,
    /// The remote task that produced the image, as last polled.
    pub task: GenerationTask,
    pub elapsed: Duration,
}

/// How a flow ended. Flows never return `Err`; every failure lands here.
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    Succeeded(FlowResult),
    Failed {
        message: String,
        debug: Option<Value>,
    },
    Cancelled,
}

impl FlowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FlowOutcome::Succeeded(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlowOutcome::Cancelled)
    }

    pub fn result(&self) -> Option<&FlowResult> {
        match self {
            FlowOutcome::Succeeded(r) => Some(r),
            _ => None,
        }
    }
}

/// Input of a refine run.
#[derive(Debug, Clone, Default)]
pub struct RefineRequest {
    /// Directive for the backend; empty lets it use its default.
    pub prompt: String,
    /// Image to refine. Defaults to the last full-resolution result.
    pub image: Option<ImageArtifact>,
    /// Optional extra reference image.
    pub reference: Option<InputImage>,
}

impl RefineRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageArtifact) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_reference(mut self, reference: InputImage) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Per-run state: which surface it renders to and how it is cancelled.
struct FlowCtx {
    surface: String,
    token: CancellationToken,
    events: EventSink,
    started: Instant,
}

impl FlowCtx {
    fn emit(&self, event: FlowEvent) {
        self.events.emit(event);
    }

    fn state(&self, state: FlowState) {
        tracing::debug!(surface = %self.surface, ?state, "flow state");
        self.emit(FlowEvent::State {
            surface: self.surface.clone(),
            state,
        });
    }

    fn loading(&self, message: &str) {
        self.emit(FlowEvent::Loading {
            surface: self.surface.clone(),
            message: message.to_string(),
        });
    }

    fn log(&self, message: impl Into<String>) {
        self.emit(FlowEvent::Log {
            surface: self.surface.clone(),
            message: message.into(),
        });
    }

    fn timer(&self, timer: Timer, elapsed: Duration) {
        tracing::info!(surface = %self.surface, ?timer, elapsed_ms = elapsed.as_millis() as u64, "stage time");
        self.emit(FlowEvent::StageTimer {
            surface: self.surface.clone(),
            timer,
            elapsed,
        });
    }

    /// Race `fut` against cancellation. Cancellation wins ties, and the
    /// in-flight result is dropped.
    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TryOnError::Cancelled),
            r = fut => r,
        }
    }

    fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(TryOnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Drives the two-stage try-on pipeline plus the refine and upscale flows.
///
/// Owns the artifact caches and one cancellation handle per render
/// surface. Starting a flow on a surface cancels whatever was running there.
///
/// ```no_run
/// use std::sync::Arc;
/// use tryon_client::{EventSink, FlowConfig, InputImage, Orchestrator, TryOnClient};
///
/// # async fn example() -> tryon_client::Result<()> {
/// let client = Arc::new(TryOnClient::new("http://127.0.0.1:9090"));
/// let (events, mut rx) = EventSink::channel();
/// let flows = Orchestrator::new(client, FlowConfig::default()).with_events(events);
///
/// let subject = InputImage::from_path("person.png".as_ref())?;
/// let garment = InputImage::from_path("dress.png".as_ref())?;
/// let outcome = flows.generate("result", &subject, &garment).await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator<B: GenerationBackend> {
    backend: Arc<B>,
    config: FlowConfig,
    events: EventSink,
    cache: Mutex<ArtifactCache>,
    surfaces: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_run: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<B: GenerationBackend> Orchestrator<B> {
    pub fn new(backend: Arc<B>, config: FlowConfig) -> Self {
        Self {
            backend,
            config,
            events: EventSink::discard(),
            cache: Mutex::new(ArtifactCache::new()),
            surfaces: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        }
    }

    /// Send flow events to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Cancel the flow running on `surface`. Returns `false` if none was.
    pub fn cancel(&self, surface: &str) -> bool {
        match lock(&self.surfaces).remove(surface) {
            Some((_, token)) => {
                tracing::info!(surface, "flow cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, surface: &str) -> bool {
        lock(&self.surfaces).contains_key(surface)
    }

    /// Drop every cached half image, padded garment and the last result.
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    /// Full-resolution output of the most recent generate or refine run.
    pub fn last_result(&self) -> Option<ImageArtifact> {
        lock(&self.cache).last_result()
    }

    /// Register a new run on `surface`, superseding the previous one.
    fn begin(&self, surface: &str) -> (u64, FlowCtx) {
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = lock(&self.surfaces).insert(surface.to_string(), (id, token.clone())) {
            tracing::debug!(surface, "superseding running flow");
            previous.cancel();
        }
        let ctx = FlowCtx {
            surface: surface.to_string(),
            token,
            events: self.events.clone(),
            started: Instant::now(),
        };
        ctx.state(FlowState::Idle);
        (id, ctx)
    }

    fn finish(&self, id: u64, ctx: &FlowCtx, result: Result<FlowResult>) -> FlowOutcome {
        {
            let mut surfaces = lock(&self.surfaces);
            if surfaces.get(&ctx.surface).is_some_and(|(current, _)| *current == id) {
                surfaces.remove(&ctx.surface);
            }
        }

        // A result that lands after cancel() is still a cancellation.
        let result = result.and_then(|r| ctx.check().map(|_| r));

        match result {
            Ok(result) => {
                ctx.timer(Timer::Total, ctx.started.elapsed());
                if let Some(preview) = &result.preview {
                    ctx.emit(FlowEvent::Preview {
                        surface: ctx.surface.clone(),
                        data_uri: preview.clone(),
                    });
                }
                ctx.emit(FlowEvent::Done {
                    surface: ctx.surface.clone(),
                    file_name: result.download.file_name.clone(),
                });
                ctx.state(FlowState::Succeeded);
                FlowOutcome::Succeeded(result)
            }
            Err(TryOnError::Cancelled) => {
                ctx.log("Cancelled by user");
                ctx.emit(FlowEvent::Cancelled {
                    surface: ctx.surface.clone(),
                });
                ctx.state(FlowState::Cancelled);
                FlowOutcome::Cancelled
            }
            Err(e) => {
                let message = e.to_string();
                let debug = e.debug().cloned();
                tracing::warn!(surface = %ctx.surface, error = %message, "flow failed");
                ctx.emit(FlowEvent::Error {
                    surface: ctx.surface.clone(),
                    message: message.clone(),
                    debug: debug.clone(),
                });
                ctx.state(FlowState::Failed);
                FlowOutcome::Failed { message, debug }
            }
        }
    }

    // ── Generate ────────────────────────────────────────────────────

    /// Dress `subject` in `garment`.
    ///
    /// Stage 1 (the half image) is skipped when the subject is unchanged
    /// since a previous run, and the padded garment is reused while both
    /// inputs are unchanged.
    pub async fn generate(&self, surface: &str, subject: &InputImage, garment: &InputImage) -> FlowOutcome {
        let (id, ctx) = self.begin(surface);
        let result = self.run_generate(&ctx, subject, garment).await;
        self.finish(id, &ctx, result)
    }

    async fn run_generate(&self, ctx: &FlowCtx, subject: &InputImage, garment: &InputImage) -> Result<FlowResult> {
        if subject.bytes.is_empty() {
            return Err(TryOnError::Validation("Please upload a character image".into()));
        }
        if garment.bytes.is_empty() {
            return Err(TryOnError::Validation("Please upload a garment image".into()));
        }

        let subject_sig = Signature::of(subject, self.config.signature_mode);
        let half = self.half_image(ctx, subject, &subject_sig).await?;

        ctx.state(FlowState::PreparingStage2Input);
        let garment_sig = Signature::of(garment, self.config.signature_mode);
        let padded = self.padded_garment(ctx, subject, garment, PairSignature::new(subject_sig, garment_sig))?;

        let (image, task) = self
            .run_stage2(ctx, &half, &[padded], &self.config.nano_prompt)
            .await?;
        self.deliver(ctx, image, task, "final", true).await
    }

    async fn half_image(&self, ctx: &FlowCtx, subject: &InputImage, sig: &Signature) -> Result<ImageArtifact> {
        let cached = lock(&self.cache).half_image(sig);
        if let Some(half) = cached {
            tracing::debug!(signature = %sig, "half image cache hit");
            ctx.log("Reuse cached half image (skip Flux)");
            return Ok(half);
        }

        ctx.state(FlowState::SubmittingStage1);
        ctx.loading("Running Flux (half image)\u{2026}");
        let started = Instant::now();
        let options = FluxOptions::default().steps(self.config.flux_steps);
        let response = ctx
            .guard(self.backend.run_flux(subject, &self.config.flux_prompt, &options))
            .await?;

        ctx.state(FlowState::AwaitingStage1Artifact);
        let half = match (response.half_image_base64, response.half_image_url) {
            (Some(b64), _) if !b64.is_empty() => ImageArtifact::from_payload(&b64),
            (_, Some(url)) if !url.is_empty() => {
                ctx.log("Half image URL received. Fetching\u{2026}");
                let bytes = ctx.guard(self.backend.fetch_image(&url)).await?;
                ImageArtifact::from_bytes(bytes)
            }
            _ => {
                return Err(TryOnError::InvalidResponse(
                    "Flux did not return a half image".into(),
                ))
            }
        };
        ctx.timer(Timer::Flux, started.elapsed());

        lock(&self.cache).put_half_image(sig.clone(), half.clone());
        Ok(half)
    }

    fn padded_garment(
        &self,
        ctx: &FlowCtx,
        subject: &InputImage,
        garment: &InputImage,
        pair: PairSignature,
    ) -> Result<InputImage> {
        let cached = lock(&self.cache).padded_garment(&pair);
        let artifact = match cached {
            Some(artifact) => artifact,
            None => {
                ctx.log("Recomputing garment padding to match character size\u{2026}");
                let (w, h) = padding::image_dimensions(&subject.bytes)?;
                let bytes = padding::resize_image_with_padding(
                    &garment.bytes,
                    w,
                    h,
                    self.config.padding_background,
                )?;
                tracing::debug!(width = w, height = h, "garment padded");
                let artifact = ImageArtifact::from_bytes(bytes);
                lock(&self.cache).put_padded_garment(pair, artifact.clone());
                artifact
            }
        };
        let bytes = artifact
            .local_bytes()?
            .ok_or_else(|| TryOnError::Validation("Padded garment is not local".into()))?;
        Ok(InputImage::new(garment.name.clone(), bytes))
    }

    // ── Refine ──────────────────────────────────────────────────────

    /// Run stage 2 again on an existing image with a user prompt.
    ///
    /// Without an explicit image the last full-resolution result is used.
    pub async fn refine(&self, surface: &str, request: RefineRequest) -> FlowOutcome {
        let (id, ctx) = self.begin(surface);
        let result = self.run_refine(&ctx, request).await;
        self.finish(id, &ctx, result)
    }

    async fn run_refine(&self, ctx: &FlowCtx, request: RefineRequest) -> Result<FlowResult> {
        let working = match request.image {
            Some(image) => image,
            None => self.last_result().ok_or_else(|| {
                TryOnError::Validation("Nothing to refine: generate an image first".into())
            })?,
        };
        ctx.state(FlowState::PreparingStage2Input);
        let refs: Vec<InputImage> = request.reference.into_iter().collect();
        let (image, task) = self.run_stage2(ctx, &working, &refs, &request.prompt).await?;
        self.deliver(ctx, image, task, "refined", true).await
    }

    // ── Stage 2 ─────────────────────────────────────────────────────

    /// Submit and poll stage 2, starting a fresh task after recoverable
    /// failures until the attempt budget runs out.
    async fn run_stage2(
        &self,
        ctx: &FlowCtx,
        working: &ImageArtifact,
        refs: &[InputImage],
        prompt: &str,
    ) -> Result<(ImageArtifact, GenerationTask)> {
        if working.approx_len() < self.config.min_payload_bytes {
            return Err(TryOnError::Validation(format!(
                "Working image is only {} bytes; expected a full-resolution image",
                working.approx_len()
            )));
        }
        ctx.log(format!("Nano prompt: \"{}\"", prompt_preview(prompt)));

        let max = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max {
            ctx.emit(FlowEvent::Attempt {
                surface: ctx.surface.clone(),
                current: attempt,
                max,
            });
            match self.stage2_attempt(ctx, working, refs, prompt).await {
                Ok(done) => return Ok(done),
                Err(e) if e.is_retryable_attempt() => {
                    tracing::warn!(surface = %ctx.surface, attempt, max, error = %e, "stage 2 attempt failed");
                    ctx.log(format!("error: {}", e));
                    if let Some(debug) = e.debug() {
                        ctx.log(format!("debug: {}", debug_preview(debug)));
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| TryOnError::TaskFailed {
            message: format!("No image from NanoBanana after {} attempts", max),
            debug: None,
        }))
    }

    async fn stage2_attempt(
        &self,
        ctx: &FlowCtx,
        working: &ImageArtifact,
        refs: &[InputImage],
        prompt: &str,
    ) -> Result<(ImageArtifact, GenerationTask)> {
        ctx.state(FlowState::SubmittingStage2);
        ctx.loading("Submitting to NanoBanana\u{2026}");
        let started = Instant::now();
        let handle = ctx
            .guard(self.backend.start_nano_process(working, refs, prompt))
            .await?;
        let task_id = handle.task_id;
        tracing::info!(surface = %ctx.surface, task_id = %task_id, "nano task submitted");
        ctx.log(format!("task_id: {}", task_id));

        ctx.state(FlowState::PollingStage2);
        let mut task = GenerationTask::new(task_id.clone(), Stage::Nano);
        let on_progress = |r: &NanoResult| {
            task.apply_nano(r);
            ctx.emit(FlowEvent::Status {
                surface: ctx.surface.clone(),
                stage: Stage::Nano,
                task_id: task_id.clone(),
                status: r.status.as_str().to_string(),
            });
            if let Some(err) = &r.error {
                ctx.log(format!("error: {}", err));
            }
        };
        let result = ctx
            .guard(poll::poll_nano_result(
                self.backend.as_ref(),
                &task_id,
                on_progress,
                self.config.poll,
            ))
            .await?;

        match result.image_base64.as_deref().filter(|s| !s.is_empty()) {
            Some(payload) => {
                ctx.timer(Timer::Nano, started.elapsed());
                Ok((ImageArtifact::from_payload(payload), task))
            }
            None => Err(TryOnError::TaskFailed {
                message: result
                    .error
                    .unwrap_or_else(|| "No image from NanoBanana".to_string()),
                debug: result.debug,
            }),
        }
    }

    // ── Upscale ─────────────────────────────────────────────────────

    /// Upscale a PNG, JPEG or WebP image of at most `max_upload_bytes`.
    pub async fn upscale(&self, surface: &str, image: &InputImage) -> FlowOutcome {
        let (id, ctx) = self.begin(surface);
        let result = self.run_upscale(&ctx, image).await;
        self.finish(id, &ctx, result)
    }

    async fn run_upscale(&self, ctx: &FlowCtx, image: &InputImage) -> Result<FlowResult> {
        if image.bytes.is_empty() {
            return Err(TryOnError::Validation("Please upload an image first".into()));
        }
        if sniff_mime(&image.bytes).is_none() {
            return Err(TryOnError::Validation(
                "Only PNG, JPEG or WebP images can be upscaled".into(),
            ));
        }
        if image.bytes.len() > self.config.max_upload_bytes {
            return Err(TryOnError::Validation(format!(
                "Image is {} bytes; the limit is {} bytes",
                image.bytes.len(),
                self.config.max_upload_bytes
            )));
        }

        ctx.loading("Uploading image for upscaling\u{2026}");
        let started = Instant::now();
        let handle = ctx.guard(self.backend.start_upscale(image)).await?;
        let task_id = handle.task_id;
        tracing::info!(surface = %ctx.surface, task_id = %task_id, "upscale task submitted");
        ctx.log(format!("task_id: {}", task_id));

        let mut task = GenerationTask::new(task_id.clone(), Stage::Upscale);
        let on_progress = |r: &UpscaleResult| {
            task.apply_upscale(r);
            ctx.emit(FlowEvent::Status {
                surface: ctx.surface.clone(),
                stage: Stage::Upscale,
                task_id: task_id.clone(),
                status: r.status.as_str().to_string(),
            });
            if let Some(stage) = &r.stage {
                ctx.log(format!("stage: {}", stage));
            }
        };
        let url = ctx
            .guard(poll::poll_upscale_result(
                self.backend.as_ref(),
                &task_id,
                on_progress,
                self.config.upscale_poll,
            ))
            .await?;

        let bytes = ctx.guard(self.backend.fetch_image(&url)).await?;
        ctx.timer(Timer::Upscale, started.elapsed());
        self.deliver(ctx, ImageArtifact::from_bytes(bytes), task, "upscaled", false).await
    }

    // ── Delivery ────────────────────────────────────────────────────

    async fn deliver(
        &self,
        ctx: &FlowCtx,
        image: ImageArtifact,
        task: GenerationTask,
        download_prefix: &str,
        remember: bool,
    ) -> Result<FlowResult> {
        ctx.check()?;
        if remember {
            lock(&self.cache).set_last_result(image.clone());
        }
        let bytes = match &image {
            ImageArtifact::Url(url) => match ctx.guard(self.backend.fetch_image(url)).await {
                Ok(bytes) => Some(bytes),
                Err(TryOnError::Cancelled) => return Err(TryOnError::Cancelled),
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "preview fetch failed");
                    None
                }
            },
            other => other.local_bytes().ok().flatten(),
        };
        Ok(FlowResult {
            preview: bytes.and_then(|bytes| self.preview(&image, bytes)),
            download: DownloadHandle::new(download_prefix, image.clone()),
            image,
            task,
            elapsed: ctx.started.elapsed(),
        })
    }

    /// Downscaled JPEG for display; falls back to the full payload when it
    /// cannot be decoded.
    fn preview(&self, image: &ImageArtifact, bytes: Vec<u8>) -> Option<String> {
        let (w, h) = self.config.preview_box;
        match padding::downscale_to_fit(&bytes, w, h, self.config.preview_quality) {
            Ok(jpeg) => Some(encode_data_uri(&jpeg, "image/jpeg")),
            Err(e) => {
                tracing::debug!(error = %e, "preview downscale failed, using full image");
                match image {
                    ImageArtifact::DataUri(uri) => Some(uri.clone()),
                    ImageArtifact::Url(url) => Some(url.clone()),
                    other => Some(encode_data_uri(&bytes, other.mime())),
                }
            }
        }
    }
}
