use std::future::Future;

use crate::artifact::{ImageArtifact, InputImage};
use crate::error::Result;
use crate::types::{FluxOptions, FluxRunResponse, NanoResult, TaskHandle, UpscaleResult};

/// The remote operations a flow needs.
///
/// [`TryOnClient`](crate::TryOnClient) implements this over HTTP. The
/// orchestrator is generic over it so flows can run against any transport,
/// including scripted fakes in tests.
///
/// # Example
///
/// ```ignore
/// struct Offline;
///
/// impl GenerationBackend for Offline {
///     async fn run_flux(&self, _: &InputImage, _: &str, _: &FluxOptions) -> Result<FluxRunResponse> {
///         Ok(FluxRunResponse { half_image_base64: Some(PNG_B64.into()), ..Default::default() })
///     }
///     // ...
/// }
/// ```
pub trait GenerationBackend: Send + Sync {
    /// Stage 1: submit the subject image and get the half image back.
    fn run_flux(
        &self,
        main_image: &InputImage,
        prompt: &str,
        options: &FluxOptions,
    ) -> impl Future<Output = Result<FluxRunResponse>> + Send;

    /// Stage 2: submit the working image plus references; returns a task.
    fn start_nano_process(
        &self,
        half_image: &ImageArtifact,
        ref_images: &[InputImage],
        prompt: &str,
    ) -> impl Future<Output = Result<TaskHandle>> + Send;

    /// One status query for a stage-2 task.
    fn nano_result(&self, task_id: &str) -> impl Future<Output = Result<NanoResult>> + Send;

    /// Submit an image for upscaling; returns a task.
    fn start_upscale(&self, image: &InputImage) -> impl Future<Output = Result<TaskHandle>> + Send;

    /// One status query for an upscale task.
    fn upscale_result(&self, task_id: &str) -> impl Future<Output = Result<UpscaleResult>> + Send;

    /// Download the bytes behind a (possibly relative) result URL.
    fn fetch_image(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Turn a backend-relative URL into an absolute one.
    fn resolve_url(&self, url: &str) -> String {
        url.to_string()
    }
}
