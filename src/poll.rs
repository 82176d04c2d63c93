use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::time::Instant;

use crate::backend::GenerationBackend;
use crate::error::{Result, TryOnError};
use crate::types::{NanoResult, PollOptions, UpscaleResult};

/// Run a progress callback; a panicking callback is logged and ignored so it
/// cannot abort polling.
fn notify<T, F: FnMut(&T)>(on_progress: &mut F, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| on_progress(value))).is_err() {
        tracing::warn!("progress callback panicked; continuing to poll");
    }
}

/// Poll `GET /nano/result` until the task settles.
///
/// Returns the first response that carries an inline image or a success
/// status. A `failed`/`error` status becomes [`TryOnError::TaskFailed`] with
/// the backend's message and debug payload. Once more than
/// `options.timeout` has elapsed (or `max_polls` requests were made) the loop
/// ends with [`TryOnError::Timeout`]; the worst case is therefore
/// `timeout + interval` plus one request.
pub async fn poll_nano_result<B, F>(
    backend: &B,
    task_id: &str,
    mut on_progress: F,
    options: PollOptions,
) -> Result<NanoResult>
where
    B: GenerationBackend + ?Sized,
    F: FnMut(&NanoResult),
{
    if task_id.is_empty() {
        return Err(TryOnError::Validation("taskId is required".into()));
    }
    let start = Instant::now();
    let mut polls: u32 = 0;

    loop {
        let result = backend.nano_result(task_id).await?;
        polls += 1;
        notify(&mut on_progress, &result);
        tracing::debug!(task_id, status = result.status.as_str(), polls, "nano poll");

        if result.has_image() || result.status.is_success() {
            return Ok(result);
        }
        if result.status.is_failure() {
            return Err(TryOnError::TaskFailed {
                message: result
                    .error
                    .unwrap_or_else(|| "nano process failed".to_string()),
                debug: result.debug,
            });
        }
        if start.elapsed() > options.timeout || options.max_polls.is_some_and(|max| polls >= max) {
            tracing::warn!(task_id, polls, "nano result timeout");
            return Err(TryOnError::Timeout(options.timeout));
        }
        tokio::time::sleep(options.interval).await;
    }
}

/// Poll `GET /upscale/result` until the task settles. Returns the absolute
/// URL of the upscaled image.
pub async fn poll_upscale_result<B, F>(
    backend: &B,
    task_id: &str,
    mut on_progress: F,
    options: PollOptions,
) -> Result<String>
where
    B: GenerationBackend + ?Sized,
    F: FnMut(&UpscaleResult),
{
    if task_id.is_empty() {
        return Err(TryOnError::Validation("taskId is required".into()));
    }
    let start = Instant::now();
    let mut polls: u32 = 0;

    loop {
        let result = backend.upscale_result(task_id).await?;
        polls += 1;
        notify(&mut on_progress, &result);
        tracing::debug!(
            task_id,
            status = result.status.as_str(),
            stage = result.stage.as_deref().unwrap_or(""),
            polls,
            "upscale poll"
        );

        if result.status.is_success() {
            let url = result
                .result_url
                .filter(|u| !u.is_empty())
                .ok_or_else(|| TryOnError::InvalidResponse("No result URL in response".into()))?;
            return Ok(backend.resolve_url(&url));
        }
        if result.status.is_failure() {
            return Err(TryOnError::TaskFailed {
                message: result.error.unwrap_or_else(|| "Upscale failed".to_string()),
                debug: None,
            });
        }
        if start.elapsed() > options.timeout || options.max_polls.is_some_and(|max| polls >= max) {
            return Err(TryOnError::Timeout(options.timeout));
        }
        tokio::time::sleep(options.interval).await;
    }
}
