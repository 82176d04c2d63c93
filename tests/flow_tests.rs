
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::mpsc::UnboundedReceiver;
use tryon_client::artifact::decode_data_uri;
use tryon_client::client::nano_form;
use tryon_client::padding::image_dimensions;
use tryon_client::*;

fn flows(backend: &Arc<FakeBackend>) -> Orchestrator<FakeBackend> {
    Orchestrator::new(backend.clone(), FlowConfig::default().with_preview_box(64, 48))
}

fn drain(rx: &mut UnboundedReceiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Generate ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_generate_delivers_full_result_and_preview() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);

    let outcome = flows.generate("result", &subject(1), &garment(1)).await;
    let result = outcome.result().expect("generate should succeed");

    let full = result.image.local_bytes().unwrap().unwrap();
    assert_eq!(full, backend.result_image);
    assert_eq!(result.download.artifact, result.image);
    assert!(result.download.file_name.starts_with("final-"));
    assert!(result.download.file_name.ends_with(".png"));
    assert_eq!(result.task.task_id, "task-1");
    assert_eq!(result.task.stage, Stage::Nano);
    assert_eq!(result.task.status, TaskStatus::Succeeded);

    let preview = decode_data_uri(result.preview.as_deref().unwrap()).unwrap();
    assert_eq!(image_dimensions(&preview).unwrap(), (64, 48));
    assert_eq!(flows.last_result(), Some(result.image.clone()));
}

#[tokio::test]
async fn test_same_inputs_reuse_half_image_and_padding() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);
    let (s, g) = (subject(1), garment(1));

    assert!(flows.generate("result", &s, &g).await.is_success());
    assert!(flows.generate("result", &s, &g).await.is_success());

    assert_eq!(backend.flux_calls(), 1);
    let subs = backend.submissions();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].half, subs[1].half);
    assert_eq!(subs[0].refs[0].bytes, subs[1].refs[0].bytes);
}

#[tokio::test]
async fn test_new_garment_keeps_half_image_but_repads() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);
    let s = subject(1);

    assert!(flows.generate("result", &s, &garment(1)).await.is_success());
    assert!(flows.generate("result", &s, &garment(2)).await.is_success());

    assert_eq!(backend.flux_calls(), 1);
    let subs = backend.submissions();
    assert_ne!(subs[0].refs[0].bytes, subs[1].refs[0].bytes);
    // Padded to the subject's size, not the garment's.
    assert_eq!(image_dimensions(&subs[1].refs[0].bytes).unwrap(), (96, 128));
}

#[tokio::test]
async fn test_new_subject_reruns_stage_one() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);
    let g = garment(1);

    assert!(flows.generate("result", &subject(1), &g).await.is_success());
    assert!(flows.generate("result", &subject(2), &g).await.is_success());
    assert_eq!(backend.flux_calls(), 2);
}

#[tokio::test]
async fn test_metadata_signatures_track_file_identity() {
    let backend = Arc::new(FakeBackend::new());
    let flows = Orchestrator::new(
        backend.clone(),
        FlowConfig::default().with_signature_mode(SignatureMode::Metadata),
    );
    let bytes = noise_png(96, 128, 1);
    let g = garment(1);

    let a = InputImage::new("a.png", bytes.clone());
    let renamed = InputImage::new("b.png", bytes);
    assert!(flows.generate("result", &a, &g).await.is_success());
    assert!(flows.generate("result", &renamed, &g).await.is_success());
    assert_eq!(backend.flux_calls(), 2);
}

#[tokio::test]
async fn test_clear_cache_forces_stage_one() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);
    let (s, g) = (subject(1), garment(1));

    assert!(flows.generate("result", &s, &g).await.is_success());
    flows.clear_cache();
    assert!(flows.last_result().is_none());
    assert!(flows.generate("result", &s, &g).await.is_success());
    assert_eq!(backend.flux_calls(), 2);
}

#[tokio::test]
async fn test_half_image_url_is_fetched() {
    let backend = Arc::new(FakeBackend::new());
    *backend.flux_response.lock().unwrap() = FluxRunResponse {
        half_image_url: Some("/files/half.png".into()),
        half_image_base64: None,
    };
    let flows = flows(&backend);

    assert!(flows.generate("result", &subject(1), &garment(1)).await.is_success());
    assert_eq!(*backend.fetched.lock().unwrap(), vec!["/files/half.png".to_string()]);
    assert!(!backend.submissions()[0].half.is_remote_url());
}

#[tokio::test]
async fn test_bare_jpeg_payloads_stay_inline() {
    let backend = Arc::new(FakeBackend::new());
    let half = noise_jpeg(96, 128, 7);
    *backend.flux_response.lock().unwrap() = FluxRunResponse {
        half_image_url: None,
        half_image_base64: Some(STANDARD.encode(&half)),
    };
    let mut done = nano_success(&[]);
    done.image_base64 = Some(STANDARD.encode(noise_jpeg(128, 96, 42)));
    backend.plan_nano(vec![done]);
    let flows = flows(&backend);

    let outcome = flows.generate("result", &subject(1), &garment(1)).await;
    let result = outcome.result().expect("generate should succeed");

    let submitted = &backend.submissions()[0].half;
    assert!(!submitted.is_remote_url());
    assert_eq!(submitted.mime(), "image/jpeg");
    assert_eq!(submitted.local_bytes().unwrap().unwrap(), half);
    let form = nano_form(submitted, &[], "").unwrap();
    assert!(form.has("half_image"));
    assert!(!form.has("half_image_url"));
    assert!(backend.fetched.lock().unwrap().is_empty());

    assert_eq!(result.image.mime(), "image/jpeg");
    assert!(result.preview.is_some());
    let dir = tempfile::tempdir().unwrap();
    assert!(result.download.save_to(dir.path()).unwrap().exists());
}

#[tokio::test]
async fn test_flux_without_image_fails() {
    let backend = Arc::new(FakeBackend::new());
    *backend.flux_response.lock().unwrap() = FluxRunResponse::default();
    let flows = flows(&backend);

    match flows.generate("result", &subject(1), &garment(1)).await {
        FlowOutcome::Failed { message, .. } => assert!(message.contains("half image")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(backend.submissions().is_empty());
}

#[tokio::test]
async fn test_missing_garment_is_rejected_before_any_request() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);

    let outcome = flows
        .generate("result", &subject(1), &InputImage::new("empty.png", Vec::new()))
        .await;
    assert!(matches!(outcome, FlowOutcome::Failed { .. }));
    assert_eq!(backend.flux_calls(), 0);
}

#[tokio::test]
async fn test_generate_emits_lifecycle_events() {
    let backend = Arc::new(FakeBackend::new());
    let (sink, mut rx) = EventSink::channel();
    let flows = flows(&backend).with_events(sink);

    assert!(flows.generate("result", &subject(1), &garment(1)).await.is_success());
    let events = drain(&mut rx);

    assert!(events.iter().all(|e| e.surface() == "result"));
    assert!(events
        .iter()
        .any(|e| matches!(e, FlowEvent::Attempt { current: 1, max: 6, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, FlowEvent::StageTimer { timer: Timer::Flux, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, FlowEvent::StageTimer { timer: Timer::Total, .. })));
    assert!(events.iter().any(|e| matches!(e, FlowEvent::Preview { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, FlowEvent::Done { file_name, .. } if file_name.starts_with("final-"))));
    assert!(matches!(
        events.last(),
        Some(FlowEvent::State { state: FlowState::Succeeded, .. })
    ));
}

#[tokio::test]
async fn test_remote_result_gets_preview() {
    let backend = Arc::new(FakeBackend::new());
    let mut done = nano_success(&[]);
    done.image_base64 = Some("https://cdn.example/result.png".into());
    backend.plan_nano(vec![done]);
    let (sink, mut rx) = EventSink::channel();
    let flows = flows(&backend).with_events(sink);

    let outcome = flows.generate("result", &subject(1), &garment(1)).await;
    let result = outcome.result().expect("generate should succeed");

    assert_eq!(result.image, ImageArtifact::Url("https://cdn.example/result.png".into()));
    assert_eq!(
        *backend.fetched.lock().unwrap(),
        vec!["https://cdn.example/result.png".to_string()]
    );
    let preview = decode_data_uri(result.preview.as_deref().unwrap()).unwrap();
    assert_eq!(image_dimensions(&preview).unwrap(), (64, 48));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FlowEvent::Preview { .. })));
}

// ── Failure policy ──────────────────────────────────────────────────

#[tokio::test]
async fn test_backend_failure_surfaces_message_and_debug() {
    let backend = Arc::new(FakeBackend::new());
    let debug = json!({"finish_reason": "SAFETY", "blocked": true});
    backend.plan_nano(vec![nano_failed("nsfw", Some(debug.clone()))]);
    backend.plan_nano(vec![nano_failed("nsfw", Some(debug.clone()))]);
    let (sink, mut rx) = EventSink::channel();
    let flows = Orchestrator::new(backend.clone(), FlowConfig::default().with_max_attempts(2))
        .with_events(sink);

    match flows.generate("result", &subject(1), &garment(1)).await {
        FlowOutcome::Failed { message, debug: got } => {
            assert_eq!(message, "nsfw");
            assert_eq!(got, Some(debug.clone()));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // Each attempt is a fresh task; a failed task is never polled again.
    assert_eq!(backend.polled(), vec!["task-1", "task-2"]);
    assert!(flows.last_result().is_none());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::Error { message, debug: Some(d), .. } if message == "nsfw" && *d == debug
    )));
    assert!(matches!(
        events.last(),
        Some(FlowEvent::State { state: FlowState::Failed, .. })
    ));
}

#[tokio::test]
async fn test_failed_attempt_then_success() {
    let backend = Arc::new(FakeBackend::new());
    backend.plan_nano(vec![nano_failed("busy", None)]);
    let flows = flows(&backend);

    assert!(flows.generate("result", &subject(1), &garment(1)).await.is_success());
    assert_eq!(backend.submissions().len(), 2);
}

#[tokio::test]
async fn test_transient_submit_error_starts_new_attempt() {
    let backend = Arc::new(FakeBackend::new());
    backend.fail_next_start(TryOnError::Http {
        method: "POST",
        path: "/nano/process_async".into(),
        status: 503,
        body: "warming up".into(),
    });
    let flows = flows(&backend);

    assert!(flows.generate("result", &subject(1), &garment(1)).await.is_success());
    assert_eq!(backend.submissions().len(), 1);
}

#[tokio::test]
async fn test_auth_error_is_not_retried() {
    let backend = Arc::new(FakeBackend::new());
    backend.fail_next_start(TryOnError::Auth {
        status: 401,
        body: "login required".into(),
    });
    let flows = flows(&backend);

    match flows.generate("result", &subject(1), &garment(1)).await {
        FlowOutcome::Failed { message, .. } => assert!(message.contains("401")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(backend.submissions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poll_timeout_fails_without_new_attempt() {
    let backend = Arc::new(FakeBackend::new());
    backend.plan_nano(vec![nano_running()]);
    let config = FlowConfig::default().with_poll(
        PollOptions::default()
            .with_interval(Duration::from_secs(3))
            .with_timeout(Duration::from_secs(30)),
    );
    let flows = Orchestrator::new(backend.clone(), config);

    match flows.generate("result", &subject(1), &garment(1)).await {
        FlowOutcome::Failed { message, .. } => assert!(message.contains("timed out")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(backend.submissions().len(), 1);
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cancel_before_success_is_cancelled() {
    let backend = Arc::new(FakeBackend::new());
    let mut plan = vec![nano_running(); 3];
    plan.push(nano_success(&backend.result_image));
    backend.plan_nano(plan);
    let (sink, mut rx) = EventSink::channel();
    let flows = flows(&backend).with_events(sink);

    let (s, g) = (subject(1), garment(1));
    let (outcome, cancelled) = tokio::join!(flows.generate("result", &s, &g), async {
        tokio::time::sleep(Duration::from_secs(4)).await;
        flows.cancel("result")
    });

    assert!(cancelled);
    assert!(outcome.is_cancelled());
    assert!(backend.polled().len() < 4);
    assert!(flows.last_result().is_none());
    assert!(!flows.is_running("result"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, FlowEvent::Cancelled { .. })));
    assert!(!events.iter().any(|e| matches!(e, FlowEvent::Error { .. })));
    assert!(!events.iter().any(|e| matches!(e, FlowEvent::Done { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_new_flow_supersedes_running_one() {
    let backend = Arc::new(FakeBackend::new());
    backend.plan_nano(vec![nano_running()]);
    let flows = flows(&backend);
    let (s, g) = (subject(1), garment(1));

    let (first, second) = tokio::join!(flows.generate("result", &s, &g), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        flows.generate("result", &s, &g).await
    });

    assert!(first.is_cancelled());
    assert!(second.is_success());
    assert_eq!(backend.flux_calls(), 1);
    assert!(!flows.is_running("result"));
}

#[tokio::test(start_paused = true)]
async fn test_surfaces_are_independent() {
    let backend = Arc::new(FakeBackend::new());
    backend.plan_nano(vec![nano_running(), nano_running(), nano_success(&backend.result_image)]);
    let flows = flows(&backend);

    let (s, g) = (subject(1), garment(1));
    let up_in = InputImage::new("in.png", noise_png(32, 32, 9));
    let (first, upscaled) = tokio::join!(
        flows.generate("result", &s, &g),
        flows.upscale("upscale", &up_in)
    );
    assert!(first.is_success());
    assert!(upscaled.is_success());
}

#[test]
fn test_cancel_without_running_flow() {
    let backend = Arc::new(FakeBackend::new());
    assert!(!flows(&backend).cancel("result"));
}

// ── Refine ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_refine_uses_full_resolution_result() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);

    let generated = flows.generate("result", &subject(1), &garment(1)).await;
    let full = generated.result().unwrap().image.clone();

    let refined = flows.refine("result", RefineRequest::new("sharper details")).await;
    let result = refined.result().expect("refine should succeed");
    assert!(result.download.file_name.starts_with("refined-"));

    let subs = backend.submissions();
    assert_eq!(subs[1].half, full);
    assert_eq!(subs[1].prompt, "sharper details");
    assert!(subs[1].refs.is_empty());
    assert_eq!(backend.flux_calls(), 1);
}

#[tokio::test]
async fn test_refine_with_remote_image_and_reference() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);

    let request = RefineRequest::new("")
        .with_image(ImageArtifact::Url("https://x/y.png".into()))
        .with_reference(InputImage::new("ref.png", noise_png(16, 16, 5)));
    assert!(flows.refine("result", request).await.is_success());

    let subs = backend.submissions();
    assert_eq!(subs[0].half, ImageArtifact::Url("https://x/y.png".into()));
    assert_eq!(subs[0].refs[0].name, "ref.png");
    assert!(backend.fetched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_refine_rejects_thumbnail_payload() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);

    let request = RefineRequest::new("x").with_image(ImageArtifact::from_bytes(solid_png(8, 8)));
    assert!(matches!(
        flows.refine("result", request).await,
        FlowOutcome::Failed { .. }
    ));
    assert!(backend.submissions().is_empty());
}

#[tokio::test]
async fn test_refine_without_previous_result() {
    let backend = Arc::new(FakeBackend::new());
    let flows = flows(&backend);

    match flows.refine("result", RefineRequest::new("x")).await {
        FlowOutcome::Failed { message, .. } => assert!(message.contains("generate")),
        other => panic!("expected failure, got {:?}", other),
    }
}

// ── Upscale ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_upscale_downloads_resolved_result() {
    let backend = Arc::new(FakeBackend::new());
    backend.plan_upscale(vec![
        upscale_status(TaskStatus::Pending, Some("queued"), None),
        upscale_status(TaskStatus::Done, None, Some("/files/up.png")),
    ]);
    let flows = flows(&backend);

    let outcome = flows
        .upscale("upscale", &InputImage::new("in.png", noise_png(32, 32, 9)))
        .await;
    let result = outcome.result().expect("upscale should succeed");

    assert!(result.download.file_name.starts_with("upscaled-"));
    assert_eq!(result.task.stage, Stage::Upscale);
    assert_eq!(result.task.result.as_deref(), Some("/files/up.png"));
    assert_eq!(*backend.fetched.lock().unwrap(), vec!["http://fake/files/up.png".to_string()]);
    assert!(flows.last_result().is_none());
}

#[tokio::test]
async fn test_upscale_error_status_fails() {
    let backend = Arc::new(FakeBackend::new());
    let mut failed = upscale_status(TaskStatus::Error, None, None);
    failed.error = Some("gpu out of memory".into());
    backend.plan_upscale(vec![failed]);
    let flows = flows(&backend);

    match flows
        .upscale("upscale", &InputImage::new("in.png", noise_png(32, 32, 9)))
        .await
    {
        FlowOutcome::Failed { message, .. } => assert_eq!(message, "gpu out of memory"),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upscale_validates_type_and_size() {
    let backend = Arc::new(FakeBackend::new());
    let mut config = FlowConfig::default();
    config.max_upload_bytes = 100;
    let flows = Orchestrator::new(backend.clone(), config);

    let text = InputImage::new("notes.txt", b"hello".to_vec());
    assert!(matches!(flows.upscale("u", &text).await, FlowOutcome::Failed { .. }));

    let big = InputImage::new("big.png", noise_png(32, 32, 1));
    assert!(matches!(flows.upscale("u", &big).await, FlowOutcome::Failed { .. }));

    assert_eq!(backend.upscale_starts.load(std::sync::atomic::Ordering::SeqCst), 0);
}
