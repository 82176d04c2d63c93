//! # tryon-client
//!
//! Async Rust client for a two-stage virtual try-on backend.
//!
//! Stage 1 (Flux) turns a photo of a person into a "half image"; stage 2
//! (NanoBanana) dresses that image in a garment, polled as an async task.
//! The crate provides the typed HTTP SDK, the image padding utilities used
//! to prepare stage-2 inputs, and an [`Orchestrator`] that runs whole flows
//! with caching, bounded retries, cancellation and a typed event stream.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tryon_client::{
//!     ClientConfig, EventSink, FlowConfig, FlowOutcome, InputImage, Orchestrator, Preferences,
//!     TryOnClient,
//! };
//!
//! # async fn example() -> tryon_client::Result<()> {
//! let prefs = Preferences::load_default();
//! let client = TryOnClient::from_config(ClientConfig::builder().with_preferences(&prefs).build())?;
//!
//! let (events, mut rx) = EventSink::channel();
//! let flows = Orchestrator::new(Arc::new(client), FlowConfig::default().with_preferences(&prefs))
//!     .with_events(events);
//!
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let subject = InputImage::from_path("person.png".as_ref())?;
//! let garment = InputImage::from_path("dress.png".as_ref())?;
//!
//! match flows.generate("result", &subject, &garment).await {
//!     FlowOutcome::Succeeded(result) => {
//!         result.download.save_to(".".as_ref())?;
//!     }
//!     FlowOutcome::Failed { message, .. } => eprintln!("Generation failed: {}", message),
//!     FlowOutcome::Cancelled => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod form;
pub mod orchestrator;
pub mod padding;
pub mod poll;
pub mod prefs;
pub mod retry;
pub mod signature;
pub mod types;

pub use artifact::{DownloadHandle, ImageArtifact, InputImage};
pub use backend::GenerationBackend;
pub use cache::ArtifactCache;
pub use client::TryOnClient;
pub use config::{resolve_base_url, ClientConfig, ClientConfigBuilder, FlowConfig, DEFAULT_BASE_URL};
pub use error::{Result, TryOnError};
pub use events::{EventSink, FlowEvent, FlowState, Timer};
pub use form::{FormSpec, FormValue};
pub use orchestrator::{FlowOutcome, FlowResult, Orchestrator, RefineRequest};
pub use padding::resize_image_with_padding;
pub use prefs::Preferences;
pub use retry::BackoffPolicy;
pub use signature::{PairSignature, Signature, SignatureMode};
pub use types::*;
