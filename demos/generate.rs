//! Dress a person in a garment using a running try-on backend.
//!
//! The backend URL comes from saved preferences, `TRYON_API_HOST` or the
//! local default. Press Ctrl-C to cancel the running flow.
//!
//! ```sh
//! cargo run --example generate -- person.png dress.png
//! ```

use anyhow::Context;
use std::sync::Arc;
use tryon_client::{
    ClientConfig, EventSink, FlowConfig, FlowEvent, FlowOutcome, InputImage, Orchestrator,
    Preferences, TryOnClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(person), Some(garment)) = (args.next(), args.next()) else {
        eprintln!("usage: generate <person image> <garment image>");
        return Ok(());
    };

    let prefs = Preferences::load_default();
    let client = TryOnClient::from_config(ClientConfig::builder().with_preferences(&prefs).build())?;
    println!("Backend: {}", client.base_url());

    let (events, mut rx) = EventSink::channel();
    let flows = Arc::new(
        Orchestrator::new(Arc::new(client), FlowConfig::default().with_preferences(&prefs))
            .with_events(events),
    );

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                FlowEvent::Log { message, .. } | FlowEvent::Loading { message, .. } => {
                    println!("  {}", message)
                }
                FlowEvent::Attempt { current, max, .. } => println!("Attempt {}/{}", current, max),
                FlowEvent::StageTimer { timer, elapsed, .. } => {
                    println!("  {:?}: {:.2} s", timer, elapsed.as_secs_f64())
                }
                _ => {}
            }
        }
    });

    let canceller = flows.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel("result");
        }
    });

    let subject = InputImage::from_path(person.as_ref()).with_context(|| format!("reading {}", person))?;
    let garment =
        InputImage::from_path(garment.as_ref()).with_context(|| format!("reading {}", garment))?;

    match flows.generate("result", &subject, &garment).await {
        FlowOutcome::Succeeded(result) => {
            let path = result
                .download
                .save_to(".".as_ref())
                .context("saving result")?;
            println!("Saved {}", path.display());
        }
        FlowOutcome::Failed { message, debug } => {
            eprintln!("Generation failed: {}", message);
            if let Some(debug) = debug {
                eprintln!("debug: {}", debug);
            }
        }
        FlowOutcome::Cancelled => eprintln!("Cancelled"),
    }

    Ok(())
}
