//! Live Voice Demo: talk to Ervie through the default microphone and speakers.
//!
//! Needs `GEMINI_API_KEY` (or `ERVIE__API_KEY`) in the environment or `.env`.
//! Speak normally; talking over Ervie interrupts her. Type a line and press Enter to send
//! it as a text turn. `/quit` or Ctrl+C ends the session.

use ervie_live::{
    ConnectionState, CpalCapture, EngineBackends, InteractionRecord, LiveConfig, VoiceEngine,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = LiveConfig::load()?;
    if config.api_key.is_none() {
        warn!("No API key found; set GEMINI_API_KEY to connect.");
    }
    info!("Live Voice Demo: model {}, voice {}", config.model, config.voice_name);

    match CpalCapture::list_input_devices() {
        Ok(devices) if devices.is_empty() => warn!("No input devices found"),
        Ok(devices) => {
            for device in devices {
                info!("🎤 Input device: {}", device);
            }
        }
        Err(e) => warn!("Could not list input devices: {}", e),
    }

    let (history_tx, mut history_rx) = mpsc::unbounded_channel::<InteractionRecord>();
    tokio::spawn(async move {
        while let Some(record) = history_rx.recv().await {
            println!(
                "[{}] {}: {}",
                record.timestamp.format("%H:%M:%S"),
                record.role.as_str(),
                record.text
            );
        }
    });

    let backends = EngineBackends::live(&config, Arc::new(history_tx));
    let engine = VoiceEngine::spawn(config, backends);
    let mut state = engine.subscribe_state();

    engine.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!("Session is {}", current);
                if matches!(current, ConnectionState::Closed | ConnectionState::Failed) {
                    if let Some(err) = engine.last_error() {
                        warn!("Last error: {}", err);
                    }
                    break;
                }
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => {
                    if let Err(e) = engine.send_text(line).await {
                        warn!("Could not send text: {}", e);
                    }
                }
                None => break,
            },
        }
    }

    engine.stop().await;
    engine.shutdown().await;
    Ok(())
}
