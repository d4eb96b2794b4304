//! Engine configuration: session-open constants plus capture and playback formats.
//!
//! Load order: built-in defaults, then an optional TOML file (`ERVIE_CONFIG` path, else
//! `config/ervie-live.toml`), then `ERVIE__*` environment variables (`__` separates sections,
//! e.g. `ERVIE__CAPTURE__FRAME_SIZE=2048`).

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{ResponseModality, SessionSetup};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Aoede";
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "\
You are Ervie, a compassionate, calm, and supportive anxiety relief companion.
Your goal is to help the user feel grounded and safe.
- Speak in a soothing, gentle, and unhurried manner.
- Keep responses concise but warm (under 60 words for voice).
- Validate their feelings without being overly clinical.
- Suggest grounding techniques like 5-4-3-2-1, box breathing, or progressive muscle relaxation when appropriate.
- If the user seems in immediate danger or crisis, gently encourage them to seek professional emergency help.";

/// Microphone capture format. Frames are mono, little-endian 16-bit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Samples per frame (default: 4096, ~256ms at 16kHz)
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 4096,
        }
    }
}

/// Format of the audio the endpoint streams back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate in Hz (default: 24000)
    pub sample_rate: u32,

    /// Number of channels (default: 1)
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
        }
    }
}

/// Which sides of the conversation the endpoint should transcribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub input: bool,
    pub output: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Target model identifier.
    pub model: String,
    /// Prebuilt synthetic voice name.
    pub voice_name: String,
    /// Fixed system instruction sent once at session open.
    pub system_instruction: String,
    pub response_modality: ResponseModality,
    /// WebSocket URL of the live endpoint (without the key query parameter).
    pub endpoint: String,
    /// API key. Usually supplied through the environment, never through a checked-in file.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub transcription: TranscriptionConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            response_modality: ResponseModality::Audio,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            transcription: TranscriptionConfig::default(),
        }
    }
}

impl LiveConfig {
    /// Load config from file and environment. Precedence: `ERVIE__*` env > file > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("ERVIE_CONFIG").unwrap_or_else(|_| "config/ervie-live.toml".to_string());
        let builder = config::Config::builder()
            .set_default("model", DEFAULT_MODEL)?
            .set_default("voice_name", DEFAULT_VOICE)?
            .set_default("endpoint", DEFAULT_ENDPOINT)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("ERVIE").separator("__"))
            .build()?;

        let mut loaded: LiveConfig = built.try_deserialize()?;
        if loaded.api_key.is_none() {
            loaded.api_key = std::env::var("GEMINI_API_KEY")
                .or_else(|_| std::env::var("API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty());
        }
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject formats the codec and scheduler cannot work with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".to_string()));
        }
        if self.capture.channels == 0 || self.playback.channels == 0 {
            return Err(VoiceError::Config("channel counts must be non-zero".to_string()));
        }
        if self.capture.frame_size == 0 {
            return Err(VoiceError::Config("capture frame_size must be non-zero".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(VoiceError::Config("model must be set".to_string()));
        }
        Ok(())
    }

    /// The immutable setup handed to the connector when a session starts.
    pub fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            system_instruction: self.system_instruction.clone(),
            response_modality: self.response_modality,
            voice_name: self.voice_name.clone(),
            input_transcription: self.transcription.input,
            output_transcription: self.transcription.output,
        }
    }
}
