//! # Ervie Live - Real-time Voice Session Engine
//!
//! Streams microphone audio to a remote conversational endpoint over a duplex channel,
//! plays the synthesized reply back without gaps, accumulates live transcripts of both
//! sides and stops playback the moment the user barges in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Voice Engine task                          │
//! │  ┌──────────────┐   frames   ┌──────────────┐  realtimeInput      │
//! │  │   Mic In     │──────────▶ │   Session    │────────────────▶ ☁  │
//! │  │ (cpal thread)│   level    │ state machine│◀────────────────  │  │
//! │  └──────────────┘            └──────────────┘  serverContent      │
//! │                               │     │      │                      │
//! │             audio chunks      │     │      │ transcription deltas │
//! │  ┌──────────────┐◀────────────┘     │      └──▶┌──────────────┐   │
//! │  │  Playback    │   interrupted:    │          │  Transcript  │   │
//! │  │  Scheduler   │◀── flush ─────────┘          │ Accumulator  │   │
//! │  │   (rodio)    │                              └──────┬───────┘   │
//! │  └──────────────┘                                     ▼           │
//! │                                                 History store     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transcript;

pub use capture::{
    CaptureBackend, CaptureStream, CpalCapture, FrameAssembler, LevelMeter, StreamResampler,
};
pub use channel::{DuplexChannel, DuplexConnector, RemoteEnd, WebSocketConnector};
pub use codec::AudioFrame;
pub use crate::config::{CaptureConfig, LiveConfig, PlaybackConfig, TranscriptionConfig};
pub use error::{VoiceError, VoiceResult};
pub use history::{HistoryStore, InteractionRecord, InteractionSource, MemoryHistory};
pub use playback::{
    AudioClock, ItemId, OutputBackend, OutputSink, PlaybackItem, PlaybackScheduler, RodioOutput,
    RodioSink,
};
pub use protocol::{
    ClientMessage, Direction, ResponseModality, Role, ServerEvent, SessionSetup, WireDecoder,
};
pub use session::{ConnectionState, EngineBackends, VoiceEngine};
pub use transcript::{TranscriptAccumulator, TranscriptEntry};
