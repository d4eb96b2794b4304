//! Duplex channel message model and its JSON mapping onto the live endpoint.
//!
//! The session only ever sees [`ClientMessage`] and [`ServerEvent`]. [`to_wire`] and
//! [`WireDecoder`] translate those to and from the endpoint's `setup` / `realtimeInput` /
//! `clientContent` / `serverContent` JSON messages.

use crate::codec;
use crate::error::VoiceResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Requested response modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseModality {
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ResponseModality::Audio => "AUDIO",
            ResponseModality::Text => "TEXT",
        }
    }
}

/// Conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// Which side of the conversation a transcription delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Transcription of the local participant's captured speech.
    Input,
    /// Transcription of the remote participant's synthesized speech.
    Output,
}

/// Configuration sent once when the session opens. Nothing here changes mid-session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
    pub response_modality: ResponseModality,
    pub voice_name: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Outbound messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// One encoded capture frame (16-bit little-endian PCM).
    AudioFrame { bytes: Vec<u8>, sample_rate: u32 },
    /// A complete typed turn.
    TextTurn { role: Role, text: String, complete: bool },
}

/// Inbound messages and lifecycle signals.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Opened,
    /// Base64 PCM chunk of remote speech.
    AudioChunk { data: String },
    /// A streamed transcription fragment. `seq` counts deltas per direction in arrival order.
    Transcription { direction: Direction, seq: u64, delta: String },
    Interrupted,
    TurnComplete,
    /// A message arrived that could not be parsed. Not fatal.
    Undecodable { detail: String },
    Closed { reason: Option<String> },
    Error { message: String },
}

/// Full model resource name (`models/...`).
fn model_resource(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

/// The `setup` message that opens a session.
pub fn setup_message(setup: &SessionSetup) -> Value {
    let mut body = json!({
        "model": model_resource(&setup.model),
        "generationConfig": {
            "responseModalities": [setup.response_modality.as_wire()],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": setup.voice_name }
                }
            }
        },
        "systemInstruction": {
            "parts": [{ "text": setup.system_instruction }]
        }
    });
    if setup.input_transcription {
        body["inputAudioTranscription"] = json!({});
    }
    if setup.output_transcription {
        body["outputAudioTranscription"] = json!({});
    }
    json!({ "setup": body })
}

/// Serialize an outbound message to the endpoint's JSON text.
pub fn to_wire(msg: &ClientMessage) -> String {
    let value = match msg {
        ClientMessage::AudioFrame { bytes, sample_rate } => json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": codec::pcm_mime_type(*sample_rate),
                    "data": codec::to_base64(bytes),
                }]
            }
        }),
        ClientMessage::TextTurn { role, text, complete } => json!({
            "clientContent": {
                "turns": [{ "role": role.as_str(), "parts": [{ "text": text }] }],
                "turnComplete": complete,
            }
        }),
    };
    value.to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    input_transcription: Option<TranscriptionText>,
    output_transcription: Option<TranscriptionText>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptionText {
    #[serde(default)]
    text: String,
}

/// Turns endpoint JSON into ordered [`ServerEvent`]s, stamping transcription sequence numbers.
#[derive(Debug, Default)]
pub struct WireDecoder {
    input_seq: u64,
    output_seq: u64,
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one inbound message. A single message may carry several signals; they come out
    /// as audio, interruption, output transcription, input transcription, turn-complete.
    pub fn decode(&mut self, raw: &[u8]) -> VoiceResult<Vec<ServerEvent>> {
        let msg: ServerMessage = serde_json::from_slice(raw)?;
        let mut events = Vec::new();

        if msg.setup_complete.is_some() {
            events.push(ServerEvent::Opened);
        }

        if let Some(content) = msg.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(inline) = part.inline_data {
                        if !inline.data.is_empty() {
                            events.push(ServerEvent::AudioChunk { data: inline.data });
                        }
                    }
                }
            }
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
                events.push(ServerEvent::Transcription {
                    direction: Direction::Output,
                    seq: self.next_seq(Direction::Output),
                    delta: t.text,
                });
            }
            if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
                events.push(ServerEvent::Transcription {
                    direction: Direction::Input,
                    seq: self.next_seq(Direction::Input),
                    delta: t.text,
                });
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if msg.go_away.is_some() {
            events.push(ServerEvent::Closed {
                reason: Some("endpoint requested disconnect".to_string()),
            });
        }

        Ok(events)
    }

    fn next_seq(&mut self, direction: Direction) -> u64 {
        let counter = match direction {
            Direction::Input => &mut self.input_seq,
            Direction::Output => &mut self.output_seq,
        };
        let seq = *counter;
        *counter += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "gemini-live".to_string(),
            system_instruction: "be calm".to_string(),
            response_modality: ResponseModality::Audio,
            voice_name: "Aoede".to_string(),
            input_transcription: true,
            output_transcription: false,
        }
    }

    #[test]
    fn setup_message_shape() {
        let v = setup_message(&setup());
        assert_eq!(v["setup"]["model"], "models/gemini-live");
        assert_eq!(v["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            v["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(v["setup"]["systemInstruction"]["parts"][0]["text"], "be calm");
        assert!(v["setup"].get("inputAudioTranscription").is_some());
        assert!(v["setup"].get("outputAudioTranscription").is_none());
    }

    #[test]
    fn text_turn_wire() {
        let wire = to_wire(&ClientMessage::TextTurn {
            role: Role::User,
            text: "hello".to_string(),
            complete: true,
        });
        let v: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(v["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(v["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
        assert_eq!(v["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn audio_frame_wire() {
        let wire = to_wire(&ClientMessage::AudioFrame {
            bytes: vec![1, 0, 2, 0],
            sample_rate: 16000,
        });
        let v: Value = serde_json::from_str(&wire).unwrap();
        let chunk = &v["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], codec::to_base64(&[1, 0, 2, 0]));
    }

    #[test]
    fn decodes_combined_server_content_in_order() {
        let mut decoder = WireDecoder::new();
        let raw = br#"{"serverContent":{
            "modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]},
            "outputTranscription":{"text":"I "},
            "inputTranscription":{"text":"hi"},
            "turnComplete":true}}"#;
        let events = decoder.decode(raw).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::AudioChunk { data: "AAA=".to_string() },
                ServerEvent::Transcription { direction: Direction::Output, seq: 0, delta: "I ".to_string() },
                ServerEvent::Transcription { direction: Direction::Input, seq: 0, delta: "hi".to_string() },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn sequences_advance_per_direction() {
        let mut decoder = WireDecoder::new();
        let out = br#"{"serverContent":{"outputTranscription":{"text":"a"}}}"#;
        decoder.decode(out).unwrap();
        let events = decoder.decode(out).unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::Transcription { direction: Direction::Output, seq: 1, delta: "a".to_string() }]
        );
        let input = br#"{"serverContent":{"inputTranscription":{"text":"b"}}}"#;
        let events = decoder.decode(input).unwrap();
        assert!(matches!(events[0], ServerEvent::Transcription { direction: Direction::Input, seq: 0, .. }));
    }

    #[test]
    fn lifecycle_signals() {
        let mut decoder = WireDecoder::new();
        assert_eq!(decoder.decode(br#"{"setupComplete":{}}"#).unwrap(), vec![ServerEvent::Opened]);
        assert_eq!(
            decoder.decode(br#"{"serverContent":{"interrupted":true}}"#).unwrap(),
            vec![ServerEvent::Interrupted]
        );
        assert!(matches!(
            decoder.decode(br#"{"goAway":{"timeLeft":"1s"}}"#).unwrap()[0],
            ServerEvent::Closed { .. }
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut decoder = WireDecoder::new();
        let events = decoder.decode(br#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut decoder = WireDecoder::new();
        assert!(decoder.decode(b"{not json").is_err());
    }
}
