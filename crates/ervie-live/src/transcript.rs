//! Transcript accumulation for the live session.
//!
//! Streams two growing buffers per turn: `inbound` (the remote participant's speech,
//! committed as role `model`) and `outbound` (the local participant's speech, committed as
//! role `user`). A turn-complete signal finalizes both into history records.

use crate::error::{VoiceError, VoiceResult};
use crate::history::{HistoryStore, InteractionRecord};
use crate::protocol::{Direction, Role};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// One line of the live transcript view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    /// False while the text is still streaming in.
    pub is_final: bool,
}

#[derive(Debug, Default)]
struct TurnBuffer {
    text: String,
    last_seq: Option<u64>,
}

impl TurnBuffer {
    fn append(&mut self, seq: u64, delta: &str, label: &str) -> VoiceResult<()> {
        if let Some(last) = self.last_seq {
            if seq != last + 1 {
                return Err(VoiceError::ProtocolViolation(format!(
                    "{} delta {} arrived after delta {}",
                    label, seq, last
                )));
            }
        }
        self.text.push_str(delta);
        self.last_seq = Some(seq);
        Ok(())
    }

    /// Drop the text but keep sequencing, later deltas still have to follow on.
    fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

/// Accumulates transcription deltas into turns and emits finalized records.
pub struct TranscriptAccumulator {
    inbound: TurnBuffer,
    outbound: TurnBuffer,
    finals: Vec<TranscriptEntry>,
    /// Streaming roles in the order they started this turn.
    streaming: Vec<Role>,
    history: Arc<dyn HistoryStore>,
}

impl TranscriptAccumulator {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self {
            inbound: TurnBuffer::default(),
            outbound: TurnBuffer::default(),
            finals: Vec::new(),
            streaming: Vec::new(),
            history,
        }
    }

    /// Append remote speech. Out-of-order deltas are rejected and leave the buffer untouched.
    pub fn append_inbound(&mut self, seq: u64, delta: &str) -> VoiceResult<()> {
        self.inbound.append(seq, delta, "inbound")?;
        self.mark_streaming(Role::Model);
        Ok(())
    }

    /// Append local speech. Out-of-order deltas are rejected and leave the buffer untouched.
    pub fn append_outbound(&mut self, seq: u64, delta: &str) -> VoiceResult<()> {
        self.outbound.append(seq, delta, "outbound")?;
        self.mark_streaming(Role::User);
        Ok(())
    }

    /// Route a wire delta: `output` transcription is inbound, `input` is outbound.
    pub fn append(&mut self, direction: Direction, seq: u64, delta: &str) -> VoiceResult<()> {
        match direction {
            Direction::Output => self.append_inbound(seq, delta),
            Direction::Input => self.append_outbound(seq, delta),
        }
    }

    pub fn inbound_text(&self) -> &str {
        &self.inbound.text
    }

    pub fn outbound_text(&self) -> &str {
        &self.outbound.text
    }

    /// Finalize the turn. Each non-empty buffer becomes one voice record (user first), then both
    /// buffers clear. With nothing buffered this emits nothing.
    pub fn commit_turn(&mut self) -> Vec<InteractionRecord> {
        let user = self.outbound.take();
        let model = self.inbound.take();
        self.streaming.clear();

        let mut committed = Vec::new();
        for (role, text) in [(Role::User, user), (Role::Model, model)] {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let record = InteractionRecord::voice(role, text);
            self.finals.push(TranscriptEntry {
                role,
                text: record.text.clone(),
                is_final: true,
            });
            self.history.append(record.clone());
            committed.push(record);
        }

        if committed.is_empty() {
            debug!("Turn complete with no speech");
        } else {
            info!("🎯 Turn committed: {} record(s)", committed.len());
        }
        committed
    }

    /// Throw away the partial outbound text (interruption). Nothing reaches history.
    pub fn discard_outbound(&mut self) {
        let dropped = self.outbound.take();
        self.streaming.retain(|r| *r != Role::User);
        if !dropped.is_empty() {
            debug!("Discarded partial outbound transcript ({} chars)", dropped.len());
        }
    }

    /// A typed turn the user sent while connected: final immediately.
    pub fn record_text_turn(&mut self, text: &str) -> InteractionRecord {
        let record = InteractionRecord::voice(Role::User, text);
        self.finals.push(TranscriptEntry {
            role: Role::User,
            text: record.text.clone(),
            is_final: true,
        });
        self.history.append(record.clone());
        record
    }

    /// Finalized entries followed by whatever is still streaming.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        let mut out = self.finals.clone();
        for role in &self.streaming {
            let text = match role {
                Role::User => &self.outbound.text,
                Role::Model => &self.inbound.text,
            };
            out.push(TranscriptEntry {
                role: *role,
                text: text.clone(),
                is_final: false,
            });
        }
        out
    }

    /// Drop partial buffers and sequencing (session teardown). The view is kept for display.
    pub fn reset(&mut self) {
        self.inbound = TurnBuffer::default();
        self.outbound = TurnBuffer::default();
        self.streaming.clear();
    }

    /// Start a fresh view for a new session.
    pub fn clear_view(&mut self) {
        self.reset();
        self.finals.clear();
    }

    fn mark_streaming(&mut self, role: Role) {
        if !self.streaming.contains(&role) {
            self.streaming.push(role);
        }
    }
}
