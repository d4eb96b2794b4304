//! Conversation history store interface.
//!
//! The engine only appends records it just created; it never reads the store back.

use crate::protocol::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Where a record came from. The text chat collaborator writes `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionSource {
    Text,
    Voice,
}

/// One finalized utterance. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub source: InteractionSource,
}

impl InteractionRecord {
    pub fn voice(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: format!("{}-voice-{}", Uuid::new_v4(), role.as_str()),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            source: InteractionSource::Voice,
        }
    }
}

/// Append-only sink for finalized turns. `append` must not block.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: InteractionRecord);
}

/// Fire-and-forget into a channel; the receiver owns persistence.
impl HistoryStore for mpsc::UnboundedSender<InteractionRecord> {
    fn append(&self, record: InteractionRecord) {
        if let Err(e) = self.send(record) {
            warn!("History receiver gone, dropping record {}", e.0.id);
        }
    }
}

/// Shared in-memory history, as kept by the app for the chat and analytics views.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    records: Arc<Mutex<Vec<InteractionRecord>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InteractionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, record: InteractionRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
