//! Core data models shared across the index and chat pipeline.
//!
//! Documents and chunks flow from the corpus loader into the index;
//! passages flow out of retrieval into the session; fragments flow out of
//! the generation provider into the chat loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized document produced by the corpus loader.
///
/// Identity is the path relative to the corpus root.
#[derive(Debug, Clone)]
pub struct Document {
    pub source_id: String,
    pub title: String,
    pub content_type: String,
    pub body: String,
    pub modified_at: DateTime<Utc>,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A retrieved passage handed to the generation provider as grounding context.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub chunk_id: String,
    pub source_id: String,
    pub title: String,
    pub chunk_index: i64,
    pub score: f64,
    pub text: String,
}

/// Token accounting reported by a generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: u64,
}

/// One incremental piece of a streamed response.
///
/// Only the final fragment of a response is expected to carry [`Usage`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    pub text: String,
    pub usage: Option<Usage>,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Conversation role of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
