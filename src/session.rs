//! Conversational retrieval session.
//!
//! A [`Session`] binds one [`Index`] to one [`ChatProvider`]. Each
//! [`Session::ask`] retrieves passages for the utterance, places them (with
//! the system instruction) wherever the negotiated [`SessionMode`] allows,
//! and returns a [`ResponseStream`] of reply fragments.
//!
//! The conversation history lives here. A reply is appended to it only once
//! its stream has been read to the end, so an abandoned or failed reply
//! leaves the history as it was before the question.

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::{RetrievalConfig, SearchMode};
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::generation::{
    Capabilities, ChatProvider, ChatRequest, FragmentStream, SingleFragment, SystemPromptSlot,
};
use crate::index::Index;
use crate::models::{ChatMessage, Fragment, Passage};
use crate::retrieve::retrieve;

/// How the session calls its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMode {
    pub streaming: bool,
    /// `None` means the system instruction and context ride on the user message.
    pub system_slot: Option<SystemPromptSlot>,
}

impl SessionMode {
    pub const SINGLE_SHOT: SessionMode = SessionMode {
        streaming: false,
        system_slot: None,
    };

    fn is_satisfied_by(&self, caps: &Capabilities) -> bool {
        (!self.streaming || caps.streaming)
            && self.system_slot.map_or(true, |slot| caps.supports(slot))
    }
}

/// Modes in order of preference. The last one works with any provider.
pub const MODE_TIERS: [SessionMode; 4] = [
    SessionMode {
        streaming: true,
        system_slot: Some(SystemPromptSlot::Instruction),
    },
    SessionMode {
        streaming: true,
        system_slot: Some(SystemPromptSlot::LeadingMessage),
    },
    SessionMode {
        streaming: true,
        system_slot: None,
    },
    SessionMode::SINGLE_SHOT,
];

/// Pick the first tier in [`MODE_TIERS`] the provider can serve.
///
/// Single-shot still uses the best system slot the provider offers.
pub fn negotiate(caps: &Capabilities) -> SessionMode {
    let mode = MODE_TIERS
        .iter()
        .copied()
        .find(|mode| mode.is_satisfied_by(caps))
        .unwrap_or(SessionMode::SINGLE_SHOT);
    if mode.streaming {
        return mode;
    }
    SessionMode {
        system_slot: [SystemPromptSlot::Instruction, SystemPromptSlot::LeadingMessage]
            .into_iter()
            .find(|slot| caps.supports(*slot)),
        ..mode
    }
}

pub struct Session {
    index: Index,
    embedder: Box<dyn EmbeddingProvider>,
    provider: Box<dyn ChatProvider>,
    retrieval: RetrievalConfig,
    system_prompt: Option<String>,
    mode: SessionMode,
    history: Vec<ChatMessage>,
    last_passages: Vec<Passage>,
}

impl Session {
    pub fn open(
        index: Index,
        embedder: Box<dyn EmbeddingProvider>,
        provider: Box<dyn ChatProvider>,
        retrieval: RetrievalConfig,
        system_prompt: Option<String>,
    ) -> Self {
        let mode = negotiate(&provider.capabilities());
        debug!(provider = provider.name(), ?mode, "Negotiated session mode");
        Self {
            index,
            embedder,
            provider,
            retrieval,
            system_prompt,
            mode,
            history: Vec::new(),
            last_passages: Vec::new(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Completed exchanges so far, oldest first.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Passages that grounded the most recent question.
    pub fn last_passages(&self) -> &[Passage] {
        &self.last_passages
    }

    /// Retrieve passages for `query` against this session's index.
    pub async fn passages_for(&self, query: &str) -> Vec<Passage> {
        let query_vec = if self.index.has_vectors() && self.retrieval.mode != SearchMode::Keyword {
            match embed_query(self.embedder.as_ref(), query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Query embedding failed, using keyword retrieval");
                    None
                }
            }
        } else {
            None
        };
        retrieve(&self.index, query, query_vec.as_deref(), &self.retrieval)
    }

    /// Ask a question. The reply arrives through the returned stream.
    pub async fn ask(&mut self, text: &str) -> Result<ResponseStream<'_>> {
        let passages = self.passages_for(text).await;
        let request = self.build_request(text, &passages);
        self.last_passages = passages;

        let inner: Box<dyn FragmentStream> = if self.mode.streaming {
            self.provider.stream(request).await?
        } else {
            Box::new(SingleFragment::new(self.provider.complete(request).await?))
        };

        Ok(ResponseStream {
            session: self,
            question: text.to_string(),
            inner,
            answer: String::new(),
            finished: false,
        })
    }

    fn build_request(&self, text: &str, passages: &[Passage]) -> ChatRequest {
        let system = system_content(self.system_prompt.as_deref(), passages);
        let mut request = ChatRequest::default();

        let user = match (self.mode.system_slot, system) {
            (_, None) => text.to_string(),
            (Some(SystemPromptSlot::Instruction), Some(system)) => {
                request.instruction = Some(system);
                text.to_string()
            }
            (Some(SystemPromptSlot::LeadingMessage), Some(system)) => {
                request.messages.push(ChatMessage::system(system));
                text.to_string()
            }
            (None, Some(system)) => format!("{}\n\n{}", system, text),
        };

        request.messages.extend(self.history.iter().cloned());
        request.messages.push(ChatMessage::user(user));
        request
    }
}

/// System instruction followed by the retrieved context, if either exists.
fn system_content(prompt: Option<&str>, passages: &[Passage]) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
        parts.push(prompt.to_string());
    }
    if !passages.is_empty() {
        parts.push(context_block(passages));
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

fn context_block(passages: &[Passage]) -> String {
    let mut block = String::from("Context from the user's documents:\n---------------------\n");
    for (i, p) in passages.iter().enumerate() {
        if i > 0 {
            block.push('\n');
        }
        block.push_str(&format!("[{}] {}\n{}\n", i + 1, p.source_id, p.text.trim_end()));
    }
    block.push_str("---------------------");
    block
}

/// The reply to one [`Session::ask`], pulled fragment by fragment.
pub struct ResponseStream<'a> {
    session: &'a mut Session,
    question: String,
    inner: Box<dyn FragmentStream>,
    answer: String,
    finished: bool,
}

impl ResponseStream<'_> {
    /// Next fragment, or `None` once the reply is complete. The exchange is
    /// recorded in the session history when `None` is first returned.
    pub async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        if self.finished {
            return Ok(None);
        }
        match self.inner.next_fragment().await? {
            Some(fragment) => {
                self.answer.push_str(&fragment.text);
                Ok(Some(fragment))
            }
            None => {
                self.finished = true;
                let answer = std::mem::take(&mut self.answer);
                self.session
                    .history
                    .push(ChatMessage::user(std::mem::take(&mut self.question)));
                self.session.history.push(ChatMessage::assistant(answer));
                Ok(None)
            }
        }
    }
}
