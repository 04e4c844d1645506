//! # ragchat
//!
//! A local command-line assistant that answers questions grounded in a
//! directory of documents, using retrieval-augmented generation.
//!
//! Documents are chunked and embedded into an index once; the index is
//! saved as a snapshot and reused on later runs. At question time the most
//! relevant passages are retrieved and sent to a chat model with the
//! question, and the answer is streamed back fragment by fragment.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │  Loader  │──▶│ Index build  │──▶│ Snapshot │
//! │  ./data  │   │ Chunk+Embed  │   │  SQLite  │
//! └──────────┘   └──────┬───────┘   └────┬─────┘
//!                       ▼                │ (next run)
//!                 ┌───────────┐◀─────────┘
//!                 │  Session  │──▶ ChatProvider (ollama / openai)
//!                 └─────┬─────┘
//!                       ▼
//!                 ┌───────────┐
//!                 │ Chat loop │  stdin / stdout
//!                 └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction from PDF and Office files |
//! | [`loader`] | Corpus directory walking |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | In-memory retrieval index |
//! | [`retrieve`] | Keyword, semantic, and hybrid passage retrieval |
//! | [`snapshot`] | SQLite index snapshots |
//! | [`acquire`] | Load-or-build orchestration |
//! | [`progress`] | Build progress reporting |
//! | [`generation`] | Chat model providers |
//! | [`session`] | Conversational retrieval session |
//! | [`chat`] | Interactive chat loop |

pub mod acquire;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod index;
pub mod loader;
pub mod models;
pub mod progress;
pub mod retrieve;
pub mod session;
pub mod snapshot;
