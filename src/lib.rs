//! # ragline
//!
//! A retrieval and context-assembly pipeline for chat over document chunks.
//!
//! ragline sits between a user's chat message and the language model that
//! answers it: it resolves follow-up references, runs hybrid
//! (keyword + vector) search over a chunk store, reranks candidates
//! against the original query, and packs a token-bounded context window
//! without silently destroying information.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌─────────┐   ┌─────────┐
//! │  Query    │──▶│ Chunk Store│──▶│ Reranker│──▶│ Budget  │
//! │ Processor │   │  (hybrid)  │   │         │   │ Manager │
//! └───────────┘   └────────────┘   └─────────┘   └────┬────┘
//!                                                     ▼
//!                 ┌────────────┐   ┌──────────┐   ┌────────┐
//!                 │  Session   │◀──│Generation│◀──│Renderer│
//!                 │  Ledger    │   │  (LLM)   │   │        │
//!                 └────────────┘   └──────────┘   └────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy and degraded-path semantics |
//! | [`query`] | Follow-up detection and reference resolution |
//! | [`store`] | Chunk store seam + SQLite hybrid retrieval |
//! | [`rerank`] | Second-pass scoring against the original query |
//! | [`budget`] | Structural splitting, smart truncation, allocation |
//! | [`render`] | Deterministic context rendering |
//! | [`ledger`] | Per-session and per-user usage accounting |
//! | [`session`] | Conversation message persistence |
//! | [`generation`] | Text-completion service client |
//! | [`pipeline`] | Per-turn orchestration |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod budget;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod render;
pub mod rerank;
pub mod session;
pub mod store;
