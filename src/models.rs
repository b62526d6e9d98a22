//! Core data models used throughout ragline.
//!
//! These types represent the chunks, conversation turns, and context blocks
//! that flow through the retrieval and assembly pipeline. Chunks are created
//! by the ingestion collaborator and are read-only here; the pipeline only
//! assigns scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structural kind of a chunk. Tables and lists lose meaning when cut
/// mid-row, so the budget manager treats them differently from prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Prose,
    Table,
    List,
    Heading,
}

impl ChunkKind {
    /// Parse a kind from its stored string form. Unknown kinds fall back to
    /// prose so a store with newer kinds degrades instead of failing.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "table" => ChunkKind::Table,
            "list" => ChunkKind::List,
            "heading" => ChunkKind::Heading,
            _ => ChunkKind::Prose,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Prose => "prose",
            ChunkKind::Table => "table",
            ChunkKind::List => "list",
            ChunkKind::Heading => "heading",
        }
    }
}

/// A retrievable unit of document text with metadata.
///
/// Immutable once created; `rerank_score` is the only field the pipeline
/// assigns, and it supersedes `relevance_score` for ordering once present.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub kind: ChunkKind,
    pub document_name: String,
    pub page: u32,
    pub section: Option<String>,
    pub tags: Vec<String>,
    pub context_note: Option<String>,
    /// Store-native hybrid relevance in [0,1]. Not authoritative after
    /// reranking.
    pub relevance_score: f64,
    /// Assigned by the reranker; normalized to [0,1].
    pub rerank_score: Option<f64>,
    pub vector: Option<Vec<f32>>,
}

impl Chunk {
    /// Effective ordering score: rerank score when present, store score
    /// otherwise.
    pub fn score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.relevance_score)
    }
}

/// Speaker role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn in a conversation session. Append-only per session.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Output of the query processor: the string actually sent to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedQuery {
    pub search_query: String,
    pub was_followup: bool,
}

/// One renderable unit produced by the budget manager.
///
/// A chunk may produce several blocks when structurally split; `ordinal`
/// preserves the original order within the chunk regardless of the order
/// blocks were allocated in.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub chunk_id: String,
    /// Position of this block within its source chunk (0 = first).
    pub ordinal: usize,
    /// Rank of the source chunk in the reranked input, used to restore
    /// reader-facing order after priority allocation.
    pub chunk_rank: usize,
    pub rendered_text: String,
    pub is_truncated: bool,
}

/// A block that was selected but could not be given any budget.
///
/// Recorded so that "excluded for budget" is an observable state rather
/// than a silent drop.
#[derive(Debug, Clone)]
pub struct ExcludedBlock {
    pub chunk_id: String,
    pub ordinal: usize,
}

/// Result of budget allocation: the included blocks in render order plus
/// everything that had to be left out.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub excluded: Vec<ExcludedBlock>,
    /// Set when the configured budget was below the usefulness floor; the
    /// block list is empty in that case.
    pub budget_too_small: bool,
    /// Characters consumed, for the pre-call token estimate.
    pub chars_used: usize,
}

impl AssembledContext {
    /// Estimated tokens consumed, using the same approximation as
    /// allocation.
    pub fn estimated_tokens(&self, chars_per_token: usize) -> usize {
        self.chars_used.div_ceil(chars_per_token.max(1))
    }
}

/// Accumulated usage for one conversation session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUsage {
    pub session_id: String,
    pub cumulative_tokens: u64,
    pub cumulative_cost: f64,
    pub last_updated: DateTime<Utc>,
}

/// Result of one full chat turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Ledger turn id for this turn; equal to the persisted assistant
    /// message id, so replaying the record is idempotent.
    pub turn_id: String,
    pub answer: String,
    /// Document names that contributed context, deduplicated in order.
    pub sources: Vec<String>,
    pub tokens_used: u64,
    pub was_followup: bool,
    /// True when any context block was truncated or excluded for budget.
    pub context_truncated: bool,
}
