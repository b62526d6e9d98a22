//! Per-turn orchestration of the retrieval and context-assembly stages.
//!
//! Stage order within a turn is strictly sequential: query processing,
//! store search, rerank, budget assembly, render, final generation,
//! ledger record. Retrieval and resolution failures degrade to documented
//! fallbacks; generation failure is the only error surfaced to the
//! caller. The turn is stateless apart from the ledger, so turns across
//! sessions run concurrently without coordination.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::budget;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::generation::{GenerationClient, GenerationMessage, GenerationRequest};
use crate::ledger::SessionLedger;
use crate::models::{Role, TurnOutcome};
use crate::query::QueryProcessor;
use crate::render::{self, NO_CONTEXT_SENTINEL};
use crate::rerank::rerank;
use crate::session::MessageStore;
use crate::store::ChunkStore;

const ANSWER_SYSTEM_PROMPT: &str = "You answer questions using only the provided document context. \
    Cite facts from the context; when the context does not contain the answer, say so plainly \
    instead of guessing.";

/// The assembled pipeline for one deployment: shared, cheaply cloneable
/// handles to every stage's collaborator.
pub struct ChatPipeline {
    config: Config,
    store: Arc<dyn ChunkStore>,
    generation: Arc<dyn GenerationClient>,
    messages: Arc<dyn MessageStore>,
    ledger: Arc<SessionLedger>,
    query_processor: QueryProcessor,
    embedding_provider: Option<Box<dyn EmbeddingProvider>>,
}

impl ChatPipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn ChunkStore>,
        generation: Arc<dyn GenerationClient>,
        messages: Arc<dyn MessageStore>,
        ledger: Arc<SessionLedger>,
    ) -> Self {
        let query_processor = QueryProcessor::new(config.query.clone(), Arc::clone(&generation));

        // A provider that cannot be constructed just disables reranking by
        // vector; the store score ordering still stands.
        let embedding_provider = if config.embedding.is_enabled() {
            match embedding::create_provider(&config.embedding) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("embedding provider unavailable for reranking: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        Self {
            config,
            store,
            generation,
            messages,
            ledger,
            query_processor,
            embedding_provider,
        }
    }

    /// Execute one full chat turn for a session.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for an empty query, [`Error::BudgetTooSmall`]
    /// for a misconfigured budget, and [`Error::GenerationFailed`] when the
    /// final answer call fails. Retrieval and resolution failures never
    /// surface here; they degrade inside the turn.
    pub async fn chat_turn(&self, session_id: &str, user_query: &str) -> Result<TurnOutcome> {
        if user_query.trim().is_empty() {
            return Err(Error::InvalidInput("query must not be empty".to_string()));
        }
        if session_id.trim().is_empty() {
            return Err(Error::InvalidInput("session_id must not be empty".to_string()));
        }

        // History fetch failure degrades to a history-less turn.
        let recent_turns = match self
            .messages
            .get_recent_turns(session_id, self.config.query.resolution_turns)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!("recent turns unavailable, continuing without history: {e}");
                Vec::new()
            }
        };

        let enhanced = self.query_processor.enhance(user_query, &recent_turns).await;

        let candidate_limit =
            self.config.retrieval.top_k * self.config.retrieval.candidate_multiplier;
        let candidates = match self
            .store
            .search(&enhanced.search_query, candidate_limit, None)
            .await
        {
            Ok(chunks) => chunks,
            Err(Error::RetrievalUnavailable(reason)) => {
                warn!("chunk store unavailable, degrading: {reason}");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if candidates.is_empty() {
            debug!(session_id, "no candidates; answering with sentinel");
            return self
                .finish_turn(
                    session_id,
                    user_query,
                    NO_CONTEXT_SENTINEL.to_string(),
                    Vec::new(),
                    0,
                    enhanced.was_followup,
                    false,
                )
                .await;
        }

        // Rerank against the query the user actually typed, not the
        // resolved search string.
        let query_vector = match &self.embedding_provider {
            Some(provider) => {
                match embedding::embed_query(provider.as_ref(), user_query).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!("query embedding failed, reranking by store score: {e:#}");
                        None
                    }
                }
            }
            None => None,
        };
        let reranked = rerank(
            query_vector.as_deref(),
            candidates,
            self.config.retrieval.top_k,
        );

        let assembled = budget::assemble(
            &self.config.budget,
            &reranked,
            self.config.budget.token_budget,
        );
        if assembled.budget_too_small {
            return Err(Error::BudgetTooSmall {
                budget: self.config.budget.token_budget,
                floor: self.config.budget.min_floor_tokens,
            });
        }
        let context_truncated =
            assembled.blocks.iter().any(|b| b.is_truncated) || !assembled.excluded.is_empty();

        let chunk_lookup: HashMap<&str, _> =
            reranked.iter().map(|c| (c.id.as_str(), c)).collect();
        let context = render::render(&assembled.blocks, &chunk_lookup);

        let mut sources: Vec<String> = Vec::new();
        for block in &assembled.blocks {
            if let Some(chunk) = chunk_lookup.get(block.chunk_id.as_str()) {
                if !sources.contains(&chunk.document_name) {
                    sources.push(chunk.document_name.clone());
                }
            }
        }

        debug!(
            session_id,
            blocks = assembled.blocks.len(),
            est_tokens = assembled.estimated_tokens(self.config.budget.chars_per_token),
            "context ready"
        );

        let mut messages: Vec<GenerationMessage> = recent_turns
            .iter()
            .map(|turn| GenerationMessage {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect();
        messages.push(GenerationMessage {
            role: Role::User,
            content: format!("Context:\n{context}\n\nQuestion: {user_query}"),
        });

        let request = GenerationRequest {
            system: ANSWER_SYSTEM_PROMPT.to_string(),
            messages,
            max_tokens: self.config.generation.max_tokens,
            temperature: 0.2,
        };

        // Generation failure is surfaced; nothing is persisted for the
        // failed turn, so a retry starts clean.
        let response = self.generation.complete(&request).await?;

        self.finish_turn(
            session_id,
            user_query,
            response.text,
            sources,
            response.tokens_used,
            enhanced.was_followup,
            context_truncated,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_turn(
        &self,
        session_id: &str,
        user_query: &str,
        answer: String,
        sources: Vec<String>,
        tokens_used: u64,
        was_followup: bool,
        context_truncated: bool,
    ) -> Result<TurnOutcome> {
        let user_metadata = serde_json::json!({ "was_followup": was_followup });
        self.messages
            .append_message(session_id, Role::User, user_query, &[], &user_metadata)
            .await?;

        let assistant_metadata = serde_json::json!({
            "tokens_used": tokens_used,
            "context_truncated": context_truncated,
        });
        // The assistant message id is the turn id: re-recording the same
        // persisted turn hits the ledger's dedup instead of double-counting.
        let turn_id = self
            .messages
            .append_message(session_id, Role::Assistant, &answer, &sources, &assistant_metadata)
            .await?;
        self.ledger
            .record_turn(session_id, &turn_id, tokens_used, None);

        Ok(TurnOutcome {
            turn_id,
            answer,
            sources,
            tokens_used,
            was_followup,
            context_truncated,
        })
    }
}
