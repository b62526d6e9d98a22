//! Query processor: follow-up detection and reference resolution.
//!
//! Detection is a pure function of the query text against a configurable
//! vocabulary. It is deliberately not a model call: a binary classification
//! has to be zero-latency and zero-cost, and the expensive resolution call
//! only runs when the classifier fires. On resolution failure the original
//! query is used unresolved; the pipeline is never blocked.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::Error;
use crate::generation::{GenerationClient, GenerationMessage, GenerationRequest};
use crate::models::{ConversationTurn, EnhancedQuery, Role};

const RESOLUTION_SYSTEM_PROMPT: &str = "You rewrite follow-up questions as standalone questions. \
    Given the recent conversation and the user's latest question, reply with a single \
    self-contained question that means the same thing. Reply with only the rewritten question.";

/// Lowercased word tokens of a query.
fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Pure follow-up classifier: OR of three heuristics over the query alone.
///
/// 1. the query contains any configured follow-up phrase;
/// 2. its word tokens intersect the pronoun set;
/// 3. it has at most four tokens and ends with a question mark or
///    contains a pronoun.
pub fn is_followup(config: &QueryConfig, query: &str) -> bool {
    let lowered = query.to_lowercase();
    let tokens = tokenize(query);

    let has_phrase = config
        .followup_phrases
        .iter()
        .any(|phrase| lowered.contains(&phrase.to_lowercase()));

    let has_pronoun = tokens
        .iter()
        .any(|t| config.pronouns.iter().any(|p| p == t));

    let short_question =
        tokens.len() <= 4 && !tokens.is_empty() && (query.trim_end().ends_with('?') || has_pronoun);

    has_phrase || has_pronoun || short_question
}

/// Resolves ambiguous queries into standalone search strings.
pub struct QueryProcessor {
    config: QueryConfig,
    generation: Arc<dyn GenerationClient>,
}

impl QueryProcessor {
    pub fn new(config: QueryConfig, generation: Arc<dyn GenerationClient>) -> Self {
        Self { config, generation }
    }

    /// Produce the standalone search string for a query.
    ///
    /// Non-follow-ups pass through unchanged. Follow-ups with available
    /// history are rewritten by a single deterministic generation call;
    /// any failure falls back to the original query.
    pub async fn enhance(&self, query: &str, recent_turns: &[ConversationTurn]) -> EnhancedQuery {
        let was_followup = is_followup(&self.config, query);

        if !was_followup || recent_turns.is_empty() {
            return EnhancedQuery {
                search_query: query.to_string(),
                was_followup,
            };
        }

        match self.resolve(query, recent_turns).await {
            Ok(resolved) => {
                debug!(original = query, resolved = resolved.as_str(), "follow-up resolved");
                EnhancedQuery {
                    search_query: resolved,
                    was_followup,
                }
            }
            Err(e) => {
                warn!("{}", Error::ResolutionFailed(e.to_string()));
                EnhancedQuery {
                    search_query: query.to_string(),
                    was_followup,
                }
            }
        }
    }

    async fn resolve(
        &self,
        query: &str,
        recent_turns: &[ConversationTurn],
    ) -> crate::error::Result<String> {
        let start = recent_turns
            .len()
            .saturating_sub(self.config.resolution_turns);

        let mut messages: Vec<GenerationMessage> = recent_turns[start..]
            .iter()
            .map(|turn| GenerationMessage {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect();
        messages.push(GenerationMessage {
            role: Role::User,
            content: format!("Latest question: {query}"),
        });

        let request = GenerationRequest {
            system: RESOLUTION_SYSTEM_PROMPT.to_string(),
            messages,
            max_tokens: self.config.resolution_max_tokens,
            temperature: 0.0,
        };

        let response = self.generation.complete(&request).await?;
        let resolved = response.text.trim();
        if resolved.is_empty() {
            return Err(Error::ResolutionFailed("empty rewrite".to_string()));
        }
        Ok(resolved.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::Result;
    use crate::generation::GenerationResponse;

    fn config() -> QueryConfig {
        QueryConfig::default()
    }

    #[test]
    fn test_pronoun_triggers_followup() {
        assert!(is_followup(&config(), "what about it in algae?"));
        assert!(is_followup(&config(), "why do they migrate"));
    }

    #[test]
    fn test_phrase_triggers_followup() {
        assert!(is_followup(&config(), "tell me more please"));
        assert!(is_followup(&config(), "What about the second quarter"));
    }

    #[test]
    fn test_short_question_triggers_followup() {
        assert!(is_followup(&config(), "since when?"));
        assert!(is_followup(&config(), "how much?"));
    }

    #[test]
    fn test_standalone_query_not_followup() {
        assert!(!is_followup(
            &config(),
            "how does photosynthesis work in plants"
        ));
        assert!(!is_followup(&config(), "summarize the revenue report for 2024"));
    }

    #[test]
    fn test_pronoun_matching_is_word_level() {
        // "its" must not fire inside "fruits"
        assert!(!is_followup(&config(), "describe tropical fruits cultivation methods"));
    }

    #[test]
    fn test_empty_query_not_followup() {
        assert!(!is_followup(&config(), ""));
        assert!(!is_followup(&config(), "   "));
    }

    struct FixedClient(Option<String>);

    #[async_trait]
    impl GenerationClient for FixedClient {
        async fn complete(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
            match &self.0 {
                Some(text) => Ok(GenerationResponse {
                    text: text.clone(),
                    tokens_used: 12,
                }),
                None => Err(Error::GenerationFailed("offline".to_string())),
            }
        }
    }

    fn turn(role: Role, content: &str) -> ConversationTurn {
        ConversationTurn {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_followup_resolved_against_history() {
        let processor = QueryProcessor::new(
            config(),
            Arc::new(FixedClient(Some(
                "How does photosynthesis work in algae?".to_string(),
            ))),
        );
        let turns = vec![
            turn(Role::User, "How does photosynthesis work?"),
            turn(Role::Assistant, "Photosynthesis converts light into energy."),
        ];

        let enhanced = processor.enhance("what about it in algae?", &turns).await;
        assert!(enhanced.was_followup);
        assert!(enhanced.search_query.contains("photosynthesis")
            || enhanced.search_query.contains("Photosynthesis"));
    }

    #[tokio::test]
    async fn test_resolution_failure_falls_back_to_original() {
        let processor = QueryProcessor::new(config(), Arc::new(FixedClient(None)));
        let turns = vec![turn(Role::User, "How does photosynthesis work?")];

        let enhanced = processor.enhance("what about it in algae?", &turns).await;
        assert!(enhanced.was_followup);
        assert_eq!(enhanced.search_query, "what about it in algae?");
    }

    #[tokio::test]
    async fn test_non_followup_passes_through_without_call() {
        // FixedClient(None) would error if called; pass-through must not call it.
        let processor = QueryProcessor::new(config(), Arc::new(FixedClient(None)));
        let turns = vec![turn(Role::User, "hello")];

        let enhanced = processor
            .enhance("summarize the revenue report for 2024", &turns)
            .await;
        assert!(!enhanced.was_followup);
        assert_eq!(enhanced.search_query, "summarize the revenue report for 2024");
    }

    #[tokio::test]
    async fn test_followup_without_history_left_unresolved() {
        let processor = QueryProcessor::new(config(), Arc::new(FixedClient(None)));
        let enhanced = processor.enhance("what about it in algae?", &[]).await;
        assert!(enhanced.was_followup);
        assert_eq!(enhanced.search_query, "what about it in algae?");
    }
}
