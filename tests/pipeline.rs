//! End-to-end pipeline tests with in-process mock collaborators.
//!
//! No network, no real model: the store and generation client are mocks
//! so every degraded path can be forced deterministically.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ragline::config::{Config, DbConfig};
use ragline::error::{Error, Result};
use ragline::generation::{GenerationClient, GenerationRequest, GenerationResponse};
use ragline::ledger::SessionLedger;
use ragline::models::{Chunk, ChunkKind, ConversationTurn, Role};
use ragline::pipeline::ChatPipeline;
use ragline::render::NO_CONTEXT_SENTINEL;
use ragline::session::MessageStore;
use ragline::store::{ChunkStore, FilterSpec};

fn test_config() -> Config {
    let toml_str = r#"
        [db]
        path = "/tmp/ragline-test.sqlite"

        [budget]
        token_budget = 500
        min_floor_tokens = 25

        [retrieval]
        top_k = 4
    "#;
    let mut config: Config = toml::from_str(toml_str).unwrap();
    config.db = DbConfig {
        path: PathBuf::from("/tmp/ragline-test.sqlite"),
    };
    config
}

fn chunk(id: &str, doc: &str, text: &str, score: f64) -> Chunk {
    Chunk {
        id: id.to_string(),
        text: text.to_string(),
        kind: ChunkKind::Prose,
        document_name: doc.to_string(),
        page: 1,
        section: None,
        tags: vec![],
        context_note: None,
        relevance_score: score,
        rerank_score: None,
        vector: None,
    }
}

// ---- mocks ----

struct MockStore {
    chunks: Vec<Chunk>,
    unavailable: bool,
    queries: Mutex<Vec<String>>,
}

impl MockStore {
    fn with_chunks(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            unavailable: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn unavailable() -> Self {
        Self {
            chunks: Vec::new(),
            unavailable: true,
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChunkStore for MockStore {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        _filters: Option<&FilterSpec>,
    ) -> Result<Vec<Chunk>> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.unavailable {
            return Err(Error::RetrievalUnavailable("store offline".to_string()));
        }
        Ok(self.chunks.iter().take(limit).cloned().collect())
    }
}

/// Mock generation client. Resolution requests (recognized by the rewrite
/// system prompt) get `resolution`; answer requests get `answer`.
struct MockGeneration {
    resolution: Option<String>,
    answer: std::result::Result<String, String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGeneration {
    fn answering(answer: &str) -> Self {
        Self {
            resolution: None,
            answer: Ok(answer.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            resolution: None,
            answer: Err("model offline".to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationClient for MockGeneration {
    async fn complete(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.requests.lock().unwrap().push(request.clone());

        if request.system.contains("standalone") {
            if let Some(ref resolved) = self.resolution {
                return Ok(GenerationResponse {
                    text: resolved.clone(),
                    tokens_used: 15,
                });
            }
        }

        match &self.answer {
            Ok(text) => Ok(GenerationResponse {
                text: text.clone(),
                tokens_used: 321,
            }),
            Err(reason) => Err(Error::GenerationFailed(reason.clone())),
        }
    }
}

#[derive(Default)]
struct MemoryMessages {
    log: Mutex<Vec<(String, Role, String)>>,
}

#[async_trait]
impl MessageStore for MemoryMessages {
    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        _sources: &[String],
        _metadata: &serde_json::Value,
    ) -> Result<String> {
        let mut log = self.log.lock().unwrap();
        let id = format!("m{}", log.len());
        log.push((session_id.to_string(), role, content.to_string()));
        Ok(id)
    }

    async fn get_recent_turns(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let log = self.log.lock().unwrap();
        let mut turns: Vec<ConversationTurn> = log
            .iter()
            .filter(|(s, _, _)| s == session_id)
            .map(|(_, role, content)| ConversationTurn {
                role: *role,
                content: content.clone(),
                timestamp: Utc::now(),
            })
            .collect();
        let start = turns.len().saturating_sub(limit);
        turns.drain(..start);
        Ok(turns)
    }
}

struct Harness {
    pipeline: ChatPipeline,
    store: Arc<MockStore>,
    generation: Arc<MockGeneration>,
    messages: Arc<MemoryMessages>,
    ledger: Arc<SessionLedger>,
}

fn harness(store: MockStore, generation: MockGeneration) -> Harness {
    let store = Arc::new(store);
    let generation = Arc::new(generation);
    let messages = Arc::new(MemoryMessages::default());
    let ledger = Arc::new(SessionLedger::new(1.0));

    let pipeline = ChatPipeline::new(
        test_config(),
        Arc::clone(&store) as Arc<dyn ChunkStore>,
        Arc::clone(&generation) as Arc<dyn GenerationClient>,
        Arc::clone(&messages) as Arc<dyn MessageStore>,
        Arc::clone(&ledger),
    );

    Harness {
        pipeline,
        store,
        generation,
        messages,
        ledger,
    }
}

// ---- tests ----

#[tokio::test]
async fn test_full_turn_answers_and_records_usage() {
    let chunks = vec![
        chunk("c1", "Handbook", "Photosynthesis converts light into chemical energy.", 0.9),
        chunk("c2", "Handbook", "Chlorophyll absorbs red and blue light.", 0.7),
    ];
    let h = harness(
        MockStore::with_chunks(chunks),
        MockGeneration::answering("It converts light into chemical energy."),
    );

    let outcome = h
        .pipeline
        .chat_turn("s1", "How does photosynthesis store energy over time")
        .await
        .unwrap();

    assert_eq!(outcome.answer, "It converts light into chemical energy.");
    assert_eq!(outcome.sources, vec!["Handbook".to_string()]);
    assert_eq!(outcome.tokens_used, 321);
    assert!(!outcome.context_truncated);

    // Both turns persisted, user first.
    let log = h.messages.log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].1, Role::User);
    assert_eq!(log[1].1, Role::Assistant);
    drop(log);

    let usage = h.ledger.get_session_usage("s1").unwrap();
    assert_eq!(usage.cumulative_tokens, 321);

    // The answer request embedded the chunk context.
    let requests = h.generation.requests.lock().unwrap();
    let last = requests.last().unwrap();
    let prompt = &last.messages.last().unwrap().content;
    assert!(prompt.contains("Photosynthesis converts light"));
    assert!(prompt.contains("[Source: Handbook, p. 1]"));
}

#[tokio::test]
async fn test_turn_id_matches_persisted_message_and_dedups() {
    let chunks = vec![chunk("c1", "Handbook", "Some context text.", 0.9)];
    let h = harness(
        MockStore::with_chunks(chunks),
        MockGeneration::answering("Answered."),
    );

    let outcome = h
        .pipeline
        .chat_turn("s1", "summarize the handbook introduction")
        .await
        .unwrap();

    assert!(!outcome.turn_id.is_empty());
    assert_eq!(h.ledger.get_session_usage("s1").unwrap().cumulative_tokens, 321);

    // Re-delivering the same persisted turn must not double-count.
    assert!(!h.ledger.record_turn("s1", &outcome.turn_id, 321, None));
    assert_eq!(h.ledger.get_session_usage("s1").unwrap().cumulative_tokens, 321);
}

#[tokio::test]
async fn test_store_unavailable_degrades_to_sentinel() {
    let h = harness(
        MockStore::unavailable(),
        MockGeneration::answering("should never be asked"),
    );

    let outcome = h
        .pipeline
        .chat_turn("s1", "summarize the quarterly revenue report")
        .await
        .unwrap();

    assert_eq!(outcome.answer, NO_CONTEXT_SENTINEL);
    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.tokens_used, 0);
    // No generation call was paid for.
    assert_eq!(h.generation.call_count(), 0);
    // The turn is still ledgered, at zero tokens.
    assert_eq!(h.ledger.get_session_usage("s1").unwrap().cumulative_tokens, 0);
}

#[tokio::test]
async fn test_zero_candidates_renders_sentinel() {
    let h = harness(
        MockStore::with_chunks(Vec::new()),
        MockGeneration::answering("should never be asked"),
    );

    let outcome = h
        .pipeline
        .chat_turn("s1", "summarize the annual safety audit")
        .await
        .unwrap();

    assert_eq!(outcome.answer, NO_CONTEXT_SENTINEL);
    assert_eq!(h.generation.call_count(), 0);
}

#[tokio::test]
async fn test_followup_resolution_feeds_store_query() {
    let chunks = vec![chunk(
        "c1",
        "Biology Primer",
        "Algae perform photosynthesis with chlorophyll a and c.",
        0.9,
    )];
    let generation = MockGeneration {
        resolution: Some("How does photosynthesis work in algae?".to_string()),
        answer: Ok("Algae use chlorophyll a and c.".to_string()),
        requests: Mutex::new(Vec::new()),
    };
    let h = harness(MockStore::with_chunks(chunks), generation);

    // Seed history so resolution has something to resolve against.
    h.messages
        .append_message(
            "s1",
            Role::User,
            "How does photosynthesis work?",
            &[],
            &serde_json::json!({}),
        )
        .await
        .unwrap();
    h.messages
        .append_message(
            "s1",
            Role::Assistant,
            "It converts light into chemical energy.",
            &[],
            &serde_json::json!({}),
        )
        .await
        .unwrap();

    let outcome = h
        .pipeline
        .chat_turn("s1", "what about it in algae?")
        .await
        .unwrap();

    assert!(outcome.was_followup);
    // The store saw the resolved standalone question, not the literal query.
    let queries = h.store.queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("photosynthesis"));
}

#[tokio::test]
async fn test_generation_failure_surfaces_and_persists_nothing() {
    let chunks = vec![chunk("c1", "Handbook", "Some context text.", 0.9)];
    let h = harness(MockStore::with_chunks(chunks), MockGeneration::failing());

    let result = h.pipeline.chat_turn("s1", "summarize the handbook introduction").await;
    assert!(matches!(result, Err(Error::GenerationFailed(_))));

    // Failed turns leave no messages and no ledger entry.
    assert!(h.messages.log.lock().unwrap().is_empty());
    assert!(h.ledger.get_session_usage("s1").is_none());
}

#[tokio::test]
async fn test_empty_query_rejected_at_boundary() {
    let h = harness(
        MockStore::with_chunks(Vec::new()),
        MockGeneration::answering("x"),
    );
    let result = h.pipeline.chat_turn("s1", "   ").await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_oversized_context_reports_truncation() {
    // One chunk far beyond the 500-token (2000-char) budget.
    let big = "The metric improved again this quarter. ".repeat(120); // 4800 chars
    let chunks = vec![
        chunk("c1", "Report", &big, 0.9),
        chunk("c2", "Report", &big, 0.8),
    ];
    let h = harness(
        MockStore::with_chunks(chunks),
        MockGeneration::answering("Summarized."),
    );

    let outcome = h
        .pipeline
        .chat_turn("s1", "summarize the improvement metrics please")
        .await
        .unwrap();

    assert!(outcome.context_truncated);

    // Budget invariant: the rendered context body cannot exceed the
    // configured char budget plus per-block markers.
    let requests = h.generation.requests.lock().unwrap();
    let prompt = &requests.last().unwrap().messages.last().unwrap().content;
    assert!(prompt.len() < 500 * 4 + 600, "context overran the budget");
}
