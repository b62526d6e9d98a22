use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    /// Number of chunks the reranker keeps.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// The store is asked for `top_k * candidate_multiplier` candidates so
    /// the reranker has a genuine choice set.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_top_k() -> usize {
    8
}
fn default_candidate_multiplier() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Tables and lists longer than this are split at row/item boundaries
    /// before budgeting.
    #[serde(default = "default_split_threshold")]
    pub structural_split_threshold_chars: usize,
    /// Below this many tokens of remaining budget a block is excluded
    /// rather than truncated into uselessness.
    #[serde(default = "default_min_floor_tokens")]
    pub min_floor_tokens: usize,
    /// Fixed char/token approximation used for every allocation decision
    /// and for reported estimates.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Priority multiplier for table and list chunks.
    #[serde(default = "default_type_boost_structured")]
    pub type_boost_structured: f64,
    /// Per-rank priority multipliers for the first ranked chunks; ranks
    /// past the end of the list get 1.0.
    #[serde(default = "default_position_boost_curve")]
    pub position_boost_curve: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            structural_split_threshold_chars: default_split_threshold(),
            min_floor_tokens: default_min_floor_tokens(),
            chars_per_token: default_chars_per_token(),
            type_boost_structured: default_type_boost_structured(),
            position_boost_curve: default_position_boost_curve(),
        }
    }
}

fn default_token_budget() -> usize {
    2000
}
fn default_split_threshold() -> usize {
    600
}
fn default_min_floor_tokens() -> usize {
    100
}
fn default_chars_per_token() -> usize {
    4
}
fn default_type_boost_structured() -> f64 {
    1.3
}
fn default_position_boost_curve() -> Vec<f64> {
    vec![1.5, 1.3, 1.15]
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_followup_phrases")]
    pub followup_phrases: Vec<String>,
    #[serde(default = "default_pronouns")]
    pub pronouns: Vec<String>,
    /// How many recent turns are sent to the resolution call.
    #[serde(default = "default_resolution_turns")]
    pub resolution_turns: usize,
    #[serde(default = "default_resolution_max_tokens")]
    pub resolution_max_tokens: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            followup_phrases: default_followup_phrases(),
            pronouns: default_pronouns(),
            resolution_turns: default_resolution_turns(),
            resolution_max_tokens: default_resolution_max_tokens(),
        }
    }
}

fn default_followup_phrases() -> Vec<String> {
    [
        "what about",
        "how about",
        "and the",
        "what else",
        "tell me more",
        "more about",
        "why is that",
        "same for",
        "also for",
        "and for",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_pronouns() -> Vec<String> {
    [
        "it", "that", "this", "those", "these", "they", "them", "its", "their",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_resolution_turns() -> usize {
    4
}
fn default_resolution_max_tokens() -> u32 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_gen_provider")]
    pub provider: String,
    #[serde(default = "default_gen_model")]
    pub model: String,
    #[serde(default = "default_gen_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_gen_provider(),
            model: default_gen_model(),
            max_tokens: default_gen_max_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_gen_timeout_secs(),
        }
    }
}

fn default_gen_provider() -> String {
    "openai".to_string()
}
fn default_gen_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_gen_max_tokens() -> u32 {
    1024
}
fn default_gen_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Blended rate used when the caller supplies no cost estimate.
    #[serde(default = "default_cost_per_million")]
    pub cost_per_million_tokens: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cost_per_million_tokens: default_cost_per_million(),
        }
    }
}

fn default_cost_per_million() -> f64 {
    0.60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// Boundary validation: malformed configuration is rejected here so the
/// pure pipeline stages never see it.
pub fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }

    if config.budget.token_budget == 0 {
        anyhow::bail!("budget.token_budget must be > 0");
    }
    if config.budget.chars_per_token == 0 {
        anyhow::bail!("budget.chars_per_token must be > 0");
    }
    if config.budget.token_budget < config.budget.min_floor_tokens {
        anyhow::bail!(
            "budget.token_budget ({}) is below the usefulness floor ({})",
            config.budget.token_budget,
            config.budget.min_floor_tokens
        );
    }
    for (i, boost) in config.budget.position_boost_curve.iter().enumerate() {
        if *boost < 1.0 {
            anyhow::bail!("budget.position_boost_curve[{}] must be >= 1.0", i);
        }
    }
    if config.budget.type_boost_structured < 1.0 {
        anyhow::bail!("budget.type_boost_structured must be >= 1.0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown generation provider: '{}'. Must be openai.", other),
    }

    if config.ledger.cost_per_million_tokens < 0.0 {
        anyhow::bail!("ledger.cost_per_million_tokens must be >= 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            db: DbConfig {
                path: PathBuf::from("/tmp/ragline.sqlite"),
            },
            retrieval: RetrievalConfig::default(),
            budget: BudgetConfig::default(),
            query: QueryConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn test_budget_below_floor_rejected() {
        let mut config = base_config();
        config.budget.token_budget = 10;
        config.budget.min_floor_tokens = 100;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_alpha_out_of_range_rejected() {
        let mut config = base_config();
        config.retrieval.hybrid_alpha = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let mut config = base_config();
        config.embedding.provider = "openai".to_string();
        assert!(validate(&config).is_err());
        config.embedding.model = Some("text-embedding-3-small".to_string());
        config.embedding.dims = Some(1536);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_minimal_toml_parses_with_defaults() {
        let toml_str = r#"
            [db]
            path = "/tmp/ragline.sqlite"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.budget.token_budget, 2000);
        assert_eq!(config.budget.chars_per_token, 4);
        assert_eq!(config.query.resolution_turns, 4);
        assert!(config.query.pronouns.contains(&"it".to_string()));
        assert!(validate(&config).is_ok());
    }
}
