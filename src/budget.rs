//! Context budget manager: splitting, truncation, and allocation.
//!
//! Two-phase algorithm. Phase one splits oversized tables and lists at
//! row/item boundaries, repeating the header so every sub-block is
//! self-contained. Phase two walks blocks in priority order against a
//! fixed character budget: a block fits whole, is smart-truncated at a
//! natural boundary, or is recorded as excluded — never silently dropped.
//! Included blocks are then restored to original chunk/ordinal order so
//! the reader sees chunks grouped sensibly rather than shuffled by
//! relevance weight.
//!
//! All counting uses one chars-per-token approximation, the same one
//! reported for pre-call token estimates.

use tracing::debug;

use crate::config::BudgetConfig;
use crate::models::{AssembledContext, Chunk, ChunkKind, ContextBlock, ExcludedBlock};

/// Fraction of the available span where the truncation boundary search
/// begins. Cutting earlier than this wastes granted budget.
const TRUNCATE_SEARCH_FRACTION: f64 = 0.70;

/// Allocate `token_budget` across `chunks` (already in reranked order).
///
/// A budget below the usefulness floor yields an empty result with
/// `budget_too_small` set rather than partial garbage; config loading
/// rejects that combination up front, this is the defensive path.
pub fn assemble(config: &BudgetConfig, chunks: &[Chunk], token_budget: usize) -> AssembledContext {
    if token_budget < config.min_floor_tokens {
        return AssembledContext {
            budget_too_small: true,
            ..Default::default()
        };
    }

    let char_budget = token_budget * config.chars_per_token;
    let floor_chars = config.min_floor_tokens * config.chars_per_token;

    // Phase one: split and prioritize. Sub-blocks inherit their chunk's
    // priority and are always allocated contiguously, so an included
    // header block can never be orphaned by later exclusions.
    let mut candidates: Vec<CandidateChunk> = chunks
        .iter()
        .enumerate()
        .map(|(rank, chunk)| CandidateChunk {
            rank,
            chunk_id: chunk.id.clone(),
            priority: priority(config, chunk, rank),
            structured: matches!(chunk.kind, ChunkKind::Table | ChunkKind::List),
            blocks: split_structural(
                &chunk.text,
                chunk.kind,
                config.structural_split_threshold_chars,
            ),
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.rank.cmp(&b.rank))
    });

    // Phase two: allocation.
    let mut remaining = char_budget;
    let mut included: Vec<ContextBlock> = Vec::new();
    let mut excluded: Vec<ExcludedBlock> = Vec::new();

    for candidate in &candidates {
        for (ordinal, text) in candidate.blocks.iter().enumerate() {
            if text.len() <= remaining {
                remaining -= text.len();
                included.push(ContextBlock {
                    chunk_id: candidate.chunk_id.clone(),
                    ordinal,
                    chunk_rank: candidate.rank,
                    rendered_text: text.clone(),
                    is_truncated: false,
                });
            } else if remaining >= floor_chars {
                // Structured blocks only ever lose whole rows; prose is cut
                // at sentence or word boundaries.
                let truncated = if candidate.structured {
                    truncate_rows(text, remaining)
                } else {
                    Some(smart_truncate(text, remaining))
                };
                let Some(truncated) = truncated.filter(|t| !t.is_empty()) else {
                    excluded.push(ExcludedBlock {
                        chunk_id: candidate.chunk_id.clone(),
                        ordinal,
                    });
                    continue;
                };
                remaining -= truncated.len();
                included.push(ContextBlock {
                    chunk_id: candidate.chunk_id.clone(),
                    ordinal,
                    chunk_rank: candidate.rank,
                    rendered_text: truncated,
                    is_truncated: true,
                });
            } else {
                excluded.push(ExcludedBlock {
                    chunk_id: candidate.chunk_id.clone(),
                    ordinal,
                });
            }
        }
    }

    // Phase three: restore reader-facing order.
    included.sort_by(|a, b| {
        a.chunk_rank
            .cmp(&b.chunk_rank)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });

    let chars_used = included.iter().map(|b| b.rendered_text.len()).sum();
    debug!(
        blocks = included.len(),
        excluded = excluded.len(),
        chars_used,
        char_budget,
        "context assembled"
    );

    AssembledContext {
        blocks: included,
        excluded,
        budget_too_small: false,
        chars_used,
    }
}

struct CandidateChunk {
    rank: usize,
    chunk_id: String,
    priority: f64,
    structured: bool,
    blocks: Vec<String>,
}

/// Allocation priority: rerank score boosted for structured kinds (which
/// disproportionately lose meaning when cut) and for the first ranks.
fn priority(config: &BudgetConfig, chunk: &Chunk, rank: usize) -> f64 {
    let type_boost = match chunk.kind {
        ChunkKind::Table | ChunkKind::List => config.type_boost_structured,
        ChunkKind::Prose | ChunkKind::Heading => 1.0,
    };
    let position_boost = config
        .position_boost_curve
        .get(rank)
        .copied()
        .unwrap_or(1.0);
    chunk.score() * type_boost * position_boost
}

/// Split a structured chunk at row/item boundaries.
///
/// Prose and headings are never pre-split. Tables and lists over the
/// threshold are packed into sub-blocks of whole lines, each repeating
/// the header (plus a markdown divider line when present) so every
/// sub-block is self-contained. A single row is never cut, even when it
/// alone exceeds the threshold.
pub fn split_structural(text: &str, kind: ChunkKind, threshold_chars: usize) -> Vec<String> {
    let structured = matches!(kind, ChunkKind::Table | ChunkKind::List);
    if !structured || text.len() <= threshold_chars {
        return vec![text.to_string()];
    }

    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 2 {
        return vec![text.to_string()];
    }

    let mut header_lines = vec![lines[0]];
    let mut body_start = 1;
    if lines.len() > 2 && is_markdown_divider(lines[1]) {
        header_lines.push(lines[1]);
        body_start = 2;
    }
    let header = header_lines.join("\n");

    let mut blocks: Vec<String> = Vec::new();
    let mut current = header.clone();
    let mut current_has_rows = false;

    for line in &lines[body_start..] {
        let would_be = current.len() + 1 + line.len();
        if would_be > threshold_chars && current_has_rows {
            blocks.push(current);
            current = header.clone();
            current_has_rows = false;
        }
        current.push('\n');
        current.push_str(line);
        current_has_rows = true;
    }
    if current_has_rows {
        blocks.push(current);
    }

    if blocks.is_empty() {
        vec![text.to_string()]
    } else {
        blocks
    }
}

/// A markdown table divider row such as `|---|:---:|`.
fn is_markdown_divider(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' ' | '+'))
        && trimmed.contains('-')
}

/// Truncate a table or list block at the last complete line within
/// `available` bytes. Returns `None` when no row survives alongside the
/// first line; a bare header carries no information worth the budget.
fn truncate_rows(text: &str, available: usize) -> Option<String> {
    if text.len() <= available {
        return Some(text.to_string());
    }
    let prefix = &text[..floor_char_boundary(text, available)];
    let cut = prefix.rfind('\n')?;
    let kept = prefix[..cut].trim_end();
    if kept.contains('\n') {
        Some(kept.to_string())
    } else {
        None
    }
}

/// Truncate `text` to at most `available` bytes at a natural boundary.
///
/// Looks for the last sentence end or paragraph break at or after 70% of
/// the available span; failing that, the last word boundary; failing
/// that, the largest char-boundary prefix. Prose only; structured blocks
/// go through [`truncate_rows`].
pub fn smart_truncate(text: &str, available: usize) -> String {
    if text.len() <= available {
        return text.to_string();
    }

    let prefix_end = floor_char_boundary(text, available);
    let prefix = &text[..prefix_end];
    let search_start = (available as f64 * TRUNCATE_SEARCH_FRACTION) as usize;

    if let Some(cut) = last_sentence_end(prefix, search_start) {
        return prefix[..cut].trim_end().to_string();
    }

    if let Some(pos) = prefix.rfind(char::is_whitespace) {
        let cut = prefix[..pos].trim_end();
        if !cut.is_empty() {
            return cut.to_string();
        }
    }

    prefix.to_string()
}

/// Last sentence-ending punctuation or paragraph break at or after
/// `min_pos`, returned as the cut position just past the boundary.
fn last_sentence_end(prefix: &str, min_pos: usize) -> Option<usize> {
    let mut best: Option<usize> = None;

    if let Some(pos) = prefix.rfind("\n\n") {
        if pos >= min_pos {
            best = Some(pos);
        }
    }

    let bytes = prefix.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if !matches!(b, b'.' | b'!' | b'?') {
            continue;
        }
        // Sentence end only when followed by whitespace or the prefix end.
        let followed_ok = i + 1 >= bytes.len() || bytes[i + 1].is_ascii_whitespace();
        if followed_ok && i >= min_pos && best.map_or(true, |b| i + 1 > b) {
            best = Some(i + 1);
        }
    }

    best
}

/// Largest index `<= max` that lands on a char boundary.
fn floor_char_boundary(text: &str, max: usize) -> usize {
    if max >= text.len() {
        return text.len();
    }
    let mut i = max;
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}
