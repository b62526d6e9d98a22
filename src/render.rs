//! Context renderer: formats assembled blocks into the prompt context
//! string with stable, parseable source markers.
//!
//! Output is byte-deterministic for a given input (tags are sorted,
//! whitespace is fixed) so golden-file assertions hold.

use std::collections::HashMap;

use crate::models::{Chunk, ContextBlock};

/// Fixed sentinel returned when no blocks survived retrieval/budgeting.
/// Distinct from an error: the pipeline completed, there was just nothing
/// relevant to show.
pub const NO_CONTEXT_SENTINEL: &str = "No relevant information found.";

/// Marker appended to a block whose text was truncated for budget.
pub const CONTINUATION_MARKER: &str = "[... continues in source]";

/// Render blocks into a single context string.
///
/// Each block renders as a source header line, optional note and tags
/// lines, the block text, and a continuation marker when truncated.
/// Blocks whose chunk is missing from `chunk_lookup` render with their
/// text only; the store handed us the block, so dropping it over absent
/// metadata would silently lose information.
pub fn render(blocks: &[ContextBlock], chunk_lookup: &HashMap<&str, &Chunk>) -> String {
    if blocks.is_empty() {
        return NO_CONTEXT_SENTINEL.to_string();
    }

    let mut sections: Vec<String> = Vec::with_capacity(blocks.len());

    for block in blocks {
        let mut lines: Vec<String> = Vec::new();

        if let Some(chunk) = chunk_lookup.get(block.chunk_id.as_str()) {
            let mut header = format!("[Source: {}, p. {}", chunk.document_name, chunk.page);
            if let Some(ref section) = chunk.section {
                header.push_str(", ");
                header.push_str(section);
            }
            header.push(']');
            lines.push(header);

            if let Some(ref note) = chunk.context_note {
                lines.push(format!("Note: {note}"));
            }
            if !chunk.tags.is_empty() {
                let mut tags = chunk.tags.clone();
                tags.sort();
                lines.push(format!("Tags: {}", tags.join(", ")));
            }
        }

        lines.push(block.rendered_text.clone());
        if block.is_truncated {
            lines.push(CONTINUATION_MARKER.to_string());
        }

        sections.push(lines.join("\n"));
    }

    sections.join("\n\n")
}
