//! Bounded context assembly for the completion call.
//!
//! Turns a ranked [`RetrievalResult`] into a single context block plus the
//! citation list that lets an answer be attributed to its sources. Chunks
//! are included whole, highest score first, until the budget would be
//! exceeded; a chunk is never truncated mid-text.

use serde::Serialize;

use crate::models::RetrievalResult;

/// Attribution for one included chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub document_id: String,
    pub filename: String,
    pub chunk_index: i64,
}

/// The assembled grounding text and its citations.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBlock {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// Outcome of context assembly. `NoRelevantContext` is an explicit signal:
/// callers must not fall through to an ungrounded answer by accident.
#[derive(Debug, Clone, Serialize)]
pub enum AssembledContext {
    Grounded(ContextBlock),
    NoRelevantContext,
}

impl AssembledContext {
    pub fn is_grounded(&self) -> bool {
        matches!(self, AssembledContext::Grounded(_))
    }
}

/// Assemble a context block of at most `max_context_chars` characters.
///
/// Hits are walked in their ranked order; assembly stops at the first hit
/// whose inclusion (header and separator included) would exceed the budget,
/// so the emitted block is always the highest-scored prefix. Empty
/// retrieval, or a first chunk that alone exceeds the budget, yields
/// `NoRelevantContext`.
pub fn assemble(result: &RetrievalResult, max_context_chars: usize) -> AssembledContext {
    let mut text = String::new();
    let mut citations = Vec::new();
    let mut used = 0usize;

    for hit in &result.hits {
        let header = format!(
            "[Source {}: {} (chunk {})]\n",
            citations.len() + 1,
            hit.filename,
            hit.chunk_index
        );
        let separator = if text.is_empty() { 0 } else { 2 }; // "\n\n"
        let cost = separator + header.chars().count() + hit.text.chars().count();

        if used + cost > max_context_chars {
            break;
        }

        if separator > 0 {
            text.push_str("\n\n");
        }
        text.push_str(&header);
        text.push_str(&hit.text);
        used += cost;

        citations.push(Citation {
            document_id: hit.document_id.clone(),
            filename: hit.filename.clone(),
            chunk_index: hit.chunk_index,
        });
    }

    if citations.is_empty() {
        AssembledContext::NoRelevantContext
    } else {
        AssembledContext::Grounded(ContextBlock { text, citations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievalHit;

    fn make_result(texts: &[&str]) -> RetrievalResult {
        RetrievalResult {
            hits: texts
                .iter()
                .enumerate()
                .map(|(i, t)| RetrievalHit {
                    chunk_id: format!("c{}", i),
                    document_id: "d1".to_string(),
                    chunk_index: i as i64,
                    filename: "notes.txt".to_string(),
                    text: t.to_string(),
                    score: 1.0 - i as f64 * 0.1,
                })
                .collect(),
        }
    }

    #[test]
    fn empty_retrieval_yields_no_context() {
        let out = assemble(&RetrievalResult::default(), 1000);
        assert!(!out.is_grounded());
    }

    #[test]
    fn includes_whole_chunks_in_rank_order() {
        let result = make_result(&["first chunk", "second chunk"]);
        match assemble(&result, 1000) {
            AssembledContext::Grounded(block) => {
                assert!(block.text.contains("first chunk"));
                assert!(block.text.contains("second chunk"));
                let first = block.text.find("first chunk").unwrap();
                let second = block.text.find("second chunk").unwrap();
                assert!(first < second);
                assert_eq!(block.citations.len(), 2);
                assert_eq!(block.citations[0].chunk_index, 0);
                assert_eq!(block.citations[1].chunk_index, 1);
            }
            AssembledContext::NoRelevantContext => panic!("expected grounded context"),
        }
    }

    #[test]
    fn never_exceeds_budget_and_never_truncates() {
        let result = make_result(&["a".repeat(120).as_str(), "b".repeat(120).as_str()]);
        for budget in [10usize, 160, 200, 400] {
            match assemble(&result, budget) {
                AssembledContext::Grounded(block) => {
                    assert!(block.text.chars().count() <= budget);
                    // Whole chunks only: the 120-char runs survive intact.
                    for citation in &block.citations {
                        let marker = if citation.chunk_index == 0 { "a" } else { "b" };
                        assert!(block.text.contains(&marker.repeat(120)));
                    }
                }
                AssembledContext::NoRelevantContext => {
                    // Only acceptable when not even the first chunk fits.
                    assert!(budget < 120);
                }
            }
        }
    }

    #[test]
    fn oversized_first_chunk_yields_no_context() {
        let big = "x".repeat(500);
        let result = make_result(&[big.as_str()]);
        assert!(!assemble(&result, 100).is_grounded());
    }

    #[test]
    fn citation_points_at_source_chunk() {
        let result = make_result(&["only chunk"]);
        match assemble(&result, 1000) {
            AssembledContext::Grounded(block) => {
                assert_eq!(
                    block.citations,
                    vec![Citation {
                        document_id: "d1".to_string(),
                        filename: "notes.txt".to_string(),
                        chunk_index: 0,
                    }]
                );
                assert!(block.text.starts_with("[Source 1: notes.txt (chunk 0)]"));
            }
            AssembledContext::NoRelevantContext => panic!("expected grounded context"),
        }
    }
}
