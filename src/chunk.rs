//! Overlapping sliding-window text chunker.
//!
//! Splits extracted text into windows of at most `window_chars` characters.
//! A window that ends before the end of the text is snapped back to the best
//! available boundary (paragraph break, then newline, then space) so facts
//! are not cut mid-sentence, and the next window starts exactly
//! `overlap_chars` before the previous window's end so consecutive windows
//! share that much text.
//!
//! Output is deterministic for identical input and parameters, which makes
//! re-ingestion reproduce the same chunk set.

/// One window over the extracted text. Offsets are char offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub index: i64,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split `text` into overlapping windows.
///
/// Guarantees:
/// - every window is at most `window_chars` chars;
/// - consecutive windows overlap by exactly `overlap_chars` chars
///   (the final window excepted);
/// - indices are contiguous from 0;
/// - empty or whitespace-only input yields no windows.
///
/// `overlap_chars` is clamped below `window_chars` to keep forward progress.
pub fn chunk_text(text: &str, window_chars: usize, overlap_chars: usize) -> Vec<ChunkSpan> {
    if window_chars == 0 || text.trim().is_empty() {
        return Vec::new();
    }
    let overlap = overlap_chars.min(window_chars - 1);

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < n {
        let hard_end = (start + window_chars).min(n);
        let end = if hard_end < n {
            snap_to_boundary(&chars, start, hard_end, overlap)
        } else {
            hard_end
        };

        spans.push(ChunkSpan {
            index,
            start,
            end,
            text: chars[start..end].iter().collect(),
        });
        index += 1;

        if end >= n {
            break;
        }
        start = end - overlap;
    }

    // A final window landing entirely in trailing whitespace carries nothing.
    while spans
        .last()
        .map(|s| s.text.trim().is_empty())
        .unwrap_or(false)
    {
        spans.pop();
    }

    spans
}

/// Find the best window end in `(start+overlap, hard_end]`, preferring a
/// paragraph break, then a line break, then a space. The lower bound keeps
/// the next window's start strictly after this window's start.
fn snap_to_boundary(chars: &[char], start: usize, hard_end: usize, overlap: usize) -> usize {
    let min_end = start + overlap + 1;

    let mut best_line = None;
    let mut best_word = None;
    let mut e = hard_end;
    while e >= min_end {
        let prev = chars[e - 1];
        if prev == '\n' {
            if e >= 2 && chars[e - 2] == '\n' {
                return e;
            }
            if best_line.is_none() {
                best_line = Some(e);
            }
        } else if prev.is_whitespace() && best_word.is_none() {
            best_word = Some(e);
        }
        e -= 1;
    }

    best_line.or(best_word).unwrap_or(hard_end)
}
