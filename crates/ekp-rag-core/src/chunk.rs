//! Paragraph-boundary text chunker with sentence and hard-split fallbacks.
//!
//! Splits document text into [`Chunk`]s of at most `max_chars` characters
//! (Unicode scalar values, not bytes). Splitting prefers paragraph
//! boundaries, then sentence boundaries, and only cuts mid-sentence when a
//! single sentence is longer than the limit.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and index, plus a SHA-256 hash of its content for staleness detection.
//!
//! # Algorithm
//!
//! 1. Split text into paragraphs on blank lines.
//! 2. Accumulate paragraphs into a buffer (joined with `\n\n`) while the
//!    joined length stays within `max_chars`; otherwise flush the buffer.
//! 3. A paragraph longer than `max_chars` is split into sentences on CJK
//!    (`。！？；`) and Latin (`.!?;` followed by whitespace) terminators,
//!    and sentences are accumulated the same way.
//! 4. A sentence still longer than `max_chars` is hard-split at fixed
//!    character offsets. Only these windows honour `overlap_chars`.
//! 5. Indices are assigned last, so they stay contiguous across sub-splits.
//!
//! # Example
//!
//! ```rust
//! use ekp_rag_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", 1000, 0);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Separator placed between paragraphs merged into one chunk.
const PARAGRAPH_JOIN: &str = "\n\n";

/// Approximate characters-per-token ratio for non-CJK text.
const CHARS_PER_TOKEN: usize = 4;

const CJK_TERMINATORS: [char; 4] = ['。', '！', '？', '；'];
const LATIN_TERMINATORS: [char; 4] = ['.', '!', '?', ';'];

/// Split text into chunks of at most `max_chars` characters.
///
/// # Guarantees
///
/// - Empty or whitespace-only text yields no chunks.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - No chunk exceeds `max_chars` characters (`max_chars` of 0 is treated
///   as 1).
/// - With `overlap_chars == 0`, concatenating the chunks reproduces the
///   text apart from whitespace consumed at split points.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);

    let mut pieces: Vec<String> = Vec::new();
    let mut buf = Buffer::default();

    for para in split_paragraphs(text) {
        let para_len = char_len(&para);

        if para_len > max_chars {
            buf.flush_into(&mut pieces);
            split_oversized_paragraph(&para, max_chars, overlap_chars, &mut pieces);
            continue;
        }

        let would_be = if buf.is_empty() {
            para_len
        } else {
            buf.len + PARAGRAPH_JOIN.len() + para_len
        };
        if would_be > max_chars {
            buf.flush_into(&mut pieces);
        }
        if !buf.is_empty() {
            buf.push(PARAGRAPH_JOIN, PARAGRAPH_JOIN.len());
        }
        buf.push(&para, para_len);
    }
    buf.flush_into(&mut pieces);

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, content)| make_chunk(document_id, index, content))
        .collect()
}

/// Estimate the token count of `text`.
///
/// Each CJK unified ideograph (U+4E00..=U+9FFF) counts as one token; all
/// other characters count as one token per four, rounded down.
pub fn estimate_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + other / CHARS_PER_TOKEN
}

/// Size summary over a chunk list. Sizes are in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    pub total_chunks: usize,
    pub total_tokens: usize,
    pub avg_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
}

pub fn chunk_stats(chunks: &[Chunk]) -> ChunkStats {
    if chunks.is_empty() {
        return ChunkStats::default();
    }
    let sizes: Vec<usize> = chunks.iter().map(|c| char_len(&c.content)).collect();
    ChunkStats {
        total_chunks: chunks.len(),
        total_tokens: chunks.iter().map(|c| c.token_count).sum(),
        avg_chunk_size: sizes.iter().sum::<usize>() / sizes.len(),
        min_chunk_size: sizes.iter().copied().min().unwrap_or(0),
        max_chunk_size: sizes.iter().copied().max().unwrap_or(0),
    }
}

/// Running chunk buffer that tracks its length in characters.
#[derive(Default)]
struct Buffer {
    text: String,
    len: usize,
}

impl Buffer {
    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn push(&mut self, s: &str, len: usize) {
        self.text.push_str(s);
        self.len += len;
    }

    fn flush_into(&mut self, out: &mut Vec<String>) {
        let trimmed = self.text.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
        self.text.clear();
        self.len = 0;
    }
}

/// Group lines into paragraphs; a blank (or whitespace-only) line ends one.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n").trim().to_string());
    }
    paragraphs
}

fn split_oversized_paragraph(
    para: &str,
    max_chars: usize,
    overlap_chars: usize,
    out: &mut Vec<String>,
) {
    let mut buf = Buffer::default();

    for sentence in split_sentences(para) {
        let len = char_len(sentence);
        if len > max_chars {
            buf.flush_into(out);
            hard_split(sentence.trim(), max_chars, overlap_chars, out);
            continue;
        }
        if buf.len + len > max_chars {
            buf.flush_into(out);
        }
        buf.push(sentence, len);
    }
    buf.flush_into(out);
}

/// Split after sentence terminators. The returned slices are contiguous
/// and cover the whole input.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        let next_is_terminator =
            next.map_or(false, |n| CJK_TERMINATORS.contains(&n) || LATIN_TERMINATORS.contains(&n));
        let ends_sentence = if CJK_TERMINATORS.contains(&c) {
            !next_is_terminator
        } else if LATIN_TERMINATORS.contains(&c) {
            next.map_or(true, char::is_whitespace)
        } else {
            false
        };
        if ends_sentence {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Cut `text` into windows of `max_chars` characters. Consecutive windows
/// share `overlap_chars` characters; the step never drops below one.
fn hard_split(text: &str, max_chars: usize, overlap_chars: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    let step = max_chars.saturating_sub(overlap_chars).max(1);
    let mut start = 0;

    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Create a single [`Chunk`] with a deterministic UUID and SHA-256 hash.
fn make_chunk(document_id: &str, index: usize, content: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, index).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        token_count: estimate_tokens(&content),
        content,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn assert_contiguous(chunks: &[Chunk]) {
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("doc1", "", 100, 0).is_empty());
    }

    #[test]
    fn test_whitespace_text() {
        assert!(chunk_text("doc1", "   \n\n  \t\n", 100, 20).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let text = "这是一个简短的文本。";
        let chunks = chunk_text("doc1", text, 100, 20);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_paragraphs_merge_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text("doc1", text, 1000, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
    }

    #[test]
    fn test_paragraphs_flush_over_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text("doc1", text, 30, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].content, "This is paragraph two.");
        assert_contiguous(&chunks);
    }

    #[test]
    fn test_blank_lines_with_spaces_split_paragraphs() {
        let text = "alpha\n   \nbeta";
        let chunks = chunk_text("doc1", text, 5, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "alpha");
        assert_eq!(chunks[1].content, "beta");
    }

    #[test]
    fn test_cjk_single_paragraph_500_chars() {
        let text: String = "知识库问答系统".chars().cycle().take(500).collect();
        let chunks = chunk_text("doc1", &text, 50, 0);
        assert!(chunks.len() >= 9, "got {} chunks", chunks.len());
        for c in &chunks {
            assert!(c.content.chars().count() <= 50);
        }
        assert_contiguous(&chunks);
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_sentence_split_keeps_terminators() {
        let text = "这是第一段内容。".repeat(20);
        let chunks = chunk_text("doc1", &text, 50, 10);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.ends_with('。'));
            assert!(c.content.chars().count() <= 50);
        }
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_latin_sentences_reconstruct() {
        let para = (0..30)
            .map(|i| format!("Sentence number {} talks about caching.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("Intro line.\n\n{}\n\nClosing words here.", para);
        let chunks = chunk_text("doc1", &text, 120, 0);
        assert_contiguous(&chunks);
        for c in &chunks {
            assert!(c.content.chars().count() <= 120);
        }
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(strip_ws(&joined), strip_ws(&text));
    }

    #[test]
    fn test_decimal_point_is_not_a_sentence_end() {
        let sentences = split_sentences("Pi is 3.14 roughly. Next one");
        assert_eq!(sentences, vec!["Pi is 3.14 roughly.", " Next one"]);
    }

    #[test]
    fn test_hard_split_indices_contiguous_across_subsplits() {
        let long = "x".repeat(95);
        let text = format!("short one\n\n{}\n\ntail", long);
        let chunks = chunk_text("doc1", &text, 20, 0);
        assert_contiguous(&chunks);
        assert_eq!(chunks[0].content, "short one");
        assert_eq!(chunks.last().unwrap().content, "tail");
        assert_eq!(chunks.len(), 1 + 5 + 1);
    }

    #[test]
    fn test_hard_split_overlap_windows() {
        let text = "abcdefghij".repeat(3);
        let chunks = chunk_text("doc1", &text, 10, 4);
        assert_eq!(chunks[0].content, "abcdefghij");
        assert_eq!(chunks[1].content, "ghijabcdef");
        for c in &chunks {
            assert!(c.content.chars().count() <= 10);
        }
    }

    #[test]
    fn test_overlap_not_smaller_step_than_one() {
        let chunks = chunk_text("doc1", "abcdef", 2, 10);
        assert!(!chunks.is_empty());
        assert!(chunks.len() <= 6);
    }

    #[test]
    fn test_token_estimation() {
        assert_eq!(estimate_tokens("这是中文"), 4);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("中abcde"), 2);
        let chunks = chunk_text("doc1", "这是中文测试内容", 100, 0);
        assert_eq!(chunks[0].token_count, 8);
    }

    #[test]
    fn test_deterministic_ids_and_hashes() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, 5, 0);
        let c2 = chunk_text("doc1", text, 5, 0);
        assert_eq!(c1, c2);
        let other = chunk_text("doc2", text, 5, 0);
        assert_ne!(c1[0].id, other[0].id);
        assert_eq!(c1[0].hash, other[0].hash);
    }

    #[test]
    fn test_chunk_stats() {
        let chunks = chunk_text("doc1", "测试内容一\n\n测试内容二", 5, 0);
        let stats = chunk_stats(&chunks);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_tokens, 10);
        assert_eq!(stats.min_chunk_size, 5);
        assert_eq!(stats.max_chunk_size, 5);
        assert_eq!(stats.avg_chunk_size, 5);
    }

    #[test]
    fn test_chunk_stats_empty() {
        assert_eq!(chunk_stats(&[]), ChunkStats::default());
    }
}
