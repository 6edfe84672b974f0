//! Overlapping-window conversation chunker.
//!
//! A conversation is rendered into one canonical text (`ROLE: body` per
//! message, separated by a blank line) and cut into windows of at most
//! `max_tokens * 4` bytes. Window ends prefer, in order: a message start, a
//! paragraph break, a line break, a word break. Breaks inside fenced code
//! are used only when nothing else fits. Consecutive chunks share up to
//! `overlap_tokens * 4` bytes, and each [`Chunk`] records exactly how many,
//! so the rendered text can be rebuilt from the chunks.
//!
//! Chunking is deterministic: the same record always yields the same
//! boundaries and hashes.

use sha2::{Digest, Sha256};
use std::ops::Range;

use crate::config::ChunkingConfig;
use crate::fence;
use crate::models::{Chunk, ConversationRecord, Message, Platform};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const MESSAGE_SEPARATOR: &str = "\n\n";

/// SHA-256 hex digest used as the content key for chunks and the cache.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn render_message(message: &Message) -> String {
    format!("{}: {}", message.role.label(), message.text.trim())
}

/// The canonical text that a conversation's chunks cover.
pub fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join(MESSAGE_SEPARATOR)
}

#[derive(Debug, Clone)]
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let max_chars = (config.max_tokens * CHARS_PER_TOKEN).max(1);
        Self {
            max_chars,
            overlap_chars: (config.overlap_tokens * CHARS_PER_TOKEN).min(max_chars - 1),
            min_chars: config.min_tokens * CHARS_PER_TOKEN,
        }
    }

    /// Lazily chunk a whole conversation.
    pub fn chunks(&self, record: &ConversationRecord) -> ChunkIter {
        let mut text = String::new();
        let mut message_starts = Vec::with_capacity(record.messages.len());
        let mut code_spans = Vec::new();

        for message in &record.messages {
            if !text.is_empty() {
                text.push_str(MESSAGE_SEPARATOR);
            }
            let start = text.len();
            message_starts.push(start);
            let rendered = render_message(message);
            code_spans.extend(
                fence::code_blocks(&rendered)
                    .into_iter()
                    .map(|b| (b.span.start + start)..(b.span.end + start)),
            );
            text.push_str(&rendered);
        }

        ChunkIter::new(
            self.clone(),
            text,
            message_starts,
            code_spans,
            record.conversation_id.clone(),
            record.platform,
        )
    }

    /// Lazily chunk free-standing text (e.g. a rendered code snippet).
    pub fn chunk_text(&self, text: &str, conversation_id: &str, platform: Platform) -> ChunkIter {
        let code_spans = fence::code_blocks(text)
            .into_iter()
            .map(|b| b.span)
            .collect();
        ChunkIter::new(
            self.clone(),
            text.to_string(),
            vec![0],
            code_spans,
            conversation_id.to_string(),
            platform,
        )
    }
}

/// Iterator over the chunks of one rendered text.
pub struct ChunkIter {
    chunker: Chunker,
    text: String,
    message_starts: Vec<usize>,
    code_spans: Vec<Range<usize>>,
    conversation_id: String,
    platform: Platform,
    start: usize,
    prev_end: usize,
    position: usize,
}

impl ChunkIter {
    fn new(
        chunker: Chunker,
        text: String,
        message_starts: Vec<usize>,
        code_spans: Vec<Range<usize>>,
        conversation_id: String,
        platform: Platform,
    ) -> Self {
        Self {
            chunker,
            text,
            message_starts,
            code_spans,
            conversation_id,
            platform,
            start: 0,
            prev_end: 0,
            position: 0,
        }
    }

    fn strength(&self, p: usize, prev_char: char) -> Option<u8> {
        if self.message_starts.binary_search(&p).is_ok() {
            Some(3)
        } else if prev_char == '\n' && self.text[..p - 1].ends_with('\n') {
            Some(2)
        } else if prev_char == '\n' {
            Some(1)
        } else if prev_char.is_whitespace() {
            Some(0)
        } else {
            None
        }
    }

    fn inside_code(&self, p: usize) -> bool {
        let idx = self.code_spans.partition_point(|s| s.end <= p);
        self.code_spans.get(idx).is_some_and(|s| s.start < p)
    }

    /// Best break in `(lo, hi]`: highest strength, then latest.
    fn best_break(&self, lo: usize, hi: usize, allow_code: bool) -> Option<usize> {
        let mut best: Option<(u8, usize)> = None;
        for (i, c) in self.text[self.start..hi].char_indices() {
            let p = self.start + i + c.len_utf8();
            if p <= lo || p > hi {
                continue;
            }
            if !allow_code && self.inside_code(p) {
                continue;
            }
            if let Some(s) = self.strength(p, c) {
                if best.map_or(true, |(bs, _)| s >= bs) {
                    best = Some((s, p));
                }
            }
        }
        best.map(|(_, p)| p)
    }

    fn choose_end(&self) -> usize {
        let len = self.text.len();
        let max = self.chunker.max_chars;
        if len - self.start <= max {
            return len;
        }

        let window_end = floor_char_boundary(&self.text, self.start + max);
        // Any end must move past the previous chunk's end.
        let lo = self.prev_end.max(self.start);
        // Keep a tail of at least `min_chars` when a break allows it.
        let tail_limit = if len - window_end < self.chunker.min_chars {
            floor_char_boundary(&self.text, len.saturating_sub(self.chunker.min_chars))
                .min(window_end)
        } else {
            window_end
        };
        let back_half = self.start + max / 2;

        let candidates = [
            (back_half.max(lo), tail_limit, false),
            (lo, tail_limit, false),
            (lo, window_end, false),
            (lo, window_end, true),
        ];
        for (from, to, allow_code) in candidates {
            if from < to {
                if let Some(p) = self.best_break(from, to, allow_code) {
                    return p;
                }
            }
        }

        if window_end > lo {
            window_end
        } else {
            ceil_char_boundary(&self.text, lo + 1)
        }
    }

    fn next_start(&self, end: usize) -> usize {
        let overlap = self.chunker.overlap_chars;
        if overlap == 0 || end >= self.text.len() {
            return end;
        }
        let lo = ceil_char_boundary(&self.text, end.saturating_sub(overlap).max(self.start + 1));
        if lo >= end {
            return end;
        }
        for (i, _) in self.text[lo..end].char_indices() {
            let p = lo + i;
            let clean = self.message_starts.binary_search(&p).is_ok()
                || self.text[..p]
                    .chars()
                    .next_back()
                    .is_some_and(char::is_whitespace);
            if clean {
                return p;
            }
        }
        lo
    }
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.start >= self.text.len() {
            return None;
        }

        let end = self.choose_end();
        let text = self.text[self.start..end].to_string();
        let overlap = self.prev_end.saturating_sub(self.start);

        let chunk = Chunk {
            content_hash: content_hash(&text),
            text,
            conversation_id: self.conversation_id.clone(),
            platform: self.platform,
            position: self.position,
            overlap,
        };

        self.position += 1;
        let next = self.next_start(end);
        self.prev_end = end;
        self.start = if end >= self.text.len() {
            self.text.len()
        } else {
            next
        };

        Some(chunk)
    }
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    i = i.min(text.len());
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(text: &str, mut i: usize) -> usize {
    i = i.min(text.len());
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn chunker(max_tokens: usize, overlap_tokens: usize, min_tokens: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_tokens,
            overlap_tokens,
            min_tokens,
        })
    }

    fn record(turns: &[(Role, &str)]) -> ConversationRecord {
        ConversationRecord::from_turns(
            Platform::ChatGpt,
            "conv-1",
            "Test",
            1_700_000_000,
            turns.iter().map(|(r, t)| (*r, t.to_string())),
        )
    }

    fn rebuild(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        for c in chunks {
            out.push_str(c.fresh_text());
        }
        out
    }

    #[test]
    fn small_conversation_is_one_chunk() {
        let rec = record(&[(Role::User, "hi"), (Role::Assistant, "hello")]);
        let chunks: Vec<_> = chunker(100, 20, 5).chunks(&rec).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "USER: hi\n\nASSISTANT: hello");
        assert_eq!(chunks[0].overlap, 0);
    }

    #[test]
    fn empty_conversation_has_no_chunks() {
        let rec = record(&[]);
        assert_eq!(chunker(100, 20, 5).chunks(&rec).count(), 0);
    }

    #[test]
    fn chunks_respect_max_and_reconstruct() {
        let body = (0..60)
            .map(|i| format!("sentence number {} about tokio runtimes.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let rec = record(&[
            (Role::User, "How do runtimes work?"),
            (Role::Assistant, &body),
            (Role::User, "thanks"),
        ]);
        let c = chunker(40, 10, 2);
        let chunks: Vec<_> = c.chunks(&rec).collect();
        assert!(chunks.len() > 3);
        for ch in &chunks {
            assert!(ch.text.len() <= 160, "chunk too long: {}", ch.text.len());
        }
        assert_eq!(rebuild(&chunks), render_messages(&rec.messages));
        assert!(chunks.iter().skip(1).any(|c| c.overlap > 0));
        for (i, ch) in chunks.iter().enumerate() {
            assert_eq!(ch.position, i);
        }
    }

    #[test]
    fn prefers_message_boundaries() {
        let a = "a".repeat(50);
        let b = "b".repeat(50);
        let rec = record(&[(Role::User, &a), (Role::Assistant, &b)]);
        // window of 80 bytes: the message start at 58 is in the back half.
        let chunks: Vec<_> = chunker(20, 0, 0).chunks(&rec).collect();
        assert_eq!(chunks[0].text, format!("USER: {}\n\n", a));
        assert!(chunks[1].text.starts_with("ASSISTANT: "));
    }

    #[test]
    fn avoids_splitting_inside_code_fence() {
        let code = "```rust\nfn a() {}\nfn b() {}\nfn c() {}\n```";
        let text = format!("intro words here\n\n{}", code);
        let rec = record(&[(Role::Assistant, &text)]);
        let chunks: Vec<_> = chunker(14, 0, 0).chunks(&rec).collect();
        assert!(chunks
            .iter()
            .any(|c| c.text.contains("```rust\nfn a() {}\nfn b() {}\nfn c() {}\n```")));
    }

    #[test]
    fn oversized_single_message_is_split_with_overlap() {
        let word = "lorem ";
        let text = word.repeat(200);
        let rec = record(&[(Role::User, &text)]);
        let chunks: Vec<_> = chunker(25, 5, 0).chunks(&rec).collect();
        assert!(chunks.len() > 5);
        assert!(chunks[1].overlap > 0 && chunks[1].overlap <= 20);
        assert_eq!(rebuild(&chunks), render_messages(&rec.messages));
    }

    #[test]
    fn hard_split_handles_multibyte_text() {
        let text = "é".repeat(100);
        let rec = record(&[(Role::User, &text)]);
        let chunks: Vec<_> = chunker(5, 1, 0).chunks(&rec).collect();
        for ch in &chunks {
            assert!(ch.text.len() <= 20);
        }
        assert_eq!(rebuild(&chunks), render_messages(&rec.messages));
    }

    #[test]
    fn short_tail_is_not_left_alone() {
        let text = "abcd ".repeat(15);
        let rec = record(&[(Role::User, &text)]);
        let chunks: Vec<_> = chunker(10, 0, 5).chunks(&rec).collect();
        // Without the tail rule the last chunk would be a lone "abcd".
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].fresh_text().len(), 24);
        assert_eq!(rebuild(&chunks), render_messages(&rec.messages));
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma delta. ".repeat(40);
        let rec = record(&[(Role::User, &text), (Role::Assistant, "ok")]);
        let c = chunker(30, 8, 2);
        let c1: Vec<_> = c.chunks(&rec).collect();
        let c2: Vec<_> = c.chunks(&rec).collect();
        assert_eq!(c1, c2);
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn chunk_text_covers_free_text() {
        let text = "Language: rust\nContext: From: demo\n\nCode:\nfn main() {}";
        let chunks: Vec<_> = chunker(100, 10, 0)
            .chunk_text(text, "conv-1", Platform::Grok)
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].platform, Platform::Grok);
    }
}
