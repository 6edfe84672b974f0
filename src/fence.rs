//! Markdown code-fence scanning.
//!
//! Used twice: to extract [`CodeSnippet`]s from messages, and by the chunker
//! to keep split points out of code blocks.

use std::ops::Range;

use crate::models::CodeSnippet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: String,
    pub source: String,
    /// Byte range of the whole block, fences included.
    pub span: Range<usize>,
}

struct OpenFence {
    start: usize,
    fence_char: char,
    language: String,
    body_start: usize,
}

fn opening_fence(trimmed: &str) -> Option<char> {
    if trimmed.starts_with("```") {
        Some('`')
    } else if trimmed.starts_with("~~~") {
        Some('~')
    } else {
        None
    }
}

/// Find every fenced block in `text`. An unterminated fence runs to the end.
pub fn code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<OpenFence> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();

        match open.take() {
            None => {
                if let Some(fence_char) = opening_fence(trimmed) {
                    let language = trimmed
                        .trim_start_matches(fence_char)
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_string();
                    open = Some(OpenFence {
                        start: line_start,
                        fence_char,
                        language,
                        body_start: offset,
                    });
                }
            }
            Some(fence) => {
                let closes = trimmed.len() >= 3 && trimmed.chars().all(|c| c == fence.fence_char);
                if closes {
                    blocks.push(close(text, fence, line_start, offset));
                } else {
                    open = Some(fence);
                }
            }
        }
    }

    if let Some(fence) = open {
        blocks.push(close(text, fence, text.len(), text.len()));
    }

    blocks
}

fn close(text: &str, fence: OpenFence, body_end: usize, block_end: usize) -> CodeBlock {
    let body_end = body_end.max(fence.body_start);
    let source = text[fence.body_start..body_end]
        .trim_end_matches(['\n', '\r'])
        .to_string();
    CodeBlock {
        language: if fence.language.is_empty() {
            "unknown".to_string()
        } else {
            fence.language
        },
        source,
        span: fence.start..block_end,
    }
}

/// Snippets for one message; empty blocks are skipped.
pub fn extract_snippets(text: &str, message_position: usize) -> Vec<CodeSnippet> {
    code_blocks(text)
        .into_iter()
        .filter(|b| !b.source.trim().is_empty())
        .map(|b| CodeSnippet {
            language: b.language,
            source: b.source,
            message_position,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_tagged_and_untagged_blocks() {
        let text = "intro\n```python\nprint(1)\n```\nmiddle\n```\nls -la\n```\n";
        let blocks = code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "python");
        assert_eq!(blocks[0].source, "print(1)");
        assert_eq!(blocks[1].language, "unknown");
        assert_eq!(&text[blocks[0].span.clone()], "```python\nprint(1)\n```\n");
    }

    #[test]
    fn unterminated_fence_runs_to_end() {
        let text = "see\n```sh\necho hi\necho bye";
        let blocks = code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source, "echo hi\necho bye");
        assert_eq!(blocks[0].span.end, text.len());
    }

    #[test]
    fn tilde_fence_not_closed_by_backticks() {
        let text = "~~~\na\n```\nb\n~~~\n";
        let blocks = code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source, "a\n```\nb");
    }

    #[test]
    fn empty_blocks_are_not_snippets() {
        assert!(extract_snippets("```\n```\n", 0).is_empty());
        assert!(extract_snippets("no code here", 0).is_empty());
    }
}
