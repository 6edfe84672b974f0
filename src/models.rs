//! Normalized record model shared by every stage of the pipeline.
//!
//! Each platform parser emits [`ConversationRecord`]s; the chunker turns them
//! into [`Chunk`]s; the embedder attaches an [`EmbeddingVector`]; the index
//! stores the result as an [`IndexEntry`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fence;

/// Source platform of a conversation export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    ChatGpt,
    Gemini,
    Grok,
    Antigravity,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::ChatGpt,
        Platform::Gemini,
        Platform::Grok,
        Platform::Antigravity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::ChatGpt => "chatgpt",
            Platform::Gemini => "gemini",
            Platform::Grok => "grok",
            Platform::Antigravity => "antigravity",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chatgpt" => Ok(Platform::ChatGpt),
            "gemini" => Ok(Platform::Gemini),
            "grok" => Ok(Platform::Grok),
            "antigravity" => Ok(Platform::Antigravity),
            other => Err(format!(
                "unknown platform '{}': expected chatgpt, gemini, grok, or antigravity",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Upper-case label used when rendering messages into chunk text.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::System => "SYSTEM",
        }
    }
}

/// A fenced code block found inside a message.
///
/// `message_position` points back at the owning [`Message`] by index rather
/// than by ownership; it is only meaningful alongside that conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSnippet {
    /// Fence language tag, or `"unknown"`.
    pub language: String,
    pub source: String,
    pub message_position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub code_snippets: Vec<CodeSnippet>,
    /// Zero-based index within the conversation.
    pub position: usize,
}

impl Message {
    /// Build a message and extract its fenced code blocks.
    pub fn new(role: Role, text: impl Into<String>, position: usize) -> Self {
        let text = text.into();
        let code_snippets = fence::extract_snippets(&text, position);
        Self {
            role,
            text,
            code_snippets,
            position,
        }
    }
}

/// One conversation from one platform, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub platform: Platform,
    /// Unique per platform.
    pub conversation_id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Unix seconds.
    pub created_at: i64,
}

impl ConversationRecord {
    /// Assemble a record from `(role, text)` pairs, dropping blank messages
    /// and numbering the rest in order.
    pub fn from_turns(
        platform: Platform,
        conversation_id: impl Into<String>,
        title: impl Into<String>,
        created_at: i64,
        turns: impl IntoIterator<Item = (Role, String)>,
    ) -> Self {
        let messages = turns
            .into_iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .enumerate()
            .map(|(i, (role, text))| Message::new(role, text, i))
            .collect();
        let title = title.into();
        Self {
            platform,
            conversation_id: conversation_id.into(),
            title: if title.trim().is_empty() {
                "Untitled".to_string()
            } else {
                title
            },
            messages,
            created_at,
        }
    }

    pub fn code_snippets(&self) -> impl Iterator<Item = &CodeSnippet> {
        self.messages.iter().flat_map(|m| m.code_snippets.iter())
    }
}

/// Logical namespace inside the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Conversations,
    Code,
    Decisions,
    Solutions,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Conversations,
        Collection::Code,
        Collection::Decisions,
        Collection::Solutions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Conversations => "conversations",
            Collection::Code => "code",
            Collection::Decisions => "decisions",
            Collection::Solutions => "solutions",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown collection '{}'", s))
    }
}

/// A bounded span of rendered conversation text prepared for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub conversation_id: String,
    pub platform: Platform,
    /// Zero-based chunk index within its source.
    pub position: usize,
    /// Leading bytes of `text` repeated from the previous chunk.
    pub overlap: usize,
    /// SHA-256 hex of `text`; cache and dedup key.
    pub content_hash: String,
}

impl Chunk {
    /// The part of the text not shared with the previous chunk.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub values: Vec<f32>,
    pub content_hash: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMetadata {
    pub platform: Platform,
    pub conversation_id: String,
    pub title: String,
    /// Unix seconds of the source conversation.
    pub timestamp: i64,
    pub collection: Collection,
    /// Fence language of a `code` collection entry, lowercased.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A chunk, its vector, and the metadata used for filtering and ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: EmbeddingVector,
    pub metadata: EntryMetadata,
}

/// An index entry as read back for ranking (vector omitted).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEntry {
    pub content_hash: String,
    pub text: String,
    pub position: usize,
    pub metadata: EntryMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_str() {
        for p in Platform::ALL {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
        assert_eq!("ChatGPT".parse::<Platform>().unwrap(), Platform::ChatGpt);
        assert!("claude".parse::<Platform>().is_err());
    }

    #[test]
    fn from_turns_drops_blank_messages_and_renumbers() {
        let record = ConversationRecord::from_turns(
            Platform::Grok,
            "c1",
            "",
            0,
            vec![
                (Role::User, "hi".to_string()),
                (Role::Assistant, "   ".to_string()),
                (Role::Assistant, "hello".to_string()),
            ],
        );
        assert_eq!(record.title, "Untitled");
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].position, 1);
        assert_eq!(record.messages[1].text, "hello");
    }

    #[test]
    fn message_extracts_code_snippets() {
        let msg = Message::new(
            Role::Assistant,
            "Try this:\n```rust\nfn main() {}\n```\n",
            3,
        );
        assert_eq!(msg.code_snippets.len(), 1);
        assert_eq!(msg.code_snippets[0].language, "rust");
        assert_eq!(msg.code_snippets[0].message_position, 3);
    }

    #[test]
    fn collection_serde_names() {
        let json = serde_json::to_string(&Collection::Code).unwrap();
        assert_eq!(json, "\"code\"");
        assert_eq!("solutions".parse::<Collection>().unwrap(), Collection::Solutions);
    }
}
