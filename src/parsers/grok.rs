//! Grok (xAI) exports.
//!
//! The export archive is read in memory; nothing is extracted to disk.
//! Field names vary between export versions, so every field is looked up
//! under several aliases.

use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use super::{
    array_field, file_stem, find_files, io_error, is_extension, mtime, name_contains_any,
    read_json, read_zip_entries, require_exists, str_field, timestamp_field, ExportParser,
};
use crate::error::Result;
use crate::models::{ConversationRecord, Platform, Role};

const SKIP_NAMES: &[&str] = &["manifest", "metadata", "account"];
const PROMPT_TITLE_CHARS: usize = 50;

pub struct GrokParser;

impl ExportParser for GrokParser {
    fn platform(&self) -> Platform {
        Platform::Grok
    }

    fn parse(&self, path: &Path) -> Result<Vec<ConversationRecord>> {
        require_exists(Platform::Grok, path)?;
        let fallback_ts = mtime(path);
        let mut records = Vec::new();

        if is_extension(path, "zip") {
            let entries = read_zip_entries(Platform::Grok, path, |name| {
                name.to_lowercase().ends_with(".json") && !name_contains_any(base_name(name), SKIP_NAMES)
            })?;
            debug!(count = entries.len(), "grok JSON entries in archive");
            for (name, bytes) in entries {
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(data) => records.extend(parse_document(&data, &stem_of(&name), fallback_ts)),
                    Err(e) => warn!(entry = %name, error = %e, "skipping invalid grok entry"),
                }
            }
        } else if path.is_dir() {
            for file in find_files(Platform::Grok, path, &["**/*.json"])? {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if name_contains_any(&name, SKIP_NAMES) {
                    continue;
                }
                match read_json(Platform::Grok, &file) {
                    Ok(data) => records.extend(parse_document(&data, &file_stem(&file), mtime(&file))),
                    Err(e) => warn!(error = %e, "skipping unreadable grok file"),
                }
            }
        } else if is_extension(path, "json") {
            let data = read_json(Platform::Grok, path)?;
            records.extend(parse_document(&data, &file_stem(path), fallback_ts));
        } else {
            return Err(io_error(
                Platform::Grok,
                path,
                "expected a .zip export, a .json file or a directory",
            ));
        }

        Ok(records)
    }
}

fn base_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

fn stem_of(entry: &str) -> String {
    let base = base_name(entry);
    base.rsplit_once('.').map(|(s, _)| s).unwrap_or(base).to_string()
}

/// A document holds one conversation, an array of them, or an object
/// with a `conversations` array.
fn parse_document(data: &Value, stem: &str, fallback_ts: i64) -> Vec<ConversationRecord> {
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        other => match other.get("conversations").and_then(Value::as_array) {
            Some(items) => items.iter().collect(),
            None => vec![other],
        },
    };
    let many = items.len() > 1;

    items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let default_id = if many {
                format!("{}-{}", stem, i)
            } else {
                stem.to_string()
            };
            let record = parse_conversation(item, default_id, fallback_ts);
            if record.is_none() {
                debug!(source = stem, index = i, "skipping grok conversation without messages");
            }
            record
        })
        .collect()
}

fn parse_conversation(data: &Value, default_id: String, fallback_ts: i64) -> Option<ConversationRecord> {
    if !data.is_object() {
        return None;
    }
    let id = str_field(data, &["id", "conversation_id"])
        .map(str::to_string)
        .or_else(|| {
            data.get("id")
                .and_then(Value::as_i64)
                .map(|n| n.to_string())
        })
        .unwrap_or(default_id);

    let prompt = str_field(data, &["prompt"]);
    let title = str_field(data, &["title", "name"])
        .map(str::to_string)
        .or_else(|| prompt.map(|p| p.chars().take(PROMPT_TITLE_CHARS).collect()))
        .unwrap_or_default();
    let created_at = timestamp_field(data, &["created_at", "timestamp"]).unwrap_or(fallback_ts);

    let mut turns: Vec<(Role, String)> = array_field(data, &["messages", "history", "chat"])
        .map(|msgs| {
            msgs.iter()
                .filter_map(|m| {
                    let text = str_field(m, &["content", "text", "message"])?;
                    Some((role_of(m), text.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    if turns.is_empty() {
        if let (Some(prompt), Some(response)) = (prompt, str_field(data, &["response"])) {
            turns.push((Role::User, prompt.to_string()));
            turns.push((Role::Assistant, response.to_string()));
        }
    }

    let record = ConversationRecord::from_turns(Platform::Grok, id, title, created_at, turns);
    (!record.messages.is_empty()).then_some(record)
}

fn role_of(msg: &Value) -> Role {
    let raw = str_field(msg, &["role", "sender", "type"]).unwrap_or("user");
    match raw.to_lowercase().as_str() {
        "assistant" | "ai" | "grok" => Role::Assistant,
        "system" => Role::System,
        _ => Role::User,
    }
}
