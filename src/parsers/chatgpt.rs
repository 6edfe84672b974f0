//! ChatGPT data export (`conversations.json`).
//!
//! Each conversation stores its messages as a `mapping` tree of nodes; the
//! parser flattens the nodes and orders them by `create_time`.

use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use super::{
    io_error, is_extension, mtime, read_json, read_zip_entries, require_exists, str_field,
    timestamp_field, ExportParser,
};
use crate::error::{Error, Result};
use crate::models::{ConversationRecord, Platform, Role};

const EXPORT_FILE: &str = "conversations.json";

pub struct ChatGptParser;

impl ExportParser for ChatGptParser {
    fn platform(&self) -> Platform {
        Platform::ChatGpt
    }

    fn parse(&self, path: &Path) -> Result<Vec<ConversationRecord>> {
        require_exists(Platform::ChatGpt, path)?;
        let (data, fallback_ts) = load(path)?;

        let conversations = match &data {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get("conversations")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    Error::parse(Platform::ChatGpt, "expected a list of conversations")
                })?,
            _ => {
                return Err(Error::parse(
                    Platform::ChatGpt,
                    "expected a list of conversations",
                ))
            }
        };
        debug!(count = conversations.len(), "chatgpt conversations in export");

        let mut records = Vec::new();
        for (i, conv) in conversations.iter().enumerate() {
            match parse_conversation(conv, i, fallback_ts) {
                Some(record) if !record.messages.is_empty() => records.push(record),
                Some(_) => debug!(index = i, "skipping chatgpt conversation without messages"),
                None => warn!(index = i, "skipping malformed chatgpt conversation"),
            }
        }
        Ok(records)
    }
}

fn load(path: &Path) -> Result<(Value, i64)> {
    if path.is_dir() {
        let file = path.join(EXPORT_FILE);
        return Ok((read_json(Platform::ChatGpt, &file)?, mtime(&file)));
    }
    if is_extension(path, "zip") {
        let mut entries = read_zip_entries(Platform::ChatGpt, path, |name| {
            name == EXPORT_FILE || name.ends_with(&format!("/{}", EXPORT_FILE))
        })?;
        let (_, bytes) = entries
            .drain(..)
            .next()
            .ok_or_else(|| io_error(Platform::ChatGpt, path, "archive has no conversations.json"))?;
        let data = serde_json::from_slice(&bytes).map_err(|e| io_error(Platform::ChatGpt, path, e))?;
        return Ok((data, mtime(path)));
    }
    Ok((read_json(Platform::ChatGpt, path)?, mtime(path)))
}

fn parse_conversation(conv: &Value, index: usize, fallback_ts: i64) -> Option<ConversationRecord> {
    let obj = conv.as_object()?;
    let id = str_field(conv, &["id", "conversation_id"])
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatgpt-{}", index));
    let title = str_field(conv, &["title"]).unwrap_or_default();
    let created_at = timestamp_field(conv, &["create_time", "created"]).unwrap_or(fallback_ts);

    let mut nodes: Vec<&Value> = obj
        .get("mapping")
        .and_then(Value::as_object)
        .map(|m| {
            m.values()
                .filter_map(|node| node.get("message"))
                .filter(|msg| msg.is_object())
                .collect()
        })
        .unwrap_or_default();
    nodes.sort_by(|a, b| {
        let ta = a.get("create_time").and_then(Value::as_f64).unwrap_or(0.0);
        let tb = b.get("create_time").and_then(Value::as_f64).unwrap_or(0.0);
        ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let turns = nodes.into_iter().map(|msg| (role_of(msg), message_text(msg)));
    Some(ConversationRecord::from_turns(
        Platform::ChatGpt,
        id,
        title,
        created_at,
        turns,
    ))
}

fn role_of(msg: &Value) -> Role {
    match msg
        .pointer("/author/role")
        .and_then(Value::as_str)
        .unwrap_or_default()
    {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => Role::System,
    }
}

/// Text parts joined by newline; non-text parts with a `text` field count too.
fn message_text(msg: &Value) -> String {
    msg.pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(Value::as_str),
                })
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
