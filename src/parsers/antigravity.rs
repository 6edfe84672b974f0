//! Antigravity brain directory.
//!
//! Each conversation is a sub-directory named by its UUID. Messages come
//! from the system-generated logs (`overview.txt` then `task_*.txt`),
//! followed by the markdown artifacts the assistant produced.

use std::path::Path;
use tracing::{debug, warn};

use super::{io_error, require_exists, ExportParser};
use crate::error::Result;
use crate::models::{ConversationRecord, Platform, Role};

/// Conversation directories are UUIDs; shorter names are bookkeeping.
const MIN_DIR_NAME_LEN: usize = 31;
const TITLE_MAX_CHARS: usize = 100;
const ARTIFACTS: &[&str] = &["task.md", "implementation_plan.md", "walkthrough.md"];
const USER_MARKER: &str = "USER_REQUEST:";
const ASSISTANT_MARKER: &str = "ASSISTANT:";

pub struct AntigravityParser;

impl ExportParser for AntigravityParser {
    fn platform(&self) -> Platform {
        Platform::Antigravity
    }

    fn parse(&self, path: &Path) -> Result<Vec<ConversationRecord>> {
        require_exists(Platform::Antigravity, path)?;
        if !path.is_dir() {
            return Err(io_error(Platform::Antigravity, path, "expected a brain directory"));
        }

        let mut dirs: Vec<_> = std::fs::read_dir(path)
            .map_err(|e| io_error(Platform::Antigravity, path, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir() && e.file_name().to_string_lossy().len() >= MIN_DIR_NAME_LEN)
            .map(|e| e.path())
            .collect();
        dirs.sort();
        debug!(count = dirs.len(), "antigravity conversation directories");

        let mut records = Vec::new();
        for dir in dirs {
            match parse_conversation_dir(&dir) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => debug!(dir = %dir.display(), "no messages in antigravity conversation"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "skipping antigravity conversation"),
            }
        }
        Ok(records)
    }
}

fn parse_conversation_dir(dir: &Path) -> std::io::Result<Option<ConversationRecord>> {
    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let title = ["task.md", "implementation_plan.md"]
        .iter()
        .find_map(|f| heading_title(&dir.join(f)))
        .unwrap_or_default();

    let mut turns: Vec<(Role, String)> = Vec::new();
    let logs = dir.join(".system_generated").join("logs");
    if logs.is_dir() {
        let overview = logs.join("overview.txt");
        if overview.is_file() {
            turns.extend(parse_overview(&std::fs::read_to_string(&overview)?));
        }

        let mut task_logs: Vec<_> = std::fs::read_dir(&logs)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with("task_") && n.ends_with(".txt")
                    })
                    .unwrap_or(false)
            })
            .collect();
        task_logs.sort();
        for log in task_logs {
            let content = std::fs::read_to_string(&log)?;
            if !content.trim().is_empty() {
                let name = log.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                turns.push((Role::Assistant, format!("[Task Log: {}]\n\n{}", name, content)));
            }
        }
    }

    for artifact in ARTIFACTS {
        let path = dir.join(artifact);
        if path.is_file() {
            let content = std::fs::read_to_string(&path)?;
            if !content.trim().is_empty() {
                turns.push((Role::Assistant, format!("[Artifact: {}]\n\n{}", artifact, content)));
            }
        }
    }

    let meta = std::fs::metadata(dir)?;
    let created_at = meta
        .created()
        .or_else(|_| meta.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let record = ConversationRecord::from_turns(Platform::Antigravity, id, title, created_at, turns);
    Ok((!record.messages.is_empty()).then_some(record))
}

/// The first line of `path` when it is a markdown heading.
fn heading_title(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let first = content.lines().next()?.trim();
    if !first.starts_with('#') {
        return None;
    }
    let title: String = first.trim_start_matches('#').trim().chars().take(TITLE_MAX_CHARS).collect();
    (!title.is_empty()).then_some(title)
}

/// Split an overview log into user requests and assistant replies.
fn parse_overview(content: &str) -> Vec<(Role, String)> {
    let mut turns = Vec::new();
    for section in content.split(USER_MARKER).skip(1) {
        match section.split_once(ASSISTANT_MARKER) {
            Some((user, assistant)) => {
                turns.push((Role::User, user.trim().to_string()));
                turns.push((Role::Assistant, assistant.trim().to_string()));
            }
            None => turns.push((Role::User, section.trim().to_string())),
        }
    }
    turns
}
