//! Gemini conversation exports: saved HTML pages or one JSON document per
//! conversation.
//!
//! HTML saves have no stable structure. Messages are taken from `div` or
//! `article` elements whose class mentions "message" or "response" (falling
//! back to paragraphs), and roles come from the class when it says so and
//! otherwise alternate, starting with the user.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

use super::{
    array_field, file_stem, find_files, io_error, is_extension, mtime, name_contains_any,
    read_json, require_exists, str_field, timestamp_field, ExportParser,
};
use crate::error::{Error, Result};
use crate::models::{ConversationRecord, Platform, Role};

const SKIP_NAMES: &[&str] = &["manifest", "metadata"];

/// Shorter HTML fragments are layout noise, not messages.
const MIN_HTML_MESSAGE_CHARS: usize = 5;
const MAX_TITLE_CHARS: usize = 100;

pub struct GeminiParser;

impl ExportParser for GeminiParser {
    fn platform(&self) -> Platform {
        Platform::Gemini
    }

    fn parse(&self, path: &Path) -> Result<Vec<ConversationRecord>> {
        require_exists(Platform::Gemini, path)?;

        if path.is_file() {
            if is_extension(path, "html") || is_extension(path, "htm") {
                return Ok(parse_html_file(path)?.into_iter().collect());
            }
            let data = read_json(Platform::Gemini, path)?;
            return Ok(parse_conversation(&data, path).into_iter().collect());
        }

        let mut records = Vec::new();
        for file in find_files(Platform::Gemini, path, &["**/*.html", "**/*.htm"])? {
            match parse_html_file(&file) {
                Ok(record) => records.extend(record),
                Err(e) => warn!(error = %e, "skipping unreadable gemini HTML save"),
            }
        }

        for file in find_files(Platform::Gemini, path, &["**/*.json"])? {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name_contains_any(&name, SKIP_NAMES) {
                continue;
            }
            match read_json(Platform::Gemini, &file) {
                Ok(data) => records.extend(parse_conversation(&data, &file)),
                Err(e) => warn!(error = %e, "skipping unreadable gemini conversation"),
            }
        }
        Ok(records)
    }
}

fn parse_conversation(data: &Value, file: &Path) -> Option<ConversationRecord> {
    if !data.is_object() {
        warn!(path = %file.display(), "gemini conversation is not a JSON object");
        return None;
    }
    let id = str_field(data, &["id"])
        .map(str::to_string)
        .unwrap_or_else(|| file_stem(file));
    let title = str_field(data, &["title", "name"]).unwrap_or_default();
    let created_at = timestamp_field(data, &["created_at"]).unwrap_or_else(|| mtime(file));

    let turns = array_field(data, &["messages", "history"])
        .map(|msgs| {
            msgs.iter()
                .map(|m| {
                    let role = match str_field(m, &["role", "author"]) {
                        Some(r) if r.eq_ignore_ascii_case("user") => Role::User,
                        None => Role::User,
                        Some(_) => Role::Assistant,
                    };
                    let text = str_field(m, &["content", "text"]).unwrap_or_default();
                    (role, text.to_string())
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let record = ConversationRecord::from_turns(Platform::Gemini, id, title, created_at, turns);
    if record.messages.is_empty() {
        debug!(path = %file.display(), "skipping gemini conversation without messages");
        return None;
    }
    Some(record)
}

fn parse_html_file(file: &Path) -> Result<Option<ConversationRecord>> {
    let html = std::fs::read_to_string(file).map_err(|e| io_error(Platform::Gemini, file, e))?;
    let record = parse_html(&html, file_stem(file), mtime(file))?;
    if record.is_none() {
        warn!(path = %file.display(), "no messages found in gemini HTML save");
    }
    Ok(record)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::parse(Platform::Gemini, format!("selector {}: {}", css, e)))
}

/// Text of an element: trimmed text nodes, one per line.
fn element_text(element: &ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn class_of(element: &ElementRef) -> String {
    element.value().attr("class").unwrap_or_default().to_lowercase()
}

/// Parse one saved Gemini page. `None` when it holds no messages.
pub(crate) fn parse_html(
    html: &str,
    conversation_id: String,
    created_at: i64,
) -> Result<Option<ConversationRecord>> {
    let document = Html::parse_document(html);

    let title = ["h1", "title"]
        .iter()
        .map(|css| selector(css))
        .collect::<Result<Vec<_>>>()?
        .iter()
        .find_map(|sel| {
            document
                .select(sel)
                .map(|el| el.text().collect::<String>().trim().to_string())
                .find(|t| !t.is_empty())
        })
        .map(|t| t.chars().take(MAX_TITLE_CHARS).collect::<String>())
        .unwrap_or_default();

    let candidates: Vec<ElementRef> = document
        .select(&selector("div[class], article[class]")?)
        .filter(|el| {
            let class = class_of(el);
            class.contains("message") || class.contains("response")
        })
        .collect();
    // A container nested in another container is part of the outer message.
    let ids: HashSet<_> = candidates.iter().map(|el| el.id()).collect();
    let mut containers: Vec<ElementRef> = candidates
        .iter()
        .filter(|el| !el.ancestors().any(|a| ids.contains(&a.id())))
        .copied()
        .collect();
    if containers.is_empty() {
        containers = document.select(&selector("p")?).collect();
    }

    let mut next_role = Role::User;
    let mut turns = Vec::new();
    for container in &containers {
        let text = element_text(container);
        if text.chars().count() < MIN_HTML_MESSAGE_CHARS {
            continue;
        }
        let class = class_of(container);
        let role = if class.contains("user") {
            Role::User
        } else if ["assistant", "model", "gemini"].iter().any(|w| class.contains(w)) {
            Role::Assistant
        } else {
            next_role
        };
        next_role = match role {
            Role::User => Role::Assistant,
            _ => Role::User,
        };
        turns.push((role, text));
    }

    let record = ConversationRecord::from_turns(Platform::Gemini, conversation_id, title, created_at, turns);
    Ok((!record.messages.is_empty()).then_some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn parses_directory_and_skips_manifests() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("Gemini");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(
            dir.join("a.json"),
            json!({
                "id": "g-1",
                "title": "Regex help",
                "created_at": "2024-03-01T10:00:00Z",
                "messages": [
                    {"role": "user", "content": "match an email"},
                    {"role": "model", "content": "try `\\S+@\\S+`"}
                ]
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.join("nested/b.json"),
            json!({
                "name": "History style",
                "history": [{"author": "USER", "text": "hi"}]
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(dir.join("manifest.json"), json!({"messages": [{"content": "x"}]}).to_string()).unwrap();
        std::fs::write(dir.join("broken.json"), "nope").unwrap();
        std::fs::write(dir.join("empty.html"), "<html></html>").unwrap();

        let records = GeminiParser.parse(&dir).unwrap();
        assert_eq!(records.len(), 2);

        let a = &records[0];
        assert_eq!(a.conversation_id, "g-1");
        assert_eq!(a.created_at, 1_709_287_200);
        assert_eq!(a.messages[1].role, Role::Assistant);

        let b = &records[1];
        assert_eq!(b.conversation_id, "b");
        assert_eq!(b.title, "History style");
        assert_eq!(b.messages[0].role, Role::User);
    }

    #[test]
    fn single_invalid_file_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conv.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(GeminiParser.parse(&path).is_err());
    }

    const SAVED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Gemini</title></head>
<body>
  <h1>Borrow checker questions</h1>
  <div class="conversation">
    <div class="user-message">
      <div class="message-content">Why does the borrow checker reject this loop?</div>
    </div>
    <div class="model-response">
      <p>You hold a mutable borrow across iterations.</p>
      <pre><code>for x in v.iter_mut() { }</code></pre>
    </div>
    <div class="message">ok</div>
    <article class="Message">Thanks, that fixed it.</article>
  </div>
</body>
</html>"#;

    #[test]
    fn html_save_yields_alternating_turns() {
        let record = parse_html(SAVED_PAGE, "saved".into(), 42).unwrap().unwrap();
        assert_eq!(record.conversation_id, "saved");
        assert_eq!(record.title, "Borrow checker questions");
        assert_eq!(record.created_at, 42);

        let roles: Vec<Role> = record.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(
            record.messages[0].text,
            "Why does the borrow checker reject this loop?"
        );
        assert!(record.messages[1]
            .text
            .contains("You hold a mutable borrow across iterations.\nfor x in v.iter_mut() { }"));
        assert_eq!(record.messages[2].text, "Thanks, that fixed it.");
    }

    #[test]
    fn html_without_containers_falls_back_to_paragraphs() {
        let html = "<html><head><title>Trip plan</title></head><body>\
                    <p>Plan a weekend in Lisbon</p><p>Day one: Alfama and Belem.</p><p>hi</p>\
                    </body></html>";
        let record = parse_html(html, "trip".into(), 0).unwrap().unwrap();
        assert_eq!(record.title, "Trip plan");
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[0].role, Role::User);
        assert_eq!(record.messages[1].role, Role::Assistant);
    }

    #[test]
    fn html_files_in_a_directory_are_parsed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("chat.html"), SAVED_PAGE).unwrap();
        std::fs::write(tmp.path().join("blank.html"), "<html><body></body></html>").unwrap();

        let records = GeminiParser.parse(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].conversation_id, "chat");
        assert_eq!(records[0].platform, Platform::Gemini);

        let single = GeminiParser.parse(&tmp.path().join("chat.html")).unwrap();
        assert_eq!(single.len(), 1);
    }
}
