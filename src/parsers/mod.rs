//! Per-platform export parsers.
//!
//! Every platform implements [`ExportParser`] and produces the same
//! [`ConversationRecord`] shape. A parser fails as a whole only when the
//! export itself is unusable (missing path, unreadable archive, invalid
//! top-level JSON); a single malformed conversation is logged and skipped.
//!
//! | Platform | Accepted input |
//! |----------|----------------|
//! | `chatgpt` | `conversations.json`, its parent directory, or the export `.zip` |
//! | `gemini` | a conversation `.json` or saved `.html` page, or a directory tree of them |
//! | `grok` | the export `.zip`, a directory of `.json` files, or one `.json` |
//! | `antigravity` | the brain directory holding one sub-directory per conversation |

pub mod antigravity;
pub mod chatgpt;
pub mod gemini;
pub mod grok;

use chrono::{DateTime, NaiveDateTime};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::{ConversationRecord, Platform};

/// Decompressed size limit for a single archive entry.
const MAX_ZIP_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

pub trait ExportParser: Send + Sync {
    /// The platform whose exports this parser reads.
    fn platform(&self) -> Platform;

    /// Parse every conversation found at `path`.
    fn parse(&self, path: &Path) -> Result<Vec<ConversationRecord>>;
}

pub fn parser_for(platform: Platform) -> Box<dyn ExportParser> {
    match platform {
        Platform::ChatGpt => Box::new(chatgpt::ChatGptParser),
        Platform::Gemini => Box::new(gemini::GeminiParser),
        Platform::Grok => Box::new(grok::GrokParser),
        Platform::Antigravity => Box::new(antigravity::AntigravityParser),
    }
}

// ============ Shared helpers ============

pub(crate) fn io_error(platform: Platform, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::parse(platform, format!("{}: {}", path.display(), e))
}

pub(crate) fn require_exists(platform: Platform, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(io_error(platform, path, "no such file or directory"))
    }
}

pub(crate) fn read_json(platform: Platform, path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path).map_err(|e| io_error(platform, path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| io_error(platform, path, e))
}

pub(crate) fn is_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Modification time in Unix seconds, or 0 when unavailable.
pub(crate) fn mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether a file name contains any of `words`, case-insensitively.
pub(crate) fn name_contains_any(name: &str, words: &[&str]) -> bool {
    let lower = name.to_lowercase();
    words.iter().any(|w| lower.contains(w))
}

fn build_globset(patterns: &[&str]) -> std::result::Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Files under `root` matching `patterns`, sorted by path.
pub(crate) fn find_files(platform: Platform, root: &Path, patterns: &[&str]) -> Result<Vec<PathBuf>> {
    let include = build_globset(patterns).map_err(|e| Error::parse(platform, e.to_string()))?;
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| io_error(platform, root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if include.is_match(relative) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Read the archive entries whose names satisfy `wanted`, in archive order.
pub(crate) fn read_zip_entries(
    platform: Platform,
    path: &Path,
    wanted: impl Fn(&str) -> bool,
) -> Result<Vec<(String, Vec<u8>)>> {
    let file = std::fs::File::open(path).map_err(|e| io_error(platform, path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| io_error(platform, path, e))?;
    let mut out = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| io_error(platform, path, e))?;
        if entry.is_dir() || !wanted(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry
            .take(MAX_ZIP_ENTRY_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| io_error(platform, path, e))?;
        if bytes.len() as u64 >= MAX_ZIP_ENTRY_BYTES {
            return Err(io_error(
                platform,
                path,
                format!("archive entry {} exceeds size limit", name),
            ));
        }
        out.push((name, bytes));
    }
    Ok(out)
}

/// First key of `keys` holding a non-empty string.
pub(crate) fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

/// First key of `keys` holding a non-empty array.
pub(crate) fn array_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_array))
        .find(|a| !a.is_empty())
}

/// Epoch seconds from a JSON number or an ISO-8601 / RFC 3339 string.
pub(crate) fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| {
            // Millisecond epochs show up in some exports.
            if f > 1e11 {
                (f / 1000.0) as i64
            } else {
                f as i64
            }
        }),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp());
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.and_utc().timestamp())
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// First key of `keys` holding a parseable timestamp.
pub(crate) fn timestamp_field(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find_map(parse_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_from_numbers_and_strings() {
        assert_eq!(parse_timestamp(&json!(1700000000)), Some(1_700_000_000));
        assert_eq!(parse_timestamp(&json!(1700000000.75)), Some(1_700_000_000));
        assert_eq!(parse_timestamp(&json!(1700000000123u64)), Some(1_700_000_000));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20.500")),
            Some(1_700_000_000)
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn field_lookup_skips_empty_values() {
        let v = json!({"title": "", "name": "Fallback", "messages": [], "history": [1]});
        assert_eq!(str_field(&v, &["title", "name"]), Some("Fallback"));
        assert_eq!(array_field(&v, &["messages", "history"]).map(|a| a.len()), Some(1));
    }

    #[test]
    fn parsers_match_platform_and_reject_missing_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        for platform in Platform::ALL {
            let parser = parser_for(platform);
            assert_eq!(parser.platform(), platform);
            let err = parser.parse(&tmp.path().join("missing")).unwrap_err();
            assert!(matches!(err, Error::Parse { .. }), "{platform}: {err}");
        }
    }

    #[test]
    fn find_files_is_sorted_and_filtered() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("b.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("sub/a.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "").unwrap();
        let files = find_files(Platform::Gemini, tmp.path(), &["**/*.json", "*.json"]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
    }
}
