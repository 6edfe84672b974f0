//! Query boundary for front ends.
//!
//! [`answer`] runs a retrieval and flattens the results into what a
//! generation step needs: text, platform, conversation title and score,
//! plus the `degraded` flag. [`format_context`] renders those items into a
//! prompt-ready block under a token budget.

use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::error::Result;
use crate::migrate;
use crate::models::{Collection, Platform};
use crate::search::{HybridRetriever, Retrieval, RetrievedChunk};
use crate::stats::format_ts_iso;
use crate::store::sqlite::SqliteIndex;

const EXCERPT_CHARS: usize = 240;

/// Rough token estimate used for context budgeting.
const CHARS_PER_TOKEN: usize = 4;

pub const NO_CONTEXT: &str = "No relevant context found.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub text: String,
    pub platform: Platform,
    pub title: String,
    pub score: f64,
    pub conversation_id: String,
    pub collection: Collection,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnswerContext {
    pub retrieved_context: Vec<ContextItem>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

/// What a front end should tell the user. Hard failures are the `Err`
/// side of [`answer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Found,
    /// Results (possibly none) produced without the semantic channel.
    Degraded,
    NoContext,
}

impl AnswerContext {
    pub fn status(&self) -> AnswerStatus {
        if self.degraded {
            AnswerStatus::Degraded
        } else if self.retrieved_context.is_empty() {
            AnswerStatus::NoContext
        } else {
            AnswerStatus::Found
        }
    }
}

/// Retrieve context for `query`. `top_k` falls back to the retriever's
/// configured default.
pub async fn answer(
    retriever: &HybridRetriever,
    query: &str,
    platform_filter: Option<Platform>,
    top_k: Option<usize>,
) -> Result<AnswerContext> {
    let top_k = top_k.unwrap_or(retriever.params().top_k);
    let retrieval = retriever.retrieve(query, top_k, platform_filter).await?;
    Ok(into_context(retrieval))
}

fn into_context(retrieval: Retrieval) -> AnswerContext {
    AnswerContext {
        retrieved_context: retrieval
            .results
            .into_iter()
            .map(|r| ContextItem {
                text: r.entry.text,
                platform: r.entry.metadata.platform,
                title: r.entry.metadata.title,
                score: r.score,
                conversation_id: r.entry.metadata.conversation_id,
                collection: r.entry.metadata.collection,
                timestamp: r.entry.metadata.timestamp,
                language: r.entry.metadata.language,
            })
            .collect(),
        degraded: retrieval.degraded,
        degraded_reason: retrieval.degraded_reason,
    }
}

/// Render items as cited blocks, stopping before the estimated token count
/// would exceed `max_tokens`. A first block that alone exceeds the budget is
/// cut to fit rather than dropped.
///
/// ```rust
/// use conductor_index::answer::{format_context, NO_CONTEXT};
///
/// assert_eq!(format_context(&[], 4000), NO_CONTEXT);
/// ```
pub fn format_context(items: &[ContextItem], max_tokens: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0usize;

    for item in items {
        let block = format!(
            "[Source: {} - {}]\n{}\n",
            item.platform.as_str().to_uppercase(),
            item.title,
            item.text
        );
        let tokens = block.len() / CHARS_PER_TOKEN;
        if used + tokens > max_tokens {
            if parts.is_empty() {
                if let Some(cut) = truncate_block(&block, max_tokens * CHARS_PER_TOKEN) {
                    parts.push(cut);
                }
            }
            break;
        }
        used += tokens;
        parts.push(block);
    }

    if parts.is_empty() {
        return NO_CONTEXT.to_string();
    }
    parts.join("\n---\n\n")
}

/// Cut `block` to at most `max_chars` bytes on a char boundary, keeping the
/// citation line whole. `None` when not even the citation fits.
fn truncate_block(block: &str, max_chars: usize) -> Option<String> {
    let header_end = block.find('\n').map_or(block.len(), |i| i + 1);
    // Room for the citation, some text and the closing newline.
    if max_chars <= header_end + 1 {
        return None;
    }
    let mut end = max_chars - 1;
    while !block.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}\n", &block[..end]))
}

// ============ CLI entry point ============

#[derive(Serialize)]
struct AskOutput<'a> {
    status: AnswerStatus,
    #[serde(flatten)]
    answer: &'a AnswerContext,
    context: String,
}

/// `conductor ask`: retrieve and print context for a query.
///
/// Prints one of three states: results, "no relevant history found", or a
/// degraded notice (on stderr) followed by whatever lexical retrieval found.
/// Hard failures are returned as errors.
///
/// With `language`, only the `code` collection is searched.
#[allow(clippy::too_many_arguments)]
pub async fn run_ask(
    config: &Config,
    query: &str,
    platform: Option<Platform>,
    top_k: Option<usize>,
    collections: &[Collection],
    language: Option<&str>,
    json: bool,
    explain: bool,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let index = Arc::new(SqliteIndex::new(pool.clone()));
    let provider = create_provider(&config.embedding)?;
    let retriever = HybridRetriever::new(index, provider, config.retrieval.clone());

    let collections = if collections.is_empty() {
        config.retrieval.collections.clone()
    } else {
        collections.to_vec()
    };
    let top_k = top_k.unwrap_or(config.retrieval.top_k);
    let retrieval = match language {
        Some(lang) => retriever.search_code(query, top_k, Some(lang), platform).await?,
        None => {
            retriever
                .retrieve_in(query, top_k, platform, &collections)
                .await?
        }
    };
    pool.close().await;

    let breakdowns: Vec<RetrievedChunk> = if explain {
        retrieval.results.clone()
    } else {
        Vec::new()
    };
    let answer = into_context(retrieval);

    if json {
        let out = AskOutput {
            status: answer.status(),
            answer: &answer,
            context: format_context(&answer.retrieved_context, config.retrieval.context_max_tokens),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if answer.degraded {
        eprintln!(
            "warning: retrieval degraded to keyword matching only ({})",
            answer.degraded_reason.as_deref().unwrap_or("embedding unavailable")
        );
    }
    if answer.retrieved_context.is_empty() {
        println!("No relevant history found.");
        return Ok(());
    }

    for (i, item) in answer.retrieved_context.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            item.score,
            item.platform,
            item.title
        );
        println!("    conversation: {}", item.conversation_id);
        println!("    date: {}", format_ts_iso(item.timestamp));
        match item.language {
            Some(ref lang) => println!("    collection: {} ({})", item.collection, lang),
            None => println!("    collection: {}", item.collection),
        }
        if let Some(r) = breakdowns.get(i) {
            let semantic = r
                .breakdown
                .semantic
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    scores: semantic {} lexical {:.3} recency {:.3}",
                semantic, r.breakdown.lexical, r.breakdown.recency
            );
        }
        let excerpt: String = item.text.chars().take(EXCERPT_CHARS).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(platform: Platform, title: &str, text: &str) -> ContextItem {
        ContextItem {
            text: text.to_string(),
            platform,
            title: title.to_string(),
            score: 1.0,
            conversation_id: "c".to_string(),
            collection: Collection::Conversations,
            timestamp: 0,
            language: None,
        }
    }

    #[test]
    fn formats_cited_blocks() {
        let out = format_context(
            &[
                item(Platform::ChatGpt, "Auth flow", "USER: jwt refresh?"),
                item(Platform::Grok, "Cache", "ASSISTANT: use redis"),
            ],
            4000,
        );
        assert_eq!(
            out,
            "[Source: CHATGPT - Auth flow]\nUSER: jwt refresh?\n\n---\n\n[Source: GROK - Cache]\nASSISTANT: use redis\n"
        );
    }

    #[test]
    fn stops_at_token_budget() {
        let long = "x".repeat(400);
        let items = vec![
            item(Platform::Gemini, "a", &long),
            item(Platform::Gemini, "b", &long),
        ];
        // Each block is ~105 tokens.
        let out = format_context(&items, 150);
        assert!(out.contains("GEMINI - a"));
        assert!(!out.contains("GEMINI - b"));
    }

    #[test]
    fn oversized_first_block_is_cut_to_fit() {
        let items = vec![item(Platform::Gemini, "a", &"é".repeat(400))];
        let out = format_context(&items, 10);
        assert!(out.starts_with("[Source: GEMINI - a]\né"));
        assert!(out.ends_with('\n'));
        assert!(out.len() <= 10 * CHARS_PER_TOKEN);

        // Not even the citation fits.
        assert_eq!(format_context(&items, 2), NO_CONTEXT);
    }

    #[test]
    fn status_distinguishes_states() {
        let mut ctx = AnswerContext::default();
        assert_eq!(ctx.status(), AnswerStatus::NoContext);
        ctx.retrieved_context.push(item(Platform::ChatGpt, "t", "x"));
        assert_eq!(ctx.status(), AnswerStatus::Found);
        ctx.degraded = true;
        assert_eq!(ctx.status(), AnswerStatus::Degraded);
    }
}
