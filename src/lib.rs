//! # Conductor Index
//!
//! A local-first semantic index over exported AI chat conversations.
//!
//! Exports from ChatGPT, Gemini, Grok and Antigravity are parsed into
//! normalized conversation records, chunked, embedded (with a content-hash
//! cache in front of the provider) and stored in a SQLite-backed vector
//! index. Queries combine vector similarity, BM25 keyword scoring and a
//! small recency boost, and fall back to keyword-only retrieval when the
//! embedding provider is unavailable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Parsers   │──▶│   Pipeline   │──▶│    SQLite    │
//! │ 4 platforms │   │ Chunk+Embed  │   │ Vectors+FTS5 │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                                             ▼
//!                                     ┌──────────────┐
//!                                     │  Retriever   │
//!                                     │ ask / answer │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Conversation, chunk and index entry types |
//! | [`parsers`] | Per-platform export parsers |
//! | [`fence`] | Fenced code block extraction |
//! | [`chunk`] | Turn-aware chunking |
//! | [`embedding`] | Embedding providers and the embedding cache |
//! | [`store`] | Vector index trait, SQLite and in-memory backends |
//! | [`lexical`] | Tokenizer and BM25 scoring |
//! | [`search`] | Hybrid retrieval |
//! | [`answer`] | Query boundary for front ends |
//! | [`ingest`] | Ingestion pipeline |
//! | [`stats`] | Index statistics |
//! | [`progress`] | Ingestion progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error kinds |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fence;
pub mod ingest;
pub mod lexical;
pub mod migrate;
pub mod models;
pub mod parsers;
pub mod progress;
pub mod search;
pub mod stats;
pub mod store;
