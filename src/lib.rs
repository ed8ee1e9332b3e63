//! # Scorecard
//!
//! Cached LLM analysis of sales-call transcripts.
//!
//! A transcript is rendered, split into overlapping token-bounded chunks,
//! scored chunk by chunk against a versioned rubric, and merged into one
//! result. Results are keyed by `(dimension, content hash, rubric version)`
//! and kept in a two-tier cache so the same call is never paid for twice.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Transcript │──▶│ Chunk + key  │──▶│ Two-tier  │── hit ──▶ result
//! │  (SQLite)  │   │ (core crate) │   │   cache   │
//! └────────────┘   └──────────────┘   └─────┬─────┘
//!                                           │ miss
//!                                           ▼
//!                  ┌──────────────┐   ┌───────────┐
//!                  │ Merge + put  │◀──│ LLM calls │  (per chunk, bounded)
//!                  └──────────────┘   └───────────┘
//! ```
//!
//! The pure pieces (tokenizer, chunker, cache identity, merge, prompt-cache
//! advisor, durable-store trait) live in `scorecard-core`; this crate adds
//! SQLite, the in-process distributed tier, LLM providers, and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`transcripts`] | Call ingest and transcript loading |
//! | [`rubric`] | Rubric and knowledge-base lookup |
//! | [`hf_tokenizer`] | Tokenizer selection |
//! | [`llm`] | Completion providers and retry policy |
//! | [`prompt`] | Prompt segments and findings parsing |
//! | [`distributed`] | Fast shared tier and wire envelope |
//! | [`sqlite_store`] | Durable tier |
//! | [`cache`] | Two-tier read/write path |
//! | [`orchestrator`] | Analysis requests end to end |
//! | [`stats`] | Hit-rate reporting |
//! | [`error`] | Error types |

pub mod cache;
pub mod config;
pub mod db;
pub mod distributed;
pub mod error;
pub mod hf_tokenizer;
pub mod llm;
pub mod migrate;
pub mod orchestrator;
pub mod prompt;
pub mod rubric;
pub mod sqlite_store;
pub mod stats;
pub mod transcripts;
