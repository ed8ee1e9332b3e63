//! # Scorecard Core
//!
//! Shared, I/O-free logic for Scorecard: transcript models, token-bounded
//! chunking, cache identity, the chunk merge policy, the prompt-segment
//! cache advisor, and the durable store trait.
//!
//! This crate contains no tokio, sqlx, HTTP, or other native-only
//! dependencies.

pub mod advisor;
pub mod chunk;
pub mod identity;
pub mod merge;
pub mod models;
pub mod store;
pub mod tokenize;
