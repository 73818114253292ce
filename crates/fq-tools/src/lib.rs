//! fq-tools: Knowledge lookup implementations for fanout-query
//!
//! The conversation layer only sees the `KnowledgeLookup` trait from
//! `fq-core`; this crate supplies the concrete Wikipedia-backed adapter.

pub mod wikipedia;

pub use wikipedia::{WikipediaLookup, DEFAULT_ENDPOINT, DEFAULT_USER_AGENT};
