//! fq-providers: Completion service clients for fanout-query
//!
//! This crate provides implementations of the Provider trait for
//! OpenAI-compatible chat completion APIs.

pub mod openai;

pub use openai::{OpenAIProvider, DEFAULT_BASE_URL};
