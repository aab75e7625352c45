//! Language-model integration for the call-bridge voice agent
//!
//! Provides the `ChatAdapter`, which turns a pluggable `LanguageModel`
//! vendor into a conversational endpoint with:
//! - Sliding-window context built from conversation turns
//! - A process-wide per-minute rate floor
//! - Retries with exponential backoff
//! - Cancellable streaming plus a non-streaming fallback

pub mod adapter;

pub use adapter::{ChatAdapter, ChatAdapterConfig};
