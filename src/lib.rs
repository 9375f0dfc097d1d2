//! clank - a multi-channel IRC chat participant that joins the conversation
//! with generated utterances, under strict filtering and rate limiting.
//!
//! Library surface for the binary and the integration tests. The module map
//! mirrors the pipeline: `chat` yields structured events, `processor`
//! coordinates them per channel, `filter`/`generator`/`store` do the work,
//! `supervisor` owns the lifecycle.

pub mod auth;
pub mod channels;
pub mod chat;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod generator;
pub mod metrics;
pub mod processor;
pub mod store;
pub mod supervisor;
