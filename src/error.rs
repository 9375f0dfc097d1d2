//! Cross-cutting error types for clank.
//!
//! Component-specific errors live next to the code that produces them
//! (`StoreError` in `store`, `GeneratorError` in `generator`, `AuthError` in
//! `auth`); this module holds the errors shared by the chat-facing layers,
//! with static labels for metric labeling.

use thiserror::Error;

/// Errors from the chat connection layer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("banned from channel: {0}")]
    Banned(String),

    #[error("chat client shut down")]
    Closed,
}

impl ChatError {
    /// Static label for metric labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Send(_) => "send",
            Self::Banned(_) => "banned",
            Self::Closed => "closed",
        }
    }
}

/// Errors from privileged in-chat command handling.
///
/// These map to a single error line back to the operator; none of them change
/// state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),

    #[error("{key} must be a number")]
    NotANumber { key: String },

    #[error("{key} must be between {min} and {max}")]
    OutOfRange { key: String, min: u32, max: u32 },

    #[error("model '{0}' is not available")]
    UnknownModel(String),

    #[error("confirmation expired or missing; send '!clank reset confirm'")]
    ResetNotConfirmed,

    #[error("setting could not be saved")]
    StoreFailed,
}

impl CommandError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownKey(_) => "unknown_key",
            Self::NotANumber { .. } => "not_a_number",
            Self::OutOfRange { .. } => "out_of_range",
            Self::UnknownModel(_) => "unknown_model",
            Self::ResetNotConfirmed => "reset_not_confirmed",
            Self::StoreFailed => "store_failed",
        }
    }
}
