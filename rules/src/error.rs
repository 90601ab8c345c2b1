//! Error taxonomy for rule loading and execution.
//!
//! Startup errors (configuration, missing directory, unreadable or
//! uncompilable sources) are fatal. Rule runtime errors only surface here
//! under the strict error policy; the default policy records them as
//! diagnostics instead.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RulesError>;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid rules configuration: {message}")]
    Configuration { message: String },

    #[error("no rules directory at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("cannot read rule source {identifier}: {source}")]
    UnreadableSource {
        identifier: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rule {identifier} failed to compile: {message}")]
    Compile { identifier: String, message: String },

    #[error("rule {rule} failed: {message}")]
    RuleRuntime { rule: String, message: String },

    #[error("sandbox construction failed: {message}")]
    SandboxConstruction { message: String },

    #[error("rule output does not fit the user/context shape: {message}")]
    Marshal { message: String },
}

impl RulesError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn sandbox(err: impl std::fmt::Display) -> Self {
        Self::SandboxConstruction {
            message: err.to_string(),
        }
    }
}
