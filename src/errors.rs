// src/errors.rs

//! Typed error kinds for the core, plus the clone-able captured form that
//! flows through promise cells.
//!
//! Application-boundary code (`lib.rs`, `main.rs`, config loading) uses
//! `anyhow` with context instead; this module is for errors the scheduler
//! itself needs to distinguish.

use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("tag conflict: \"{tag}\" is already provided by {existing}")]
    TagConflict { tag: String, existing: String },

    #[error("plugin protocol error: {0}")]
    PluginProtocol(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    /// An error that already flowed through a promise once. Re-raising out
    /// of a `MaybeException` produces this variant.
    #[error(transparent)]
    Captured(#[from] CapturedError),
}

impl BuildError {
    /// True if this error (possibly through a captured layer) is a
    /// cancellation, which is never user-visible.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BuildError::Cancelled => true,
            BuildError::Captured(c) => c.get().is_cancelled(),
            _ => false,
        }
    }
}

/// A snapshot of an error that already happened, cheap to clone so a single
/// failure can be delivered to every subscriber of a promise join.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct CapturedError(Arc<BuildError>);

impl CapturedError {
    pub fn new(error: BuildError) -> CapturedError {
        match error {
            // Don't stack capture wrappers when an error crosses several
            // promises.
            BuildError::Captured(captured) => captured,
            other => CapturedError(Arc::new(other)),
        }
    }

    pub fn get(&self) -> &BuildError {
        &self.0
    }
}

impl From<BuildError> for CapturedError {
    fn from(error: BuildError) -> CapturedError {
        CapturedError::new(error)
    }
}
