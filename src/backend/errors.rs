//! Backend lifecycle error types.

use thiserror::Error;

use super::runtime::RuntimeError;
use crate::errors::ErrorList;

/// Errors starting or stopping a tool backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The local program could not be spawned.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The backend's launch parameters could not be resolved.
    #[error("backend '{name}' is misconfigured: {reason}")]
    ConfigError { name: String, reason: String },

    /// A container runtime call failed.
    #[error("container '{name}': {step} failed: {source}")]
    Runtime {
        name: String,
        step: &'static str,
        #[source]
        source: RuntimeError,
    },

    /// A lifecycle step did not finish within its deadline.
    #[error("backend '{name}': {step} timed out after {timeout_secs}s")]
    Timeout {
        name: String,
        step: &'static str,
        timeout_secs: u64,
    },

    /// Closing the backend's streams failed.
    #[error("backend '{name}': {reason}")]
    StreamError { name: String, reason: String },

    /// One or more shutdown steps failed. Every step was still attempted.
    #[error("shutdown of '{name}' failed: {errors}")]
    Shutdown {
        name: String,
        errors: ErrorList<BackendError>,
    },
}

impl BackendError {
    pub(crate) fn runtime(name: &str, step: &'static str, source: RuntimeError) -> Self {
        BackendError::Runtime {
            name: name.to_string(),
            step,
            source,
        }
    }
}
