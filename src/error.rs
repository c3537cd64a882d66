//! Error types for the fingerprint guard
//!
//! This module provides the error taxonomy with:
//! - Detailed error variants for different failure modes
//! - Error classification (page-fatal vs recoverable)
//! - Error codes for programmatic handling
//!
//! None of these errors ever reach a page script: the access hot path
//! degrades (default score, page-URL attribution, skipped surface) instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasm_bindgen::JsValue;

pub type Result<T> = std::result::Result<T, GuardError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Dataset errors (1xx)
    DatasetUnavailable = 100,
    DatasetMalformed = 101,

    // Settings errors (2xx)
    InvalidThreshold = 200,
    InvalidMode = 201,
    SettingsStorage = 202,

    // Messaging errors (3xx)
    MessageFailed = 300,
    UnexpectedResponse = 301,
    Serialization = 302,

    // Interception errors (4xx)
    SurfaceUnavailable = 400,
    TrapInstallFailed = 401,

    // Setup errors (5xx)
    SetupAborted = 500,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Main error type for the fingerprint guard
#[derive(Error, Debug, Clone)]
pub enum GuardError {
    // ===== Dataset Errors =====
    #[error("Entropy dataset unavailable: {0}")]
    DatasetUnavailable(String),

    #[error("Entropy dataset malformed: {0}")]
    DatasetMalformed(String),

    // ===== Settings Errors =====
    #[error("Threshold out of range [0, 1]: {0}")]
    InvalidThreshold(f64),

    #[error("Unknown mode: {0}")]
    InvalidMode(String),

    #[error("Settings storage error: {0}")]
    SettingsStorage(String),

    // ===== Messaging Errors =====
    #[error("Message to privileged context failed: {0}")]
    MessageFailed(String),

    #[error("Unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Interception Errors =====
    #[error("Surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("Trap installation failed on {attribute}: {reason}")]
    TrapInstallFailed { attribute: String, reason: String },

    // ===== Setup Errors =====
    #[error("Setup aborted at {stage}: {reason}")]
    SetupAborted { stage: String, reason: String },

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            GuardError::DatasetUnavailable(_) => ErrorCode::DatasetUnavailable,
            GuardError::DatasetMalformed(_) => ErrorCode::DatasetMalformed,

            GuardError::InvalidThreshold(_) => ErrorCode::InvalidThreshold,
            GuardError::InvalidMode(_) => ErrorCode::InvalidMode,
            GuardError::SettingsStorage(_) => ErrorCode::SettingsStorage,

            GuardError::MessageFailed(_) => ErrorCode::MessageFailed,
            GuardError::UnexpectedResponse { .. } => ErrorCode::UnexpectedResponse,
            GuardError::Serialization(_) => ErrorCode::Serialization,

            GuardError::SurfaceUnavailable(_) => ErrorCode::SurfaceUnavailable,
            GuardError::TrapInstallFailed { .. } => ErrorCode::TrapInstallFailed,

            GuardError::SetupAborted { .. } => ErrorCode::SetupAborted,

            GuardError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error prevents the monitor from being installed on a page.
    ///
    /// Installing with partial state would compare entropy against an
    /// unknown threshold, so setup failures abort instead.
    pub fn is_fatal_for_page(&self) -> bool {
        matches!(
            self,
            GuardError::SetupAborted { .. }
                | GuardError::MessageFailed(_)
                | GuardError::UnexpectedResponse { .. }
        )
    }

    /// Whether the guard keeps running with degraded behaviour after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GuardError::DatasetUnavailable(_)
                | GuardError::DatasetMalformed(_)
                | GuardError::SurfaceUnavailable(_)
                | GuardError::TrapInstallFailed { .. }
                | GuardError::SettingsStorage(_)
        )
    }

    /// Wrap any error raised during ordered setup with the stage it came from.
    pub fn setup(stage: &str, cause: GuardError) -> Self {
        GuardError::SetupAborted {
            stage: stage.to_string(),
            reason: cause.to_string(),
        }
    }

    /// Convert a raw JS exception into a messaging error.
    pub fn from_js(context: &str, value: &JsValue) -> Self {
        let detail = value
            .as_string()
            .unwrap_or_else(|| format!("{:?}", value));
        GuardError::MessageFailed(format!("{}: {}", context, detail))
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Serialization(err.to_string())
    }
}

impl From<serde_wasm_bindgen::Error> for GuardError {
    fn from(err: serde_wasm_bindgen::Error) -> Self {
        GuardError::Serialization(err.to_string())
    }
}

impl From<GuardError> for JsValue {
    fn from(err: GuardError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}

/// Error information for JavaScript consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    pub is_fatal: bool,
    pub is_recoverable: bool,
}

impl From<&GuardError> for ErrorInfo {
    fn from(err: &GuardError) -> Self {
        ErrorInfo {
            code: err.code() as u32,
            message: err.to_string(),
            is_fatal: err.is_fatal_for_page(),
            is_recoverable: err.is_recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(GuardError::setup("mode", GuardError::MessageFailed("x".into())).is_fatal_for_page());
        assert!(GuardError::MessageFailed("test".into()).is_fatal_for_page());

        assert!(!GuardError::DatasetUnavailable("test".into()).is_fatal_for_page());
        assert!(!GuardError::InvalidThreshold(1.5).is_fatal_for_page());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(GuardError::DatasetUnavailable("test".into()).is_recoverable());
        assert!(GuardError::SurfaceUnavailable("WebGL2RenderingContext".into()).is_recoverable());

        assert!(!GuardError::SetupAborted {
            stage: "threshold".into(),
            reason: "rejected".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            GuardError::InvalidThreshold(2.0).code(),
            ErrorCode::InvalidThreshold
        );
        assert_eq!(
            GuardError::TrapInstallFailed {
                attribute: "screen.width".into(),
                reason: "frozen".into()
            }
            .code(),
            ErrorCode::TrapInstallFailed
        );
        assert_eq!(ErrorCode::SetupAborted as u32, 500);
    }

    #[test]
    fn test_setup_wraps_cause() {
        let err = GuardError::setup("dataset", GuardError::DatasetUnavailable("404".into()));
        let info = ErrorInfo::from(&err);
        assert_eq!(info.code, 500);
        assert!(info.message.contains("dataset"));
        assert!(info.message.contains("404"));
        assert!(info.is_fatal);
    }
}
