//! Guard configuration.
//!
//! Deserializable from a plain JS object; every field has a default so
//! `{}` or `undefined` yields a fully working configuration.

use serde::{Deserialize, Serialize};

use crate::settings::Mode;

/// Score assumed for vectors the dataset knows nothing about.
/// Unknown combinations are treated as highly identifying.
pub const DEFAULT_UNKNOWN_SCORE: f64 = 0.99;

/// Threshold used by the privileged context until the user picks one.
pub const DEFAULT_THRESHOLD: f64 = 0.83;

/// Upper bound on retained in-page log lines.
pub const DEFAULT_MAX_LOG_LINES: usize = 10_000;

/// Configuration for the page-side monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Score returned for vectors with no exact or sub-vector match.
    pub default_score: f64,
    /// Search sub-vectors (largest first) when there is no exact match.
    pub subvector_fallback: bool,
    /// Endpoint that receives one POSTed line per access, if any.
    pub log_endpoint: Option<String>,
    /// Schedule removal of `<script>` elements whose origin was denied.
    pub remove_denied_scripts: bool,
    /// Maximum number of access records kept for `get_log_text`.
    pub max_log_lines: usize,
    /// Which surface groups to trap.
    pub surface: SurfaceConfig,
    /// Privileged side: threshold before one has been persisted.
    pub default_threshold: f64,
    /// Privileged side: mode before one has been persisted.
    pub default_mode: Mode,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_score: DEFAULT_UNKNOWN_SCORE,
            subvector_fallback: true,
            log_endpoint: None,
            remove_denied_scripts: true,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            surface: SurfaceConfig::default(),
            default_threshold: DEFAULT_THRESHOLD,
            default_mode: Mode::Entropy,
        }
    }
}

/// Toggles for each monitored surface group.
/// All groups are enabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub navigator: bool,
    pub screen: bool,
    pub canvas: bool,
    pub webgl: bool,
    pub history: bool,
    pub geometry: bool,
    pub storage: bool,
    pub permissions: bool,
    pub fonts: bool,
    pub audio: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            navigator: true,
            screen: true,
            canvas: true,
            webgl: true,
            history: true,
            geometry: true,
            storage: true,
            permissions: true,
            fonts: true,
            audio: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: GuardConfig =
            serde_json::from_str(r#"{"default_score": 0.83, "surface": {"webgl": false}}"#)
                .unwrap();
        assert_eq!(cfg.default_score, 0.83);
        assert!(cfg.subvector_fallback);
        assert!(!cfg.surface.webgl);
        assert!(cfg.surface.navigator);
        assert_eq!(cfg.max_log_lines, DEFAULT_MAX_LOG_LINES);
        assert_eq!(cfg.default_mode, Mode::Entropy);
    }
}
