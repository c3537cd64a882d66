//! Mode, threshold and settings persistence.
//!
//! The threshold is shared through a [`ThresholdHandle`]: the policy reads
//! it on every decision, so a user adjusting sensitivity mid-session takes
//! effect without reinstalling traps.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Storage key for the persisted threshold.
pub const THRESHOLD_KEY: &str = "entropyThreshold";
/// Storage key for the persisted mode.
pub const MODE_KEY: &str = "currentMode";
/// Storage key for the persisted session identity.
pub const IDENTITY_KEY: &str = "randomProfile";

/// What to do once an origin's vector is over the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Deny over-threshold access.
    #[default]
    Entropy,
    /// Substitute spoofed values for over-threshold access.
    Random,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Entropy => "entropy",
            Mode::Random => "random",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entropy" => Ok(Mode::Entropy),
            "random" => Ok(Mode::Random),
            other => Err(GuardError::InvalidMode(other.to_string())),
        }
    }
}

/// Validate that a threshold lies in `[0, 1]`.
pub fn validate_threshold(value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(GuardError::InvalidThreshold(value))
    }
}

/// Live, shared threshold. Clones observe the same value.
#[derive(Debug, Clone)]
pub struct ThresholdHandle {
    value: Rc<Cell<f64>>,
}

impl ThresholdHandle {
    pub fn new(value: f64) -> Result<Self> {
        Ok(Self {
            value: Rc::new(Cell::new(validate_threshold(value)?)),
        })
    }

    pub fn get(&self) -> f64 {
        self.value.get()
    }

    pub fn set(&self, value: f64) -> Result<()> {
        let value = validate_threshold(value)?;
        log::info!("Entropy threshold changed {} -> {}", self.value.get(), value);
        self.value.set(value);
        Ok(())
    }
}

impl Default for ThresholdHandle {
    fn default() -> Self {
        Self {
            value: Rc::new(Cell::new(crate::config::DEFAULT_THRESHOLD)),
        }
    }
}

/// Human label for a threshold, as shown next to the sensitivity slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingLevel {
    Negligible,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl BlockingLevel {
    pub fn from_threshold(threshold: f64) -> Self {
        if threshold < 0.442 {
            BlockingLevel::Negligible
        } else if threshold < 0.596 {
            BlockingLevel::Low
        } else if threshold < 0.705 {
            BlockingLevel::Medium
        } else if threshold < 0.832 {
            BlockingLevel::High
        } else {
            BlockingLevel::VeryHigh
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BlockingLevel::Negligible => "Negligible",
            BlockingLevel::Low => "Low",
            BlockingLevel::Medium => "Medium",
            BlockingLevel::High => "High",
            BlockingLevel::VeryHigh => "Very High",
        }
    }
}

/// Key/value persistence for privileged-context settings.
pub trait SettingsStore {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn store(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory store, used natively and when browser storage is unavailable.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Rc<RefCell<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.borrow().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// `window.localStorage`-backed store.
pub struct LocalStorageStore {
    storage: web_sys::Storage,
}

impl LocalStorageStore {
    pub fn open() -> Result<Self> {
        let window = web_sys::window()
            .ok_or_else(|| GuardError::SettingsStorage("no window".into()))?;
        let storage = window
            .local_storage()
            .map_err(|_| GuardError::SettingsStorage("localStorage access denied".into()))?
            .ok_or_else(|| GuardError::SettingsStorage("localStorage unavailable".into()))?;
        Ok(Self { storage })
    }
}

impl SettingsStore for LocalStorageStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        self.storage
            .get_item(key)
            .map_err(|e| GuardError::SettingsStorage(format!("get {}: {:?}", key, e)))
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.storage
            .set_item(key, value)
            .map_err(|e| GuardError::SettingsStorage(format!("set {}: {:?}", key, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("random".parse::<Mode>().unwrap(), Mode::Random);
        assert_eq!(" Entropy ".parse::<Mode>().unwrap(), Mode::Entropy);
        assert!("spoof".parse::<Mode>().is_err());
        assert_eq!(serde_json::to_string(&Mode::Random).unwrap(), "\"random\"");
    }

    #[test]
    fn test_threshold_handle_is_shared() {
        let handle = ThresholdHandle::new(0.5).unwrap();
        let reader = handle.clone();
        handle.set(0.7).unwrap();
        assert_eq!(reader.get(), 0.7);
    }

    #[test]
    fn test_threshold_range_is_enforced() {
        assert!(ThresholdHandle::new(1.2).is_err());
        assert!(ThresholdHandle::new(f64::NAN).is_err());
        let handle = ThresholdHandle::new(0.0).unwrap();
        assert!(handle.set(-0.1).is_err());
        assert_eq!(handle.get(), 0.0);
    }

    #[test]
    fn test_blocking_levels() {
        assert_eq!(BlockingLevel::from_threshold(0.2), BlockingLevel::Negligible);
        assert_eq!(BlockingLevel::from_threshold(0.5), BlockingLevel::Low);
        assert_eq!(BlockingLevel::from_threshold(0.6), BlockingLevel::Medium);
        assert_eq!(BlockingLevel::from_threshold(0.83), BlockingLevel::High);
        assert_eq!(BlockingLevel::from_threshold(0.9).label(), "Very High");
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.load(MODE_KEY).unwrap(), None);
        store.store(MODE_KEY, "random").unwrap();
        assert_eq!(store.load(MODE_KEY).unwrap().as_deref(), Some("random"));
    }
}
