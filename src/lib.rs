//! # fp-entropy-guard
//!
//! Entropy-based browser fingerprinting detection and mitigation,
//! compiled to WebAssembly.
//!
//! Every read of a fingerprintable attribute is attributed to the script
//! that made it. The set of attributes a script has touched is scored
//! against a dataset of measured identifying power; once a script's
//! combination becomes identifying enough, it is flagged and its further
//! reads are either withheld or answered from a per-session random
//! profile.
//!
//! ## Architecture
//!
//! ```text
//! PrivilegedHost (settings, dataset, session identity, header rewriting)
//!   ↑ messages
//! FingerprintMonitor (page)
//!   ↓
//! InterceptionLayer → AccessGate → DecisionPolicy
//!                                    ├─ AccessLedger
//!                                    ├─ EntropyOracle
//!                                    └─ AccessReporter → sinks
//! ```

use wasm_bindgen::prelude::*;

pub mod attribute;
pub mod config;
pub mod entropy;
mod error;
pub mod intercept;
pub mod ledger;
pub mod messages;
pub mod policy;
pub mod privileged;
pub mod profile;
pub mod report;
pub mod settings;
pub mod setup;

pub use attribute::{AttributeId, AttributeVector};
pub use config::{GuardConfig, SurfaceConfig};
pub use entropy::{EntropyOracle, EntropyRecord};
pub use error::{ErrorCode, ErrorInfo, GuardError, Result};
pub use ledger::{AccessLedger, ScriptOrigin};
pub use messages::{LocalBroker, Notification, Request, Response, RuntimeBroker, SettingsBroker};
pub use policy::{Decision, DecisionPolicy, Resolution, Verdict};
pub use privileged::{PrivilegedContext, PrivilegedHost};
pub use profile::{NetworkIdentity, ProfileGenerator, RandomProfile, SpoofValue};
pub use report::{AccessCounts, AccessLogEntry, AccessReporter, AccessSink};
pub use settings::{BlockingLevel, Mode};
pub use setup::{FingerprintMonitor, PageMonitor};

#[wasm_bindgen(start)]
pub fn init() {
    // A second init (e.g. a reloaded module) keeps the existing logger.
    if console_log::init_with_level(log::Level::Info).is_ok() {
        log::info!("🛡️ fp-entropy-guard initialized");
    }
}

/// Crate version, for the settings page.
#[wasm_bindgen]
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
