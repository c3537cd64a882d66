//! Decision policy: the per-origin threshold state machine.
//!
//! Each origin starts Unflagged and moves to Flagged the first time the
//! entropy of its cumulative vector exceeds the live threshold. Flagged is
//! terminal for the page lifetime, and the transition is reported once.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, AttributeVector};
use crate::entropy::EntropyOracle;
use crate::ledger::{AccessLedger, ScriptOrigin};
use crate::profile::{RandomProfile, SpoofValue};
use crate::report::{AccessLogEntry, AccessReporter};
use crate::settings::{Mode, ThresholdHandle};

/// What the trap should do with one access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Within budget: real value / real call.
    Allow,
    /// Over budget in Entropy mode: absent value, original never invoked.
    Deny,
    /// Over budget in Random mode: substitute value.
    Spoof,
}

/// Outcome of one access after profile lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Real,
    Absent,
    Substitute(SpoofValue),
}

/// Full result of a decision, for the trap and for diagnostics.
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    pub entropy: f64,
    pub vector: AttributeVector,
    pub newly_flagged: bool,
}

impl Decision {
    /// Map the verdict onto a concrete outcome. A spoof with no substitute
    /// for the attribute falls back to the real value.
    pub fn resolve(&self, profile: Option<&RandomProfile>, attribute: &AttributeId) -> Resolution {
        match self.verdict {
            Verdict::Allow => Resolution::Real,
            Verdict::Deny => Resolution::Absent,
            Verdict::Spoof => match profile.and_then(|p| p.get(attribute)) {
                Some(value) => Resolution::Substitute(value.clone()),
                None => Resolution::Real,
            },
        }
    }
}

/// Page-scoped policy. Shared by every trap through an `Rc`.
pub struct DecisionPolicy {
    oracle: Rc<EntropyOracle>,
    ledger: RefCell<AccessLedger>,
    threshold: ThresholdHandle,
    mode: Mode,
    reporter: Rc<AccessReporter>,
    page: String,
}

impl DecisionPolicy {
    pub fn new(
        oracle: Rc<EntropyOracle>,
        threshold: ThresholdHandle,
        mode: Mode,
        reporter: Rc<AccessReporter>,
        page: impl Into<String>,
    ) -> Self {
        Self {
            oracle,
            ledger: RefCell::new(AccessLedger::new()),
            threshold,
            mode,
            reporter,
            page: page.into(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn page(&self) -> &str {
        &self.page
    }

    pub fn threshold(&self) -> &ThresholdHandle {
        &self.threshold
    }

    pub fn reporter(&self) -> &Rc<AccessReporter> {
        &self.reporter
    }

    pub fn is_flagged(&self, origin: &ScriptOrigin) -> bool {
        self.ledger.borrow().is_flagged(origin)
    }

    pub fn origin_count(&self) -> usize {
        self.ledger.borrow().origin_count()
    }

    /// Run one access through the state machine.
    pub fn decide(&self, attribute: &AttributeId, origin: &ScriptOrigin) -> Decision {
        let vector = self
            .ledger
            .borrow_mut()
            .record_and_get_vector(origin, attribute);
        let entropy = self.oracle.score(&vector);
        // Live read: the user may have moved the slider since install.
        let threshold = self.threshold.get();
        let within_budget = entropy <= threshold;

        let newly_flagged = !within_budget && self.ledger.borrow_mut().mark_flagged(origin);
        if newly_flagged {
            log::info!(
                "🚩 {} flagged: entropy {:.3} > {:.3} for [{}]",
                origin,
                entropy,
                threshold,
                vector
            );
            self.reporter.flagged(origin, &self.page);
        }

        let verdict = match (within_budget, self.mode) {
            (true, _) => Verdict::Allow,
            (false, Mode::Random) => Verdict::Spoof,
            (false, Mode::Entropy) => Verdict::Deny,
        };

        log::debug!(
            "{} by {}: entropy {:.3} -> {:?}",
            attribute,
            origin,
            entropy,
            verdict
        );

        self.reporter.record(AccessLogEntry {
            timestamp: Utc::now(),
            attribute: attribute.clone(),
            vector: vector.normalized(),
            origin: origin.clone(),
            page: self.page.clone(),
            entropy,
        });

        Decision {
            verdict,
            entropy,
            vector,
            newly_flagged,
        }
    }
}
