//! Per-origin access ledger.
//!
//! Tracks, for every script origin on a page, the cumulative set of
//! attributes it has read and whether it has crossed the threshold.
//! Entries are created lazily and live exactly as long as the page.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, AttributeVector};

/// Identity used to attribute accesses: the executing script's URL, or the
/// page URL when no script URL can be resolved.
///
/// This is an approximation. Code running from a microtask or an inline
/// handler is attributed to whatever script the resolver sees last.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptOrigin(String);

impl ScriptOrigin {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Resolve from an optional script `src`, falling back to the page URL.
    /// Inline scripts report an empty `src`, which also falls back.
    pub fn resolve(script_src: Option<&str>, page_url: &str) -> Self {
        match script_src.map(str::trim) {
            Some(src) if !src.is_empty() => Self(src.to_string()),
            _ => Self(page_url.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host of the origin URL, if it parses as an absolute URL.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// Whether this origin shares the page's hostname.
    ///
    /// Unparseable origins fall back to a substring test against the host,
    /// which is how relative or opaque script URLs end up classified.
    pub fn is_first_party(&self, page_url: &str) -> bool {
        let page_host = match url::Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        {
            Some(host) => host,
            None => return self.0 == page_url,
        };

        match self.host() {
            Some(host) => host == page_host,
            None => self.0.contains(&page_host),
        }
    }
}

impl fmt::Display for ScriptOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State kept per origin.
#[derive(Debug, Clone, Default)]
pub struct LedgerEntry {
    pub vector: AttributeVector,
    /// Monotonic: once true, never reset for the page lifetime.
    pub flagged: bool,
}

/// Per-page ledger of origins.
#[derive(Debug, Default)]
pub struct AccessLedger {
    entries: HashMap<ScriptOrigin, LedgerEntry>,
}

impl AccessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `attribute` to the origin's set and return the updated vector.
    pub fn record_and_get_vector(
        &mut self,
        origin: &ScriptOrigin,
        attribute: &AttributeId,
    ) -> AttributeVector {
        let entry = self.entries.entry(origin.clone()).or_default();
        if entry.vector.insert(attribute.clone()) {
            log::debug!(
                "Origin {} now touched {} attributes",
                origin,
                entry.vector.len()
            );
        }
        entry.vector.clone()
    }

    pub fn is_flagged(&self, origin: &ScriptOrigin) -> bool {
        self.entries.get(origin).map(|e| e.flagged).unwrap_or(false)
    }

    /// Set the flag. Returns `true` only for the call that performed the
    /// Unflagged → Flagged transition.
    pub fn mark_flagged(&mut self, origin: &ScriptOrigin) -> bool {
        let entry = self.entries.entry(origin.clone()).or_default();
        if entry.flagged {
            return false;
        }
        entry.flagged = true;
        true
    }

    pub fn vector(&self, origin: &ScriptOrigin) -> Option<&AttributeVector> {
        self.entries.get(origin).map(|e| &e.vector)
    }

    pub fn origin_count(&self) -> usize {
        self.entries.len()
    }

    pub fn flagged_origins(&self) -> impl Iterator<Item = &ScriptOrigin> {
        self.entries
            .iter()
            .filter(|(_, e)| e.flagged)
            .map(|(o, _)| o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(s: &str) -> ScriptOrigin {
        ScriptOrigin::new(s)
    }

    #[test]
    fn test_growth_is_cumulative_and_order_independent() {
        let mut a = AccessLedger::new();
        let mut b = AccessLedger::new();
        let o = origin("https://cdn.example/fp.js");

        a.record_and_get_vector(&o, &"navigator.language".into());
        let va = a.record_and_get_vector(&o, &"navigator.platform".into());

        b.record_and_get_vector(&o, &"navigator.platform".into());
        b.record_and_get_vector(&o, &"navigator.platform".into());
        let vb = b.record_and_get_vector(&o, &"navigator.language".into());

        assert_eq!(va, vb);
        assert_eq!(va.normalized(), "navigator.language|navigator.platform");
    }

    #[test]
    fn test_origins_are_independent() {
        let mut ledger = AccessLedger::new();
        ledger.record_and_get_vector(&origin("a.js"), &"screen.width".into());
        let v = ledger.record_and_get_vector(&origin("b.js"), &"screen.height".into());
        assert_eq!(v.len(), 1);
        assert_eq!(ledger.origin_count(), 2);
    }

    #[test]
    fn test_flag_transition_happens_once() {
        let mut ledger = AccessLedger::new();
        let o = origin("a.js");
        assert!(!ledger.is_flagged(&o));
        assert!(ledger.mark_flagged(&o));
        assert!(!ledger.mark_flagged(&o));
        assert!(ledger.is_flagged(&o));
        assert_eq!(ledger.flagged_origins().count(), 1);
    }

    #[test]
    fn test_origin_resolution_falls_back_to_page() {
        let page = "https://shop.example/cart";
        assert_eq!(ScriptOrigin::resolve(None, page).as_str(), page);
        assert_eq!(ScriptOrigin::resolve(Some(""), page).as_str(), page);
        assert_eq!(
            ScriptOrigin::resolve(Some("https://t.tracker/x.js"), page).as_str(),
            "https://t.tracker/x.js"
        );
    }

    #[test]
    fn test_first_party_classification() {
        let page = "https://shop.example/cart";
        assert!(origin("https://shop.example/app.js").is_first_party(page));
        assert!(origin(page).is_first_party(page));
        assert!(!origin("https://t.tracker/x.js").is_first_party(page));
        assert!(origin("//shop.example/rel.js").is_first_party(page));
    }
}
