//! Access records, flag counters and log sinks.
//!
//! Every decision produces one [`AccessLogEntry`]. The [`AccessReporter`]
//! keeps the page's own counters and log (served to the host UI) and fans
//! records out to any number of [`AccessSink`]s. Sinks are fire-and-forget:
//! they never report failure back to the access path.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::attribute::AttributeId;
use crate::ledger::ScriptOrigin;

/// One structured access record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub attribute: AttributeId,
    pub vector: String,
    pub origin: ScriptOrigin,
    pub page: String,
    pub entropy: f64,
}

impl AccessLogEntry {
    fn iso_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Line format served by `get_log_text`.
    pub fn to_log_line(&self) -> String {
        format!(
            "{} - {} : {} : {} : {}",
            self.iso_timestamp(),
            self.attribute,
            self.vector,
            self.origin,
            self.page
        )
    }

    /// Line format POSTed to the external log endpoint.
    pub fn to_sink_line(&self) -> String {
        format!(
            "{} - Last accessed attribute: {}, Vector: {}, Script source: {}, Detected entropy: {}\n",
            self.iso_timestamp(),
            self.attribute,
            self.vector,
            self.origin,
            self.entropy
        )
    }
}

/// Flagged-origin counters for one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCounts {
    pub total: u32,
    pub first_party: u32,
    pub third_party: u32,
}

impl AccessCounts {
    /// Count one newly flagged origin.
    pub fn count(&mut self, origin: &ScriptOrigin, page: &str) {
        self.total += 1;
        if origin.is_first_party(page) {
            self.first_party += 1;
        } else {
            self.third_party += 1;
        }
    }
}

/// Receiver of access events. Implementations must not block and must
/// swallow their own failures.
pub trait AccessSink {
    fn on_flagged(&self, _origin: &ScriptOrigin, _page: &str) {}
    fn on_access(&self, _entry: &AccessLogEntry) {}
}

#[derive(Debug, Default)]
struct ReporterState {
    counts: AccessCounts,
    counted: HashSet<ScriptOrigin>,
    entries: VecDeque<AccessLogEntry>,
}

/// Page-local counters and log, plus fan-out to external sinks.
pub struct AccessReporter {
    state: RefCell<ReporterState>,
    sinks: Vec<Rc<dyn AccessSink>>,
    max_entries: usize,
}

impl AccessReporter {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: RefCell::new(ReporterState::default()),
            sinks: Vec::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn with_sink(mut self, sink: Rc<dyn AccessSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Count a newly flagged origin. Returns `false` (and counts nothing)
    /// for an origin that was already counted on this page.
    pub fn flagged(&self, origin: &ScriptOrigin, page: &str) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if !state.counted.insert(origin.clone()) {
                log::warn!("Duplicate flag report for {} ignored", origin);
                return false;
            }
            state.counts.count(origin, page);
        }
        for sink in &self.sinks {
            sink.on_flagged(origin, page);
        }
        true
    }

    /// Keep the record locally and forward it to every sink.
    pub fn record(&self, entry: AccessLogEntry) {
        for sink in &self.sinks {
            sink.on_access(&entry);
        }
        let mut state = self.state.borrow_mut();
        if state.entries.len() >= self.max_entries {
            state.entries.pop_front();
        }
        state.entries.push_back(entry);
    }

    pub fn counts(&self) -> AccessCounts {
        self.state.borrow().counts
    }

    /// Newline-joined log, one line per access.
    pub fn log_text(&self) -> String {
        self.state
            .borrow()
            .entries
            .iter()
            .map(AccessLogEntry::to_log_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn entry_count(&self) -> usize {
        self.state.borrow().entries.len()
    }
}

/// POSTs each access line to an HTTP endpoint. Failures are logged at
/// debug level and dropped; nothing is retried.
pub struct HttpLogSink {
    endpoint: String,
}

impl HttpLogSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl AccessSink for HttpLogSink {
    fn on_access(&self, entry: &AccessLogEntry) {
        let endpoint = self.endpoint.clone();
        let body = entry.to_sink_line();
        wasm_bindgen_futures::spawn_local(async move {
            if let Err(e) = post_text(&endpoint, &body).await {
                log::debug!("Access log sink unreachable ({}): {:?}", endpoint, e);
            }
        });
    }
}

async fn post_text(endpoint: &str, body: &str) -> Result<(), wasm_bindgen::JsValue> {
    let window = web_sys::window().ok_or_else(|| wasm_bindgen::JsValue::from_str("no window"))?;

    let init = web_sys::RequestInit::new();
    init.set_method("POST");
    init.set_mode(web_sys::RequestMode::Cors);
    init.set_body(&wasm_bindgen::JsValue::from_str(body));

    let request = web_sys::Request::new_with_str_and_init(endpoint, &init)?;
    request.headers().set("Content-Type", "text/plain")?;

    let response = JsFuture::from(window.fetch_with_request(&request)).await?;
    let response: web_sys::Response = response.dyn_into()?;
    if !response.ok() {
        return Err(wasm_bindgen::JsValue::from_str(&format!(
            "HTTP {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(attr: &str, origin: &str) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            attribute: attr.into(),
            vector: attr.to_string(),
            origin: ScriptOrigin::new(origin),
            page: "https://shop.example/".into(),
            entropy: 0.42,
        }
    }

    #[derive(Default)]
    struct Recording {
        flagged: RefCell<Vec<String>>,
        accesses: RefCell<usize>,
    }

    impl AccessSink for Recording {
        fn on_flagged(&self, origin: &ScriptOrigin, _page: &str) {
            self.flagged.borrow_mut().push(origin.to_string());
        }
        fn on_access(&self, _entry: &AccessLogEntry) {
            *self.accesses.borrow_mut() += 1;
        }
    }

    #[test]
    fn test_log_line_format() {
        let line = entry("screen.width", "https://t.tracker/x.js").to_log_line();
        assert_eq!(
            line,
            "2024-05-01T12:00:00.000Z - screen.width : screen.width : https://t.tracker/x.js : https://shop.example/"
        );
        let sink_line = entry("screen.width", "a.js").to_sink_line();
        assert!(sink_line.contains("Detected entropy: 0.42"));
        assert!(sink_line.ends_with('\n'));
    }

    #[test]
    fn test_counts_split_by_party() {
        let reporter = AccessReporter::new(10);
        let page = "https://shop.example/";
        assert!(reporter.flagged(&ScriptOrigin::new("https://shop.example/app.js"), page));
        assert!(reporter.flagged(&ScriptOrigin::new("https://t.tracker/x.js"), page));
        assert!(!reporter.flagged(&ScriptOrigin::new("https://t.tracker/x.js"), page));
        assert_eq!(
            reporter.counts(),
            AccessCounts {
                total: 2,
                first_party: 1,
                third_party: 1
            }
        );
    }

    #[test]
    fn test_sinks_receive_events_once() {
        let sink = Rc::new(Recording::default());
        let reporter = AccessReporter::new(10).with_sink(sink.clone());
        let origin = ScriptOrigin::new("a.js");
        reporter.flagged(&origin, "https://p/");
        reporter.flagged(&origin, "https://p/");
        reporter.record(entry("screen.width", "a.js"));
        assert_eq!(sink.flagged.borrow().len(), 1);
        assert_eq!(*sink.accesses.borrow(), 1);
    }

    #[test]
    fn test_log_is_bounded() {
        let reporter = AccessReporter::new(2);
        reporter.record(entry("a.x", "o"));
        reporter.record(entry("b.x", "o"));
        reporter.record(entry("c.x", "o"));
        assert_eq!(reporter.entry_count(), 2);
        let text = reporter.log_text();
        assert!(!text.contains("a.x"));
        assert_eq!(text.lines().count(), 2);
    }
}
