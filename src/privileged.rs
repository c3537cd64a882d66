//! The privileged, long-lived side: owns the dataset, Mode, Threshold and
//! the session network identity, and answers page requests.
//!
//! One context serves every page. Flag counters are kept per page URL and
//! reset when the host reports a fresh load of that page.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use http::header::{HeaderName, HeaderValue, ACCEPT_LANGUAGE, DNT, USER_AGENT};
use http::HeaderMap;
use wasm_bindgen::prelude::*;

use crate::config::GuardConfig;
use crate::entropy::EntropyRecord;
use crate::error::{ErrorInfo, GuardError, Result};
use crate::ledger::ScriptOrigin;
use crate::messages::{Notification, Request, Response};
use crate::profile::NetworkIdentity;
use crate::report::{AccessCounts, AccessLogEntry};
use crate::settings::{
    BlockingLevel, LocalStorageStore, MemoryStore, Mode, SettingsStore, ThresholdHandle,
    IDENTITY_KEY, MODE_KEY, THRESHOLD_KEY,
};

/// Pages whose flag counters are kept at once; the least recently
/// first-seen page is dropped beyond this.
pub const MAX_TRACKED_PAGES: usize = 128;

#[derive(Debug, Default)]
struct PageCounters {
    counts: AccessCounts,
    seen: HashSet<ScriptOrigin>,
}

pub struct PrivilegedContext {
    dataset: EntropyRecord,
    store: Box<dyn SettingsStore>,
    mode: Mode,
    threshold: ThresholdHandle,
    identity: Option<NetworkIdentity>,
    pages: HashMap<String, PageCounters>,
    page_order: VecDeque<String>,
    log: VecDeque<String>,
    max_log_lines: usize,
}

impl PrivilegedContext {
    /// Build a context, restoring Mode, Threshold and identity from `store`.
    /// Unreadable or invalid persisted values fall back to the configured
    /// defaults.
    pub fn new(dataset: EntropyRecord, store: Box<dyn SettingsStore>, config: &GuardConfig) -> Self {
        let mode = match store.load(MODE_KEY) {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|e| {
                log::warn!("Ignoring persisted mode: {}", e);
                config.default_mode
            }),
            Ok(None) => config.default_mode,
            Err(e) => {
                log::warn!("{}", e);
                config.default_mode
            }
        };

        let fallback_threshold = ThresholdHandle::new(config.default_threshold).unwrap_or_else(|e| {
            log::warn!("{}; using {}", e, crate::config::DEFAULT_THRESHOLD);
            ThresholdHandle::default()
        });
        let threshold = match store.load(THRESHOLD_KEY) {
            Ok(Some(raw)) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|v| ThresholdHandle::new(v).ok())
                .unwrap_or_else(|| {
                    log::warn!("Ignoring persisted threshold {:?}", raw);
                    fallback_threshold
                }),
            Ok(None) => fallback_threshold,
            Err(e) => {
                log::warn!("{}", e);
                fallback_threshold
            }
        };

        let identity = match store.load(IDENTITY_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|e| log::warn!("Ignoring persisted identity: {}", e))
                .ok(),
            _ => None,
        };

        log::info!(
            "Privileged context ready: {} dataset entries, mode {}, threshold {}",
            dataset.len(),
            mode,
            threshold.get()
        );

        Self {
            dataset,
            store,
            mode,
            threshold,
            identity,
            pages: HashMap::new(),
            page_order: VecDeque::new(),
            log: VecDeque::new(),
            max_log_lines: config.max_log_lines.max(1),
        }
    }

    /// Answer one page request. Failures become `Response::Error`.
    pub fn handle(&mut self, request: Request) -> Response {
        match self.try_handle(request) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Request failed: {}", e);
                Response::error(&e)
            }
        }
    }

    fn try_handle(&mut self, request: Request) -> Result<Response> {
        let response = match request {
            Request::GetEntropyDataset => Response::EntropyDataset {
                entries: self
                    .dataset
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            },
            Request::GetMode => Response::Mode { mode: self.mode },
            Request::SetMode { mode } => {
                self.set_mode(mode);
                Response::Ack
            }
            Request::GetThreshold => Response::Threshold {
                threshold: self.threshold.get(),
            },
            Request::SetThreshold { threshold } => {
                self.set_threshold(threshold)?;
                Response::Ack
            }
            Request::GetRandomProfile => Response::RandomProfile {
                profile: self.session_identity().clone(),
            },
            Request::ReportFlagged { origin, page } => {
                self.report_flagged(origin, &page);
                Response::Ack
            }
            Request::AppendLog { entry } => {
                self.append_log(&entry);
                Response::Ack
            }
            Request::GetAccessCounts { page } => Response::AccessCounts {
                counts: self.access_counts(&page),
            },
        };
        Ok(response)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        log::info!("Mode {} -> {}", self.mode, mode);
        self.mode = mode;
        self.persist(MODE_KEY, mode.as_str());
    }

    pub fn threshold(&self) -> f64 {
        self.threshold.get()
    }

    /// The live threshold. Monitors in the same realm hold a clone, so a
    /// change here reaches their next decision.
    pub fn threshold_handle(&self) -> ThresholdHandle {
        self.threshold.clone()
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<()> {
        self.threshold.set(threshold)?;
        self.persist(THRESHOLD_KEY, &threshold.to_string());
        Ok(())
    }

    pub fn blocking_level(&self) -> BlockingLevel {
        BlockingLevel::from_threshold(self.threshold.get())
    }

    /// The identity for this session. Created on first use, then reused
    /// (and persisted) so every page and every request header agree.
    pub fn session_identity(&mut self) -> &NetworkIdentity {
        let store = &self.store;
        self.identity.get_or_insert_with(|| {
            let identity = NetworkIdentity::random(&mut rand::thread_rng());
            log::info!("Session identity: {} ({})", identity.platform, identity.user_agent);
            match serde_json::to_string(&identity) {
                Ok(json) => {
                    if let Err(e) = store.store(IDENTITY_KEY, &json) {
                        log::warn!("{}", e);
                    }
                }
                Err(e) => log::warn!("Identity not persisted: {}", e),
            }
            identity
        })
    }

    /// Count a flagged origin for `page`. Repeats for the same origin during
    /// one page load are ignored.
    pub fn report_flagged(&mut self, origin: ScriptOrigin, page: &str) -> bool {
        let counters = self.counters(page);
        if !counters.seen.insert(origin.clone()) {
            log::debug!("{} already counted for {}", origin, page);
            return false;
        }
        counters.counts.count(&origin, page);
        true
    }

    pub fn access_counts(&self, page: &str) -> AccessCounts {
        self.pages
            .get(page)
            .map(|c| c.counts)
            .unwrap_or_default()
    }

    /// A new load of `page` starts with fresh counters.
    pub fn page_loaded(&mut self, page: &str) {
        if self.pages.remove(page).is_some() {
            self.page_order.retain(|p| p != page);
        }
    }

    fn counters(&mut self, page: &str) -> &mut PageCounters {
        if !self.pages.contains_key(page) {
            if self.pages.len() >= MAX_TRACKED_PAGES {
                if let Some(oldest) = self.page_order.pop_front() {
                    log::debug!("Dropping flag counters for {}", oldest);
                    self.pages.remove(&oldest);
                }
            }
            self.page_order.push_back(page.to_string());
        }
        self.pages.entry(page.to_string()).or_default()
    }

    pub fn append_log(&mut self, entry: &AccessLogEntry) {
        if self.log.len() >= self.max_log_lines {
            self.log.pop_front();
        }
        self.log.push_back(entry.to_log_line());
    }

    pub fn log_text(&self) -> String {
        self.log.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// In Random mode, replace the identity-bearing request headers that are
    /// already present with the session identity's values. Headers that are
    /// absent are not added.
    pub fn rewrite_request_headers(&mut self, headers: &mut HeaderMap) -> usize {
        if self.mode != Mode::Random {
            return 0;
        }
        let identity = self.session_identity().clone();
        let replacements: [(HeaderName, Option<&str>); 3] = [
            (USER_AGENT, Some(identity.user_agent.as_str())),
            (ACCEPT_LANGUAGE, identity.language.as_deref()),
            (DNT, identity.do_not_track.as_deref()),
        ];

        let mut rewritten = 0;
        for (name, value) in replacements {
            let Some(value) = value else { continue };
            if !headers.contains_key(&name) {
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                    rewritten += 1;
                }
                Err(e) => log::warn!("Cannot set {}: {}", name, e),
            }
        }
        rewritten
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.store.store(key, value) {
            log::warn!("{}", e);
        }
    }
}

/// JS handle on a [`PrivilegedContext`], for the extension's background side.
#[wasm_bindgen]
#[derive(Clone)]
pub struct PrivilegedHost {
    context: Rc<RefCell<PrivilegedContext>>,
    listeners: Rc<RefCell<Vec<js_sys::Function>>>,
}

#[wasm_bindgen]
impl PrivilegedHost {
    /// Create from the bundled CSV dataset. Settings persist to
    /// `localStorage` when available, in memory otherwise.
    #[wasm_bindgen(constructor)]
    pub fn new(dataset_csv: &str, config: JsValue) -> std::result::Result<PrivilegedHost, JsValue> {
        let config: GuardConfig = if config.is_undefined() || config.is_null() {
            GuardConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config).map_err(GuardError::from)?
        };

        let dataset = EntropyRecord::from_csv(dataset_csv).unwrap_or_else(|e| {
            log::error!("{}; every vector will score {}", e, config.default_score);
            EntropyRecord::empty()
        });

        let store: Box<dyn SettingsStore> = match LocalStorageStore::open() {
            Ok(store) => Box::new(store),
            Err(e) => {
                log::warn!("{}; settings kept in memory", e);
                Box::new(MemoryStore::new())
            }
        };

        Ok(PrivilegedHost {
            context: Rc::new(RefCell::new(PrivilegedContext::new(dataset, store, &config))),
            listeners: Rc::new(RefCell::new(Vec::new())),
        })
    }

    /// Handle a `{type, ...}` request object and return the response object.
    /// A threshold change is pushed to every listener afterwards.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, message: JsValue) -> JsValue {
        let request = match serde_wasm_bindgen::from_value::<Request>(message) {
            Ok(request) => request,
            Err(e) => return to_js(&Response::error(&GuardError::from(e))),
        };
        let before = self.context.borrow().threshold();
        let response = self.context.borrow_mut().handle(request);
        let after = self.context.borrow().threshold();
        if after != before {
            self.notify(&Notification::ApplyEntropyBlocking { threshold: after });
        }
        to_js(&response)
    }

    /// Register `listener(notification)` for pushes to page monitors, e.g. a
    /// function forwarding to every tab.
    #[wasm_bindgen(js_name = addListener)]
    pub fn add_listener(&self, listener: js_sys::Function) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Rewrite `[[name, value], ...]` request headers; returns the new list.
    #[wasm_bindgen(js_name = rewriteHeaders)]
    pub fn rewrite_headers(&self, headers: JsValue) -> std::result::Result<JsValue, JsValue> {
        let pairs: Vec<(String, String)> =
            serde_wasm_bindgen::from_value(headers).map_err(GuardError::from)?;

        let mut map = HeaderMap::new();
        for (name, value) in &pairs {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        self.context.borrow_mut().rewrite_request_headers(&mut map);

        let rewritten: Vec<(String, String)> = map
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Ok(to_js(&rewritten))
    }

    #[wasm_bindgen(js_name = pageLoaded)]
    pub fn page_loaded(&self, page: &str) {
        self.context.borrow_mut().page_loaded(page);
    }

    #[wasm_bindgen(js_name = blockingLevel)]
    pub fn blocking_level(&self) -> String {
        self.context.borrow().blocking_level().label().to_string()
    }

    #[wasm_bindgen(js_name = getLogText)]
    pub fn get_log_text(&self) -> String {
        self.context.borrow().log_text()
    }
}

impl PrivilegedHost {
    pub fn context(&self) -> Rc<RefCell<PrivilegedContext>> {
        self.context.clone()
    }

    fn notify(&self, notification: &Notification) {
        let payload = to_js(notification);
        let listeners = self.listeners.borrow().clone();
        for listener in &listeners {
            if let Err(e) = listener.call1(&JsValue::NULL, &payload) {
                log::warn!("Listener rejected {:?}: {:?}", notification, e);
            }
        }
    }
}

fn to_js<T: serde::Serialize>(value: &T) -> JsValue {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .unwrap_or_else(|e| {
            let info = ErrorInfo::from(&GuardError::from(e));
            JsValue::from_str(&info.message)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const PAGE: &str = "https://shop.example/";

    fn context(store: MemoryStore) -> PrivilegedContext {
        PrivilegedContext::new(
            EntropyRecord::from_entries([("screen.width", 0.2)]),
            Box::new(store),
            &GuardConfig::default(),
        )
    }

    fn request_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("RealBrowser/1.0"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("nl-NL"));
        headers.insert("x-other", HeaderValue::from_static("kept"));
        headers
    }

    #[test]
    fn test_defaults() {
        let ctx = context(MemoryStore::new());
        assert_eq!(ctx.mode(), Mode::Entropy);
        assert_eq!(ctx.threshold(), 0.83);
        assert_eq!(ctx.blocking_level(), BlockingLevel::High);
    }

    #[test]
    fn test_settings_persist_across_contexts() {
        let store = MemoryStore::new();
        let mut ctx = context(store.clone());
        assert!(matches!(ctx.handle(Request::SetMode { mode: Mode::Random }), Response::Ack));
        assert!(matches!(
            ctx.handle(Request::SetThreshold { threshold: 0.6 }),
            Response::Ack
        ));
        let identity = ctx.session_identity().clone();

        let mut restored = context(store);
        assert_eq!(restored.mode(), Mode::Random);
        assert_eq!(restored.threshold(), 0.6);
        assert_eq!(restored.session_identity(), &identity);
    }

    #[test]
    fn test_threshold_handle_follows_set_threshold() {
        let mut ctx = context(MemoryStore::new());
        let shared = ctx.threshold_handle();
        ctx.handle(Request::SetThreshold { threshold: 0.4 });
        assert_eq!(shared.get(), 0.4);
        assert!(ctx.set_threshold(-1.0).is_err());
        assert_eq!(shared.get(), 0.4);
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let mut ctx = context(MemoryStore::new());
        match ctx.handle(Request::SetThreshold { threshold: 1.5 }) {
            Response::Error { info } => assert_eq!(info.code, 200),
            other => panic!("expected error, got {}", other.kind()),
        }
        assert_eq!(ctx.threshold(), 0.83);
    }

    #[test]
    fn test_garbage_persisted_values_fall_back() {
        let store = MemoryStore::new();
        store.store(MODE_KEY, "paranoid").unwrap();
        store.store(THRESHOLD_KEY, "7").unwrap();
        let ctx = context(store);
        assert_eq!(ctx.mode(), Mode::Entropy);
        assert_eq!(ctx.threshold(), 0.83);
    }

    #[test]
    fn test_identity_is_stable_for_the_session() {
        let mut ctx = context(MemoryStore::new());
        let a = match ctx.handle(Request::GetRandomProfile) {
            Response::RandomProfile { profile } => profile,
            other => panic!("unexpected {}", other.kind()),
        };
        let b = ctx.session_identity().clone();
        assert_eq!(a, b);
    }

    #[test]
    fn test_flag_counts_are_idempotent_per_page_load() {
        let mut ctx = context(MemoryStore::new());
        let tracker = ScriptOrigin::new("https://t.tracker/x.js");
        let own = ScriptOrigin::new("https://shop.example/app.js");
        assert!(ctx.report_flagged(tracker.clone(), PAGE));
        assert!(!ctx.report_flagged(tracker.clone(), PAGE));
        assert!(ctx.report_flagged(own, PAGE));
        assert_eq!(
            ctx.access_counts(PAGE),
            AccessCounts {
                total: 2,
                first_party: 1,
                third_party: 1
            }
        );
        assert_eq!(ctx.access_counts("https://other.example/").total, 0);

        ctx.page_loaded(PAGE);
        assert_eq!(ctx.access_counts(PAGE).total, 0);
        assert!(ctx.report_flagged(tracker, PAGE));
    }

    #[test]
    fn test_tracked_pages_are_bounded() {
        let mut ctx = context(MemoryStore::new());
        let tracker = ScriptOrigin::new("https://t.tracker/x.js");
        for i in 0..=MAX_TRACKED_PAGES {
            ctx.report_flagged(tracker.clone(), &format!("https://site{}.example/", i));
        }
        assert_eq!(ctx.pages.len(), MAX_TRACKED_PAGES);
        assert_eq!(ctx.page_order.len(), MAX_TRACKED_PAGES);
        assert_eq!(ctx.access_counts("https://site0.example/").total, 0);
        let newest = format!("https://site{}.example/", MAX_TRACKED_PAGES);
        assert_eq!(ctx.access_counts(&newest).total, 1);

        ctx.page_loaded(&newest);
        assert_eq!(ctx.page_order.len(), MAX_TRACKED_PAGES - 1);
    }

    #[test]
    fn test_headers_untouched_in_entropy_mode() {
        let mut ctx = context(MemoryStore::new());
        let mut headers = request_headers();
        assert_eq!(ctx.rewrite_request_headers(&mut headers), 0);
        assert_eq!(headers.get(USER_AGENT).unwrap(), "RealBrowser/1.0");
    }

    #[test]
    fn test_headers_follow_identity_in_random_mode() {
        let mut ctx = context(MemoryStore::new());
        ctx.set_mode(Mode::Random);
        let identity = ctx.session_identity().clone();

        let mut headers = request_headers();
        let rewritten = ctx.rewrite_request_headers(&mut headers);

        assert_eq!(rewritten, 2);
        assert_eq!(headers.get(USER_AGENT).unwrap(), identity.user_agent.as_str());
        assert_eq!(
            headers.get(ACCEPT_LANGUAGE).unwrap(),
            identity.language.as_deref().unwrap()
        );
        // Not present before, so not added.
        assert!(headers.get(DNT).is_none());
        assert_eq!(headers.get("x-other").unwrap(), "kept");
    }

    #[test]
    fn test_append_log_is_bounded() {
        let config = GuardConfig {
            max_log_lines: 1,
            ..GuardConfig::default()
        };
        let mut ctx =
            PrivilegedContext::new(EntropyRecord::empty(), Box::new(MemoryStore::new()), &config);
        for attr in ["screen.width", "screen.height"] {
            ctx.append_log(&AccessLogEntry {
                timestamp: Utc::now(),
                attribute: attr.into(),
                vector: attr.to_string(),
                origin: ScriptOrigin::new("a.js"),
                page: PAGE.to_string(),
                entropy: 0.5,
            });
        }
        let text = ctx.log_text();
        assert!(text.contains("screen.height"));
        assert!(!text.contains("screen.width"));
    }
}
