//! Request/response contract between the page monitor and the privileged
//! context.
//!
//! The shapes are fixed; the transport is not. [`LocalBroker`] answers
//! in-process, [`RuntimeBroker`] hands JSON-compatible objects to a
//! host-supplied `sendMessage(request) -> Promise<response>` function.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use crate::entropy::EntropyRecord;
use crate::error::{ErrorInfo, GuardError, Result};
use crate::ledger::ScriptOrigin;
use crate::privileged::PrivilegedContext;
use crate::profile::NetworkIdentity;
use crate::report::{AccessCounts, AccessLogEntry, AccessSink};
use crate::settings::{Mode, ThresholdHandle};

/// Page → privileged requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    GetEntropyDataset,
    GetMode,
    SetMode { mode: Mode },
    GetThreshold,
    SetThreshold { threshold: f64 },
    GetRandomProfile,
    ReportFlagged { origin: ScriptOrigin, page: String },
    AppendLog { entry: AccessLogEntry },
    GetAccessCounts { page: String },
}

/// Privileged → page responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    EntropyDataset { entries: HashMap<String, f64> },
    Mode { mode: Mode },
    Threshold { threshold: f64 },
    RandomProfile { profile: NetworkIdentity },
    AccessCounts { counts: AccessCounts },
    Ack,
    Error { info: ErrorInfo },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::EntropyDataset { .. } => "entropyDataset",
            Response::Mode { .. } => "mode",
            Response::Threshold { .. } => "threshold",
            Response::RandomProfile { .. } => "randomProfile",
            Response::AccessCounts { .. } => "accessCounts",
            Response::Ack => "ack",
            Response::Error { .. } => "error",
        }
    }

    pub fn error(err: &GuardError) -> Self {
        Response::Error { info: err.into() }
    }

    /// Turn an `Error` response into `Err`, and anything else that is not
    /// `expected` into `UnexpectedResponse`.
    fn unexpected(self, expected: &str) -> GuardError {
        match self {
            Response::Error { info } => GuardError::MessageFailed(info.message),
            other => GuardError::UnexpectedResponse {
                expected: expected.to_string(),
                got: other.kind().to_string(),
            },
        }
    }
}

/// Privileged → page pushes, sent outside any request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// The user moved the sensitivity slider.
    ApplyEntropyBlocking { threshold: f64 },
}

impl Notification {
    pub fn apply(&self, threshold: &ThresholdHandle) -> Result<()> {
        match self {
            Notification::ApplyEntropyBlocking { threshold: value } => threshold.set(*value),
        }
    }
}

/// Page-side view of the privileged context.
#[async_trait(?Send)]
pub trait SettingsBroker {
    async fn request(&self, request: Request) -> Result<Response>;

    /// The privileged context's own threshold, when it lives in this realm.
    /// Brokers that only exchange messages return `None`.
    fn shared_threshold(&self) -> Option<ThresholdHandle> {
        None
    }

    async fn entropy_dataset(&self) -> Result<EntropyRecord> {
        match self.request(Request::GetEntropyDataset).await? {
            Response::EntropyDataset { entries } => Ok(EntropyRecord::from_entries(entries)),
            other => Err(other.unexpected("entropyDataset")),
        }
    }

    async fn mode(&self) -> Result<Mode> {
        match self.request(Request::GetMode).await? {
            Response::Mode { mode } => Ok(mode),
            other => Err(other.unexpected("mode")),
        }
    }

    async fn threshold(&self) -> Result<f64> {
        match self.request(Request::GetThreshold).await? {
            Response::Threshold { threshold } => Ok(threshold),
            other => Err(other.unexpected("threshold")),
        }
    }

    async fn network_identity(&self) -> Result<NetworkIdentity> {
        match self.request(Request::GetRandomProfile).await? {
            Response::RandomProfile { profile } => Ok(profile),
            other => Err(other.unexpected("randomProfile")),
        }
    }

    async fn report_flagged(&self, origin: ScriptOrigin, page: String) -> Result<()> {
        match self.request(Request::ReportFlagged { origin, page }).await? {
            Response::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }

    async fn append_log(&self, entry: AccessLogEntry) -> Result<()> {
        match self.request(Request::AppendLog { entry }).await? {
            Response::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }
}

/// In-process broker over a shared [`PrivilegedContext`].
#[derive(Clone)]
pub struct LocalBroker {
    context: Rc<RefCell<PrivilegedContext>>,
}

impl LocalBroker {
    pub fn new(context: Rc<RefCell<PrivilegedContext>>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Rc<RefCell<PrivilegedContext>> {
        &self.context
    }
}

#[async_trait(?Send)]
impl SettingsBroker for LocalBroker {
    async fn request(&self, request: Request) -> Result<Response> {
        let mut context = self
            .context
            .try_borrow_mut()
            .map_err(|_| GuardError::Internal("privileged context re-entered".into()))?;
        Ok(context.handle(request))
    }

    fn shared_threshold(&self) -> Option<ThresholdHandle> {
        self.context.try_borrow().ok().map(|c| c.threshold_handle())
    }
}

/// Broker backed by a host messaging function, e.g. a wrapper around
/// `chrome.runtime.sendMessage`.
pub struct RuntimeBroker {
    send: js_sys::Function,
}

impl RuntimeBroker {
    pub fn new(send: js_sys::Function) -> Self {
        Self { send }
    }
}

#[async_trait(?Send)]
impl SettingsBroker for RuntimeBroker {
    async fn request(&self, request: Request) -> Result<Response> {
        let payload = request.serialize(&serde_wasm_bindgen::Serializer::json_compatible())?;
        let returned = self
            .send
            .call1(&JsValue::NULL, &payload)
            .map_err(|e| GuardError::from_js("sendMessage threw", &e))?;
        // Accept plain values as well as promises.
        let reply = JsFuture::from(js_sys::Promise::resolve(&returned))
            .await
            .map_err(|e| GuardError::from_js("sendMessage rejected", &e))?;
        if reply.is_undefined() || reply.is_null() {
            return Err(GuardError::MessageFailed("empty reply".into()));
        }
        Ok(serde_wasm_bindgen::from_value(reply)?)
    }
}

/// Forwards flag transitions and access records to the privileged context.
/// Delivery is detached; failures are logged and dropped.
pub struct BrokerSink {
    broker: Rc<dyn SettingsBroker>,
}

impl BrokerSink {
    pub fn new(broker: Rc<dyn SettingsBroker>) -> Self {
        Self { broker }
    }
}

impl AccessSink for BrokerSink {
    fn on_flagged(&self, origin: &ScriptOrigin, page: &str) {
        let broker = self.broker.clone();
        let origin = origin.clone();
        let page = page.to_string();
        wasm_bindgen_futures::spawn_local(async move {
            if let Err(e) = broker.report_flagged(origin, page).await {
                log::warn!("reportFlagged not delivered: {}", e);
            }
        });
    }

    fn on_access(&self, entry: &AccessLogEntry) {
        let broker = self.broker.clone();
        let entry = entry.clone();
        wasm_bindgen_futures::spawn_local(async move {
            if let Err(e) = broker.append_log(entry).await {
                log::debug!("appendLog not delivered: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::settings::MemoryStore;
    use futures::executor::block_on;

    fn broker() -> LocalBroker {
        let dataset = EntropyRecord::from_entries([("navigator.platform|navigator.language", 0.9)]);
        let context = PrivilegedContext::new(
            dataset,
            Box::new(MemoryStore::new()),
            &GuardConfig::default(),
        );
        LocalBroker::new(Rc::new(RefCell::new(context)))
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_string(&Request::SetThreshold { threshold: 0.6 }).unwrap();
        assert_eq!(json, r#"{"type":"setThreshold","threshold":0.6}"#);
        let parsed: Request = serde_json::from_str(r#"{"type":"getMode"}"#).unwrap();
        assert_eq!(parsed, Request::GetMode);
        let mode: Response = serde_json::from_str(r#"{"type":"mode","mode":"random"}"#).unwrap();
        assert!(matches!(mode, Response::Mode { mode: Mode::Random }));
    }

    #[test]
    fn test_notification_wire_shape() {
        let pushed: Notification =
            serde_json::from_str(r#"{"type":"applyEntropyBlocking","threshold":0.4}"#).unwrap();
        assert_eq!(pushed, Notification::ApplyEntropyBlocking { threshold: 0.4 });

        let handle = ThresholdHandle::new(0.8).unwrap();
        pushed.apply(&handle).unwrap();
        assert_eq!(handle.get(), 0.4);
        assert!(Notification::ApplyEntropyBlocking { threshold: 7.0 }
            .apply(&handle)
            .is_err());
        assert_eq!(handle.get(), 0.4);
    }

    #[test]
    fn test_local_broker_shares_the_live_threshold() {
        let broker = broker();
        let shared = broker.shared_threshold().unwrap();
        block_on(broker.request(Request::SetThreshold { threshold: 0.6 })).unwrap();
        assert_eq!(shared.get(), 0.6);
    }

    #[test]
    fn test_reentered_context_is_an_internal_error() {
        let broker = broker();
        let _held = broker.context().borrow_mut();
        let err = block_on(broker.request(Request::GetMode)).unwrap_err();
        assert!(matches!(err, GuardError::Internal(_)));
        assert!(broker.shared_threshold().is_none());
    }

    #[test]
    fn test_typed_helpers_over_local_broker() {
        let broker = broker();
        block_on(async {
            let dataset = broker.entropy_dataset().await.unwrap();
            assert_eq!(dataset.get("navigator.language|navigator.platform"), Some(0.9));
            assert_eq!(broker.mode().await.unwrap(), Mode::Entropy);
            assert_eq!(broker.threshold().await.unwrap(), 0.83);

            let first = broker.network_identity().await.unwrap();
            let second = broker.network_identity().await.unwrap();
            assert_eq!(first, second);
        });
    }

    #[test]
    fn test_error_response_becomes_err() {
        let broker = broker();
        let err = block_on(broker.request(Request::SetThreshold { threshold: 3.0 }))
            .map(|r| r.unexpected("ack"))
            .unwrap();
        assert!(matches!(err, GuardError::MessageFailed(_)));
    }

    #[test]
    fn test_unexpected_response_kind() {
        let err = Response::Ack.unexpected("mode");
        match err {
            GuardError::UnexpectedResponse { expected, got } => {
                assert_eq!(expected, "mode");
                assert_eq!(got, "ack");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_report_flagged_roundtrip() {
        let broker = broker();
        let page = "https://shop.example/".to_string();
        block_on(async {
            broker
                .report_flagged(ScriptOrigin::new("https://t.tracker/x.js"), page.clone())
                .await
                .unwrap();
            broker
                .report_flagged(ScriptOrigin::new("https://t.tracker/x.js"), page.clone())
                .await
                .unwrap();
        });
        let counts = broker.context().borrow().access_counts(&page);
        assert_eq!(counts.total, 1);
        assert_eq!(counts.third_party, 1);
    }
}
