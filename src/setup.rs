//! Page-side setup and the JS-facing monitor.
//!
//! Setup is strictly ordered: dataset, mode, threshold, and (Random mode
//! only) the session identity are fetched before any trap exists. Any
//! failed exchange aborts installation for the page.
//!
//! The threshold stays live afterwards. In the privileged realm the monitor
//! reads the context's own handle; across a message channel it follows
//! `applyEntropyBlocking` notifications.

use std::rc::Rc;

use wasm_bindgen::prelude::*;

use crate::config::GuardConfig;
use crate::entropy::EntropyOracle;
use crate::error::{GuardError, Result};
use crate::intercept::dom::DomInterceptor;
use crate::intercept::{AccessGate, InstallReport, InterceptionLayer, Interceptor};
use crate::messages::{BrokerSink, LocalBroker, Notification, RuntimeBroker, SettingsBroker};
use crate::policy::DecisionPolicy;
use crate::privileged::PrivilegedHost;
use crate::profile::{ProfileGenerator, RandomProfile};
use crate::report::{AccessCounts, AccessReporter, AccessSink, HttpLogSink};
use crate::settings::{Mode, ThresholdHandle};

/// Everything the traps need, resolved up front.
pub struct Prepared {
    pub oracle: EntropyOracle,
    pub mode: Mode,
    pub threshold: ThresholdHandle,
    pub profile: Option<RandomProfile>,
}

/// Run the ordered setup exchange.
pub async fn prepare(broker: &dyn SettingsBroker, config: &GuardConfig) -> Result<Prepared> {
    let dataset = broker
        .entropy_dataset()
        .await
        .map_err(|e| GuardError::setup("dataset", e))?;
    let oracle = if dataset.is_empty() {
        EntropyOracle::unavailable(config)
    } else {
        EntropyOracle::new(dataset, config)
    };

    let mode = broker
        .mode()
        .await
        .map_err(|e| GuardError::setup("mode", e))?;

    let threshold = broker
        .threshold()
        .await
        .and_then(|value| match broker.shared_threshold() {
            Some(shared) => Ok(shared),
            None => ThresholdHandle::new(value),
        })
        .map_err(|e| GuardError::setup("threshold", e))?;

    let profile = match mode {
        Mode::Random => {
            let identity = broker
                .network_identity()
                .await
                .map_err(|e| GuardError::setup("profile", e))?;
            Some(ProfileGenerator::new().generate(&identity))
        }
        Mode::Entropy => None,
    };

    log::debug!(
        "Setup resolved: {} dataset entries, mode {}, threshold {}",
        oracle.dataset_len(),
        mode,
        threshold.get()
    );
    Ok(Prepared {
        oracle,
        mode,
        threshold,
        profile,
    })
}

/// An installed monitor for one page.
pub struct PageMonitor<I: Interceptor> {
    policy: Rc<DecisionPolicy>,
    layer: InterceptionLayer<I>,
}

impl<I: Interceptor> PageMonitor<I> {
    pub fn install(
        prepared: Prepared,
        interceptor: I,
        config: &GuardConfig,
        page_url: &str,
        sinks: Vec<Rc<dyn AccessSink>>,
    ) -> Self {
        let reporter = sinks
            .into_iter()
            .fold(AccessReporter::new(config.max_log_lines), |r, sink| {
                r.with_sink(sink)
            });
        let policy = Rc::new(DecisionPolicy::new(
            Rc::new(prepared.oracle),
            prepared.threshold,
            prepared.mode,
            Rc::new(reporter),
            page_url,
        ));
        let gate = Rc::new(AccessGate::new(
            policy.clone(),
            prepared.profile.map(Rc::new),
        ));
        let layer = InterceptionLayer::install(interceptor, &config.surface, gate);
        Self { policy, layer }
    }

    /// Prepare, then install. On failure nothing is installed.
    pub async fn prepare_and_install(
        broker: &dyn SettingsBroker,
        interceptor: I,
        config: &GuardConfig,
        page_url: &str,
        sinks: Vec<Rc<dyn AccessSink>>,
    ) -> Result<Self> {
        match prepare(broker, config).await {
            Ok(prepared) => Ok(Self::install(prepared, interceptor, config, page_url, sinks)),
            Err(e) => {
                log::error!("Monitor not installed on {}: {}", page_url, e);
                Err(e)
            }
        }
    }

    pub fn access_counts(&self) -> AccessCounts {
        self.policy.reporter().counts()
    }

    pub fn log_text(&self) -> String {
        self.policy.reporter().log_text()
    }

    pub fn threshold(&self) -> f64 {
        self.policy.threshold().get()
    }

    /// Takes effect on the next decision; traps stay in place.
    pub fn set_threshold(&self, threshold: f64) -> Result<()> {
        self.policy.threshold().set(threshold)
    }

    /// Apply a push from the privileged context.
    pub fn apply_notification(&self, notification: &Notification) -> Result<()> {
        notification.apply(self.policy.threshold())
    }

    pub fn mode(&self) -> Mode {
        self.policy.mode()
    }

    pub fn policy(&self) -> &Rc<DecisionPolicy> {
        &self.policy
    }

    pub fn report(&self) -> &InstallReport {
        self.layer.report()
    }

    pub fn layer(&self) -> &InterceptionLayer<I> {
        &self.layer
    }

    pub fn layer_mut(&mut self) -> &mut InterceptionLayer<I> {
        &mut self.layer
    }

    pub fn restore(&mut self) -> usize {
        self.layer.restore()
    }
}

fn parse_config(config: JsValue) -> std::result::Result<GuardConfig, JsValue> {
    if config.is_undefined() || config.is_null() {
        Ok(GuardConfig::default())
    } else {
        Ok(serde_wasm_bindgen::from_value(config).map_err(GuardError::from)?)
    }
}

async fn install_on_page(
    broker: Rc<dyn SettingsBroker>,
    config: GuardConfig,
) -> Result<FingerprintMonitor> {
    let interceptor = DomInterceptor::for_current_page(config.remove_denied_scripts)
        .map_err(|e| GuardError::setup("page", e))?;
    let page_url = interceptor.page_url().to_string();

    let mut sinks: Vec<Rc<dyn AccessSink>> = vec![Rc::new(BrokerSink::new(broker.clone()))];
    if let Some(endpoint) = &config.log_endpoint {
        sinks.push(Rc::new(HttpLogSink::new(endpoint.clone())));
    }

    let inner =
        PageMonitor::prepare_and_install(broker.as_ref(), interceptor, &config, &page_url, sinks)
            .await?;
    Ok(FingerprintMonitor {
        inner,
        listener: None,
    })
}

/// Hand `subscribe` a listener that applies privileged pushes to `threshold`.
fn subscribe_to_notifications(
    threshold: ThresholdHandle,
    subscribe: &js_sys::Function,
) -> std::result::Result<Closure<dyn FnMut(JsValue)>, JsValue> {
    let listener = Closure::wrap(Box::new(move |message: JsValue| {
        match serde_wasm_bindgen::from_value::<Notification>(message) {
            Ok(notification) => {
                if let Err(e) = notification.apply(&threshold) {
                    log::warn!("Ignoring {:?}: {}", notification, e);
                }
            }
            Err(_) => log::debug!("Ignoring message that is not a notification"),
        }
    }) as Box<dyn FnMut(JsValue)>);
    subscribe.call1(&JsValue::NULL, listener.as_ref())?;
    Ok(listener)
}

/// The page monitor as seen from JS.
#[wasm_bindgen]
pub struct FingerprintMonitor {
    inner: PageMonitor<DomInterceptor>,
    listener: Option<Closure<dyn FnMut(JsValue)>>,
}

#[wasm_bindgen]
impl FingerprintMonitor {
    /// Set up against a privileged context reached through
    /// `sendMessage(request) -> Promise<response>`. When given,
    /// `subscribe(listener)` registers `listener` for privileged pushes,
    /// e.g. `chrome.runtime.onMessage.addListener`.
    pub async fn install(
        send_message: js_sys::Function,
        config: JsValue,
        subscribe: Option<js_sys::Function>,
    ) -> std::result::Result<FingerprintMonitor, JsValue> {
        let config = parse_config(config)?;
        let broker: Rc<dyn SettingsBroker> = Rc::new(RuntimeBroker::new(send_message));
        let mut monitor = install_on_page(broker, config).await?;
        if let Some(subscribe) = subscribe {
            let threshold = monitor.inner.policy().threshold().clone();
            match subscribe_to_notifications(threshold, &subscribe) {
                Ok(listener) => monitor.listener = Some(listener),
                Err(e) => log::warn!("Threshold pushes unavailable: {:?}", e),
            }
        }
        Ok(monitor)
    }

    /// Set up against a privileged context living in the same realm.
    /// Resolves to a `FingerprintMonitor`.
    #[wasm_bindgen(js_name = installLocal)]
    pub fn install_local(
        host: &PrivilegedHost,
        config: JsValue,
    ) -> std::result::Result<js_sys::Promise, JsValue> {
        let config = parse_config(config)?;
        let broker: Rc<dyn SettingsBroker> = Rc::new(LocalBroker::new(host.context()));
        Ok(wasm_bindgen_futures::future_to_promise(async move {
            let monitor = install_on_page(broker, config).await?;
            Ok(JsValue::from(monitor))
        }))
    }

    /// `{ total, firstParty, thirdParty }` for this page.
    #[wasm_bindgen(js_name = getAccessCounts)]
    pub fn get_access_counts(&self) -> JsValue {
        serde_wasm_bindgen::to_value(&self.inner.access_counts()).unwrap_or(JsValue::NULL)
    }

    /// One line per access.
    #[wasm_bindgen(js_name = getLogText)]
    pub fn get_log_text(&self) -> String {
        self.inner.log_text()
    }

    #[wasm_bindgen(js_name = setThreshold)]
    pub fn set_threshold(&self, threshold: f64) -> std::result::Result<(), JsValue> {
        Ok(self.inner.set_threshold(threshold)?)
    }

    #[wasm_bindgen(js_name = getThreshold)]
    pub fn get_threshold(&self) -> f64 {
        self.inner.threshold()
    }

    #[wasm_bindgen(js_name = getMode)]
    pub fn get_mode(&self) -> String {
        self.inner.mode().to_string()
    }

    /// Attribute ids that were trapped.
    #[wasm_bindgen(js_name = installedAttributes)]
    pub fn installed_attributes(&self) -> Vec<String> {
        self.inner
            .report()
            .installed
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    /// Surfaces the page lacks or that could not be trapped.
    #[wasm_bindgen(js_name = skippedSurfaces)]
    pub fn skipped_surfaces(&self) -> Vec<String> {
        self.inner.report().skipped.clone()
    }

    /// Remove every trap. The monitor stops observing this page.
    pub fn uninstall(&mut self) -> usize {
        self.listener = None;
        self.inner.restore()
    }
}
