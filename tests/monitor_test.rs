//! Browser integration tests for the page monitor and privileged host.
//!
//! Run with: wasm-pack test --headless --chrome
//! (or --firefox)

#![cfg(target_arch = "wasm32")]

use fp_entropy_guard::{FingerprintMonitor, GuardConfig, PrivilegedHost};
use js_sys::{Array, Function, Reflect};
use wasm_bindgen::prelude::*;
use gloo_timers::future::TimeoutFuture;
use wasm_bindgen::JsCast;
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

const DATASET: &str = "vector,count,entropy\n\
navigator.userAgent,120,0.10\n\
navigator.platform|navigator.userAgent,40,0.95\n";

fn host() -> PrivilegedHost {
    PrivilegedHost::new(DATASET, JsValue::UNDEFINED).unwrap()
}

fn request(host: &PrivilegedHost, json: &str) -> JsValue {
    host.handle_message(js_sys::JSON::parse(json).unwrap())
}

fn field(value: &JsValue, name: &str) -> JsValue {
    Reflect::get(value, &JsValue::from_str(name)).unwrap()
}

/// A `sendMessage` function that answers from `host` in the same realm.
fn send_message(host: PrivilegedHost) -> Function {
    let closure = Closure::wrap(
        Box::new(move |message: JsValue| host.handle_message(message)) as Box<dyn FnMut(JsValue) -> JsValue>,
    );
    let f: Function = closure.as_ref().unchecked_ref::<Function>().clone();
    closure.forget();
    f
}

/// A `subscribe` function registering listeners on `host`.
fn subscribe(host: PrivilegedHost) -> Function {
    let closure = Closure::wrap(
        Box::new(move |listener: Function| host.add_listener(listener)) as Box<dyn FnMut(Function)>,
    );
    let f: Function = closure.as_ref().unchecked_ref::<Function>().clone();
    closure.forget();
    f
}

fn quiet_config() -> JsValue {
    let config = GuardConfig {
        remove_denied_scripts: false,
        ..GuardConfig::default()
    };
    serde_wasm_bindgen::to_value(&config).unwrap()
}

fn navigator() -> JsValue {
    Reflect::get(&js_sys::global(), &JsValue::from_str("navigator")).unwrap()
}

fn navigator_prop(name: &str) -> JsValue {
    Reflect::get(&navigator(), &JsValue::from_str(name)).unwrap()
}

// ===== Privileged host =====

#[wasm_bindgen_test]
fn host_answers_settings_requests() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"random"}"#);
    let mode = request(&host, r#"{"type":"getMode"}"#);
    assert_eq!(field(&mode, "mode").as_string().as_deref(), Some("random"));

    let rejected = request(&host, r#"{"type":"setThreshold","threshold":1.5}"#);
    assert_eq!(field(&rejected, "type").as_string().as_deref(), Some("error"));

    let dataset = request(&host, r#"{"type":"getEntropyDataset"}"#);
    let entries = field(&dataset, "entries");
    assert_eq!(
        field(&entries, "navigator.userAgent").as_f64(),
        Some(0.10)
    );
}

#[wasm_bindgen_test]
fn host_rewrites_headers_only_in_random_mode() {
    let host = host();
    let headers = || {
        let pair = Array::of2(&"User-Agent".into(), &"Real/1.0".into());
        Array::of1(&pair).into()
    };

    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    let unchanged = host.rewrite_headers(headers()).unwrap();
    let first: Array = Array::from(&unchanged).get(0).unchecked_into();
    assert_eq!(first.get(1).as_string().as_deref(), Some("Real/1.0"));

    request(&host, r#"{"type":"setMode","mode":"random"}"#);
    let rewritten = host.rewrite_headers(headers()).unwrap();
    let first: Array = Array::from(&rewritten).get(0).unchecked_into();
    assert_ne!(first.get(1).as_string().as_deref(), Some("Real/1.0"));
}

// ===== Page monitor =====

#[wasm_bindgen_test]
async fn monitor_denies_once_combination_is_identifying() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":0.5}"#);
    let real_agent = navigator_prop("userAgent");

    let mut monitor = FingerprintMonitor::install(send_message(host), quiet_config(), None)
        .await
        .unwrap();
    assert!(monitor
        .installed_attributes()
        .iter()
        .any(|a| a == "navigator.userAgent"));

    // Known and cheap.
    assert_eq!(navigator_prop("userAgent"), real_agent);
    // userAgent + platform is identifying: withheld.
    assert!(navigator_prop("platform").is_undefined());

    let counts = monitor.get_access_counts();
    assert_eq!(field(&counts, "total").as_f64(), Some(1.0));
    assert!(monitor.get_log_text().lines().count() >= 2);

    assert!(monitor.uninstall() > 0);
    assert!(!navigator_prop("platform").is_undefined());
}

#[wasm_bindgen_test]
async fn monitor_substitutes_in_random_mode() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"random"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":0.05}"#);
    let identity = request(&host, r#"{"type":"getRandomProfile"}"#);
    let spoofed_agent = field(&field(&identity, "profile"), "userAgent");

    let mut monitor = FingerprintMonitor::install(send_message(host), quiet_config(), None)
        .await
        .unwrap();
    assert_eq!(monitor.get_mode(), "random");

    assert_eq!(navigator_prop("userAgent"), spoofed_agent);

    monitor.uninstall();
}

#[wasm_bindgen_test]
async fn threshold_change_applies_without_reinstall() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":0.05}"#);
    let real_agent = navigator_prop("userAgent");

    let mut monitor = FingerprintMonitor::install(send_message(host), quiet_config(), None)
        .await
        .unwrap();
    assert!(navigator_prop("userAgent").is_undefined());

    monitor.set_threshold(0.5).unwrap();
    assert_eq!(monitor.get_threshold(), 0.5);
    assert_eq!(navigator_prop("userAgent"), real_agent);
    assert!(monitor.set_threshold(-0.1).is_err());

    monitor.uninstall();
}

#[wasm_bindgen_test]
async fn failed_exchange_installs_nothing() {
    let failing = Function::new_no_args("return Promise.reject('no receiver')");
    let before = navigator_prop("userAgent");

    let result = FingerprintMonitor::install(failing, quiet_config(), None).await;
    assert!(result.is_err());
    assert_eq!(navigator_prop("userAgent"), before);
}

#[wasm_bindgen_test]
async fn pushed_threshold_reaches_messaging_monitor() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":0.05}"#);
    let real_agent = navigator_prop("userAgent");

    let mut monitor = FingerprintMonitor::install(
        send_message(host.clone()),
        quiet_config(),
        Some(subscribe(host.clone())),
    )
    .await
    .unwrap();
    assert!(navigator_prop("userAgent").is_undefined());

    // The settings page moves the slider; no call on the monitor itself.
    request(&host, r#"{"type":"setThreshold","threshold":0.5}"#);
    assert_eq!(monitor.get_threshold(), 0.5);
    assert_eq!(navigator_prop("userAgent"), real_agent);

    monitor.uninstall();
}

#[wasm_bindgen_test]
async fn getter_only_members_stay_read_only() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":1.0}"#);
    let real_agent = navigator_prop("userAgent");

    let mut monitor = FingerprintMonitor::install(send_message(host), quiet_config(), None)
        .await
        .unwrap();
    assert!(monitor
        .installed_attributes()
        .iter()
        .any(|a| a == "navigator.userAgent"));

    let _ = Reflect::set(&navigator(), &"userAgent".into(), &"Forged/1.0".into());
    assert_eq!(navigator_prop("userAgent"), real_agent);

    monitor.uninstall();
}

#[wasm_bindgen_test]
async fn non_configurable_constants_are_left_alone() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":0.0}"#);
    let prototype = Reflect::get(
        &Reflect::get(&js_sys::global(), &"WebGLRenderingContext".into()).unwrap(),
        &"prototype".into(),
    )
    .unwrap();

    let mut monitor = FingerprintMonitor::install(send_message(host), quiet_config(), None)
        .await
        .unwrap();
    assert!(!monitor
        .installed_attributes()
        .iter()
        .any(|a| a == "WebGLRenderingContext.DEPTH_BUFFER_BIT"));
    assert!(monitor
        .skipped_surfaces()
        .iter()
        .any(|s| s == "WebGLRenderingContext.DEPTH_BUFFER_BIT"));
    assert_eq!(
        Reflect::get(&prototype, &"DEPTH_BUFFER_BIT".into()).unwrap().as_f64(),
        Some(256.0)
    );

    monitor.uninstall();
}

#[wasm_bindgen_test]
async fn denied_script_element_is_removed() {
    let host = host();
    request(&host, r#"{"type":"setMode","mode":"entropy"}"#);
    request(&host, r#"{"type":"setThreshold","threshold":0.05}"#);

    let document = web_sys::window().unwrap().document().unwrap();
    let script: web_sys::HtmlScriptElement =
        document.create_element("script").unwrap().unchecked_into();
    script.set_src("/fp-tracker-under-test.js");
    document
        .document_element()
        .unwrap()
        .append_child(&script)
        .unwrap();
    let src = script.src();

    // Default config: denied scripts are removed.
    let mut monitor = FingerprintMonitor::install(send_message(host), JsValue::UNDEFINED, None)
        .await
        .unwrap();

    // The appended element is the last <script>, so the read is attributed to it.
    assert!(navigator_prop("userAgent").is_undefined());
    assert!(monitor.get_log_text().contains(&src));

    TimeoutFuture::new(20).await;
    assert!(!script.is_connected());

    monitor.uninstall();
}
