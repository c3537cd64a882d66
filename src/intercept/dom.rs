//! Browser implementation of [`Interceptor`].
//!
//! Property traps replace the member with a configurable accessor whose
//! getter and setter are proxies around the originals. A member without a
//! setter stays read-only, and non-configurable members are left alone.
//! Method traps proxy the original function. Every trap swallows its own
//! failures: a page script only ever sees the real behaviour, an absent
//! value, or a substitute.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use js_sys::{Array, Object, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use super::js_helpers;
use super::{
    font_check_answer, webgl_parameter_attribute, AccessGate, Holder, Interceptor, Trap, TrapKind,
};
use crate::attribute::AttributeId;
use crate::error::{GuardError, Result};
use crate::ledger::ScriptOrigin;
use crate::policy::Resolution;
use crate::profile::{attrs, SpoofValue};

/// Page-wide state shared by every trap closure.
struct PageContext {
    page_url: String,
    remove_denied_scripts: bool,
    scheduled: RefCell<HashSet<ScriptOrigin>>,
}

impl PageContext {
    /// `document.currentScript`, else the last `<script>` element, else
    /// the page itself.
    fn resolve_origin(&self) -> ScriptOrigin {
        ScriptOrigin::resolve(current_script_src().as_deref(), &self.page_url)
    }

    /// Best-effort removal of the denied origin's `<script>` elements, on a
    /// later task so the current access returns first.
    fn schedule_removal(&self, origin: &ScriptOrigin) {
        if !self.remove_denied_scripts || origin.as_str() == self.page_url {
            return;
        }
        if !self.scheduled.borrow_mut().insert(origin.clone()) {
            return;
        }
        let src = origin.as_str().to_string();
        gloo_timers::callback::Timeout::new(0, move || {
            let removed = remove_scripts_with_src(&src);
            log::debug!("Removed {} <script> element(s) for {}", removed, src);
        })
        .forget();
    }
}

fn current_script_src() -> Option<String> {
    let document = web_sys::window()?.document()?;
    if let Some(script) = document.current_script() {
        if let Ok(script) = script.dyn_into::<web_sys::HtmlScriptElement>() {
            return Some(script.src());
        }
    }
    let scripts = document.get_elements_by_tag_name("script");
    let last = scripts.item(scripts.length().checked_sub(1)?)?;
    let script: web_sys::HtmlScriptElement = last.dyn_into().ok()?;
    Some(script.src())
}

fn remove_scripts_with_src(src: &str) -> usize {
    let Some(document) = web_sys::window().and_then(|w| w.document()) else {
        return 0;
    };
    let scripts = document.get_elements_by_tag_name("script");
    let matching: Vec<web_sys::Element> = (0..scripts.length())
        .filter_map(|i| scripts.item(i))
        .filter(|el| {
            el.dyn_ref::<web_sys::HtmlScriptElement>()
                .map_or(false, |s| s.src() == src)
        })
        .collect();
    for el in &matching {
        el.remove();
    }
    matching.len()
}

enum Restore {
    /// Put the original own descriptor back.
    Descriptor(JsValue, String, Object),
    /// The trap shadowed an inherited member; delete it.
    Delete(JsValue, String),
    /// Reassign the original method.
    Method(JsValue, String, JsValue),
}

/// Installs traps on the live page.
pub struct DomInterceptor {
    page: Rc<PageContext>,
    installed: Vec<Restore>,
}

impl DomInterceptor {
    pub fn new(page_url: impl Into<String>, remove_denied_scripts: bool) -> Self {
        Self {
            page: Rc::new(PageContext {
                page_url: page_url.into(),
                remove_denied_scripts,
                scheduled: RefCell::new(HashSet::new()),
            }),
            installed: Vec::new(),
        }
    }

    /// Uses `window.location.href` as the page URL.
    pub fn for_current_page(remove_denied_scripts: bool) -> Result<Self> {
        let href = web_sys::window()
            .ok_or_else(|| GuardError::SurfaceUnavailable("window".into()))?
            .location()
            .href()
            .map_err(|e| GuardError::SurfaceUnavailable(format!("location.href: {:?}", e)))?;
        Ok(Self::new(href, remove_denied_scripts))
    }

    pub fn page_url(&self) -> &str {
        &self.page.page_url
    }

    fn holder_object(holder: &Holder) -> Result<JsValue> {
        let obj = match holder {
            Holder::Global(name) => js_helpers::get_global(name),
            Holder::Prototype(name) => js_helpers::get_prototype(name),
        }
        .map_err(|_| GuardError::SurfaceUnavailable(holder.name().to_string()))?;
        if obj.is_object() {
            Ok(obj)
        } else {
            Err(GuardError::SurfaceUnavailable(holder.name().to_string()))
        }
    }

    fn install_property(&mut self, obj: JsValue, trap: &Trap, gate: Rc<AccessGate>) -> Result<()> {
        let (descriptor, own) = js_helpers::find_descriptor(&obj, &trap.member)
            .ok_or_else(|| GuardError::SurfaceUnavailable(trap.attribute.to_string()))?;
        let failed = |e: JsValue| GuardError::TrapInstallFailed {
            attribute: trap.attribute.to_string(),
            reason: format!("{:?}", e),
        };

        let field = |name: &str| Reflect::get(&descriptor, &JsValue::from_str(name)).unwrap_or(JsValue::UNDEFINED);
        // Redefining a non-configurable own member throws; leave it untouched.
        if own && field("configurable").as_bool() == Some(false) {
            return Err(failed(JsValue::from_str("not configurable")));
        }
        let original_get = field("get");
        let original_set = field("set");
        let enumerable = field("enumerable").as_bool().unwrap_or(true);
        let has_native_setter = original_set.is_function();
        // Only a writable data property accepts writes without a native
        // setter; they land in `shadow`. Getter-only accessors stay read-only.
        let writable_data = !original_get.is_function()
            && !has_native_setter
            && field("writable").as_bool().unwrap_or(false);

        let shadow: Rc<RefCell<Option<JsValue>>> = Rc::new(RefCell::new(None));
        let get_target = if original_get.is_function() {
            original_get
        } else {
            js_helpers::constant_function(field("value"))
        };

        let getter = {
            let page = self.page.clone();
            let gate = gate.clone();
            let attribute = trap.attribute.clone();
            let shadow = shadow.clone();
            let apply = js_helpers::apply_trap(
                move |target: JsValue, this: JsValue, args: JsValue| {
                    let origin = page.resolve_origin();
                    match gate.read(&attribute, &origin) {
                        Resolution::Real => match shadow.borrow().as_ref() {
                            Some(written) => Ok(written.clone()),
                            None => js_helpers::call_function(&target, &this, &args),
                        },
                        Resolution::Absent => {
                            page.schedule_removal(&origin);
                            Ok(JsValue::UNDEFINED)
                        }
                        Resolution::Substitute(value) => Ok(js_helpers::spoof_to_js(&value)),
                    }
                },
            );
            js_helpers::proxy_function_with_apply(&get_target, apply).map_err(failed)?
        };

        let setter = if has_native_setter || writable_data {
            let page = self.page.clone();
            let attribute = trap.attribute.clone();
            let set_target = if has_native_setter {
                original_set
            } else {
                js_helpers::noop_function()
            };
            let apply = js_helpers::apply_trap(
                move |target: JsValue, this: JsValue, args: JsValue| {
                    let origin = page.resolve_origin();
                    if !gate.write(&attribute, &origin) {
                        page.schedule_removal(&origin);
                        return Ok(JsValue::UNDEFINED);
                    }
                    if has_native_setter {
                        js_helpers::call_function(&target, &this, &args)
                    } else {
                        let value = args.unchecked_ref::<Array>().get(0);
                        *shadow.borrow_mut() = Some(value);
                        Ok(JsValue::UNDEFINED)
                    }
                },
            );
            js_helpers::proxy_function_with_apply(&set_target, apply).map_err(failed)?
        } else {
            JsValue::UNDEFINED
        };

        js_helpers::define_accessor(&obj, &trap.member, &getter, &setter, enumerable)
            .map_err(failed)?;

        self.installed.push(if own {
            Restore::Descriptor(obj, trap.member.clone(), descriptor)
        } else {
            Restore::Delete(obj, trap.member.clone())
        });
        Ok(())
    }

    fn install_method(&mut self, obj: JsValue, trap: &Trap, gate: Rc<AccessGate>) -> Result<()> {
        let key = JsValue::from_str(&trap.member);
        let original = Reflect::get(&obj, &key)
            .ok()
            .filter(|f| f.is_function())
            .ok_or_else(|| GuardError::SurfaceUnavailable(trap.attribute.to_string()))?;

        let page = self.page.clone();
        let kind = trap.kind;
        let context_name = trap.holder.name();
        let fixed_attribute = trap.attribute.clone();
        let apply = js_helpers::apply_trap(
            move |target: JsValue, this: JsValue, args: JsValue| {
                let arguments: &Array = args.unchecked_ref();
                let attribute = if kind == TrapKind::Parameter {
                    let pname = arguments.get(0).as_f64().unwrap_or(-1.0);
                    match webgl_parameter_attribute(context_name, pname as u32) {
                        Some(attribute) => attribute,
                        None => return js_helpers::call_function(&target, &this, &args),
                    }
                } else {
                    fixed_attribute.clone()
                };

                let origin = page.resolve_origin();
                match gate.call(&attribute, &origin) {
                    Resolution::Real => js_helpers::call_function(&target, &this, &args),
                    Resolution::Absent => {
                        page.schedule_removal(&origin);
                        Ok(absent_result(kind))
                    }
                    Resolution::Substitute(value) => {
                        Ok(substitute_result(&attribute, &value, arguments, kind)
                            .unwrap_or(JsValue::UNDEFINED))
                    }
                }
            },
        );
        let proxied = js_helpers::proxy_function_with_apply(&original, apply).map_err(|e| {
            GuardError::TrapInstallFailed {
                attribute: trap.attribute.to_string(),
                reason: format!("{:?}", e),
            }
        })?;
        Reflect::set(&obj, &key, &proxied).map_err(|e| GuardError::TrapInstallFailed {
            attribute: trap.attribute.to_string(),
            reason: format!("{:?}", e),
        })?;

        self.installed
            .push(Restore::Method(obj, trap.member.clone(), original));
        Ok(())
    }
}

/// What a denied call returns: the method is never invoked, and async
/// methods still hand back a Promise.
fn absent_result(kind: TrapKind) -> JsValue {
    if kind == TrapKind::AsyncMethod {
        js_helpers::resolved(&JsValue::UNDEFINED)
    } else {
        JsValue::UNDEFINED
    }
}

/// Shape a substitute like the real method's result.
fn substitute_result(
    attribute: &AttributeId,
    value: &SpoofValue,
    arguments: &Array,
    kind: TrapKind,
) -> std::result::Result<JsValue, JsValue> {
    let result = match attribute.as_str() {
        attrs::STORAGE_ESTIMATE => js_helpers::object_from(&[
            ("quota", js_helpers::spoof_to_js(value)),
            ("usage", JsValue::from_f64(0.0)),
        ])?,
        attrs::PERMISSIONS_QUERY => {
            let name = Reflect::get(&arguments.get(0), &JsValue::from_str("name"))
                .unwrap_or(JsValue::UNDEFINED);
            js_helpers::object_from(&[("name", name), ("state", js_helpers::spoof_to_js(value))])?
        }
        attrs::FONTS_CHECK => {
            let spec = arguments.get(0).as_string().unwrap_or_default();
            let fonts = value.as_list().unwrap_or(&[]);
            JsValue::from_bool(font_check_answer(fonts, &spec))
        }
        _ => js_helpers::spoof_to_js(value),
    };
    Ok(if kind == TrapKind::AsyncMethod {
        js_helpers::resolved(&result)
    } else {
        result
    })
}

impl Interceptor for DomInterceptor {
    fn list_properties(&self, holder: &Holder) -> Result<Vec<String>> {
        let obj = Self::holder_object(holder)?;
        js_helpers::enumerable_properties(&obj)
            .map_err(|e| GuardError::SurfaceUnavailable(format!("{}: {:?}", holder.name(), e)))
    }

    fn install(&mut self, trap: &Trap, gate: Rc<AccessGate>) -> Result<()> {
        let obj = Self::holder_object(&trap.holder)?;
        match trap.kind {
            TrapKind::Property => self.install_property(obj, trap, gate),
            TrapKind::Method | TrapKind::AsyncMethod | TrapKind::Parameter => {
                self.install_method(obj, trap, gate)
            }
        }
    }

    fn attribute(&self) -> ScriptOrigin {
        self.page.resolve_origin()
    }

    fn restore(&mut self) -> usize {
        let mut restored = 0;
        for entry in self.installed.drain(..).rev() {
            let result = match &entry {
                Restore::Descriptor(obj, member, descriptor) => {
                    js_helpers::define_property(obj, member, descriptor)
                }
                Restore::Delete(obj, member) => {
                    Reflect::delete_property(obj.unchecked_ref::<Object>(), &JsValue::from_str(member))
                        .map(|_| ())
                }
                Restore::Method(obj, member, original) => {
                    Reflect::set(obj, &JsValue::from_str(member), original).map(|_| ())
                }
            };
            match result {
                Ok(()) => restored += 1,
                Err(e) => log::warn!("Restore failed: {:?}", e),
            }
        }
        restored
    }
}
