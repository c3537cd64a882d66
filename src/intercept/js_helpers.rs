//! Proxy and Reflect wrappers used by the browser interceptor.
//!
//! Trap bodies are WASM closures wrapped in a `Proxy` around the original
//! accessor or method, so `toString()` and `length` still report the
//! original function.

use js_sys::{Array, Function, Object, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use crate::profile::SpoofValue;

pub type ApplyTrap = Closure<dyn FnMut(JsValue, JsValue, JsValue) -> Result<JsValue, JsValue>>;

/// Box a Rust closure as a Proxy `apply` trap.
pub fn apply_trap<F>(trap: F) -> ApplyTrap
where
    F: FnMut(JsValue, JsValue, JsValue) -> Result<JsValue, JsValue> + 'static,
{
    Closure::wrap(Box::new(trap) as Box<dyn FnMut(JsValue, JsValue, JsValue) -> Result<JsValue, JsValue>>)
}

/// Get a property from the global scope.
pub fn get_global(prop: &str) -> Result<JsValue, JsValue> {
    Reflect::get(&js_sys::global(), &JsValue::from_str(prop))
}

/// Get a global constructor's prototype, e.g. `HTMLCanvasElement.prototype`.
pub fn get_prototype(constructor_name: &str) -> Result<JsValue, JsValue> {
    let ctor = get_global(constructor_name)?;
    if ctor.is_undefined() || ctor.is_null() {
        return Ok(JsValue::UNDEFINED);
    }
    Reflect::get(&ctor, &JsValue::from_str("prototype"))
}

fn object_prototype() -> Result<JsValue, JsValue> {
    get_prototype("Object")
}

/// Find the own property descriptor for `member` on `obj` or its prototype
/// chain. Returns the descriptor and whether it is own to `obj`.
pub fn find_descriptor(obj: &JsValue, member: &str) -> Option<(Object, bool)> {
    let key = JsValue::from_str(member);
    let mut current = obj.clone();
    let mut own = true;
    while current.is_object() {
        let descriptor =
            Object::get_own_property_descriptor(current.unchecked_ref::<Object>(), &key);
        if !descriptor.is_undefined() {
            return Some((descriptor.unchecked_into(), own));
        }
        current = Object::get_prototype_of(&current).into();
        own = false;
    }
    None
}

/// Names enumerable with `for...in` whose values are not functions.
/// Accessors are classified from their descriptor, without invoking getters.
pub fn enumerable_properties(obj: &JsValue) -> Result<Vec<String>, JsValue> {
    let stop = object_prototype()?;
    let mut names: Vec<String> = Vec::new();
    let mut current = obj.clone();

    while current.is_object() && !Object::is(&current, &stop) {
        let current_obj: &Object = current.unchecked_ref();
        for key in Object::keys(current_obj).iter() {
            let Some(name) = key.as_string() else { continue };
            if names.contains(&name) {
                continue;
            }
            let descriptor = Object::get_own_property_descriptor(current_obj, &key);
            let value = Reflect::get(&descriptor, &JsValue::from_str("value"))?;
            if value.is_function() {
                continue;
            }
            names.push(name);
        }
        current = Object::get_prototype_of(&current).into();
    }
    Ok(names)
}

/// `Object.defineProperty(obj, prop, descriptor)`, with exceptions returned
/// as `Err` instead of trapping.
pub fn define_property(obj: &JsValue, prop: &str, descriptor: &Object) -> Result<(), JsValue> {
    let object_ctor = get_global("Object")?;
    let define: Function = Reflect::get(&object_ctor, &JsValue::from_str("defineProperty"))?
        .dyn_into()
        .map_err(|_| JsValue::from_str("Object.defineProperty not found"))?;
    let args = Array::of3(obj, &JsValue::from_str(prop), descriptor);
    Reflect::apply(&define, &JsValue::UNDEFINED, &args)?;
    Ok(())
}

/// Define a configurable accessor with the given getter and setter.
pub fn define_accessor(
    obj: &JsValue,
    prop: &str,
    getter: &JsValue,
    setter: &JsValue,
    enumerable: bool,
) -> Result<(), JsValue> {
    let descriptor = Object::new();
    Reflect::set(&descriptor, &JsValue::from_str("get"), getter)?;
    Reflect::set(&descriptor, &JsValue::from_str("set"), setter)?;
    Reflect::set(&descriptor, &JsValue::from_str("configurable"), &JsValue::TRUE)?;
    Reflect::set(
        &descriptor,
        &JsValue::from_str("enumerable"),
        &JsValue::from_bool(enumerable),
    )?;
    define_property(obj, prop, &descriptor)
}

/// Wrap `target` in a `Proxy` with an `apply` trap receiving
/// `(target, thisArg, argumentsList)`.
pub fn proxy_function_with_apply(target: &JsValue, apply_trap: ApplyTrap) -> Result<JsValue, JsValue> {
    let handler = Object::new();
    Reflect::set(&handler, &JsValue::from_str("apply"), apply_trap.as_ref())?;
    apply_trap.forget();

    let proxy_ctor: Function = get_global("Proxy")?
        .dyn_into()
        .map_err(|_| JsValue::from_str("Proxy not found"))?;
    let args = Array::of2(target, &handler);
    Reflect::construct(&proxy_ctor, &args)
}

/// A plain function returning `value`, used as the proxy target for data
/// properties that have no native getter.
pub fn constant_function(value: JsValue) -> JsValue {
    let getter = Closure::wrap(Box::new(move || -> JsValue { value.clone() }) as Box<dyn FnMut() -> JsValue>);
    let f: JsValue = getter.as_ref().clone();
    getter.forget();
    f
}

/// A function that ignores its arguments, used as a setter target for
/// read-only properties.
pub fn noop_function() -> JsValue {
    let noop = Closure::wrap(Box::new(|_value: JsValue| {}) as Box<dyn FnMut(JsValue)>);
    let f: JsValue = noop.as_ref().clone();
    noop.forget();
    f
}

/// Call a JS function with arguments via `Reflect.apply`.
pub fn call_function(func: &JsValue, this_arg: &JsValue, args: &JsValue) -> Result<JsValue, JsValue> {
    let func: &Function = func.unchecked_ref();
    Reflect::apply(func, this_arg, args.unchecked_ref())
}

/// Frozen JS array of strings.
pub fn frozen_string_array(items: &[String]) -> JsValue {
    let arr = Array::new();
    for item in items {
        arr.push(&JsValue::from_str(item));
    }
    Object::freeze(&arr).into()
}

/// JS value for a substitute, keeping the replaced attribute's type.
pub fn spoof_to_js(value: &SpoofValue) -> JsValue {
    match value {
        SpoofValue::Null => JsValue::NULL,
        SpoofValue::Bool(b) => JsValue::from_bool(*b),
        SpoofValue::Number(n) => JsValue::from_f64(*n),
        SpoofValue::Text(s) => JsValue::from_str(s),
        SpoofValue::List(items) => frozen_string_array(items),
    }
}

/// `Promise.resolve(value)`.
pub fn resolved(value: &JsValue) -> JsValue {
    js_sys::Promise::resolve(value).into()
}

/// Plain object from string/value pairs.
pub fn object_from(pairs: &[(&str, JsValue)]) -> Result<JsValue, JsValue> {
    let obj = Object::new();
    for (key, value) in pairs {
        Reflect::set(&obj, &JsValue::from_str(key), value)?;
    }
    Ok(obj.into())
}
