//! Conversions between [`rhai::Dynamic`] and [`Value`].

use std::collections::BTreeMap;

use rhai::{Dynamic, Map};

use crate::hooks::HookResult;
use crate::types::Value;

/// Convert a Rhai Dynamic to our Value type.
pub fn dynamic_to_value(val: &Dynamic) -> Value {
    if val.is_unit() {
        Value::Null
    } else if val.is_bool() {
        Value::Bool(val.as_bool().unwrap_or(false))
    } else if val.is_int() {
        Value::Integer(val.as_int().unwrap_or(0))
    } else if val.is_float() {
        Value::Float(val.as_float().unwrap_or(0.0))
    } else if val.is_string() {
        Value::String(val.clone().into_string().unwrap_or_default())
    } else if val.is_char() {
        Value::String(val.as_char().map(String::from).unwrap_or_default())
    } else if val.is_array() {
        let arr = val.clone().into_array().unwrap_or_default();
        Value::Array(arr.iter().map(dynamic_to_value).collect())
    } else if val.is_map() {
        let map = val.clone().cast::<Map>();
        let obj: BTreeMap<String, Value> = map
            .into_iter()
            .map(|(k, v)| (k.to_string(), dynamic_to_value(&v)))
            .collect();
        Value::Object(obj)
    } else {
        Value::Null
    }
}

/// Convert our Value type to a Rhai Dynamic.
pub fn value_to_dynamic(val: &Value) -> Dynamic {
    match val {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Integer(i) => Dynamic::from(*i),
        Value::Float(f) => Dynamic::from(*f),
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => {
            let rhai_arr: rhai::Array = arr.iter().map(value_to_dynamic).collect();
            Dynamic::from(rhai_arr)
        }
        Value::Object(obj) => Dynamic::from(value_map_to_rhai(obj)),
    }
}

pub(crate) fn value_map_to_rhai(obj: &BTreeMap<String, Value>) -> Map {
    let mut map = Map::new();
    for (k, v) in obj {
        map.insert(k.as_str().into(), value_to_dynamic(v));
    }
    map
}

/// Interpret a handler's return value.
///
/// `()` is a plain success. A map carrying any of `stop_propagation`,
/// `prevent_default` or `value` is read as control flags; anything else is
/// the handler's return value.
pub(crate) fn dynamic_to_hook_result(result: Dynamic) -> HookResult {
    if result.is_unit() {
        return HookResult::ok();
    }

    if result.is_map() {
        let map = result.clone().cast::<Map>();
        let is_control = ["stop_propagation", "prevent_default", "value"]
            .iter()
            .any(|key| map.contains_key(*key));
        if is_control {
            let flag = |key: &str| map.get(key).and_then(|v| v.as_bool().ok()).unwrap_or(false);
            let mut hook_result = HookResult::ok();
            if flag("prevent_default") {
                hook_result = hook_result.prevent_default();
            }
            if flag("stop_propagation") {
                hook_result = hook_result.stop_propagation();
            }
            if let Some(val) = map.get("value") {
                hook_result.value = Some(dynamic_to_value(val));
            }
            return hook_result;
        }
    }

    HookResult::with_value(dynamic_to_value(&result))
}
