//! JSON <-> JavaScript value conversions
//!
//! | JSON    | JavaScript |
//! |---------|------------|
//! | null    | null       |
//! | boolean | Boolean    |
//! | number  | Number     |
//! | string  | String     |
//! | array   | Array      |
//! | object  | Object     |
//!
//! `undefined`, symbols and functions become `null`; symbol keys are skipped.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context, JsResult,
};
use jsrender_core::EngineError;
use serde_json::Value;

fn backend(message: String) -> EngineError {
    EngineError::Backend(message)
}

pub fn json_to_js_value(json: &Value, ctx: &mut Context) -> Result<JsValue, EngineError> {
    match json {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::new(*b)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(JsValue::new)
            .or_else(|| n.as_f64().map(JsValue::new))
            .ok_or_else(|| backend(format!("Number {} is out of range", n))),
        Value::String(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        Value::Array(items) => {
            let array = JsArray::new(ctx);
            for item in items {
                let value = json_to_js_value(item, ctx)?;
                array
                    .push(value, ctx)
                    .map_err(|e| backend(format!("Failed to build array: {}", e)))?;
            }
            Ok(array.into())
        }
        Value::Object(map) => {
            let object = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in map {
                let value = json_to_js_value(value, ctx)?;
                object
                    .create_data_property_or_throw(js_string!(key.as_str()), value, ctx)
                    .map_err(|e| backend(format!("Failed to set property '{}': {}", key, e)))?;
            }
            Ok(object.into())
        }
    }
}

pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> JsResult<Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(Value::Bool(b));
    }
    if let JsValue::Integer(i) = *value {
        return Ok(Value::from(i));
    }
    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
            return Ok(Value::from(n as i64));
        }
        // NaN and the infinities serialize to null, as in JSON.stringify
        return Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if let Some(s) = value.as_string() {
        return Ok(Value::String(s.to_std_string_escaped()));
    }

    let object = match value.as_object() {
        Some(object) if !object.is_callable() => object,
        _ => return Ok(Value::Null),
    };

    if object.is_array() {
        let array = JsArray::from_object(object.clone())?;
        let length = array.length(ctx)? as usize;
        let mut items = Vec::with_capacity(length);
        for index in 0..length {
            let item = array.get(index, ctx)?;
            items.push(js_value_to_json(&item, ctx)?);
        }
        return Ok(Value::Array(items));
    }

    let mut map = serde_json::Map::new();
    for key in object.own_property_keys(ctx)? {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let property = object.get(key, ctx)?;
        if property.is_undefined() {
            continue;
        }
        map.insert(name, js_value_to_json(&property, ctx)?);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    #[test]
    fn test_json_survives_the_engine() {
        let mut ctx = Context::default();
        let input = json!({ "name": "Ada", "tags": ["a", "b"], "n": 3, "ok": true, "none": null });
        let value = json_to_js_value(&input, &mut ctx).unwrap();
        assert_eq!(js_value_to_json(&value, &mut ctx).unwrap(), input);
    }

    #[test]
    fn test_non_json_values_become_null() {
        let mut ctx = Context::default();
        for code in ["undefined", "(function () {})", "Symbol('x')", "NaN"] {
            let value = ctx.eval(Source::from_bytes(code)).unwrap();
            assert_eq!(js_value_to_json(&value, &mut ctx).unwrap(), Value::Null, "{}", code);
        }
    }

    #[test]
    fn test_undefined_properties_are_skipped() {
        let mut ctx = Context::default();
        let value = ctx
            .eval(Source::from_bytes("({ a: 1, b: undefined, c: 'x' })"))
            .unwrap();
        assert_eq!(
            js_value_to_json(&value, &mut ctx).unwrap(),
            json!({ "a": 1, "c": "x" })
        );
    }
}
