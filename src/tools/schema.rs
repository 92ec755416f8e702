//! 工具参数 JSON Schema：校验与生成
//!
//! validate_args 覆盖工具参数常用的子集（type / required / properties / additionalProperties / enum /
//! items / minLength / maxLength / minimum / maximum / minItems / maxItems），未知关键字忽略。
//! schema_for_args 用 schemars 从参数结构体派生 schema。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 从参数结构体生成 schema（schemars）
pub fn schema_for_args<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 注册时检查 schema：必须是 JSON 对象，若声明 type 则必须是 object
pub fn check_schema(schema: &Value) -> Result<(), String> {
    let obj = schema
        .as_object()
        .ok_or_else(|| "schema must be a JSON object".to_string())?;
    match obj.get("type") {
        None => Ok(()),
        Some(Value::String(t)) if t == "object" => Ok(()),
        Some(other) => Err(format!("top-level type must be \"object\", got {other}")),
    }
}

/// 校验工具参数；返回全部错误而不是第一个
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), Vec<String>> {
    if !args.is_object() {
        return Err(vec![format!(
            "arguments must be a JSON object, got {}",
            json_type_name(args)
        )]);
    }
    let mut errors = Vec::new();
    validate_value("$", args, schema, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_value(path: &str, value: &Value, schema: &Value, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(declared) = schema.get("type") {
        let allowed: Vec<&str> = match declared {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(|t| t.as_str()).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            errors.push(format!(
                "{path}: expected {}, got {}",
                allowed.join(" | "),
                json_type_name(value)
            ));
            return;
        }
    }

    if let Some(options) = schema.get("enum").and_then(|v| v.as_array()) {
        if !options.contains(value) {
            errors.push(format!("{path}: value {value} not in enum"));
        }
    }

    match value {
        Value::Object(map) => {
            if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
                for field in required.iter().filter_map(|f| f.as_str()) {
                    if !map.contains_key(field) {
                        errors.push(format!("{path}: missing required field '{field}'"));
                    }
                }
            }
            let properties = schema.get("properties").and_then(|v| v.as_object());
            if let Some(properties) = properties {
                for (name, prop_schema) in properties {
                    if let Some(v) = map.get(name) {
                        validate_value(&format!("{path}.{name}"), v, prop_schema, errors);
                    }
                }
            }
            match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    for key in map.keys() {
                        if !properties.is_some_and(|p| p.contains_key(key)) {
                            errors.push(format!("{path}: unexpected field '{key}'"));
                        }
                    }
                }
                Some(extra @ Value::Object(_)) => {
                    for (key, v) in map {
                        if !properties.is_some_and(|p| p.contains_key(key)) {
                            validate_value(&format!("{path}.{key}"), v, extra, errors);
                        }
                    }
                }
                _ => {}
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(|v| v.as_u64()) {
                if (items.len() as u64) < min {
                    errors.push(format!("{path}: expected at least {min} items, got {}", items.len()));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(|v| v.as_u64()) {
                if (items.len() as u64) > max {
                    errors.push(format!("{path}: expected at most {max} items, got {}", items.len()));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_value(&format!("{path}[{i}]"), item, item_schema, errors);
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(|v| v.as_u64()) {
                if len < min {
                    errors.push(format!("{path}: length {len} < minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(|v| v.as_u64()) {
                if len > max {
                    errors.push(format!("{path}: length {len} > maximum {max}"));
                }
            }
        }
        Value::Number(n) => {
            let Some(x) = n.as_f64() else {
                return;
            };
            if let Some(min) = schema.get("minimum").and_then(|v| v.as_f64()) {
                if x < min {
                    errors.push(format!("{path}: {x} < minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(|v| v.as_f64()) {
                if x > max {
                    errors.push(format!("{path}: {x} > maximum {max}"));
                }
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
