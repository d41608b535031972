//! JSON-Schema helpers: Gemini parameter translation and canonical JSON.

use serde_json::{Map, Value, json};
pub use tooldrive_core::message::canonical_json;

const ALLOWED_KEYS: [&str; 8] = [
    "type",
    "description",
    "enum",
    "items",
    "properties",
    "required",
    "nullable",
    "format",
];

fn empty_object() -> Value {
    json!({"type": "OBJECT", "properties": {}})
}

fn map_type(t: &str) -> &'static str {
    match t.trim().to_ascii_lowercase().as_str() {
        "string" => "STRING",
        "number" => "NUMBER",
        "integer" => "INTEGER",
        "boolean" => "BOOLEAN",
        "array" => "ARRAY",
        "object" => "OBJECT",
        "null" => "NULL",
        _ => "TYPE_UNSPECIFIED",
    }
}

fn is_null_schema(v: &Value) -> bool {
    match v.get("type") {
        Some(Value::String(t)) => t.eq_ignore_ascii_case("null"),
        Some(Value::Array(ts)) => ts
            .iter()
            .any(|t| t.as_str().is_some_and(|s| s.eq_ignore_ascii_case("null"))),
        _ => false,
    }
}

/// Fold `type: [T, "null"]` and `anyOf/oneOf: [T, {type: null}]` into `T` plus a nullable flag.
fn collapse_nullable(mut schema: Map<String, Value>) -> (Map<String, Value>, bool) {
    let mut nullable = false;

    if let Some(Value::Array(types)) = schema.get("type").cloned() {
        let names: Vec<String> = types
            .iter()
            .filter_map(|t| t.as_str().map(String::from))
            .collect();
        if names.iter().any(|t| t.eq_ignore_ascii_case("null")) {
            nullable = true;
            let first = names
                .into_iter()
                .find(|t| !t.eq_ignore_ascii_case("null"))
                .unwrap_or_else(|| "null".to_string());
            schema.insert("type".into(), Value::String(first));
        }
    }

    for key in ["anyOf", "oneOf"] {
        let Some(Value::Array(variants)) = schema.get(key).cloned() else {
            continue;
        };
        if variants.is_empty() {
            continue;
        }
        let non_null: Vec<&Value> = variants.iter().filter(|v| !is_null_schema(v)).collect();
        if non_null.len() == variants.len() || non_null.len() != 1 {
            continue;
        }
        let Some(base) = non_null[0].as_object() else {
            continue;
        };
        nullable = true;
        let mut base = base.clone();
        for inherited in ["description", "enum", "format"] {
            if let Some(v) = schema.get(inherited) {
                base.entry(inherited.to_string()).or_insert_with(|| v.clone());
            }
        }
        schema.remove(key);
        for (k, v) in base {
            schema.insert(k, v);
        }
        break;
    }

    (schema, nullable)
}

fn sanitize_node(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };

    let src: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| {
            !k.starts_with('$') && *k != "additionalProperties" && *k != "additional_properties"
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let (src, nullable_from_union) = collapse_nullable(src);

    let mut dst = Map::new();
    let ty = match src.get("type") {
        Some(Value::String(t)) => map_type(t),
        None if src.contains_key("properties") => "OBJECT",
        None if src.contains_key("items") => "ARRAY",
        _ => "TYPE_UNSPECIFIED",
    };
    dst.insert("type".into(), Value::String(ty.into()));

    if src.get("nullable") == Some(&Value::Bool(true)) || nullable_from_union {
        dst.insert("nullable".into(), Value::Bool(true));
    }

    for key in ["description", "format"] {
        if let Some(Value::String(s)) = src.get(key) {
            if !s.is_empty() {
                dst.insert(key.into(), Value::String(s.clone()));
            }
        }
    }

    if let Some(Value::Array(values)) = src.get("enum") {
        if !values.is_empty() {
            dst.insert("enum".into(), Value::Array(values.clone()));
        }
    }

    if let Some(Value::Array(req)) = src.get("required") {
        let names: Vec<Value> = req
            .iter()
            .filter_map(|r| match r {
                Value::String(s) => Some(Value::String(s.clone())),
                Value::Number(n) => Some(Value::String(n.to_string())),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            dst.insert("required".into(), Value::Array(names));
        }
    }

    if let Some(Value::Object(props)) = src.get("properties") {
        let cleaned: Map<String, Value> = props
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.clone(), sanitize_node(v)))
            .collect();
        dst.insert("properties".into(), Value::Object(cleaned));
    }

    match src.get("items") {
        Some(items @ Value::Object(_)) => {
            dst.insert("items".into(), sanitize_node(items));
        }
        Some(Value::Array(list)) => {
            let first = list
                .first()
                .map(sanitize_node)
                .unwrap_or_else(|| json!({"type": "STRING"}));
            dst.insert("items".into(), first);
        }
        _ => {}
    }

    dst.retain(|k, _| ALLOWED_KEYS.contains(&k.as_str()));
    Value::Object(dst)
}

/// Tool parameters as a JSON-Schema object; anything else becomes an empty object schema.
pub fn object_schema_or_empty(params: &Value) -> Value {
    let is_object_schema = params
        .as_object()
        .is_some_and(|o| o.get("type").is_none_or(|t| t.as_str() == Some("object")));
    if is_object_schema {
        params.clone()
    } else {
        json!({"type": "object", "properties": {}})
    }
}

/// Translate a JSON-Schema parameters object into Gemini's dialect. Never fails.
pub fn sanitize_gemini_parameters(params: &Value) -> Value {
    if !params.as_object().is_some_and(|o| !o.is_empty()) {
        return empty_object();
    }
    let mut out = sanitize_node(params);
    if out.get("type").and_then(Value::as_str) != Some("OBJECT") {
        return empty_object();
    }
    if !out.get("properties").is_some_and(Value::is_object) {
        if let Some(obj) = out.as_object_mut() {
            obj.insert("properties".into(), json!({}));
        }
    }
    out
}
