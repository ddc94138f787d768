//! Recursive validator over JSON-schema-like documents.
//!
//! Supports the subset used for input/output shaping: `type` (single or
//! list), `enum`, `anyOf`/`oneOf`/`allOf`, string length/pattern/format,
//! numeric bounds, array bounds/items, object properties/required/
//! additionalProperties. Compiled regexes are cached under the canonical
//! SHA-256 key of the schema document.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Validation failure; the message carries a JSON-pointer-like path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SchemaError(pub String);

/// A schema: either a JSON document or a host-side check function.
///
/// Check functions never cross the wire; spawn-safe façade modes reject
/// them at construction. On the wire a `Check` serializes as `null`.
#[derive(Clone)]
pub enum Schema {
    Doc(Json),
    Check(Arc<dyn Fn(&Json) -> Result<(), String> + Send + Sync>),
}

impl Schema {
    pub fn doc(value: Json) -> Self {
        Schema::Doc(value)
    }

    pub fn check<F>(f: F) -> Self
    where
        F: Fn(&Json) -> Result<(), String> + Send + Sync + 'static,
    {
        Schema::Check(Arc::new(f))
    }

    pub fn is_doc(&self) -> bool {
        matches!(self, Schema::Doc(_))
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Doc(v) => f.debug_tuple("Doc").field(v).finish(),
            Schema::Check(_) => f.write_str("Check(..)"),
        }
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Schema::Doc(a), Schema::Doc(b)) => a == b,
            (Schema::Check(a), Schema::Check(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Schema::Doc(v) => v.serialize(serializer),
            Schema::Check(_) => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Schema::Doc(Json::deserialize(deserializer)?))
    }
}

/// Validate `value` against `schema`, caching compiled artifacts by the
/// schema's canonical key.
pub fn validate_schema_cached(value: &Json, schema: &Schema) -> Result<(), SchemaError> {
    match schema {
        Schema::Check(f) => f(value).map_err(|e| SchemaError(format!("$: {e}"))),
        Schema::Doc(doc) => {
            let key = canonical_key(doc);
            validate_doc(value, doc, "$", &key)
        }
    }
}

/// Stable cache key: SHA-256 over the canonical (sorted-key) JSON form.
/// serde_json sorts object keys on `Value` serialization only when the map
/// preserves order; re-encode through `BTreeMap` ordering to be canonical.
pub fn canonical_key(doc: &Json) -> String {
    let canonical = canonical_string(doc);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_string(doc: &Json) -> String {
    match doc {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Json::from(k.as_str()),
                        canonical_string(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Json::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_string).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

fn regex_cache() -> &'static Mutex<HashMap<String, Arc<Regex>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Regex>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cached_regex(pattern: &str, cache_key: &str) -> Option<Arc<Regex>> {
    let key = format!("{cache_key}:{pattern}");
    let mut cache = regex_cache().lock().ok()?;
    if let Some(re) = cache.get(&key) {
        return Some(Arc::clone(re));
    }
    let re = Arc::new(Regex::new(pattern).ok()?);
    tracing::trace!(pattern, "Compiled schema regex");
    cache.insert(key, Arc::clone(&re));
    Some(re)
}

fn path_join(path: &str, part: &str) -> String {
    if part.starts_with('[') {
        format!("{path}{part}")
    } else {
        format!("{path}.{part}")
    }
}

fn validate_doc(value: &Json, schema: &Json, path: &str, cache_key: &str) -> Result<(), SchemaError> {
    if schema.is_null() {
        return Ok(());
    }
    let Json::Object(doc) = schema else {
        return Err(SchemaError(format!("{path}: invalid schema")));
    };

    if let Some(Json::Array(subs)) = doc.get("anyOf") {
        let mut last_err = None;
        for sub in subs {
            match validate_doc(value, sub, path, cache_key) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        return Err(last_err.unwrap_or_else(|| SchemaError(format!("{path}: anyOf failed"))));
    }

    if let Some(Json::Array(subs)) = doc.get("oneOf") {
        let matched = subs
            .iter()
            .filter(|sub| validate_doc(value, sub, path, cache_key).is_ok())
            .count();
        if matched != 1 {
            return Err(SchemaError(format!("{path}: oneOf failed")));
        }
    }

    if let Some(Json::Array(subs)) = doc.get("allOf") {
        for sub in subs {
            validate_doc(value, sub, path, cache_key)?;
        }
    }

    if let Some(Json::Array(options)) = doc.get("enum")
        && !options.contains(value)
    {
        return Err(SchemaError(format!("{path}: value not in enum")));
    }

    match doc.get("type") {
        None => Ok(()),
        Some(Json::Array(types)) => {
            let mut last = None;
            for t in types {
                let mut narrowed = doc.clone();
                narrowed.insert("type".into(), t.clone());
                match validate_doc(value, &Json::Object(narrowed), path, cache_key) {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| SchemaError(format!("{path}: type mismatch"))))
        }
        Some(Json::String(t)) => validate_typed(value, t, doc, path, cache_key),
        Some(_) => Err(SchemaError(format!("{path}: invalid schema"))),
    }
}

fn validate_typed(
    value: &Json,
    t: &str,
    doc: &serde_json::Map<String, Json>,
    path: &str,
    cache_key: &str,
) -> Result<(), SchemaError> {
    match t {
        "null" => {
            if !value.is_null() {
                return Err(SchemaError(format!("{path}: expected null")));
            }
            Ok(())
        }
        "boolean" => {
            if !value.is_boolean() {
                return Err(SchemaError(format!("{path}: expected boolean")));
            }
            Ok(())
        }
        "integer" => {
            // JSON booleans are never integers.
            if !(value.is_i64() || value.is_u64()) {
                return Err(SchemaError(format!("{path}: expected integer")));
            }
            check_number(value.as_f64().unwrap_or(0.0), doc, path)
        }
        "number" => {
            if !value.is_number() {
                return Err(SchemaError(format!("{path}: expected number")));
            }
            check_number(value.as_f64().unwrap_or(0.0), doc, path)
        }
        "string" => {
            let Json::String(s) = value else {
                return Err(SchemaError(format!("{path}: expected string")));
            };
            check_string(s, doc, path, cache_key)
        }
        "array" => {
            let Json::Array(items) = value else {
                return Err(SchemaError(format!("{path}: expected array")));
            };
            check_array(items, doc, path, cache_key)
        }
        "object" => {
            let Json::Object(map) = value else {
                return Err(SchemaError(format!("{path}: expected object")));
            };
            check_object(map, doc, path, cache_key)
        }
        _ => Ok(()),
    }
}

fn check_number(value: f64, doc: &serde_json::Map<String, Json>, path: &str) -> Result<(), SchemaError> {
    if let Some(min) = doc.get("minimum").and_then(Json::as_f64)
        && value < min
    {
        return Err(SchemaError(format!("{path}: below minimum")));
    }
    if let Some(max) = doc.get("maximum").and_then(Json::as_f64)
        && value > max
    {
        return Err(SchemaError(format!("{path}: above maximum")));
    }
    Ok(())
}

fn check_string(
    value: &str,
    doc: &serde_json::Map<String, Json>,
    path: &str,
    cache_key: &str,
) -> Result<(), SchemaError> {
    let len = value.chars().count() as u64;
    if let Some(min) = doc.get("minLength").and_then(Json::as_u64)
        && len < min
    {
        return Err(SchemaError(format!("{path}: too short")));
    }
    if let Some(max) = doc.get("maxLength").and_then(Json::as_u64)
        && len > max
    {
        return Err(SchemaError(format!("{path}: too long")));
    }
    if let Some(Json::String(pattern)) = doc.get("pattern") {
        match cached_regex(pattern, cache_key) {
            Some(re) => {
                if !re.is_match(value) {
                    return Err(SchemaError(format!("{path}: pattern mismatch")));
                }
            }
            None => return Err(SchemaError(format!("{path}: invalid pattern"))),
        }
    }
    if let Some(Json::String(fmt)) = doc.get("format") {
        match fmt.as_str() {
            "email" => {
                let re = cached_regex(r"^[^@]+@[^@]+\.[^@]+$", "format").ok_or_else(|| {
                    SchemaError(format!("{path}: invalid pattern"))
                })?;
                if !re.is_match(value) {
                    return Err(SchemaError(format!("{path}: invalid email")));
                }
            }
            "uuid" => {
                let re = cached_regex(
                    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
                    "format",
                )
                .ok_or_else(|| SchemaError(format!("{path}: invalid pattern")))?;
                if !re.is_match(value) {
                    return Err(SchemaError(format!("{path}: invalid uuid")));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_array(
    items: &[Json],
    doc: &serde_json::Map<String, Json>,
    path: &str,
    cache_key: &str,
) -> Result<(), SchemaError> {
    if let Some(min) = doc.get("minItems").and_then(Json::as_u64)
        && (items.len() as u64) < min
    {
        return Err(SchemaError(format!("{path}: too few items")));
    }
    if let Some(max) = doc.get("maxItems").and_then(Json::as_u64)
        && (items.len() as u64) > max
    {
        return Err(SchemaError(format!("{path}: too many items")));
    }
    if let Some(item_schema) = doc.get("items") {
        for (i, v) in items.iter().enumerate() {
            validate_doc(v, item_schema, &path_join(path, &format!("[{i}]")), cache_key)?;
        }
    }
    Ok(())
}

fn check_object(
    map: &serde_json::Map<String, Json>,
    doc: &serde_json::Map<String, Json>,
    path: &str,
    cache_key: &str,
) -> Result<(), SchemaError> {
    let empty = serde_json::Map::new();
    let props = match doc.get("properties") {
        Some(Json::Object(p)) => p,
        _ => &empty,
    };
    if let Some(Json::Array(required)) = doc.get("required") {
        for r in required {
            if let Json::String(name) = r
                && !map.contains_key(name)
            {
                return Err(SchemaError(format!(
                    "{}: missing required",
                    path_join(path, name)
                )));
            }
        }
    }
    let additional = doc
        .get("additionalProperties")
        .and_then(Json::as_bool)
        .unwrap_or(true);
    for (k, v) in map {
        if let Some(sub) = props.get(k) {
            validate_doc(v, sub, &path_join(path, k), cache_key)?;
        } else if !additional {
            return Err(SchemaError(format!(
                "{}: unexpected property",
                path_join(path, k)
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Json) -> Schema {
        Schema::doc(v)
    }

    #[test]
    fn type_checks() {
        assert!(validate_schema_cached(&json!(3), &doc(json!({"type": "integer"}))).is_ok());
        assert!(validate_schema_cached(&json!(3.5), &doc(json!({"type": "number"}))).is_ok());
        assert!(validate_schema_cached(&json!("x"), &doc(json!({"type": "string"}))).is_ok());
        assert!(validate_schema_cached(&json!(null), &doc(json!({"type": "null"}))).is_ok());
        assert!(validate_schema_cached(&json!([1]), &doc(json!({"type": "array"}))).is_ok());
        assert!(validate_schema_cached(&json!({}), &doc(json!({"type": "object"}))).is_ok());
    }

    #[test]
    fn boolean_is_not_an_integer_or_number() {
        assert!(validate_schema_cached(&json!(true), &doc(json!({"type": "integer"}))).is_err());
        assert!(validate_schema_cached(&json!(true), &doc(json!({"type": "number"}))).is_err());
        assert!(validate_schema_cached(&json!(true), &doc(json!({"type": "boolean"}))).is_ok());
    }

    #[test]
    fn numeric_bounds() {
        let s = doc(json!({"type": "integer", "minimum": 2, "maximum": 4}));
        assert!(validate_schema_cached(&json!(3), &s).is_ok());
        assert!(validate_schema_cached(&json!(1), &s).is_err());
        assert!(validate_schema_cached(&json!(5), &s).is_err());
    }

    #[test]
    fn string_pattern_and_formats() {
        let s = doc(json!({"type": "string", "pattern": "^a.+z$"}));
        assert!(validate_schema_cached(&json!("abcz"), &s).is_ok());
        assert!(validate_schema_cached(&json!("ab"), &s).is_err());

        let email = doc(json!({"type": "string", "format": "email"}));
        assert!(validate_schema_cached(&json!("a@b.com"), &email).is_ok());
        assert!(validate_schema_cached(&json!("nope"), &email).is_err());

        let uuid = doc(json!({"type": "string", "format": "uuid"}));
        assert!(
            validate_schema_cached(&json!("123e4567-e89b-12d3-a456-426614174000"), &uuid).is_ok()
        );
        assert!(validate_schema_cached(&json!("123e4567"), &uuid).is_err());
    }

    #[test]
    fn one_of_requires_exactly_one_branch() {
        let s = doc(json!({"oneOf": [
            {"type": "integer", "minimum": 0},
            {"type": "integer", "maximum": 10},
        ]}));
        // 5 matches both branches.
        assert!(validate_schema_cached(&json!(5), &s).is_err());
        assert!(validate_schema_cached(&json!(-1), &s).is_ok());
    }

    #[test]
    fn any_of_and_all_of() {
        let any = doc(json!({"anyOf": [{"type": "string"}, {"type": "integer"}]}));
        assert!(validate_schema_cached(&json!(1), &any).is_ok());
        assert!(validate_schema_cached(&json!(1.5), &any).is_err());

        let all = doc(json!({"allOf": [
            {"type": "integer", "minimum": 2},
            {"type": "integer", "maximum": 4},
        ]}));
        assert!(validate_schema_cached(&json!(3), &all).is_ok());
        assert!(validate_schema_cached(&json!(9), &all).is_err());
    }

    #[test]
    fn type_lists_accept_any_member() {
        let s = doc(json!({"type": ["integer", "null"]}));
        assert!(validate_schema_cached(&json!(1), &s).is_ok());
        assert!(validate_schema_cached(&json!(null), &s).is_ok());
        assert!(validate_schema_cached(&json!("x"), &s).is_err());
    }

    #[test]
    fn object_required_and_additional() {
        let s = doc(json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}},
            "required": ["x"],
            "additionalProperties": false,
        }));
        assert!(validate_schema_cached(&json!({"x": 1}), &s).is_ok());
        let err = validate_schema_cached(&json!({}), &s).unwrap_err();
        assert!(err.0.contains("missing required"));
        let err = validate_schema_cached(&json!({"x": 1, "y": 2}), &s).unwrap_err();
        assert!(err.0.contains("unexpected property"));
    }

    #[test]
    fn errors_carry_paths() {
        let s = doc(json!({
            "type": "object",
            "properties": {"xs": {"type": "array", "items": {"type": "integer"}}},
        }));
        let err = validate_schema_cached(&json!({"xs": [1, "two"]}), &s).unwrap_err();
        assert!(err.0.starts_with("$.xs[1]"), "{}", err.0);
    }

    #[test]
    fn check_schema_runs_host_function() {
        let s = Schema::check(|v| {
            if v.as_i64() == Some(7) {
                Ok(())
            } else {
                Err("not seven".into())
            }
        });
        assert!(validate_schema_cached(&json!(7), &s).is_ok());
        assert!(validate_schema_cached(&json!(8), &s).is_err());
    }

    #[test]
    fn canonical_key_is_order_insensitive() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_key(&a), canonical_key(&b));
        assert_eq!(canonical_key(&a).len(), 64);
    }
}
