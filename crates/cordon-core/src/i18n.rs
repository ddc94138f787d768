//! Locale-aware canonicalisation of error messages.
//!
//! Pipeline messages are stable English strings; this module maps them to
//! message keys (exact match first, then pattern match) and re-renders them
//! from a locale bundle. Only the `en` bundle ships here — other tables are
//! registered by the embedder via [`register_bundle`]. Placeholders survive
//! translation so callers can keep matching programmatically.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

use crate::result::ErrorInfo;

pub const DEFAULT_LOCALE: &str = "en";

fn en_bundle() -> Vec<(&'static str, &'static str)> {
    vec![
        ("error.import_not_allowed", "import is not allowed"),
        ("error.global_not_allowed", "global is not allowed"),
        ("error.nonlocal_not_allowed", "nonlocal is not allowed"),
        ("error.del_not_allowed", "del is not allowed"),
        ("error.raise_not_allowed", "raise is not allowed"),
        ("error.yield_not_allowed", "yield is not allowed"),
        ("error.async_not_allowed", "async is not allowed"),
        ("error.class_not_allowed", "class is not allowed"),
        ("error.def_not_allowed", "def is not allowed"),
        ("error.lambda_not_allowed", "lambda is not allowed"),
        ("error.try_not_allowed", "try/except is not allowed"),
        ("error.with_not_allowed", "with is not allowed"),
        ("error.subscript_not_allowed", "subscript is not allowed"),
        ("error.dunder_name_not_allowed", "dunder names are not allowed"),
        ("error.dunder_attr_not_allowed", "dunder attribute is not allowed"),
        ("error.attr_root_only", "only root.attr attribute access is allowed"),
        ("error.attr_not_allowed", "attribute '{root}.{attr}' is not allowed"),
        ("error.call_not_allowed", "call '{name}' is not allowed"),
        ("error.call_form", "only f(...) or root.attr(...) calls are allowed"),
        ("error.loop_not_allowed", "loops are not allowed"),
        ("error.loop_iter_not_allowed", "loop iterable is not allowed"),
        ("error.loop_nesting_too_deep", "loop nesting too deep"),
        ("error.comp_not_allowed", "comprehension is not allowed"),
        ("error.comp_iter_not_allowed", "comprehension iterable is not allowed"),
        ("error.comp_nesting_too_deep", "comprehension nesting too deep"),
        ("error.literal_too_large", "literal too large"),
        ("error.suspicious_const_alloc", "suspicious constant allocation"),
        ("error.ast_node_limit", "AST node limit exceeded"),
        ("error.step_limit", "step limit exceeded: {max_steps}"),
        ("error.timeout", "exceeded {ms}ms"),
        ("error.cap_max_call_ms", "cap max_call_ms exceeded ({ms}ms)"),
        ("error.cap_max_ret_bytes", "cap max_ret_bytes exceeded ({bytes} bytes)"),
        ("error.cap_max_calls", "cap max_calls exceeded ({calls})"),
        ("error.cap_max_total_ms", "cap max_total_ms exceeded ({ms}ms)"),
        ("error.cap_max_total_bytes", "cap max_total_bytes exceeded ({bytes} bytes)"),
        ("error.cap_max_qps", "cap max_qps exceeded ({qps})"),
        ("error.cap_max_bandwidth", "cap max_bandwidth exceeded ({bytes} bytes/sec)"),
        (
            "error.token_budget",
            "token budget exceeded: need {need}, remaining {remaining}",
        ),
        ("error.token_budget_scopes", "token budget exceeded across scopes"),
        ("error.worker_no_payload", "no payload from worker"),
        ("error.worker_no_payload_err", "no payload from worker: {msg}"),
        ("error.worker_invalid_payload", "invalid payload: {msg}"),
    ]
}

type Bundle = HashMap<String, String>;

fn bundles() -> &'static Mutex<HashMap<String, Bundle>> {
    static BUNDLES: OnceLock<Mutex<HashMap<String, Bundle>>> = OnceLock::new();
    BUNDLES.get_or_init(|| {
        let en: Bundle = en_bundle()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Mutex::new(HashMap::from([(DEFAULT_LOCALE.to_string(), en)]))
    })
}

/// Add or extend a locale bundle. Callers supply their own tables; keys not
/// present fall back to `en`, then to the key itself.
pub fn register_bundle(locale: &str, messages: impl IntoIterator<Item = (String, String)>) {
    if locale.is_empty() {
        return;
    }
    if let Ok(mut all) = bundles().lock() {
        let bundle = all.entry(locale.to_string()).or_default();
        bundle.extend(messages);
    }
}

/// Look up `key` in `locale` and substitute `{name}` placeholders.
pub fn translate(key: &str, locale: Option<&str>, params: &[(&str, String)]) -> String {
    let loc = locale.unwrap_or(DEFAULT_LOCALE);
    let text = {
        let all = match bundles().lock() {
            Ok(all) => all,
            Err(_) => return key.to_string(),
        };
        all.get(loc)
            .and_then(|b| b.get(key))
            .or_else(|| all.get(DEFAULT_LOCALE).and_then(|b| b.get(key)))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    };
    let mut out = text;
    for (name, value) in params {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

struct PatternKey {
    pattern: Regex,
    key: &'static str,
    params: &'static [&'static str],
}

fn pattern_keys() -> &'static Vec<PatternKey> {
    static KEYS: OnceLock<Vec<PatternKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        let defs: [(&str, &str, &[&str]); 12] = [
            (
                r"^attribute '(.+)\.(.+)' is not allowed$",
                "error.attr_not_allowed",
                &["root", "attr"],
            ),
            (r"^call '(.+)' is not allowed$", "error.call_not_allowed", &["name"]),
            (r"^step limit exceeded: (\d+)$", "error.step_limit", &["max_steps"]),
            (r"^cap max_call_ms exceeded \((\d+)ms\)$", "error.cap_max_call_ms", &["ms"]),
            (
                r"^cap max_ret_bytes exceeded \((\d+) bytes\)$",
                "error.cap_max_ret_bytes",
                &["bytes"],
            ),
            (r"^cap max_calls exceeded \((\d+)\)$", "error.cap_max_calls", &["calls"]),
            (r"^cap max_total_ms exceeded \((\d+)ms\)$", "error.cap_max_total_ms", &["ms"]),
            (
                r"^cap max_total_bytes exceeded \((\d+) bytes\)$",
                "error.cap_max_total_bytes",
                &["bytes"],
            ),
            (r"^cap max_qps exceeded \((.+)\)$", "error.cap_max_qps", &["qps"]),
            (
                r"^cap max_bandwidth exceeded \((\d+) bytes/sec\)$",
                "error.cap_max_bandwidth",
                &["bytes"],
            ),
            (
                r"^token budget exceeded: need (\d+), remaining (\d+)$",
                "error.token_budget",
                &["need", "remaining"],
            ),
            (r"^exceeded (\d+)ms$", "error.timeout", &["ms"]),
        ];
        defs.into_iter()
            .filter_map(|(pattern, key, params)| {
                Some(PatternKey {
                    pattern: Regex::new(pattern).ok()?,
                    key,
                    params,
                })
            })
            .collect()
    })
}

fn exact_key(message: &str) -> Option<&'static str> {
    en_bundle()
        .into_iter()
        .find(|(_, text)| !text.contains('{') && *text == message)
        .map(|(key, _)| key)
}

/// Canonicalise a pipeline message into the given locale. Unknown messages
/// pass through untouched.
pub fn translate_message(message: &str, locale: Option<&str>) -> String {
    if message.is_empty() {
        return message.to_string();
    }
    if let Some(key) = exact_key(message) {
        return translate(key, locale, &[]);
    }
    for pk in pattern_keys() {
        if let Some(caps) = pk.pattern.captures(message) {
            let params: Vec<(&str, String)> = pk
                .params
                .iter()
                .zip(caps.iter().skip(1))
                .filter_map(|(name, group)| Some((*name, group?.as_str().to_string())))
                .collect();
            return translate(pk.key, locale, &params);
        }
    }
    message.to_string()
}

/// Translate an error's message when the active locale differs from `en`.
pub fn translate_error(err: ErrorInfo, locale: &str) -> ErrorInfo {
    if locale.is_empty() || locale == DEFAULT_LOCALE {
        return err;
    }
    let message = translate_message(&err.message, Some(locale));
    ErrorInfo { message, ..err }
}

/// The supervisor's timeout message for the active locale.
pub fn timeout_message(ms: u64, locale: Option<&str>) -> String {
    translate("error.timeout", locale, &[("ms", ms.to_string())])
}
