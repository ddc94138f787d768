//! Bounded rendering of JSON trees.
//!
//! Every value that escapes the sandbox (result, locals, event data) passes
//! through [`safe_json`], which enforces depth/item/string/byte caps and
//! applies the determinism float format. The worker applies the same limits
//! to its runtime values before they become JSON; this module is the shared
//! JSON-to-JSON half used by the façade for inputs and by tests.

use serde_json::{Map, Value as Json};

pub const MAX_DEPTH: usize = 10;
pub const MAX_ITEMS: usize = 2_000;
pub const MAX_STR: usize = 10_000;

pub const TRUNCATED_ITEMS: &str = "<truncated:too_many_items>";
pub const TRUNCATED_DEPTH: &str = "<truncated:depth_limit>";
pub const TRUNCATED_BYTES: &str = "<truncated:byte_limit>";
pub const TRUNCATED_STR_TAIL: &str = "<truncated>";
pub const TRUNCATED_CYCLE: &str = "<truncated:cycle>";

/// Caps applied while rendering an output tree.
#[derive(Debug, Clone)]
pub struct SerializeLimits {
    pub max_depth: usize,
    pub max_items: usize,
    pub max_str: usize,
    pub max_bytes: Option<usize>,
    /// Format spec for float leaves, e.g. ".6f" renders as a string.
    pub float_format: Option<String>,
}

impl Default for SerializeLimits {
    fn default() -> Self {
        Self {
            max_depth: MAX_DEPTH,
            max_items: MAX_ITEMS,
            max_str: MAX_STR,
            max_bytes: None,
            float_format: None,
        }
    }
}

impl SerializeLimits {
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::default()
        }
    }

    pub fn with_float_format(mut self, fmt: Option<&str>) -> Self {
        self.float_format = fmt.map(String::from);
        self
    }
}

struct RenderState {
    items: usize,
    bytes: usize,
}

/// Render `x` as a bounded JSON tree under `limits`.
///
/// Idempotent: rendering an already-rendered tree yields the same tree.
pub fn safe_json(x: &Json, limits: &SerializeLimits) -> Json {
    let mut state = RenderState { items: 0, bytes: 0 };
    render(x, limits, 0, &mut state)
}

fn render(x: &Json, limits: &SerializeLimits, depth: usize, state: &mut RenderState) -> Json {
    state.items += 1;
    if state.items > limits.max_items {
        return Json::from(TRUNCATED_ITEMS);
    }
    if depth > limits.max_depth {
        return Json::from(TRUNCATED_DEPTH);
    }
    if let Some(max) = limits.max_bytes
        && state.bytes > max
    {
        return Json::from(TRUNCATED_BYTES);
    }

    match x {
        Json::Null | Json::Bool(_) => x.clone(),
        Json::Number(n) => {
            if let (Some(f), Some(fmt)) = (n.as_f64(), limits.float_format.as_deref())
                && !n.is_i64()
                && !n.is_u64()
            {
                let s = format_float(f, fmt);
                state.bytes += s.len();
                return Json::from(s);
            }
            x.clone()
        }
        Json::String(s) => {
            let rendered = clip_str(s, limits.max_str);
            state.bytes += rendered.len();
            Json::from(rendered)
        }
        Json::Array(items) => Json::Array(
            items
                .iter()
                .map(|i| render(i, limits, depth + 1, state))
                .collect(),
        ),
        Json::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().take(limits.max_items) {
                let key = match render(&Json::from(k.as_str()), limits, depth + 1, state) {
                    Json::String(s) => s,
                    other => other.to_string(),
                };
                let val = render(v, limits, depth + 1, state);
                out.insert(key, val);
            }
            Json::Object(out)
        }
    }
}

/// Clip a string to `max` characters, appending the truncation tail.
pub fn clip_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let clipped: String = s.chars().take(max).collect();
    format!("{clipped}{TRUNCATED_STR_TAIL}")
}

/// Apply a Python-style float format spec. Supports the ".Nf"/".Ne"/".Ng"
/// family; anything else falls back to the plain value. Negative zero is
/// normalised first so formatted output is stable across platforms.
pub fn format_float(v: f64, spec: &str) -> String {
    let v = if v == 0.0 && v.is_sign_negative() { 0.0 } else { v };
    if let Some(rest) = spec.strip_prefix('.')
        && rest.len() >= 2
    {
        let (digits, conv) = rest.split_at(rest.len() - 1);
        if let Ok(prec) = digits.parse::<usize>() {
            match conv {
                "f" => return format!("{v:.prec$}"),
                "e" => return format!("{v:.prec$e}"),
                "g" => {
                    // Shortest of fixed/scientific at the given precision.
                    let fixed = format!("{v:.prec$}");
                    let sci = format!("{v:.prec$e}");
                    return if sci.len() < fixed.len() { sci } else { fixed };
                }
                _ => {}
            }
        }
    }
    v.to_string()
}

/// Rough recursive size estimate for budget accounting: 8 bytes per scalar,
/// string lengths capped, item and depth caps matching the serializer.
pub fn approx_bytes(x: &Json) -> u64 {
    const SIZE_MAX_DEPTH: usize = 6;
    let mut items = 0usize;
    approx(x, 0, SIZE_MAX_DEPTH, &mut items)
}

fn approx(x: &Json, depth: usize, max_depth: usize, items: &mut usize) -> u64 {
    *items += 1;
    if *items > MAX_ITEMS || depth > max_depth {
        return 0;
    }
    match x {
        Json::Null => 0,
        Json::Bool(_) | Json::Number(_) => 8,
        Json::String(s) => s.len().min(MAX_STR) as u64,
        Json::Array(a) => a
            .iter()
            .take(MAX_ITEMS)
            .map(|i| approx(i, depth + 1, max_depth, items))
            .sum(),
        Json::Object(m) => m
            .iter()
            .take(MAX_ITEMS)
            .map(|(k, v)| {
                k.len().min(MAX_STR) as u64 + approx(v, depth + 1, max_depth, items)
            })
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn scalars_pass_through() {
        let limits = SerializeLimits::default();
        assert_eq!(safe_json(&json!(null), &limits), json!(null));
        assert_eq!(safe_json(&json!(true), &limits), json!(true));
        assert_eq!(safe_json(&json!(42), &limits), json!(42));
        assert_eq!(safe_json(&json!("hi"), &limits), json!("hi"));
    }

    #[test]
    fn long_strings_are_clipped() {
        let limits = SerializeLimits {
            max_str: 4,
            ..Default::default()
        };
        assert_eq!(
            safe_json(&json!("abcdefgh"), &limits),
            json!("abcd<truncated>")
        );
    }

    #[test]
    fn deep_nesting_truncates() {
        let mut v = json!(1);
        for _ in 0..20 {
            v = json!([v]);
        }
        let out = safe_json(&v, &SerializeLimits::default());
        assert!(out.to_string().contains(TRUNCATED_DEPTH));
    }

    #[test]
    fn too_many_items_truncates() {
        let v = json!((0..5000).collect::<Vec<_>>());
        let out = safe_json(&v, &SerializeLimits::default());
        let arr = out.as_array().unwrap();
        assert!(arr.iter().any(|x| x == &json!(TRUNCATED_ITEMS)));
    }

    #[test]
    fn float_format_renders_strings() {
        let limits = SerializeLimits::default().with_float_format(Some(".3f"));
        assert_eq!(safe_json(&json!(1.23456), &limits), json!("1.235"));
        // Integers are untouched by the float format.
        assert_eq!(safe_json(&json!(7), &limits), json!(7));
    }

    #[test]
    fn negative_zero_is_normalised() {
        assert_eq!(format_float(-0.0, ".2f"), "0.00");
    }

    #[test]
    fn approx_bytes_counts_strings_and_scalars() {
        assert_eq!(approx_bytes(&json!("abcd")), 4);
        assert_eq!(approx_bytes(&json!(7)), 8);
        assert_eq!(approx_bytes(&json!([1, 2, "ab"])), 18);
        assert_eq!(approx_bytes(&json!({"k": 1})), 9);
    }

    proptest! {
        #[test]
        fn safe_json_is_idempotent(v in arb_json(3)) {
            let limits = SerializeLimits::default();
            let once = safe_json(&v, &limits);
            let twice = safe_json(&once, &limits);
            prop_assert_eq!(once, twice);
        }
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Json> {
        let leaf = prop_oneof![
            Just(json!(null)),
            any::<bool>().prop_map(Json::from),
            any::<i64>().prop_map(Json::from),
            "[a-z]{0,12}".prop_map(Json::from),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Json::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..8)
                    .prop_map(|m| Json::Object(m.into_iter().collect())),
            ]
        })
    }
}
