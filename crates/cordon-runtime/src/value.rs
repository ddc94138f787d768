//! Runtime values for the gated dialect.
//!
//! The worker is single-threaded, so aggregate values share structure with
//! `Rc`/`RefCell`. At every boundary (result, locals, event data) values are
//! rendered down to bounded JSON; anything that is not JSON-shaped leaves as
//! an `<opaque:...>` sentinel and repeated identities collapse to a cycle
//! sentinel.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use cordon_core::value::{
    clip_str, format_float, SerializeLimits, TRUNCATED_BYTES, TRUNCATED_CYCLE, TRUNCATED_DEPTH,
    TRUNCATED_ITEMS,
};
use serde_json::{Map, Value as Json};

use crate::caps::CapabilityHandle;
use crate::eval::UserFn;
use crate::proxies::{RootCallable, RootProxy};

/// Nesting cap for input freezing; deeper structure collapses.
pub const FREEZE_MAX_DEPTH: usize = 30;
pub const FROZEN_DEPTH: &str = "<frozen:depth_limit>";

/// Builtin functions exposed (subject to the policy allowlist).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Abs,
    All,
    Any,
    Bool,
    Dict,
    Enumerate,
    Float,
    Int,
    Len,
    List,
    Max,
    Min,
    Print,
    Range,
    Reversed,
    Round,
    Set,
    Sorted,
    Str,
    Sum,
    Tuple,
    Zip,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::All => "all",
            Builtin::Any => "any",
            Builtin::Bool => "bool",
            Builtin::Dict => "dict",
            Builtin::Enumerate => "enumerate",
            Builtin::Float => "float",
            Builtin::Int => "int",
            Builtin::Len => "len",
            Builtin::List => "list",
            Builtin::Max => "max",
            Builtin::Min => "min",
            Builtin::Print => "print",
            Builtin::Range => "range",
            Builtin::Reversed => "reversed",
            Builtin::Round => "round",
            Builtin::Set => "set",
            Builtin::Sorted => "sorted",
            Builtin::Str => "str",
            Builtin::Sum => "sum",
            Builtin::Tuple => "tuple",
            Builtin::Zip => "zip",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let b = match name {
            "abs" => Builtin::Abs,
            "all" => Builtin::All,
            "any" => Builtin::Any,
            "bool" => Builtin::Bool,
            "dict" => Builtin::Dict,
            "enumerate" => Builtin::Enumerate,
            "float" => Builtin::Float,
            "int" => Builtin::Int,
            "len" => Builtin::Len,
            "list" => Builtin::List,
            "max" => Builtin::Max,
            "min" => Builtin::Min,
            "print" => Builtin::Print,
            "range" => Builtin::Range,
            "reversed" => Builtin::Reversed,
            "round" => Builtin::Round,
            "set" => Builtin::Set,
            "sorted" => Builtin::Sorted,
            "str" => Builtin::Str,
            "sum" => Builtin::Sum,
            "tuple" => Builtin::Tuple,
            "zip" => Builtin::Zip,
            _ => return None,
        };
        Some(b)
    }
}

/// Integer range with Python `range` semantics. `step` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeObj {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeObj {
    pub fn len(&self) -> u64 {
        let span = if self.step > 0 {
            self.stop.saturating_sub(self.start)
        } else {
            self.start.saturating_sub(self.stop)
        };
        if span <= 0 {
            return 0;
        }
        let step = self.step.unsigned_abs();
        (span as u64).div_ceil(step)
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let (start, step, len) = (self.start, self.step, self.len());
        (0..len).map(move |i| start + step * i as i64)
    }
}

/// Insertion-ordered mapping with structural-equality keys.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    pub entries: Vec<(Value, Value)>,
    /// Frozen dicts reject mutation; inputs arrive frozen.
    pub frozen: bool,
}

impl Dict {
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.py_eq(key))
            .map(|(_, v)| v.clone())
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        for (k, v) in &mut self.entries {
            if k.py_eq(&key) {
                *v = value;
                return;
            }
        }
        self.entries.push((key, value));
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k.py_eq(key))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.iter().any(|(k, _)| k.py_eq(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Set(Rc<RefCell<Vec<Value>>>),
    Range(Rc<RangeObj>),
    Func(Rc<UserFn>),
    Builtin(Builtin),
    Capability(Rc<CapabilityHandle>),
    Root(Rc<RootProxy>),
    RootFn(Rc<RootCallable>),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.py_repr())
    }
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(RefCell::new(Dict {
            entries,
            frozen: false,
        })))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Func(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Capability(_) => "capability",
            Value::Root(_) => "module",
            Value::RootFn(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Range(r) => r.len() > 0,
            _ => true,
        }
    }

    /// Structural equality with int/float cross-comparison.
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => {
                i64::from(*a) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.entries
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|bv| bv.py_eq(v)))
            }
            (Value::Set(a), Value::Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|x| b.iter().any(|y| x.py_eq(y)))
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Capability(a), Value::Capability(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering for `<`/`>` style comparisons; `None` when the pair is
    /// unordered (mixed types).
    pub fn py_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Int(b)) => Some(i64::from(*a).cmp(b)),
            (Value::Int(a), Value::Bool(b)) => Some(a.cmp(&i64::from(*b))),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                cmp_seq(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => cmp_seq(a, b),
            _ => None,
        }
    }

    pub fn py_repr(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(l) => {
                let items: Vec<String> = l.borrow().iter().map(|v| v.py_repr()).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Tuple(t) => {
                let items: Vec<String> = t.iter().map(|v| v.py_repr()).collect();
                if items.len() == 1 {
                    format!("({},)", items[0])
                } else {
                    format!("({})", items.join(", "))
                }
            }
            Value::Dict(d) => {
                let items: Vec<String> = d
                    .borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.py_repr(), v.py_repr()))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::Set(s) => {
                let set = s.borrow();
                if set.is_empty() {
                    return "set()".into();
                }
                let items: Vec<String> = set.iter().map(|v| v.py_repr()).collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::Range(r) => {
                if r.step == 1 {
                    format!("range({}, {})", r.start, r.stop)
                } else {
                    format!("range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Value::Func(f) => format!("<function {}>", f.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::Capability(c) => format!("<capability {}>", c.name()),
            Value::Root(r) => format!("<root {}>", r.name()),
            Value::RootFn(f) => format!("<function {}>", f.name()),
        }
    }

    pub fn py_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.py_repr(),
        }
    }

    /// Build a live (mutable) value from JSON, e.g. a capability return.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::str(s),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::dict(
                map.iter()
                    .map(|(k, v)| (Value::str(k), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Build a deeply immutable value from JSON: arrays become tuples and
    /// objects become frozen dicts, so user code cannot mutate its inputs.
    /// Nesting past [`FREEZE_MAX_DEPTH`] collapses to the frozen sentinel.
    pub fn frozen_from_json(json: &Json) -> Value {
        Self::freeze(json, 0)
    }

    fn freeze(json: &Json, depth: usize) -> Value {
        if depth > FREEZE_MAX_DEPTH {
            return Value::str(FROZEN_DEPTH);
        }
        match json {
            Json::Array(items) => {
                Value::tuple(items.iter().map(|i| Self::freeze(i, depth + 1)).collect())
            }
            Json::Object(map) => Value::Dict(Rc::new(RefCell::new(Dict {
                entries: map
                    .iter()
                    .map(|(k, v)| (Value::str(k), Self::freeze(v, depth + 1)))
                    .collect(),
                frozen: true,
            }))),
            other => Value::from_json(other),
        }
    }

    /// Render this value as a bounded JSON tree.
    pub fn to_safe_json(&self, limits: &SerializeLimits) -> Json {
        let mut state = RenderState {
            items: 0,
            bytes: 0,
            seen: Vec::new(),
        };
        render(self, limits, 0, &mut state)
    }
}

fn cmp_seq(a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        if x.py_eq(y) {
            continue;
        }
        return x.py_cmp(y);
    }
    Some(a.len().cmp(&b.len()))
}

/// Python-flavoured float rendering: integral floats keep a ".0" suffix.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

struct RenderState {
    items: usize,
    bytes: usize,
    /// Addresses of aggregates already rendered. Repeated identities —
    /// true cycles included — collapse to the cycle sentinel.
    seen: Vec<usize>,
}

fn aggregate_addr(value: &Value) -> Option<usize> {
    match value {
        Value::List(l) => Some(Rc::as_ptr(l) as usize),
        Value::Tuple(t) => Some(Rc::as_ptr(t) as usize),
        Value::Dict(d) => Some(Rc::as_ptr(d) as usize),
        Value::Set(s) => Some(Rc::as_ptr(s) as usize),
        _ => None,
    }
}

fn render(value: &Value, limits: &SerializeLimits, depth: usize, state: &mut RenderState) -> Json {
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
    if let Some(addr) = aggregate_addr(value) {
        if state.seen.contains(&addr) {
            return Json::from(TRUNCATED_CYCLE);
        }
        state.seen.push(addr);
        return render_aggregate(value, limits, depth, state);
    }

    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::from(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => {
            if let Some(fmt) = limits.float_format.as_deref() {
                let s = format_float(*f, fmt);
                state.bytes += s.len();
                Json::from(s)
            } else {
                serde_json::Number::from_f64(*f)
                    .map(Json::Number)
                    .unwrap_or(Json::Null)
            }
        }
        Value::Str(s) => {
            let rendered = clip_str(s, limits.max_str);
            state.bytes += rendered.len();
            Json::from(rendered)
        }
        other => Json::from(format!("<opaque:{}>", other.type_name())),
    }
}

fn render_aggregate(
    value: &Value,
    limits: &SerializeLimits,
    depth: usize,
    state: &mut RenderState,
) -> Json {
    match value {
        Value::List(l) => Json::Array(
            l.borrow()
                .iter()
                .map(|v| render(v, limits, depth + 1, state))
                .collect(),
        ),
        Value::Tuple(t) => Json::Array(
            t.iter()
                .map(|v| render(v, limits, depth + 1, state))
                .collect(),
        ),
        Value::Dict(d) => {
            let mut out = Map::new();
            for (k, v) in d.borrow().entries.iter().take(limits.max_items) {
                let key = match render(k, limits, depth + 1, state) {
                    Json::String(s) => s,
                    other => other.to_string(),
                };
                out.insert(key, render(v, limits, depth + 1, state));
            }
            Json::Object(out)
        }
        // Sets have no JSON shape; they leave as opaque sentinels.
        other => Json::from(format!("<opaque:{}>", other.type_name())),
    }
}

/// Bounded size estimate over runtime values, for capability accounting.
pub fn approx_bytes(value: &Value) -> u64 {
    const MAX_DEPTH: usize = 6;
    const MAX_ITEMS: usize = 2_000;
    const MAX_STR: usize = 10_000;
    let mut items = 0usize;

    fn walk(value: &Value, depth: usize, items: &mut usize) -> u64 {
        *items += 1;
        if *items > MAX_ITEMS || depth > MAX_DEPTH {
            return 0;
        }
        match value {
            Value::None => 0,
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => 8,
            Value::Str(s) => s.len().min(MAX_STR) as u64,
            Value::List(l) => l
                .borrow()
                .iter()
                .take(MAX_ITEMS)
                .map(|v| walk(v, depth + 1, items))
                .sum(),
            Value::Tuple(t) => t
                .iter()
                .take(MAX_ITEMS)
                .map(|v| walk(v, depth + 1, items))
                .sum(),
            Value::Set(s) => s
                .borrow()
                .iter()
                .take(MAX_ITEMS)
                .map(|v| walk(v, depth + 1, items))
                .sum(),
            Value::Dict(d) => d
                .borrow()
                .entries
                .iter()
                .take(MAX_ITEMS)
                .map(|(k, v)| walk(k, depth + 1, items) + walk(v, depth + 1, items))
                .sum(),
            _ => 256,
        }
    }

    walk(value, 0, &mut items)
}
