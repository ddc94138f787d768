//! Safe builtins, filtered into sandbox globals by the policy allowlist.
//!
//! These operate purely on runtime values; `print` is the one exception —
//! it writes to the run's captured stdout stream.

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::{RunCtx, StreamKind};
use crate::error::ExecError;
use crate::value::{Builtin, Dict, RangeObj, Value};

/// Materialise any iterable value. Errors mirror the dialect's `TypeError`.
pub fn iter_items(value: &Value) -> Result<Vec<Value>, ExecError> {
    match value {
        Value::List(l) => Ok(l.borrow().clone()),
        Value::Tuple(t) => Ok(t.as_ref().clone()),
        Value::Set(s) => Ok(s.borrow().clone()),
        Value::Range(r) => Ok(r.iter().map(Value::Int).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Dict(d) => Ok(d
            .borrow()
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()),
        other => Err(ExecError::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExecError> {
    if args.len() < min || args.len() > max {
        return Err(ExecError::type_error(format!(
            "{name}() takes {min} to {max} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn kwarg<'a>(kwargs: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn reject_unknown_kwargs(
    name: &str,
    kwargs: &[(String, Value)],
    accepted: &[&str],
) -> Result<(), ExecError> {
    for (k, _) in kwargs {
        if !accepted.contains(&k.as_str()) {
            return Err(ExecError::type_error(format!(
                "{name}() got an unexpected keyword argument '{k}'"
            )));
        }
    }
    Ok(())
}

fn as_int(name: &str, value: &Value) -> Result<i64, ExecError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(ExecError::type_error(format!(
            "{name}() expected an integer, got '{}'",
            other.type_name()
        ))),
    }
}

pub fn call_builtin(
    builtin: Builtin,
    args: &[Value],
    kwargs: &[(String, Value)],
    ctx: &Rc<RefCell<RunCtx>>,
) -> Result<Value, ExecError> {
    if builtin != Builtin::Print {
        reject_unknown_kwargs(
            builtin.name(),
            kwargs,
            match builtin {
                Builtin::Sorted => &["reverse"],
                Builtin::Enumerate => &["start"],
                Builtin::Round => &["ndigits"],
                _ => &[],
            },
        )?;
    }

    match builtin {
        Builtin::Abs => {
            arity("abs", args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i.checked_abs().map(Value::Int).ok_or_else(ExecError::overflow),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                other => Err(ExecError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::All => {
            arity("all", args, 1, 1)?;
            Ok(Value::Bool(iter_items(&args[0])?.iter().all(Value::truthy)))
        }
        Builtin::Any => {
            arity("any", args, 1, 1)?;
            Ok(Value::Bool(iter_items(&args[0])?.iter().any(Value::truthy)))
        }
        Builtin::Bool => {
            arity("bool", args, 0, 1)?;
            Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
        }
        Builtin::Dict => {
            arity("dict", args, 0, 1)?;
            let mut entries = Vec::new();
            if let Some(src) = args.first() {
                match src {
                    Value::Dict(d) => entries = d.borrow().entries.clone(),
                    other => {
                        for pair in iter_items(other)? {
                            let items = iter_items(&pair)?;
                            let [k, v] = items.as_slice() else {
                                return Err(ExecError::value_error(
                                    "dictionary update sequence element is not a pair",
                                ));
                            };
                            entries.push((k.clone(), v.clone()));
                        }
                    }
                }
            }
            Ok(Value::Dict(Rc::new(RefCell::new(Dict {
                entries,
                frozen: false,
            }))))
        }
        Builtin::Enumerate => {
            arity("enumerate", args, 1, 2)?;
            let start = match (args.get(1), kwarg(kwargs, "start")) {
                (Some(v), _) | (None, Some(v)) => as_int("enumerate", v)?,
                (None, None) => 0,
            };
            let items = iter_items(&args[0])?;
            Ok(Value::list(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                    .collect(),
            ))
        }
        Builtin::Float => {
            arity("float", args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Int(i)) => Ok(Value::Float(*i as f64)),
                Some(Value::Float(f)) => Ok(Value::Float(*f)),
                Some(Value::Bool(b)) => Ok(Value::Float(f64::from(*b))),
                Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    ExecError::value_error(format!("could not convert string to float: '{s}'"))
                }),
                Some(other) => Err(ExecError::type_error(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Int => {
            arity("int", args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Int(i)) => Ok(Value::Int(*i)),
                Some(Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
                Some(Value::Float(f)) => Ok(Value::Int(f.trunc() as i64)),
                Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    ExecError::value_error(format!(
                        "invalid literal for int() with base 10: '{s}'"
                    ))
                }),
                Some(other) => Err(ExecError::type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Len => {
            arity("len", args, 1, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count() as i64,
                Value::List(l) => l.borrow().len() as i64,
                Value::Tuple(t) => t.len() as i64,
                Value::Set(s) => s.borrow().len() as i64,
                Value::Dict(d) => d.borrow().len() as i64,
                Value::Range(r) => r.len() as i64,
                other => {
                    return Err(ExecError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(n))
        }
        Builtin::List => {
            arity("list", args, 0, 1)?;
            match args.first() {
                None => Ok(Value::list(vec![])),
                Some(v) => Ok(Value::list(iter_items(v)?)),
            }
        }
        Builtin::Max | Builtin::Min => {
            let name = builtin.name();
            if args.is_empty() {
                return Err(ExecError::type_error(format!(
                    "{name} expected at least 1 argument, got 0"
                )));
            }
            let items = if args.len() == 1 {
                iter_items(&args[0])?
            } else {
                args.to_vec()
            };
            let mut best: Option<Value> = None;
            for item in items {
                best = Some(match best {
                    None => item,
                    Some(current) => {
                        let ord = item.py_cmp(&current).ok_or_else(|| {
                            ExecError::type_error(format!(
                                "'{}' not supported between instances",
                                if builtin == Builtin::Max { ">" } else { "<" }
                            ))
                        })?;
                        let take = if builtin == Builtin::Max {
                            ord == std::cmp::Ordering::Greater
                        } else {
                            ord == std::cmp::Ordering::Less
                        };
                        if take { item } else { current }
                    }
                });
            }
            best.ok_or_else(|| {
                ExecError::value_error(format!("{name}() arg is an empty sequence"))
            })
        }
        Builtin::Print => {
            let sep = match kwarg(kwargs, "sep") {
                Some(v) => v.py_str(),
                None => " ".to_string(),
            };
            let end = match kwarg(kwargs, "end") {
                Some(v) => v.py_str(),
                None => "\n".to_string(),
            };
            reject_unknown_kwargs("print", kwargs, &["sep", "end"])?;
            let text = args
                .iter()
                .map(Value::py_str)
                .collect::<Vec<_>>()
                .join(&sep);
            ctx.borrow_mut()
                .write_stream(StreamKind::Stdout, &format!("{text}{end}"));
            Ok(Value::None)
        }
        Builtin::Range => {
            arity("range", args, 1, 3)?;
            let (start, stop, step) = match args {
                [stop] => (0, as_int("range", stop)?, 1),
                [start, stop] => (as_int("range", start)?, as_int("range", stop)?, 1),
                [start, stop, step] => (
                    as_int("range", start)?,
                    as_int("range", stop)?,
                    as_int("range", step)?,
                ),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(ExecError::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(Rc::new(RangeObj { start, stop, step })))
        }
        Builtin::Reversed => {
            arity("reversed", args, 1, 1)?;
            let mut items = iter_items(&args[0])?;
            items.reverse();
            Ok(Value::list(items))
        }
        Builtin::Round => {
            arity("round", args, 1, 2)?;
            let ndigits = match (args.get(1), kwarg(kwargs, "ndigits")) {
                (Some(v), _) | (None, Some(v)) => Some(as_int("round", v)?),
                (None, None) => None,
            };
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => match ndigits {
                    None => Ok(Value::Int(round_half_even(*f))),
                    Some(n) => {
                        let scale = 10f64.powi(n.clamp(-308, 308) as i32);
                        Ok(Value::Float((f * scale).round() / scale))
                    }
                },
                other => Err(ExecError::type_error(format!(
                    "type {} doesn't define __round__",
                    other.type_name()
                ))),
            }
        }
        Builtin::Set => {
            arity("set", args, 0, 1)?;
            let mut out: Vec<Value> = Vec::new();
            if let Some(v) = args.first() {
                for item in iter_items(v)? {
                    if !out.iter().any(|x| x.py_eq(&item)) {
                        out.push(item);
                    }
                }
            }
            Ok(Value::Set(Rc::new(RefCell::new(out))))
        }
        Builtin::Sorted => {
            arity("sorted", args, 1, 1)?;
            let mut items = iter_items(&args[0])?;
            let reverse = kwarg(kwargs, "reverse").map(Value::truthy).unwrap_or(false);
            let mut failed = false;
            items.sort_by(|a, b| {
                a.py_cmp(b).unwrap_or_else(|| {
                    failed = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failed {
                return Err(ExecError::type_error(
                    "'<' not supported between instances",
                ));
            }
            if reverse {
                items.reverse();
            }
            Ok(Value::list(items))
        }
        Builtin::Str => {
            arity("str", args, 0, 1)?;
            Ok(Value::str(
                args.first().map(Value::py_str).unwrap_or_default(),
            ))
        }
        Builtin::Sum => {
            arity("sum", args, 1, 2)?;
            let mut acc = match args.get(1) {
                Some(v) => v.clone(),
                None => Value::Int(0),
            };
            for item in iter_items(&args[0])? {
                acc = numeric_add(&acc, &item)?;
            }
            Ok(acc)
        }
        Builtin::Tuple => {
            arity("tuple", args, 0, 1)?;
            match args.first() {
                None => Ok(Value::tuple(vec![])),
                Some(v) => Ok(Value::tuple(iter_items(v)?)),
            }
        }
        Builtin::Zip => {
            let columns: Vec<Vec<Value>> = args
                .iter()
                .map(iter_items)
                .collect::<Result<_, _>>()?;
            let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list(
                (0..shortest)
                    .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect(),
            ))
        }
    }
}

fn numeric_add(a: &Value, b: &Value) -> Result<Value, ExecError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            x.checked_add(*y).map(Value::Int).ok_or_else(ExecError::overflow)
        }
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
        _ => Err(ExecError::type_error(format!(
            "unsupported operand type(s) for +: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Round-half-to-even, matching the dialect's `round(x)`.
fn round_half_even(f: f64) -> i64 {
    let floor = f.floor();
    let diff = f - floor;
    let base = floor as i64;
    if diff > 0.5 {
        base + 1
    } else if diff < 0.5 {
        base
    } else if base % 2 == 0 {
        base
    } else {
        base + 1
    }
}
