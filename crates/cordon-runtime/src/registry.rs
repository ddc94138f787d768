//! Named bindings for side-effectful host functionality.
//!
//! Capability specs and root specs reference host functions by name; the
//! registry is where those names resolve. A process-global registry serves
//! spawn-safe workers (the entries survive `fork`, and a custom worker
//! binary registers its own before handling requests). Fork-mode runs may
//! additionally carry a live per-environment registry whose entries never
//! need to serialize.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value as Json;

use crate::proxies::{RootMember, RootTarget, TableRoot};

pub type Kwargs = std::collections::BTreeMap<String, Json>;

pub type CapFunc = Arc<dyn Fn(&[Json], &Kwargs) -> Result<Json, String> + Send + Sync>;
pub type Validator = Arc<dyn Fn(&[Json], &Kwargs) -> Result<(), String> + Send + Sync>;
pub type Serializer = Arc<dyn Fn(Json) -> Result<Json, String> + Send + Sync>;
pub type InitHook = Arc<dyn Fn() -> Result<Json, String> + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(&Json) + Send + Sync>;

/// A resolvable set of named host bindings.
#[derive(Default, Clone)]
pub struct Registry {
    funcs: HashMap<String, CapFunc>,
    validators: HashMap<String, Validator>,
    serializers: HashMap<String, Serializer>,
    inits: HashMap<String, InitHook>,
    closers: HashMap<String, CloseHook>,
    roots: HashMap<String, Arc<dyn RootTarget>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_func<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Json], &Kwargs) -> Result<Json, String> + Send + Sync + 'static,
    {
        self.funcs.insert(name.into(), Arc::new(f));
    }

    pub fn register_validator<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Json], &Kwargs) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.insert(name.into(), Arc::new(f));
    }

    pub fn register_serializer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Json) -> Result<Json, String> + Send + Sync + 'static,
    {
        self.serializers.insert(name.into(), Arc::new(f));
    }

    pub fn register_init<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Result<Json, String> + Send + Sync + 'static,
    {
        self.inits.insert(name.into(), Arc::new(f));
    }

    pub fn register_close<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Json) + Send + Sync + 'static,
    {
        self.closers.insert(name.into(), Arc::new(f));
    }

    pub fn register_root(&mut self, name: impl Into<String>, root: Arc<dyn RootTarget>) {
        self.roots.insert(name.into(), root);
    }

    pub fn func(&self, name: &str) -> Option<CapFunc> {
        self.funcs.get(name).cloned()
    }

    pub fn validator(&self, name: &str) -> Option<Validator> {
        self.validators.get(name).cloned()
    }

    pub fn serializer(&self, name: &str) -> Option<Serializer> {
        self.serializers.get(name).cloned()
    }

    pub fn init(&self, name: &str) -> Option<InitHook> {
        self.inits.get(name).cloned()
    }

    pub fn close(&self, name: &str) -> Option<CloseHook> {
        self.closers.get(name).cloned()
    }

    pub fn root(&self, name: &str) -> Option<Arc<dyn RootTarget>> {
        self.roots.get(name).cloned()
    }
}

fn global() -> &'static RwLock<Registry> {
    static GLOBAL: OnceLock<RwLock<Registry>> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let mut registry = Registry::new();
        registry.register_root("math", Arc::new(math_root()));
        RwLock::new(registry)
    })
}

/// Mutate the process-global registry. Embedders call this before any
/// execution; a custom worker binary calls it before serving requests.
pub fn with_global_mut<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = global().write().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

/// Snapshot-read the process-global registry.
pub fn with_global<R>(f: impl FnOnce(&Registry) -> R) -> R {
    let guard = global().read().unwrap_or_else(|e| e.into_inner());
    f(&guard)
}

fn num(arg: &Json) -> Result<f64, String> {
    arg.as_f64().ok_or_else(|| "expected a number".to_string())
}

fn unary(f: fn(f64) -> f64) -> impl Fn(&[Json]) -> Result<Json, String> {
    move |args| {
        let [x] = args else {
            return Err("expected 1 argument".into());
        };
        Ok(Json::from(f(num(x)?)))
    }
}

/// The standard `math` root target: pure functions plus frozen constants.
pub fn math_root() -> TableRoot {
    let mut t = TableRoot::new();
    t.insert_fn("sin", unary(f64::sin));
    t.insert_fn("cos", unary(f64::cos));
    t.insert_fn("tan", unary(f64::tan));
    t.insert_fn("asin", unary(f64::asin));
    t.insert_fn("acos", unary(f64::acos));
    t.insert_fn("atan", unary(f64::atan));
    t.insert_fn("sinh", unary(f64::sinh));
    t.insert_fn("cosh", unary(f64::cosh));
    t.insert_fn("tanh", unary(f64::tanh));
    t.insert_fn("exp", unary(f64::exp));
    t.insert_fn("log", |args| match args {
        [x] => Ok(Json::from(num(x)?.ln())),
        [x, base] => Ok(Json::from(num(x)?.log(num(base)?))),
        _ => Err("expected 1 or 2 arguments".into()),
    });
    t.insert_fn("log10", unary(f64::log10));
    t.insert_fn("log2", unary(f64::log2));
    t.insert_fn("sqrt", |args| {
        let [x] = args else {
            return Err("expected 1 argument".into());
        };
        let v = num(x)?;
        if v < 0.0 {
            return Err("math domain error".into());
        }
        Ok(Json::from(v.sqrt()))
    });
    t.insert_fn("pow", |args| {
        let [x, y] = args else {
            return Err("expected 2 arguments".into());
        };
        Ok(Json::from(num(x)?.powf(num(y)?)))
    });
    t.insert_fn("atan2", |args| {
        let [y, x] = args else {
            return Err("expected 2 arguments".into());
        };
        Ok(Json::from(num(y)?.atan2(num(x)?)))
    });
    t.insert_fn("hypot", |args| {
        let [x, y] = args else {
            return Err("expected 2 arguments".into());
        };
        Ok(Json::from(num(x)?.hypot(num(y)?)))
    });
    t.insert_fn("floor", |args| {
        let [x] = args else {
            return Err("expected 1 argument".into());
        };
        Ok(Json::from(num(x)?.floor() as i64))
    });
    t.insert_fn("ceil", |args| {
        let [x] = args else {
            return Err("expected 1 argument".into());
        };
        Ok(Json::from(num(x)?.ceil() as i64))
    });
    t.insert_fn("fabs", unary(f64::abs));
    t.insert_fn("degrees", unary(f64::to_degrees));
    t.insert_fn("radians", unary(f64::to_radians));
    t.insert_value("pi", Json::from(std::f64::consts::PI));
    t.insert_value("e", Json::from(std::f64::consts::E));
    t.insert_value("tau", Json::from(std::f64::consts::TAU));
    t
}
