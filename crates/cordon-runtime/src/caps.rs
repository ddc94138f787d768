//! Capability wrappers: validation, budget accounting, and audit.
//!
//! Every call through a wrapper charges exactly one cost record — success
//! or failure — and emits one `cap` event. Budget violations poison the
//! per-capability accumulator, so once a limit trips no later call within
//! the run can succeed.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use cordon_core::capability::{
    BudgetError, BudgetSpec, CapabilityCost, CapabilitySpec, ScopeBundle,
};
use cordon_core::value::SerializeLimits;
use cordon_core::wire::ExecMode;
use serde_json::{json, Value as Json};

use crate::context::RunCtx;
use crate::registry::{self, CapFunc, Kwargs, Registry, Serializer, Validator};
use crate::value::{approx_bytes, Value};

/// Per-capability running totals plus the enforcement logic.
pub struct BudgetManager {
    spec: BudgetSpec,
    started: Instant,
    pub calls: u64,
    pub ms: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

impl BudgetManager {
    pub fn new(spec: BudgetSpec) -> Self {
        Self {
            spec,
            started: Instant::now(),
            calls: 0,
            ms: 0,
            bytes_out: 0,
            bytes_in: 0,
        }
    }

    /// Charge one cost record. Limits are enforced in a fixed order: the
    /// first triggered limit wins.
    pub fn charge(
        &mut self,
        cost: &CapabilityCost,
        scopes: &mut ScopeBundle,
    ) -> Result<(), BudgetError> {
        if cost.calls == 0 {
            return Ok(());
        }
        if let Some(limit) = self.spec.max_call_ms
            && cost.ms > limit
        {
            return Err(BudgetError::MaxCallMs(limit));
        }
        if let Some(limit) = self.spec.max_ret_bytes
            && cost.bytes_out > limit
        {
            return Err(BudgetError::MaxRetBytes(limit));
        }

        self.calls += cost.calls;
        self.ms += cost.ms;
        self.bytes_out += cost.bytes_out;
        self.bytes_in += cost.bytes_in;

        if let Some(limit) = self.spec.max_calls
            && self.calls > limit
        {
            return Err(BudgetError::MaxCalls(limit));
        }
        if let Some(limit) = self.spec.max_total_ms
            && self.ms > limit
        {
            return Err(BudgetError::MaxTotalMs(limit));
        }
        if let Some(limit) = self.spec.max_total_bytes
            && self.bytes_out > limit
        {
            return Err(BudgetError::MaxTotalBytes(limit));
        }

        let elapsed = self.started.elapsed().as_secs_f64().max(1e-6);
        if let Some(limit) = self.spec.max_qps
            && self.calls as f64 / elapsed > limit
        {
            return Err(BudgetError::MaxQps(limit));
        }
        if let Some(limit) = self.spec.max_bandwidth
            && self.bytes_out as f64 / elapsed > limit as f64
        {
            return Err(BudgetError::MaxBandwidth(limit));
        }

        if let Some(max_tokens) = self.spec.max_tokens
            && scopes.exec_scope.total.is_none()
        {
            scopes.exec_scope.total = Some(max_tokens);
            scopes.exec_scope.remaining = Some(max_tokens);
        }

        if cost.tokens > 0 {
            scopes.consume(cost.tokens)?;
        }
        Ok(())
    }
}

/// Why a capability call failed.
#[derive(Debug, Clone)]
pub enum CapCallError {
    /// Budget violation; not catchable by user code.
    Budget(BudgetError),
    /// Validator or underlying-function failure; catchable.
    App(String),
}

/// A capability bound into sandbox globals under its spec name.
pub struct CapabilityHandle {
    spec: CapabilitySpec,
    func: CapFunc,
    validator: Option<Validator>,
    serializer: Option<Serializer>,
    budget: RefCell<BudgetManager>,
    ctx: Rc<RefCell<RunCtx>>,
}

impl CapabilityHandle {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The single call contract: validate, measure, invoke, serialize,
    /// charge, audit.
    pub fn call(&self, args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, CapCallError> {
        // Validation failures propagate before any cost is charged.
        let limits = SerializeLimits::default();
        let json_args: Vec<Json> = args.iter().map(|v| v.to_safe_json(&limits)).collect();
        let json_kwargs: Kwargs = kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_safe_json(&limits)))
            .collect();
        if let Some(validator) = &self.validator {
            validator(&json_args, &json_kwargs).map_err(CapCallError::App)?;
        }

        let bytes_in = args.iter().map(approx_bytes).sum::<u64>()
            + kwargs.iter().map(|(_, v)| approx_bytes(v)).sum::<u64>();

        let start = Instant::now();
        let outcome = (self.func)(&json_args, &json_kwargs).and_then(|ret| {
            match &self.serializer {
                Some(serializer) => serializer(ret),
                None => Ok(ret),
            }
        });
        let ms = start.elapsed().as_millis() as u64;

        let bytes_out = match &outcome {
            Ok(ret) => cordon_core::value::approx_bytes(ret),
            Err(_) => 0,
        };
        let tokens = self.spec.tokens_per_call
            + (self.spec.tokens_per_byte * bytes_out as f64) as u64;
        let cost = CapabilityCost {
            calls: 1,
            ms,
            bytes_in,
            bytes_out,
            tokens,
        };

        let mut ctx = self.ctx.borrow_mut();
        let charge = {
            let ctx = &mut *ctx;
            self.budget.borrow_mut().charge(&cost, &mut ctx.scopes)
        };

        let name = self.spec.name.clone();
        {
            let budget = self.budget.borrow();
            ctx.metrics.cap_calls.insert(name.clone(), budget.calls);
            ctx.metrics.cap_ms.insert(name.clone(), budget.ms);
            ctx.metrics
                .cap_bytes_out
                .insert(name.clone(), budget.bytes_out);
            ctx.metrics
                .cap_bytes_in
                .insert(name.clone(), budget.bytes_in);
        }

        let limit = self.spec.arg_repr_limit;
        let mut record = json!({
            "name": name,
            "ok": outcome.is_ok() && charge.is_ok(),
            "ms": ms,
            "bytes_out": bytes_out,
            "bytes_in": bytes_in,
            "args": clip(&Value::tuple(args.to_vec()).py_repr(), limit),
            "kwargs": clip(&kwargs_repr(kwargs), limit),
        });
        if let Err(e) = &outcome {
            record["error"] = Json::from(e.clone());
        } else if let Err(e) = &charge {
            record["error"] = Json::from(e.to_string());
        }
        ctx.emit("cap", record);
        drop(ctx);

        // A budget violation outranks the call's own outcome.
        charge.map_err(CapCallError::Budget)?;
        outcome
            .map(|ret| Value::from_json(&ret))
            .map_err(CapCallError::App)
    }
}

fn clip(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        s.chars().take(limit).collect()
    }
}

fn kwargs_repr(kwargs: &[(String, Value)]) -> String {
    let items: Vec<String> = kwargs
        .iter()
        .map(|(k, v)| format!("'{k}': {}", v.py_repr()))
        .collect();
    format!("{{{}}}", items.join(", "))
}

/// Deferred close hook, run at teardown in reverse registration order.
pub type Closer = Box<dyn FnOnce()>;

/// Build capability wrappers for the run's globals, running init hooks and
/// collecting close hooks.
pub fn build_capabilities(
    specs: &[CapabilitySpec],
    mode: ExecMode,
    live: Option<&Registry>,
    ctx: &Rc<RefCell<RunCtx>>,
) -> Result<(Vec<(String, Rc<CapabilityHandle>)>, Vec<Closer>), String> {
    let mut handles = Vec::with_capacity(specs.len());
    let mut closers: Vec<Closer> = Vec::new();

    for spec in specs {
        let func = resolve_func(spec, mode, live)?;
        let validator = resolve_ref(spec.validator_ref.as_deref(), live, |r, n| r.validator(n))?;
        let serializer = resolve_ref(spec.serializer_ref.as_deref(), live, |r, n| r.serializer(n))?;
        let init = resolve_ref(spec.init_ref.as_deref(), live, |r, n| r.init(n))?;
        let close = resolve_ref(spec.close_ref.as_deref(), live, |r, n| r.close(n))?;

        let init_state = match init {
            Some(init) => init().map_err(|e| format!("cap '{}' init failed: {e}", spec.name))?,
            None => Json::Null,
        };
        if let Some(close) = close {
            closers.push(Box::new(move || close(&init_state)));
        }

        tracing::debug!(cap = %spec.name, mode = %mode, "Capability bound");
        let handle = Rc::new(CapabilityHandle {
            spec: spec.clone(),
            func,
            validator,
            serializer,
            budget: RefCell::new(BudgetManager::new(spec.budget.clone())),
            ctx: Rc::clone(ctx),
        });
        handles.push((spec.name.clone(), handle));
    }

    Ok((handles, closers))
}

fn resolve_func(
    spec: &CapabilitySpec,
    mode: ExecMode,
    live: Option<&Registry>,
) -> Result<CapFunc, String> {
    match mode {
        ExecMode::Fork => live
            .and_then(|r| r.func(&spec.name))
            .ok_or_else(|| format!("cap '{}' not in registry (fork mode)", spec.name)),
        ExecMode::Spawn => {
            let func_ref = spec
                .func_ref
                .as_deref()
                .ok_or_else(|| format!("cap '{}' missing func_ref (spawn mode)", spec.name))?;
            registry::with_global(|r| r.func(func_ref))
                .ok_or_else(|| format!("cap '{}': unknown registry entry '{func_ref}'", spec.name))
        }
    }
}

/// Look a named hook up in the live registry first, then the global one.
fn resolve_ref<T>(
    name: Option<&str>,
    live: Option<&Registry>,
    get: impl Fn(&Registry, &str) -> Option<T>,
) -> Result<Option<T>, String> {
    let Some(name) = name else {
        return Ok(None);
    };
    if let Some(live) = live
        && let Some(found) = get(live, name)
    {
        return Ok(Some(found));
    }
    registry::with_global(|r| get(r, name))
        .map(Some)
        .ok_or_else(|| format!("unknown registry entry '{name}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::audit::AuditStream;
    use cordon_core::capability::TokenScope;
    use crate::determinism::Clock;

    fn test_ctx(scopes: ScopeBundle) -> Rc<RefCell<RunCtx>> {
        Rc::new(RefCell::new(RunCtx::new(
            AuditStream::new(vec![]),
            scopes,
            Clock::real(),
            4096,
            4096,
            None,
        )))
    }

    fn add_handle(
        spec: CapabilitySpec,
        ctx: &Rc<RefCell<RunCtx>>,
    ) -> Rc<CapabilityHandle> {
        Rc::new(CapabilityHandle {
            budget: RefCell::new(BudgetManager::new(spec.budget.clone())),
            spec,
            func: Arc::new(|args: &[Json], _: &Kwargs| {
                let sum: i64 = args.iter().filter_map(Json::as_i64).sum();
                Ok(Json::from(sum))
            }),
            validator: None,
            serializer: None,
            ctx: Rc::clone(ctx),
        })
    }

    use std::sync::Arc;

    #[test]
    fn call_returns_serialized_value_and_emits_event() {
        let ctx = test_ctx(ScopeBundle::default());
        let handle = add_handle(CapabilitySpec::new("add"), &ctx);
        let out = handle.call(&[Value::Int(1), Value::Int(2)], &[]).unwrap();
        assert!(out.py_eq(&Value::Int(3)));

        let ctx = ctx.borrow();
        let events = ctx.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "cap");
        assert_eq!(events[0].data["name"], "add");
        assert_eq!(events[0].data["ok"], true);
        assert_eq!(ctx.metrics.cap_calls["add"], 1);
    }

    #[test]
    fn max_calls_trips_on_the_next_call() {
        let ctx = test_ctx(ScopeBundle::default());
        let spec = CapabilitySpec::new("add").with_budget(BudgetSpec {
            max_calls: Some(1),
            ..BudgetSpec::default()
        });
        let handle = add_handle(spec, &ctx);
        handle.call(&[Value::Int(1)], &[]).unwrap();
        let err = handle.call(&[Value::Int(2)], &[]).unwrap_err();
        assert!(matches!(
            err,
            CapCallError::Budget(BudgetError::MaxCalls(1))
        ));
    }

    #[test]
    fn budget_is_charged_even_when_the_function_fails() {
        let ctx = test_ctx(ScopeBundle::default());
        let spec = CapabilitySpec::new("boom");
        let handle = Rc::new(CapabilityHandle {
            budget: RefCell::new(BudgetManager::new(spec.budget.clone())),
            spec,
            func: Arc::new(|_: &[Json], _: &Kwargs| Err("kaput".to_string())),
            validator: None,
            serializer: None,
            ctx: Rc::clone(&ctx),
        });
        let err = handle.call(&[], &[]).unwrap_err();
        assert!(matches!(err, CapCallError::App(ref m) if m == "kaput"));
        let ctx = ctx.borrow();
        assert_eq!(ctx.metrics.cap_calls["boom"], 1);
        assert_eq!(ctx.audit.events()[0].data["ok"], false);
    }

    #[test]
    fn tokens_consume_from_exec_scope() {
        let ctx = test_ctx(ScopeBundle::new(Some(5), None, None));
        let spec = CapabilitySpec::new("add").with_tokens_per_call(2);
        let handle = add_handle(spec, &ctx);
        handle.call(&[Value::Int(1)], &[]).unwrap();
        assert_eq!(ctx.borrow().scopes.exec_scope.remaining, Some(3));
    }

    #[test]
    fn token_shortfall_is_a_budget_error() {
        let ctx = test_ctx(ScopeBundle::new(Some(1), Some(0), Some(0)));
        let spec = CapabilitySpec::new("add").with_tokens_per_call(2);
        let handle = add_handle(spec, &ctx);
        let err = handle.call(&[Value::Int(1)], &[]).unwrap_err();
        assert!(matches!(
            err,
            CapCallError::Budget(BudgetError::TokenBudgetScopes)
        ));
    }

    #[test]
    fn max_tokens_initialises_the_exec_scope() {
        let ctx = test_ctx(ScopeBundle::default());
        let spec = CapabilitySpec::new("add")
            .with_budget(BudgetSpec {
                max_tokens: Some(1),
                ..BudgetSpec::default()
            })
            .with_tokens_per_call(2);
        let handle = add_handle(spec, &ctx);
        let err = handle.call(&[Value::Int(1)], &[]).unwrap_err();
        assert!(matches!(err, CapCallError::Budget(_)));
        assert_eq!(ctx.borrow().scopes.exec_scope.total, Some(1));
    }

    #[test]
    fn max_ret_bytes_checks_the_single_return() {
        let ctx = test_ctx(ScopeBundle::default());
        let spec = CapabilitySpec::new("big").with_budget(BudgetSpec {
            max_ret_bytes: Some(4),
            ..BudgetSpec::default()
        });
        let handle = Rc::new(CapabilityHandle {
            budget: RefCell::new(BudgetManager::new(spec.budget.clone())),
            spec,
            func: Arc::new(|_: &[Json], _: &Kwargs| Ok(Json::from("abcdefgh"))),
            validator: None,
            serializer: None,
            ctx: Rc::clone(&ctx),
        });
        let err = handle.call(&[], &[]).unwrap_err();
        assert!(matches!(
            err,
            CapCallError::Budget(BudgetError::MaxRetBytes(4))
        ));
    }

    #[test]
    fn charge_order_checks_per_call_limits_first() {
        let mut mgr = BudgetManager::new(BudgetSpec {
            max_call_ms: Some(10),
            max_calls: Some(0),
            ..BudgetSpec::default()
        });
        let mut scopes = ScopeBundle::default();
        let cost = CapabilityCost {
            calls: 1,
            ms: 50,
            bytes_in: 0,
            bytes_out: 0,
            tokens: 0,
        };
        // max_call_ms is checked before the (already exhausted) max_calls.
        assert!(matches!(
            mgr.charge(&cost, &mut scopes),
            Err(BudgetError::MaxCallMs(10))
        ));
    }

    #[test]
    fn exec_scope_snapshot_reflects_consumption() {
        let mut scopes = ScopeBundle::new(Some(4), None, None);
        let mut mgr = BudgetManager::new(BudgetSpec::default());
        let cost = CapabilityCost {
            calls: 1,
            ms: 0,
            bytes_in: 0,
            bytes_out: 0,
            tokens: 3,
        };
        mgr.charge(&cost, &mut scopes).unwrap();
        assert_eq!(scopes.exec_scope.remaining, Some(1));
        assert_eq!(TokenScope::new(Some(4)).total, Some(4));
    }
}
