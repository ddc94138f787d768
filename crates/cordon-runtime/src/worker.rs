//! The isolation worker: runs one request to completion and returns the
//! whole outcome as a serializable payload.
//!
//! `run_worker` applies process confinement (session, rlimits, OS sandbox)
//! and then delegates to `run_program`, which owns the parse → check →
//! bind → evaluate → collect pipeline. The split keeps the pipeline
//! testable in-process, where crippling the test runner with rlimits would
//! be unwelcome.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use cordon_core::audit::{build_audit_sinks, AuditSink, AuditStream};
use cordon_core::capability::ScopeBundle;
use cordon_core::result::{ErrorInfo, Metrics, RunStats, Stage, TokenScopeSnapshot};
use cordon_core::value::SerializeLimits;
use cordon_core::wire::{WireRequest, WireResponse};
use serde_json::{json, Map, Value as Json};

use crate::builtins;
use crate::caps::build_capabilities;
use crate::checker::PolicyChecker;
use crate::context::{RunCtx, StreamKind};
use crate::determinism;
use crate::error::ExecError;
use crate::eval::{Interp, Scope};
use crate::os_sandbox;
use crate::parse::{parse_program, LineIndex};
use crate::proxies::RootProxy;
use crate::registry::{self, Registry};
use crate::value::{Builtin, Value};

/// In-memory bindings available only to fork-mode workers: a live
/// registry (capabilities and root targets) and live audit sinks.
#[derive(Default)]
pub struct LiveBindings {
    pub registry: Registry,
    pub sinks: Vec<Arc<dyn AuditSink>>,
}

/// Full worker entry: confine the current process, then run the program.
pub fn run_worker(req: &WireRequest, live: Option<&LiveBindings>) -> WireResponse {
    os_sandbox::enter_new_session();
    let started = Instant::now();
    os_sandbox::apply_rlimits(&req.policy);

    if let Err(e) = os_sandbox::apply_os_sandbox(req.policy.os_sandbox.as_ref()) {
        let mut metrics = Metrics::default();
        metrics.wall_ms = started.elapsed().as_millis() as u64;
        let error = ErrorInfo::new(Stage::Worker, "SandboxError", e.to_string());
        return WireResponse::failure(error, vec![], metrics);
    }

    run_program(req, live)
}

/// The evaluation pipeline, without process-level confinement.
pub fn run_program(req: &WireRequest, live: Option<&LiveBindings>) -> WireResponse {
    let started = Instant::now();
    let clock = determinism::install(req.policy.determinism.as_ref());
    let float_format = req
        .policy
        .determinism
        .as_ref()
        .and_then(|d| d.float_format.clone());

    let mut sinks: Vec<Arc<dyn AuditSink>> = match live {
        Some(l) => l.sinks.clone(),
        None => Vec::new(),
    };
    match build_audit_sinks(&req.audit_sink_specs) {
        Ok(built) => sinks.extend(built),
        Err(e) => {
            let error = ErrorInfo::new(Stage::Worker, "SandboxError", e.to_string());
            return failure_response(error, Vec::new(), Metrics::default(), started);
        }
    }

    let ctx = Rc::new(std::cell::RefCell::new(RunCtx::new(
        AuditStream::new(sinks),
        ScopeBundle::new(req.tokens, req.session_tokens, req.tenant_tokens),
        clock,
        req.policy.max_stdout_bytes,
        req.policy.max_stderr_bytes,
        float_format.clone(),
    )));

    let index = LineIndex::new(&req.code);

    // Stage: parse.
    let suite = match parse_program(&req.code) {
        Ok(suite) => suite,
        Err(e) => {
            let error = ErrorInfo::new(Stage::Parse, "SyntaxError", e.message)
                .with_location(&req.code, Some(e.lineno), Some(e.col));
            return teardown_failure(error, &ctx, started);
        }
    };

    // Stage: policy check.
    let known_iters = known_iter_names(req.inputs.as_ref());
    let checker = PolicyChecker::new(&req.policy, &index, known_iters);
    let ast_nodes = match checker.check(&suite) {
        Ok(n) => n,
        Err(v) => {
            let error = ErrorInfo::new(Stage::Policy, "SandboxError", v.message)
                .with_location(&req.code, Some(v.lineno), Some(v.col));
            return teardown_failure(error, &ctx, started);
        }
    };
    ctx.borrow_mut().metrics.ast_nodes = ast_nodes;

    // Stage: bind globals (builtins, roots, capabilities).
    let mut globals: HashMap<String, Value> = HashMap::new();
    for name in &req.policy.builtin_allowlist {
        if let Some(b) = Builtin::from_name(name) {
            globals.insert(name.clone(), Value::Builtin(b));
        }
    }
    for spec in &req.root_specs {
        let target = live
            .and_then(|l| l.registry.root(&spec.target))
            .or_else(|| registry::with_global(|r| r.root(&spec.target)));
        let Some(target) = target else {
            let error = ErrorInfo::new(
                Stage::Worker,
                "SandboxError",
                format!("root target '{}' is not registered", spec.target),
            );
            return teardown_failure(error, &ctx, started);
        };
        let proxy = RootProxy::new(&spec.name, target, spec.allow_tree.clone());
        globals.insert(spec.name.clone(), Value::Root(Rc::new(proxy)));
    }
    let (cap_handles, closers) = match build_capabilities(
        &req.cap_specs,
        req.mode,
        live.map(|l| &l.registry),
        &ctx,
    ) {
        Ok(built) => built,
        Err(e) => {
            let error = ErrorInfo::new(Stage::Worker, "SandboxError", e);
            return teardown_failure(error, &ctx, started);
        }
    };
    for (name, handle) in cap_handles {
        globals.insert(name, Value::Capability(handle));
    }

    // Stage: seed locals from frozen inputs.
    let scope = Scope::root();
    match &req.inputs {
        Some(Json::Object(map)) => {
            for (k, v) in map {
                scope.set(k.clone(), Value::frozen_from_json(v));
            }
        }
        Some(Json::Null) | None => {}
        Some(other) => scope.set("input", Value::frozen_from_json(other)),
    }

    // Stage: evaluate.
    let mut interp = Interp::new(
        Rc::clone(&ctx),
        globals,
        &index,
        req.policy.max_steps,
        req.policy.max_recursion,
    );
    let outcome = interp.run_module(&suite, &scope);
    let steps = interp.steps;
    drop(interp);

    // Stage: release closers in reverse registration order.
    for closer in closers.into_iter().rev() {
        closer();
    }

    let error = outcome.err().map(|e| runtime_error_info(e, &req.code));

    // Stage: collect bindings and user events.
    let limits = SerializeLimits::with_max_bytes(req.policy.max_stdout_bytes)
        .with_float_format(float_format.as_deref());

    let mut locals = Map::new();
    for (name, value) in scope.locals() {
        if !name.starts_with("__") {
            locals.insert(name, value.to_safe_json(&limits));
        }
    }
    let result = scope
        .get("__result__")
        .map(|v| v.to_safe_json(&limits))
        .unwrap_or(Json::Null);
    let user_stats = scope
        .get("__stats__")
        .map(|v| v.to_safe_json(&limits))
        .unwrap_or(Json::Null);

    if let Some(raw_events) = scope.get("__events__") {
        emit_user_events(&ctx, &raw_events, &limits);
    }

    // Stage: final accounting.
    let (user_ms, sys_ms, max_rss_kb) = os_sandbox::collect_rusage();
    let (events, mut metrics, scopes) = {
        let ctx = ctx.borrow();
        (
            ctx.audit.events().to_vec(),
            ctx.metrics.clone(),
            ctx.scopes.clone(),
        )
    };
    metrics.steps = steps;
    metrics.wall_ms = started.elapsed().as_millis() as u64;
    metrics.stdout_bytes = ctx.borrow().stream_bytes(StreamKind::Stdout);
    metrics.stderr_bytes = ctx.borrow().stream_bytes(StreamKind::Stderr);
    metrics.user_ms = user_ms;
    metrics.sys_ms = sys_ms;
    metrics.max_rss_kb = max_rss_kb;

    determinism::reset();

    WireResponse {
        ok: error.is_none(),
        error,
        result,
        locals: Json::Object(locals),
        events,
        metrics,
        stats: Some(RunStats {
            user: user_stats,
            token_scopes: TokenScopeSnapshot {
                exec: scopes.exec_scope.remaining,
                session: scopes.session_scope.remaining,
                tenant: scopes.tenant_scope.remaining,
            },
        }),
    }
}

fn runtime_error_info(e: ExecError, code: &str) -> ErrorInfo {
    let tb = e.traceback(3);
    let mut info = ErrorInfo::new(Stage::Runtime, e.kind.clone(), e.message.clone())
        .with_location(code, e.lineno, None);
    info.tb = tb;
    info
}

/// Names of input bindings that are iterable, seeded into the checker's
/// loop-iterable tracker.
fn known_iter_names(inputs: Option<&Json>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    match inputs {
        Some(Json::Object(map)) => {
            for (k, v) in map {
                if v.is_array() {
                    out.insert(k.clone());
                }
            }
        }
        Some(Json::Array(_)) => {
            out.insert("input".to_string());
        }
        _ => {}
    }
    out
}

/// Append user-declared events after all captured output events.
fn emit_user_events(
    ctx: &Rc<std::cell::RefCell<RunCtx>>,
    raw: &Value,
    limits: &SerializeLimits,
) {
    let items = match raw {
        Value::List(_) | Value::Tuple(_) => builtins::iter_items(raw).unwrap_or_default(),
        other => vec![other.clone()],
    };
    for item in items {
        let rendered = item.to_safe_json(limits);
        let mut ctx = ctx.borrow_mut();
        match rendered {
            Json::Object(map) => {
                let kind = map
                    .get("type")
                    .and_then(Json::as_str)
                    .unwrap_or("user")
                    .to_string();
                let ts_ms = map.get("ts_ms").and_then(Json::as_i64);
                let data = match map.get("data") {
                    Some(data) if !data.is_null() => data.clone(),
                    _ => {
                        let rest: Map<String, Json> = map
                            .iter()
                            .filter(|(k, _)| !matches!(k.as_str(), "type" | "ts_ms" | "data"))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        Json::Object(rest)
                    }
                };
                match ts_ms {
                    Some(ts) => {
                        let event = cordon_core::result::Event::new(ts, kind, data);
                        ctx.audit.emit(event);
                    }
                    None => ctx.emit(&kind, data),
                }
            }
            other => ctx.emit("user", json!({ "value": other })),
        }
    }
}

fn failure_response(
    error: ErrorInfo,
    events: Vec<cordon_core::result::Event>,
    mut metrics: Metrics,
    started: Instant,
) -> WireResponse {
    metrics.wall_ms = started.elapsed().as_millis() as u64;
    WireResponse::failure(error, events, metrics)
}

fn teardown_failure(
    error: ErrorInfo,
    ctx: &Rc<std::cell::RefCell<RunCtx>>,
    started: Instant,
) -> WireResponse {
    determinism::reset();
    let ctx = ctx.borrow();
    failure_response(
        error,
        ctx.audit.events().to_vec(),
        ctx.metrics.clone(),
        started,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::capability::{BudgetSpec, CapabilitySpec};
    use cordon_core::policy::{DeterminismConfig, Policy};
    use cordon_core::roots::{allow_tree, leaf, value_leaf, RootSpec};
    use cordon_core::wire::ExecMode;
    use serde_json::json;

    fn add_registry() -> Registry {
        let mut r = Registry::new();
        r.register_func("add", |args, _| {
            let sum: i64 = args.iter().filter_map(Json::as_i64).sum();
            Ok(Json::from(sum))
        });
        r
    }

    fn request(code: &str) -> WireRequest {
        WireRequest {
            code: code.into(),
            policy: Policy::default_permissive(),
            cap_specs: vec![],
            root_specs: vec![],
            inputs: None,
            mode: ExecMode::Fork,
            tokens: None,
            session_tokens: None,
            tenant_tokens: None,
            audit_sink_specs: vec![],
        }
    }

    fn run_live(req: &WireRequest) -> WireResponse {
        let live = LiveBindings {
            registry: add_registry(),
            sinks: vec![],
        };
        run_program(req, Some(&live))
    }

    #[test]
    fn loop_program_produces_result() {
        let req = request("s = 0\nfor i in range(3):\n    s = s + i\n__result__ = s\n");
        let resp = run_live(&req);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(3));
        assert!(resp.metrics.steps > 0);
        assert!(resp.metrics.ast_nodes > 0);
        assert!(resp.metrics.steps <= req.policy.max_steps);
    }

    #[test]
    fn locals_are_collected_without_dunders() {
        let resp = run_live(&request("x = 1\nys = [1, 2]\n__result__ = 2\n"));
        assert_eq!(resp.locals, json!({"x": 1, "ys": [1, 2]}));
    }

    #[test]
    fn parse_error_reports_excerpt_and_caret() {
        let resp = run_live(&request("x =\n__result__ = 1\n"));
        assert!(!resp.ok);
        let err = resp.error.unwrap();
        assert_eq!(err.stage, Stage::Parse);
        assert!(err.excerpt.is_some());
        assert!(err.caret.is_some());
        assert!(resp.stats.is_none());
    }

    #[test]
    fn policy_error_carries_location() {
        let resp = run_live(&request("x = 1\nimport os\n"));
        let err = resp.error.unwrap();
        assert_eq!(err.stage, Stage::Policy);
        assert_eq!(err.kind, "SandboxError");
        assert_eq!(err.message, "import is not allowed");
        assert_eq!(err.lineno, Some(2));
        assert_eq!(err.col, Some(1));
    }

    #[test]
    fn runtime_error_has_trimmed_traceback() {
        let resp = run_live(&request("x = 1\ny = x / 0\n__result__ = y\n"));
        let err = resp.error.unwrap();
        assert_eq!(err.stage, Stage::Runtime);
        assert_eq!(err.kind, "ZeroDivisionError");
        assert_eq!(err.lineno, Some(2));
        let tb = err.tb.unwrap();
        assert!(tb.starts_with("Traceback"));
        assert!(tb.contains("line 2"));
    }

    #[test]
    fn step_limit_is_a_runtime_error() {
        let mut req = request("n = 0\nwhile True:\n    n = n + 1\n");
        req.policy.max_steps = 60;
        let resp = run_live(&req);
        let err = resp.error.unwrap();
        assert_eq!(err.stage, Stage::Runtime);
        assert_eq!(err.kind, "StepLimitError");
        assert_eq!(resp.metrics.steps, 61);
    }

    #[test]
    fn capability_calls_flow_through_budget_and_events() {
        let mut req = request("x = add(1, 2)\n__result__ = x\n");
        req.cap_specs = vec![CapabilitySpec::new("add")];
        req.policy.call_name_allowlist.insert("add".into());
        let resp = run_live(&req);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(3));
        assert_eq!(resp.metrics.cap_calls["add"], 1);
        assert!(resp.events.iter().any(|e| e.kind == "cap"));
    }

    #[test]
    fn capability_budget_violation_is_runtime_error() {
        let mut req = request("x = add(1, 2)\ny = add(2, 3)\n__result__ = x + y\n");
        req.cap_specs = vec![CapabilitySpec::new("add").with_budget(BudgetSpec {
            max_calls: Some(1),
            ..BudgetSpec::default()
        })];
        req.policy.call_name_allowlist.insert("add".into());
        let resp = run_live(&req);
        let err = resp.error.unwrap();
        assert_eq!(err.stage, Stage::Runtime);
        assert_eq!(err.kind, "CapabilityBudgetError");
    }

    #[test]
    fn exec_tokens_limit_capability_calls() {
        let mut req = request("x = add(1, 2)\n__result__ = x\n");
        req.cap_specs = vec![CapabilitySpec::new("add").with_tokens_per_call(2)];
        req.policy.call_name_allowlist.insert("add".into());
        req.tokens = Some(1);
        let resp = run_live(&req);
        let err = resp.error.unwrap();
        assert_eq!(err.kind, "CapabilityBudgetError");

        req.tokens = Some(5);
        let resp = run_live(&req);
        assert!(resp.ok);
        assert_eq!(resp.stats.unwrap().token_scopes.exec, Some(3));
    }

    #[test]
    fn session_scope_is_drawn_when_exec_unlimited() {
        let mut req = request("x = add(1, 2)\n__result__ = x\n");
        req.cap_specs = vec![CapabilitySpec::new("add").with_tokens_per_call(2)];
        req.policy.call_name_allowlist.insert("add".into());
        req.session_tokens = Some(5);
        req.tenant_tokens = Some(0);
        let resp = run_live(&req);
        assert!(resp.ok);
        let scopes = resp.stats.unwrap().token_scopes;
        assert_eq!(scopes.exec, None);
        assert_eq!(scopes.session, Some(3));
        assert_eq!(scopes.tenant, Some(0));
    }

    #[test]
    fn spawn_mode_resolves_func_refs_from_global_registry() {
        registry::with_global_mut(|r| {
            r.register_func("tests:triple", |args, _| {
                let x = args.first().and_then(Json::as_i64).unwrap_or(0);
                Ok(Json::from(x * 3))
            });
        });
        let mut req = request("__result__ = triple(7)\n");
        req.mode = ExecMode::Spawn;
        req.cap_specs = vec![CapabilitySpec::new("triple").with_func_ref("tests:triple")];
        req.policy.call_name_allowlist.insert("triple".into());
        let resp = run_program(&req, None);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(21));
    }

    #[test]
    fn missing_registry_entry_is_a_worker_error() {
        let mut req = request("__result__ = nope()\n");
        req.mode = ExecMode::Spawn;
        req.cap_specs = vec![CapabilitySpec::new("nope").with_func_ref("tests:missing")];
        req.policy.call_name_allowlist.insert("nope".into());
        let resp = run_program(&req, None);
        let err = resp.error.unwrap();
        assert_eq!(err.stage, Stage::Worker);
    }

    #[test]
    fn math_root_is_gated_by_allow_tree() {
        let mut req = request("__result__ = math.sqrt(9.0) + math.pi\n");
        req.root_specs = vec![RootSpec::new(
            "math",
            "math",
            allow_tree([("sqrt", leaf()), ("pi", value_leaf())]),
        )];
        req.policy
            .attr_allowlist
            .entry("math".into())
            .or_default()
            .extend(["sqrt".to_string(), "pi".to_string()]);
        let resp = run_program(&req, None);
        assert!(resp.ok, "{:?}", resp.error);
        let v = resp.result.as_f64().unwrap();
        assert!((v - (3.0 + std::f64::consts::PI)).abs() < 1e-9);
    }

    #[test]
    fn inputs_are_frozen_and_splatted() {
        let mut req = request("__result__ = xs[0] + xs[1]\n");
        req.inputs = Some(json!({"xs": [40, 2]}));
        let resp = run_live(&req);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(42));

        let mut req = request("xs[0] = 1\n");
        req.inputs = Some(json!({"xs": [40, 2]}));
        let resp = run_live(&req);
        let err = resp.error.unwrap();
        assert_eq!(err.kind, "TypeError");
    }

    #[test]
    fn input_mappings_allow_loop_iteration_over_their_arrays() {
        let mut req = request("s = 0\nfor v in xs:\n    s = s + v\n__result__ = s\n");
        req.inputs = Some(json!({"xs": [1, 2, 3]}));
        let resp = run_live(&req);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(6));
    }

    #[test]
    fn non_mapping_input_binds_as_input() {
        let mut req = request("__result__ = len(input)\n");
        req.inputs = Some(json!([1, 2, 3]));
        let resp = run_live(&req);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(3));
    }

    #[test]
    fn user_events_are_appended_after_captured_events() {
        let req = request(
            "print('first')\n__events__ = [{'type': 'user', 'data': {'x': 1}}, 'plain']\n__result__ = 0\n",
        );
        let resp = run_live(&req);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.events[0].kind, "stdout");
        assert_eq!(resp.events[1].kind, "user");
        assert_eq!(resp.events[1].data, json!({"x": 1}));
        assert_eq!(resp.events[2].data, json!({"value": "plain"}));
    }

    #[test]
    fn user_event_extra_keys_become_data() {
        let req = request("__events__ = [{'type': 'info', 'x': 5}]\n__result__ = 0\n");
        let resp = run_live(&req);
        let ev = &resp.events[0];
        assert_eq!(ev.kind, "info");
        assert_eq!(ev.data, json!({"x": 5}));
    }

    #[test]
    fn stats_binding_passes_through() {
        let resp = run_live(&request("__stats__ = {'n': 5}\n__result__ = 0\n"));
        let stats = resp.stats.unwrap();
        assert_eq!(stats.user, json!({"n": 5}));
        assert_eq!(stats.token_scopes.exec, None);
    }

    #[test]
    fn init_and_close_hooks_run_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static INITS: AtomicU32 = AtomicU32::new(0);
        static CLOSES: AtomicU32 = AtomicU32::new(0);

        registry::with_global_mut(|r| {
            r.register_func("hooks:noop", |_, _| Ok(Json::Null));
            r.register_init("hooks:init", || {
                INITS.fetch_add(1, Ordering::SeqCst);
                Ok(Json::from("state"))
            });
            r.register_close("hooks:close", |state| {
                if state.as_str() == Some("state") {
                    CLOSES.fetch_add(1, Ordering::SeqCst);
                }
            });
        });

        let mut spec = CapabilitySpec::new("noop").with_func_ref("hooks:noop");
        spec.init_ref = Some("hooks:init".into());
        spec.close_ref = Some("hooks:close".into());
        let mut req = request("__result__ = 1\n");
        req.mode = ExecMode::Spawn;
        req.cap_specs = vec![spec];
        req.policy.call_name_allowlist.insert("noop".into());

        let resp = run_program(&req, None);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
        assert_eq!(CLOSES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fake_time_advances_event_timestamps() {
        let mut req = request("print('a')\nprint('b')\n__result__ = 0\n");
        req.policy.determinism = Some(DeterminismConfig {
            seed: 0,
            fake_time: Some(1000.0),
            time_step: 0.5,
            float_format: None,
        });
        let resp = run_live(&req);
        assert!(resp.ok);
        let ts: Vec<i64> = resp.events.iter().map(|e| e.ts_ms).collect();
        assert_eq!(ts, vec![500, 1000]);
    }

    #[test]
    fn float_format_applies_to_result_leaves() {
        let mut req = request("__result__ = 1.23456\n");
        req.policy.determinism = Some(DeterminismConfig {
            seed: 0,
            fake_time: None,
            time_step: 0.0,
            float_format: Some(".2f".into()),
        });
        let resp = run_live(&req);
        assert_eq!(resp.result, json!("1.23"));
    }

    #[test]
    fn stdout_cap_limits_captured_bytes() {
        let mut req = request("print('aaaaaaaaaa')\nprint('bbbbbbbbbb')\n__result__ = 0\n");
        req.policy.max_stdout_bytes = 12;
        let resp = run_live(&req);
        assert!(resp.ok);
        assert!(resp.metrics.stdout_bytes <= 12);
    }
}
