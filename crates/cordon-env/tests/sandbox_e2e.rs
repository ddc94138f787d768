//! End-to-end scenarios through the façade and the inline (forked)
//! transport.

#![cfg(unix)]

use cordon_core::capability::{BudgetSpec, CapabilitySpec};
use cordon_core::policy::Policy;
use cordon_core::result::Stage;
use cordon_core::roots::{allow_tree, leaf, value_leaf, RootSpec};
use cordon_core::schema::Schema;
use cordon_core::wire::ExecMode;
use cordon_env::SandboxEnv;
use serde_json::{json, Value as Json};

fn env_with_add(cap: CapabilitySpec) -> SandboxEnv {
    SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .cap_specs(vec![cap])
        .live_registry(|r| {
            r.register_func("add", |args, _| {
                let sum: i64 = args.iter().filter_map(Json::as_i64).sum();
                Ok(Json::from(sum))
            });
        })
        .build()
        .unwrap()
}

#[test]
fn loop_over_range_produces_result() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .build()
        .unwrap();
    let r = env.execute("s = 0\nfor i in range(3): s = s + i\n__result__ = s", None, None);
    assert!(r.ok, "{:?}", r.error);
    assert_eq!(r.result, json!(3));
    assert!(r.metrics.steps <= env.policy().max_steps);
}

#[test]
fn capability_max_calls_budget_trips() {
    let cap = CapabilitySpec::new("add").with_budget(BudgetSpec {
        max_calls: Some(1),
        ..BudgetSpec::default()
    });
    let mut env = env_with_add(cap);
    let r = env.execute("x = add(1,2)\ny = add(2,3)\n__result__ = x + y", None, None);
    assert!(!r.ok);
    let err = r.error.unwrap();
    assert_eq!(err.stage, Stage::Runtime);
    assert_eq!(err.kind, "CapabilityBudgetError");
}

#[test]
fn exec_tokens_bound_capability_usage() {
    let cap = CapabilitySpec::new("add").with_tokens_per_call(2);
    let mut env = env_with_add(cap);
    let r = env.execute("x = add(1,2)\n__result__ = x", None, Some(1));
    assert!(!r.ok);
    assert_eq!(r.error.unwrap().kind, "CapabilityBudgetError");
}

#[test]
fn session_tokens_persist_across_executions() {
    let cap = CapabilitySpec::new("add").with_tokens_per_call(2);
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .cap_specs(vec![cap])
        .live_registry(|r| {
            r.register_func("add", |args, _| {
                let sum: i64 = args.iter().filter_map(Json::as_i64).sum();
                Ok(Json::from(sum))
            });
        })
        .session_tokens(Some(3))
        .tenant_tokens(Some(0))
        .build()
        .unwrap();

    let r1 = env.execute("x = add(1,2)\n__result__ = x", None, Some(0));
    assert!(r1.ok, "{:?}", r1.error);
    assert_eq!(r1.stats.as_ref().unwrap().token_scopes.session, Some(1));
    assert_eq!(env.session_tokens(), Some(1));

    let r2 = env.execute("x = add(1,2)\n__result__ = x", None, Some(0));
    assert!(!r2.ok);
    assert_eq!(r2.error.unwrap().kind, "CapabilityBudgetError");
}

#[test]
fn output_schema_gates_the_result() {
    let mut policy = Policy::default_permissive();
    policy.output_schema = Some(Schema::doc(json!({"type": "string", "format": "email"})));
    let mut env = SandboxEnv::builder(policy)
        .mode(ExecMode::Fork)
        .build()
        .unwrap();

    let r = env.execute("__result__ = 'nope'", None, None);
    assert!(!r.ok);
    assert_eq!(r.error.unwrap().stage, Stage::Schema);

    let r = env.execute("__result__ = 'a@b.com'", None, None);
    assert!(r.ok, "{:?}", r.error);
}

#[test]
fn suspicious_constant_allocation_is_a_policy_error() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .build()
        .unwrap();
    let r = env.execute("x = list(range(2000000))\n__result__ = 1", None, None);
    assert!(!r.ok);
    let err = r.error.unwrap();
    assert_eq!(err.stage, Stage::Policy);
    assert_eq!(err.message, "suspicious constant allocation");
}

#[test]
fn import_is_rejected_by_policy() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .build()
        .unwrap();
    let r = env.execute("import os\n__result__ = 1", None, None);
    assert!(!r.ok);
    assert_eq!(r.error.unwrap().stage, Stage::Policy);
}

#[test]
fn timeout_kills_the_worker() {
    let mut policy = Policy::default_permissive();
    policy.timeout_ms = 150;
    policy.max_steps = u64::MAX;
    let mut env = SandboxEnv::builder(policy)
        .mode(ExecMode::Fork)
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let r = env.execute("n = 0\nwhile True:\n    n = n + 1", None, None);
    assert!(!r.ok);
    let err = r.error.unwrap();
    assert_eq!(err.stage, Stage::Timeout);
    assert_eq!(err.message, "exceeded 150ms");
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn root_proxy_is_reachable_through_the_facade() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .root_specs(vec![RootSpec::new(
            "math",
            "math",
            allow_tree([("sin", leaf()), ("pi", value_leaf())]),
        )])
        .build()
        .unwrap();
    let r = env.execute("__result__ = math.sin(0.0) + math.pi", None, None);
    assert!(r.ok, "{:?}", r.error);
    let v = r.result.as_f64().unwrap();
    assert!((v - std::f64::consts::PI).abs() < 1e-9);
}

#[test]
fn attribute_outside_allowlist_is_a_policy_error() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .root_specs(vec![RootSpec::new(
            "math",
            "math",
            allow_tree([("sin", leaf())]),
        )])
        .build()
        .unwrap();
    let r = env.execute("__result__ = math.cos(0.0)", None, None);
    assert!(!r.ok);
    let err = r.error.unwrap();
    assert_eq!(err.stage, Stage::Policy);
    assert_eq!(err.message, "attribute 'math.cos' is not allowed");
}

#[test]
fn user_events_and_stats_round_trip() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .build()
        .unwrap();
    let r = env.execute(
        "print('hi')\n__events__ = [{'type': 'user', 'data': {'x': 1}}]\n__stats__ = {'n': 5}\n__result__ = 0",
        None,
        None,
    );
    assert!(r.ok, "{:?}", r.error);
    assert_eq!(r.events[0].kind, "stdout");
    assert!(r.events.iter().any(|e| e.kind == "user" && e.data == json!({"x": 1})));
    let stats = r.stats.unwrap();
    assert_eq!(stats.user, json!({"n": 5}));
    // Timestamps are monotonic-nondecreasing relative to run start.
    let ts: Vec<i64> = r.events.iter().map(|e| e.ts_ms).collect();
    assert!(ts.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn inputs_validate_against_the_input_schema() {
    let mut policy = Policy::default_permissive();
    policy.input_schema = Some(Schema::doc(json!({
        "type": "object",
        "properties": {"x": {"type": "integer"}},
        "required": ["x"],
    })));
    let mut env = SandboxEnv::builder(policy)
        .mode(ExecMode::Fork)
        .build()
        .unwrap();

    let r = env.execute("__result__ = x + 1", Some(json!({"x": 41})), None);
    assert!(r.ok, "{:?}", r.error);
    assert_eq!(r.result, json!(42));

    let r = env.execute("__result__ = 1", Some(json!({"x": "nope"})), None);
    assert!(!r.ok);
    assert_eq!(r.error.unwrap().stage, Stage::Schema);
}

#[test]
fn dunder_identifiers_outside_allowlist_are_rejected() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .build()
        .unwrap();
    let r = env.execute("x = __class__\n__result__ = 1", None, None);
    assert!(!r.ok);
    let err = r.error.unwrap();
    assert_eq!(err.stage, Stage::Policy);
    assert_eq!(err.message, "dunder names are not allowed");
}

#[test]
fn locals_and_result_are_bounded_json() {
    let mut env = SandboxEnv::builder(Policy::default_permissive())
        .mode(ExecMode::Fork)
        .build()
        .unwrap();
    let r = env.execute("xs = [1, 'two', 2.5, None, True]\n__result__ = xs", None, None);
    assert!(r.ok, "{:?}", r.error);
    assert_eq!(r.result, json!([1, "two", 2.5, null, true]));
    assert_eq!(r.locals["xs"], json!([1, "two", 2.5, null, true]));
}
