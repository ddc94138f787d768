//! The sandbox façade: policy normalisation, input/output schema gates,
//! transport dispatch, and session/tenant token bookkeeping.

use cordon_core::audit::AuditSinkSpec;
use cordon_core::capability::CapabilitySpec;
use cordon_core::i18n::{timeout_message, translate_error};
use cordon_core::policy::Policy;
use cordon_core::result::{ErrorInfo, SandboxResult, Stage};
use cordon_core::roots::RootSpec;
use cordon_core::schema::{validate_schema_cached, Schema};
use cordon_core::value::{safe_json, SerializeLimits};
use cordon_core::wire::{ExecMode, WireRequest, WireResponse};
use cordon_runtime::worker::LiveBindings;
use serde_json::Value as Json;
use thiserror::Error;

use crate::runner::RunnerSpec;
use crate::transport::{self, TransportFailure};

/// Construction-time configuration errors.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("fork mode requires a Unix host")]
    ForkUnsupported,
    #[error("cap '{0}' missing func_ref in spawn-safe mode")]
    CapMissingFuncRef(String),
    #[error("live registry entries are not supported in spawn-safe modes; use func_ref")]
    LiveRegistryNotSpawnSafe,
    #[error("live audit sinks are not supported in spawn-safe modes; use audit_sink_specs")]
    LiveSinksNotSpawnSafe,
    #[error("{0}_schema must be a JSON document in spawn-safe modes")]
    SchemaNotSpawnSafe(&'static str),
    #[error("command runner requires spawn mode")]
    CommandRequiresSpawn,
}

/// Configures and builds a [`SandboxEnv`].
pub struct SandboxEnvBuilder {
    policy: Policy,
    mode: ExecMode,
    cap_specs: Vec<CapabilitySpec>,
    root_specs: Vec<RootSpec>,
    runner: RunnerSpec,
    live: LiveBindings,
    live_registry_used: bool,
    live_sinks_used: bool,
    audit_sink_specs: Vec<AuditSinkSpec>,
    session_tokens: Option<u64>,
    tenant_tokens: Option<u64>,
    locale: String,
}

impl SandboxEnvBuilder {
    pub fn mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn cap_specs(mut self, specs: Vec<CapabilitySpec>) -> Self {
        self.cap_specs = specs;
        self
    }

    pub fn root_specs(mut self, specs: Vec<RootSpec>) -> Self {
        self.root_specs = specs;
        self
    }

    pub fn runner(mut self, runner: RunnerSpec) -> Self {
        self.runner = runner;
        self
    }

    /// Live in-process bindings for fork mode: capability functions and
    /// root targets registered by name, plus in-memory audit sinks.
    pub fn live_registry(
        mut self,
        configure: impl FnOnce(&mut cordon_runtime::Registry),
    ) -> Self {
        configure(&mut self.live.registry);
        self.live_registry_used = true;
        self
    }

    pub fn live_sink(mut self, sink: std::sync::Arc<dyn cordon_core::AuditSink>) -> Self {
        self.live.sinks.push(sink);
        self.live_sinks_used = true;
        self
    }

    pub fn audit_sink_specs(mut self, specs: Vec<AuditSinkSpec>) -> Self {
        self.audit_sink_specs = specs;
        self
    }

    pub fn session_tokens(mut self, tokens: Option<u64>) -> Self {
        self.session_tokens = tokens;
        self
    }

    pub fn tenant_tokens(mut self, tokens: Option<u64>) -> Self {
        self.tenant_tokens = tokens;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn build(self) -> Result<SandboxEnv, EnvError> {
        if self.mode == ExecMode::Fork && !cfg!(unix) {
            return Err(EnvError::ForkUnsupported);
        }
        if self.mode != ExecMode::Fork {
            // Spawn-safe configurations must survive serialization: no
            // live registries, no live sinks, no host-side schema checks.
            if self.live_registry_used {
                return Err(EnvError::LiveRegistryNotSpawnSafe);
            }
            if self.live_sinks_used {
                return Err(EnvError::LiveSinksNotSpawnSafe);
            }
            for spec in &self.cap_specs {
                if spec.func_ref.is_none() {
                    return Err(EnvError::CapMissingFuncRef(spec.name.clone()));
                }
            }
            if matches!(&self.policy.input_schema, Some(s) if !s.is_doc()) {
                return Err(EnvError::SchemaNotSpawnSafe("input"));
            }
            if matches!(&self.policy.output_schema, Some(s) if !s.is_doc()) {
                return Err(EnvError::SchemaNotSpawnSafe("output"));
            }
        }
        if self.runner.is_command() && self.mode != ExecMode::Spawn {
            return Err(EnvError::CommandRequiresSpawn);
        }

        // Normalise the policy: root allow-trees feed the attribute
        // allowlist, capability names become callable bare names.
        let mut policy = self.policy;
        for spec in &self.root_specs {
            policy
                .attr_allowlist
                .entry(spec.name.clone())
                .or_default()
                .extend(spec.attr_allow());
        }
        for spec in &self.cap_specs {
            policy.call_name_allowlist.insert(spec.name.clone());
        }

        tracing::debug!(
            mode = %self.mode,
            caps = self.cap_specs.len(),
            roots = self.root_specs.len(),
            "Sandbox environment ready"
        );

        Ok(SandboxEnv {
            policy,
            mode: self.mode,
            cap_specs: self.cap_specs,
            root_specs: self.root_specs,
            runner: self.runner,
            live: self.live,
            audit_sink_specs: self.audit_sink_specs,
            session_tokens: self.session_tokens,
            tenant_tokens: self.tenant_tokens,
            locale: self.locale,
        })
    }
}

/// A confined execution environment.
///
/// Executions are serialised through `&mut self`; session and tenant token
/// balances mutate only when a worker returns.
pub struct SandboxEnv {
    policy: Policy,
    mode: ExecMode,
    cap_specs: Vec<CapabilitySpec>,
    root_specs: Vec<RootSpec>,
    runner: RunnerSpec,
    live: LiveBindings,
    audit_sink_specs: Vec<AuditSinkSpec>,
    session_tokens: Option<u64>,
    tenant_tokens: Option<u64>,
    locale: String,
}

impl std::fmt::Debug for SandboxEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnv")
            .field("mode", &self.mode)
            .field("runner", &self.runner)
            .field("session_tokens", &self.session_tokens)
            .field("tenant_tokens", &self.tenant_tokens)
            .field("locale", &self.locale)
            .finish_non_exhaustive()
    }
}

impl SandboxEnv {
    pub fn builder(policy: Policy) -> SandboxEnvBuilder {
        SandboxEnvBuilder {
            policy,
            mode: ExecMode::Spawn,
            cap_specs: Vec::new(),
            root_specs: Vec::new(),
            runner: RunnerSpec::local(),
            live: LiveBindings::default(),
            live_registry_used: false,
            live_sinks_used: false,
            audit_sink_specs: Vec::new(),
            session_tokens: None,
            tenant_tokens: None,
            locale: "en".into(),
        }
    }

    /// The normalised policy this environment enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn session_tokens(&self) -> Option<u64> {
        self.session_tokens
    }

    pub fn tenant_tokens(&self) -> Option<u64> {
        self.tenant_tokens
    }

    /// Execute one program: validate inputs, dispatch to the worker under
    /// timeout supervision, validate the result, update token balances.
    pub fn execute(&mut self, code: &str, inputs: Option<Json>, tokens: Option<u64>) -> SandboxResult {
        let safe_inputs = inputs.map(|i| safe_json(&i, &SerializeLimits::default()));

        if let Some(schema) = &self.policy.input_schema {
            let value = safe_inputs.clone().unwrap_or(Json::Null);
            if let Err(e) = validate_schema_cached(&value, schema) {
                let error = ErrorInfo::new(Stage::Schema, "SchemaError", e.to_string());
                return SandboxResult::failure(self.translate(error));
            }
        }

        let request = WireRequest {
            code: code.to_string(),
            policy: self.wire_policy(),
            cap_specs: self.cap_specs.clone(),
            root_specs: self.root_specs.clone(),
            inputs: safe_inputs,
            mode: self.mode,
            tokens,
            session_tokens: self.session_tokens,
            tenant_tokens: self.tenant_tokens,
            audit_sink_specs: self.audit_sink_specs.clone(),
        };

        let timeout_ms = self.policy.timeout_ms;
        let dispatched = match &self.runner {
            RunnerSpec::Local => transport::execute_inline(&request, &self.live, timeout_ms),
            RunnerSpec::Command { command, env, cwd } => {
                transport::execute_command(&request, command, env.as_ref(), cwd.as_ref(), timeout_ms)
            }
        };

        let response = match dispatched {
            Ok(response) => response,
            Err(TransportFailure::Timeout) => {
                let error = ErrorInfo::new(
                    Stage::Timeout,
                    "TimeoutError",
                    timeout_message(timeout_ms, Some(&self.locale)),
                );
                return SandboxResult::failure(error);
            }
            Err(TransportFailure::Worker { kind, message }) => {
                let error = ErrorInfo::new(Stage::Worker, kind, message);
                return SandboxResult::failure(self.translate(error));
            }
        };

        self.collect(response)
    }

    fn collect(&mut self, response: WireResponse) -> SandboxResult {
        if let Some(stats) = &response.stats {
            self.session_tokens = stats.token_scopes.session;
            self.tenant_tokens = stats.token_scopes.tenant;
        }

        let WireResponse {
            ok,
            error,
            result,
            locals,
            events,
            metrics,
            stats,
        } = response;

        if ok && let Some(schema) = &self.policy.output_schema {
            if let Err(e) = validate_schema_cached(&result, schema) {
                let error = ErrorInfo::new(Stage::Schema, "SchemaError", e.to_string());
                return SandboxResult {
                    ok: false,
                    result,
                    locals,
                    error: Some(self.translate(error)),
                    events,
                    metrics,
                    stats,
                };
            }
        }

        SandboxResult {
            ok,
            result,
            locals,
            error: error.map(|e| self.translate(e)),
            events,
            metrics,
            stats,
        }
    }

    fn translate(&self, error: ErrorInfo) -> ErrorInfo {
        translate_error(error, &self.locale)
    }

    /// The policy as sent on the wire: host-side schema checks are kept
    /// out of the worker copy (spawn-safe modes never have them).
    fn wire_policy(&self) -> Policy {
        let strip = |s: &Option<Schema>| match s {
            Some(schema) if schema.is_doc() => Some(schema.clone()),
            _ => None,
        };
        Policy {
            input_schema: strip(&self.policy.input_schema),
            output_schema: strip(&self.policy.output_schema),
            ..self.policy.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::roots::{allow_tree, leaf, value_leaf};
    use serde_json::json;

    fn base_policy() -> Policy {
        Policy::default_permissive()
    }

    #[test]
    fn construction_merges_root_allowlists() {
        let env = SandboxEnv::builder(base_policy())
            .root_specs(vec![RootSpec::new(
                "math",
                "math",
                allow_tree([("sin", leaf()), ("pi", value_leaf())]),
            )])
            .build()
            .unwrap();
        let allowed = &env.policy().attr_allowlist["math"];
        assert!(allowed.contains("sin"));
        assert!(allowed.contains("pi"));
    }

    #[test]
    fn construction_adds_cap_names_to_call_allowlist() {
        let env = SandboxEnv::builder(base_policy())
            .cap_specs(vec![CapabilitySpec::new("add").with_func_ref("demo:add")])
            .build()
            .unwrap();
        assert!(env.policy().call_name_allowlist.contains("add"));
    }

    #[test]
    fn spawn_mode_requires_func_refs() {
        let err = SandboxEnv::builder(base_policy())
            .cap_specs(vec![CapabilitySpec::new("add")])
            .build()
            .unwrap_err();
        assert!(matches!(err, EnvError::CapMissingFuncRef(name) if name == "add"));
    }

    #[test]
    fn spawn_mode_rejects_live_bindings() {
        let err = SandboxEnv::builder(base_policy())
            .live_registry(|r| r.register_func("x", |_, _| Ok(Json::Null)))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnvError::LiveRegistryNotSpawnSafe));

        let err = SandboxEnv::builder(base_policy())
            .live_sink(std::sync::Arc::new(cordon_core::MemoryAuditSink::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnvError::LiveSinksNotSpawnSafe));
    }

    #[test]
    fn spawn_mode_rejects_host_schema_checks() {
        let mut policy = base_policy();
        policy.input_schema = Some(Schema::check(|_| Ok(())));
        let err = SandboxEnv::builder(policy).build().unwrap_err();
        assert!(matches!(err, EnvError::SchemaNotSpawnSafe("input")));
    }

    #[test]
    fn fork_mode_accepts_live_bindings() {
        let env = SandboxEnv::builder(base_policy())
            .mode(ExecMode::Fork)
            .live_registry(|r| r.register_func("x", |_, _| Ok(Json::Null)))
            .live_sink(std::sync::Arc::new(cordon_core::MemoryAuditSink::new()))
            .build();
        assert!(env.is_ok());
    }

    #[test]
    fn command_runner_requires_spawn_mode() {
        let err = SandboxEnv::builder(base_policy())
            .mode(ExecMode::Fork)
            .runner(RunnerSpec::command(vec!["cordon-worker".into()]))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnvError::CommandRequiresSpawn));
    }

    #[test]
    fn input_schema_gate_rejects_before_dispatch() {
        let mut policy = base_policy();
        policy.input_schema = Some(Schema::doc(json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}},
            "required": ["x"],
        })));
        let mut env = SandboxEnv::builder(policy).build().unwrap();

        let result = env.execute("__result__ = 1", Some(json!({"x": "nope"})), None);
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().stage, Stage::Schema);
    }
}
