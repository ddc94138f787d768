//! Payloads that cross the isolation boundary.
//!
//! The request carries everything the worker needs to rebuild its world:
//! policy, capability and root descriptors, inputs, mode, and token
//! balances. The response is the worker's entire outcome. Both are plain
//! JSON; sets serialize as sorted sequences and callables never appear.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::audit::AuditSinkSpec;
use crate::capability::CapabilitySpec;
use crate::policy::Policy;
use crate::result::{ErrorInfo, Event, Metrics, RunStats};
use crate::roots::RootSpec;

/// How the worker resolves side-effectful bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Inline forked worker: live registry entries, live roots, and live
    /// audit sinks are all reachable through inherited memory.
    Fork,
    /// Spawn-safe worker: everything resolves through named references.
    Spawn,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Fork => f.write_str("fork"),
            ExecMode::Spawn => f.write_str("spawn"),
        }
    }
}

/// One execution request, written to the worker's stdin in command mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub code: String,
    pub policy: Policy,
    #[serde(default)]
    pub cap_specs: Vec<CapabilitySpec>,
    #[serde(default)]
    pub root_specs: Vec<RootSpec>,
    #[serde(default)]
    pub inputs: Option<Json>,
    pub mode: ExecMode,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub session_tokens: Option<u64>,
    #[serde(default)]
    pub tenant_tokens: Option<u64>,
    #[serde(default)]
    pub audit_sink_specs: Vec<AuditSinkSpec>,
}

/// The worker's entire outcome, read from its stdout in command mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub result: Json,
    #[serde(default)]
    pub locals: Json,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub stats: Option<RunStats>,
}

impl WireResponse {
    /// Early-stage failure shell: no result, no locals, no stats.
    pub fn failure(error: ErrorInfo, events: Vec<Event>, metrics: Metrics) -> Self {
        Self {
            ok: false,
            error: Some(error),
            result: Json::Null,
            locals: Json::Null,
            events,
            metrics,
            stats: None,
        }
    }
}
