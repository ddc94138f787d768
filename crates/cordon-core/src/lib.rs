//! Core model for Cordon: declarative policy, capability budgets, result
//! types, bounded serialization, schema validation, and the wire payloads
//! that cross the isolation boundary.
//!
//! This crate is pure data and validation — nothing here spawns processes
//! or executes untrusted code. The evaluation side lives in
//! `cordon-runtime`; orchestration in `cordon-env`.

pub mod audit;
pub mod capability;
pub mod i18n;
pub mod policy;
pub mod result;
pub mod roots;
pub mod schema;
pub mod value;
pub mod wire;

pub use audit::{AuditSink, AuditSinkSpec, AuditStream, MemoryAuditSink};
pub use capability::{
    BudgetError, BudgetSpec, CapabilityCost, CapabilitySpec, ScopeBundle, TokenScope,
};
pub use policy::{default_policy_v14, DeterminismConfig, FsMode, OsSandboxConfig, Policy};
pub use result::{
    ErrorInfo, Event, Metrics, RunStats, SandboxResult, Stage, TokenScopeSnapshot,
};
pub use roots::{allow_tree, leaf, value_leaf, AllowNode, AllowTree, RootSpec};
pub use schema::{validate_schema_cached, Schema, SchemaError};
pub use value::{approx_bytes, safe_json, SerializeLimits};
pub use wire::{ExecMode, WireRequest, WireResponse};
