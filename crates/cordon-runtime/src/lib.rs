//! Worker-side runtime for Cordon.
//!
//! Everything that executes inside the isolated worker process lives here:
//! the parser adapter, the static policy checker, the step-counted
//! evaluator with its safe builtins, root proxies, capability wrappers and
//! budget manager, deterministic sources, and OS-level confinement.
//!
//! The façade crate (`cordon-env`) drives this through [`worker::run_worker`]
//! — either in a forked child (inline transport) or from the
//! `cordon-worker` binary (external command transport). Embedders with
//! custom capabilities register them in [`registry`] before executing, and
//! build their own worker binary on top of `cordon-env` when using the
//! external transport.

pub mod builtins;
pub mod caps;
pub mod checker;
pub mod context;
pub mod determinism;
pub mod error;
pub mod eval;
pub mod os_sandbox;
pub mod parse;
pub mod proxies;
pub mod registry;
pub mod value;
pub mod worker;

pub use caps::{BudgetManager, CapabilityHandle};
pub use checker::{PolicyChecker, Violation};
pub use error::ExecError;
pub use os_sandbox::{merge_allow_syscalls, validate_seccomp_profile, SandboxSetupError};
pub use proxies::{RootMember, RootProxy, RootTarget, TableRoot};
pub use registry::Registry;
pub use value::Value;
pub use worker::{run_program, run_worker, LiveBindings};
