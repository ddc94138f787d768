//! Sandbox façade for Cordon.
//!
//! [`SandboxEnv`] orchestrates one execution end to end: input schema
//! gate, dispatch to an isolated worker (forked inline or spawned as an
//! external command), timeout supervision, output schema gate, and
//! session/tenant token bookkeeping.
//!
//! ```no_run
//! use cordon_core::Policy;
//! use cordon_env::SandboxEnv;
//!
//! # fn run() -> Result<(), cordon_env::EnvError> {
//! let mut env = SandboxEnv::builder(Policy::default_permissive()).build()?;
//! let result = env.execute("s = 0\nfor i in range(3): s = s + i\n__result__ = s", None, None);
//! assert!(result.ok);
//! # Ok(())
//! # }
//! ```
//!
//! Embedders using the external-command transport build their own worker
//! binary: register custom capabilities/roots in
//! `cordon_runtime::registry`, then delegate to [`worker_main`].

pub mod runner;
pub mod sandbox;
pub mod transport;

use std::io::Read;
use std::process::ExitCode;

use cordon_core::result::{ErrorInfo, Metrics, Stage};
use cordon_core::wire::{WireRequest, WireResponse};

pub use cordon_core::{
    default_policy_v14, BudgetSpec, CapabilitySpec, Policy, RootSpec, SandboxResult, Schema,
};
pub use runner::RunnerSpec;
pub use sandbox::{EnvError, SandboxEnv, SandboxEnvBuilder};

/// External worker entry: read one JSON request from stdin, run it, write
/// one JSON response to stdout. Exit code 0 on normal completion (payload
/// written), 2 on missing input.
pub fn worker_main() -> ExitCode {
    let mut raw = String::new();
    if std::io::stdin().read_to_string(&mut raw).is_err() || raw.trim().is_empty() {
        return ExitCode::from(2);
    }

    let response = match serde_json::from_str::<WireRequest>(&raw) {
        Ok(request) => cordon_runtime::worker::run_worker(&request, None),
        Err(e) => WireResponse::failure(
            ErrorInfo::new(Stage::Worker, "WorkerError", format!("invalid payload: {e}")),
            vec![],
            Metrics::default(),
        ),
    };

    match serde_json::to_string(&response) {
        Ok(payload) => {
            println!("{payload}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode worker response");
            ExitCode::from(2)
        }
    }
}
