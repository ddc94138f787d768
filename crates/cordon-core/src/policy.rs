use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::schema::Schema;

/// Deterministic-source configuration for a run.
///
/// When present, the worker seeds its PRNG entry points with `seed` and,
/// if `fake_time` is set, replaces the process-wide clock with a counter
/// that returns `fake_time + n * time_step`. Every clock read observes
/// progress: reading the clock advances `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterminismConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub fake_time: Option<f64>,
    #[serde(default)]
    pub time_step: f64,
    /// Format spec applied by the serializer to every float leaf, e.g. ".6f".
    #[serde(default)]
    pub float_format: Option<String>,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            fake_time: None,
            time_step: 0.0,
            float_format: None,
        }
    }
}

/// Filesystem confinement mode for the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsMode {
    /// No filesystem restriction.
    None,
    /// Redirect temp env vars into a sandbox directory and chdir there.
    Tmp,
    /// Remount the root filesystem read-only.
    Ro,
}

/// OS-level confinement applied inside the worker before user code runs.
///
/// Each restriction is best-effort unless its enforce flag promotes an
/// inability to apply it into a fatal `worker` error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsSandboxConfig {
    /// Path to a seccomp profile JSON document.
    #[serde(default)]
    pub seccomp_profile: Option<String>,
    #[serde(default)]
    pub seccomp_enforce: bool,
    /// Deny network syscalls with EACCES.
    #[serde(default = "default_true")]
    pub no_network: bool,
    #[serde(default = "default_fs_mode")]
    pub fs_mode: FsMode,
    #[serde(default)]
    pub fs_enforce: bool,
    #[serde(default)]
    pub fs_chroot: bool,
    #[serde(default)]
    pub tmp_dir: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_fs_mode() -> FsMode {
    FsMode::Tmp
}

impl Default for OsSandboxConfig {
    fn default() -> Self {
        Self {
            seccomp_profile: None,
            seccomp_enforce: false,
            no_network: true,
            fs_mode: FsMode::Tmp,
            fs_enforce: false,
            fs_chroot: false,
            tmp_dir: None,
        }
    }
}

/// Immutable execution policy: allowlists, syntax switches, and limits.
///
/// Allowlist sets are `BTreeSet`/`BTreeMap` so the wire form is sorted
/// without extra canonicalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Builtins exposed inside the sandbox globals.
    pub builtin_allowlist: BTreeSet<String>,

    /// Bare names callable as `f(...)`.
    pub call_name_allowlist: BTreeSet<String>,

    /// Permitted `root.attr` pairs, e.g. {"math": {"sin", "pi"}}.
    #[serde(default)]
    pub attr_allowlist: BTreeMap<String, BTreeSet<String>>,

    // Syntax switches
    #[serde(default)]
    pub allow_def: bool,
    #[serde(default)]
    pub allow_lambda: bool,
    #[serde(default)]
    pub allow_class: bool,
    #[serde(default)]
    pub allow_try: bool,
    #[serde(default)]
    pub allow_with: bool,
    #[serde(default = "default_true")]
    pub allow_loops: bool,
    #[serde(default = "default_true")]
    pub allow_comprehension: bool,
    #[serde(default = "default_true")]
    pub allow_subscript: bool,

    /// Double-underscore identifiers permitted (the result contract).
    #[serde(default = "default_dunder_names")]
    pub allow_dunder_names: BTreeSet<String>,

    // Loop iterable gating
    #[serde(default = "default_true")]
    pub restrict_loop_iterables: bool,
    #[serde(default = "default_loop_iter_allowlist")]
    pub loop_iter_allowlist: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub allow_loop_iter_literals: bool,
    #[serde(default = "default_true")]
    pub allow_loop_iter_names: bool,

    // Complexity limits
    #[serde(default = "default_max_ast_nodes")]
    pub max_ast_nodes: u64,
    #[serde(default = "default_max_nesting")]
    pub max_loop_nesting: u32,
    #[serde(default = "default_max_nesting")]
    pub max_comp_nesting: u32,
    #[serde(default = "default_max_literal_elems")]
    pub max_literal_elems: u64,
    #[serde(default = "default_max_const_alloc_elems")]
    pub max_const_alloc_elems: u64,

    // Runtime limits
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    // Output limits
    #[serde(default = "default_max_stream_bytes")]
    pub max_stdout_bytes: usize,
    #[serde(default = "default_max_stream_bytes")]
    pub max_stderr_bytes: usize,

    // Best-effort OS limits (Linux)
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_seconds")]
    pub max_cpu_seconds: u64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
    #[serde(default = "default_max_recursion")]
    pub max_recursion: u32,

    #[serde(default)]
    pub determinism: Option<DeterminismConfig>,

    // Type shaping (JSON-schema-like)
    #[serde(default)]
    pub input_schema: Option<Schema>,
    #[serde(default)]
    pub output_schema: Option<Schema>,

    #[serde(default)]
    pub os_sandbox: Option<OsSandboxConfig>,
}

fn default_dunder_names() -> BTreeSet<String> {
    ["__result__", "__events__", "__stats__"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_loop_iter_allowlist() -> BTreeSet<String> {
    ["range", "list", "tuple"].into_iter().map(String::from).collect()
}

fn default_max_ast_nodes() -> u64 {
    7_000
}
fn default_max_nesting() -> u32 {
    3
}
fn default_max_literal_elems() -> u64 {
    100_000
}
fn default_max_const_alloc_elems() -> u64 {
    1_000_000
}
fn default_timeout_ms() -> u64 {
    800
}
fn default_max_steps() -> u64 {
    120_000
}
fn default_max_stream_bytes() -> usize {
    32_000
}
fn default_max_memory_mb() -> u64 {
    256
}
fn default_max_cpu_seconds() -> u64 {
    1
}
fn default_max_open_files() -> u64 {
    32
}
fn default_max_recursion() -> u32 {
    300
}

impl Policy {
    /// Permissive default: basic numeric/string/collection builtins, no
    /// roots, conservative syntax switches and limits.
    pub fn default_permissive() -> Self {
        let safe_builtins: BTreeSet<String> = [
            "None", "True", "False", "abs", "all", "any", "bool", "dict",
            "enumerate", "float", "int", "len", "list", "max", "min", "range",
            "reversed", "round", "set", "sorted", "str", "sum", "tuple", "zip",
            "print",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            builtin_allowlist: safe_builtins.clone(),
            call_name_allowlist: safe_builtins,
            attr_allowlist: BTreeMap::new(),
            allow_def: false,
            allow_lambda: false,
            allow_class: false,
            allow_try: false,
            allow_with: false,
            allow_loops: true,
            allow_comprehension: true,
            allow_subscript: true,
            allow_dunder_names: default_dunder_names(),
            restrict_loop_iterables: true,
            loop_iter_allowlist: default_loop_iter_allowlist(),
            allow_loop_iter_literals: true,
            allow_loop_iter_names: true,
            max_ast_nodes: default_max_ast_nodes(),
            max_loop_nesting: default_max_nesting(),
            max_comp_nesting: default_max_nesting(),
            max_literal_elems: default_max_literal_elems(),
            max_const_alloc_elems: default_max_const_alloc_elems(),
            timeout_ms: default_timeout_ms(),
            max_steps: default_max_steps(),
            max_stdout_bytes: default_max_stream_bytes(),
            max_stderr_bytes: default_max_stream_bytes(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_seconds: default_max_cpu_seconds(),
            max_open_files: default_max_open_files(),
            max_recursion: default_max_recursion(),
            determinism: None,
            input_schema: None,
            output_schema: None,
            os_sandbox: None,
        }
    }

    /// Permissive default plus the default OS sandbox config.
    pub fn default_confined() -> Self {
        Self {
            os_sandbox: Some(OsSandboxConfig::default()),
            ..Self::default_permissive()
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::default_permissive()
    }
}

// Historical aliases kept for callers that pinned a versioned default.
// v05 through v09 are the bare permissive policy; v10 onward add the
// default OS sandbox.
pub fn default_policy_v05() -> Policy {
    Policy::default_permissive()
}
pub fn default_policy_v06() -> Policy {
    default_policy_v05()
}
pub fn default_policy_v07() -> Policy {
    default_policy_v06()
}
pub fn default_policy_v08() -> Policy {
    default_policy_v07()
}
pub fn default_policy_v09() -> Policy {
    default_policy_v08()
}
pub fn default_policy_v10() -> Policy {
    Policy::default_confined()
}
pub fn default_policy_v11() -> Policy {
    default_policy_v10()
}
pub fn default_policy_v12() -> Policy {
    default_policy_v11()
}
pub fn default_policy_v13() -> Policy {
    default_policy_v12()
}
pub fn default_policy_v14() -> Policy {
    default_policy_v13()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_exposes_basic_builtins_only() {
        let p = Policy::default_permissive();
        assert!(p.builtin_allowlist.contains("range"));
        assert!(p.builtin_allowlist.contains("print"));
        assert!(!p.builtin_allowlist.contains("eval"));
        assert!(!p.builtin_allowlist.contains("open"));
        assert!(p.attr_allowlist.is_empty());
        assert!(!p.allow_def);
        assert!(p.allow_loops);
    }

    #[test]
    fn versioned_aliases_agree() {
        assert_eq!(default_policy_v05(), default_policy_v09());
        let v14 = default_policy_v14();
        assert_eq!(v14.os_sandbox, Some(OsSandboxConfig::default()));
        assert_eq!(
            Policy {
                os_sandbox: None,
                ..v14
            },
            default_policy_v05()
        );
    }

    #[test]
    fn policy_round_trips_through_json() {
        let p = Policy::default_confined();
        let s = serde_json::to_string(&p).unwrap();
        let back: Policy = serde_json::from_str(&s).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn wire_form_encodes_sets_as_sorted_sequences() {
        let p = Policy::default_permissive();
        let v = serde_json::to_value(&p).unwrap();
        let names: Vec<&str> = v["builtin_allowlist"]
            .as_array()
            .unwrap()
            .iter()
            .map(|x| x.as_str().unwrap())
            .collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
