//! OS-level confinement for the worker process.
//!
//! Resource limits are best-effort; filesystem and syscall restrictions are
//! best-effort unless the config's enforce flags promote failure to a fatal
//! worker error. Everything here mutates the *current* process — it must
//! run in the worker, never in the façade.

use cordon_core::policy::{FsMode, OsSandboxConfig, Policy};
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SandboxSetupError(pub String);

fn fail(msg: impl Into<String>) -> SandboxSetupError {
    SandboxSetupError(msg.into())
}

pub const ALLOWED_ACTIONS: [&str; 7] = [
    "SCMP_ACT_ALLOW",
    "SCMP_ACT_ERRNO",
    "SCMP_ACT_KILL",
    "SCMP_ACT_TRAP",
    "SCMP_ACT_LOG",
    "SCMP_ACT_KILL_PROCESS",
    "SCMP_ACT_KILL_THREAD",
];

const NETWORK_SYSCALLS: [&str; 15] = [
    "socket",
    "connect",
    "accept",
    "accept4",
    "bind",
    "listen",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "getsockopt",
    "setsockopt",
    "getpeername",
    "getsockname",
    "shutdown",
];

/// Validate a seccomp profile document. Unknown fields are allowed;
/// unknown action strings are not.
pub fn validate_seccomp_profile(profile: &Json) -> Result<(), SandboxSetupError> {
    let Json::Object(doc) = profile else {
        return Err(fail("seccomp profile must be an object"));
    };
    let Some(default_action) = doc.get("defaultAction") else {
        return Err(fail("seccomp profile missing defaultAction"));
    };
    if !default_action
        .as_str()
        .is_some_and(|a| ALLOWED_ACTIONS.contains(&a))
    {
        return Err(fail("seccomp defaultAction invalid"));
    }
    let Some(Json::Array(syscalls)) = doc.get("syscalls") else {
        return Err(fail("seccomp syscalls must be a list"));
    };
    for rule in syscalls {
        let Json::Object(rule) = rule else {
            return Err(fail("seccomp syscall rule must be an object"));
        };
        let action = rule
            .get("action")
            .map(|a| a.as_str().unwrap_or_default())
            .unwrap_or("SCMP_ACT_ALLOW");
        if !ALLOWED_ACTIONS.contains(&action) {
            return Err(fail("seccomp syscall action invalid"));
        }
        let Some(Json::Array(names)) = rule.get("names") else {
            return Err(fail("seccomp syscall names must be a list"));
        };
        if names.is_empty() {
            return Err(fail("seccomp syscall names must be a list"));
        }
        for name in names {
            if !name.as_str().is_some_and(|n| !n.is_empty()) {
                return Err(fail("seccomp syscall name invalid"));
            }
        }
    }
    Ok(())
}

/// Merge `names` into the profile's first `SCMP_ACT_ALLOW` rule, creating
/// one if absent. The rule's name list stays sorted and deduplicated.
pub fn merge_allow_syscalls(profile: &mut Json, names: &[&str]) -> Result<(), SandboxSetupError> {
    validate_seccomp_profile(profile)?;
    let doc = profile.as_object_mut().expect("validated object");
    let syscalls = doc
        .entry("syscalls")
        .or_insert_with(|| Json::Array(vec![]))
        .as_array_mut()
        .expect("validated list");

    let allow_idx = syscalls.iter().position(|rule| {
        rule.get("action")
            .and_then(Json::as_str)
            .unwrap_or("SCMP_ACT_ALLOW")
            == "SCMP_ACT_ALLOW"
    });
    let idx = match allow_idx {
        Some(i) => i,
        None => {
            syscalls.push(serde_json::json!({
                "names": [],
                "action": "SCMP_ACT_ALLOW",
            }));
            syscalls.len() - 1
        }
    };

    let rule = syscalls[idx].as_object_mut().expect("validated rule");
    let existing = rule
        .get("names")
        .and_then(Json::as_array)
        .map(|a| a.iter().filter_map(Json::as_str))
        .into_iter()
        .flatten();
    // Set semantics: the existing list is deduplicated along with the
    // additions, and the result stays sorted.
    let mut merged: Vec<String> = Vec::new();
    for name in existing.chain(names.iter().copied()) {
        if !name.is_empty() && !merged.iter().any(|m| m == name) {
            merged.push(name.to_string());
        }
    }
    merged.sort_unstable();
    rule.insert("names".into(), Json::from(merged));
    validate_seccomp_profile(profile)
}

/// Apply CPU, address-space, and file-descriptor rlimits. Best-effort: a
/// limit the host refuses is skipped.
#[cfg(unix)]
pub fn apply_rlimits(policy: &Policy) {
    let limits = [
        (libc::RLIMIT_CPU, policy.max_cpu_seconds),
        (libc::RLIMIT_AS, policy.max_memory_mb * 1024 * 1024),
        (libc::RLIMIT_NOFILE, policy.max_open_files),
    ];
    for (resource, value) in limits {
        let lim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads the provided struct.
        let rc = unsafe { libc::setrlimit(resource, &lim) };
        if rc != 0 {
            tracing::debug!(value, "setrlimit refused");
        }
    }
}

#[cfg(not(unix))]
pub fn apply_rlimits(_policy: &Policy) {}

/// Start a new session so the supervisor can signal the whole group.
#[cfg(unix)]
pub fn enter_new_session() {
    let _ = nix::unistd::setsid();
}

#[cfg(not(unix))]
pub fn enter_new_session() {}

/// Process accounting after evaluation: (user_ms, sys_ms, max_rss_kb).
#[cfg(unix)]
pub fn collect_rusage() -> (u64, u64, u64) {
    // SAFETY: getrusage writes into the zeroed struct we hand it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return (0, 0, 0);
    }
    let tv_ms = |tv: libc::timeval| tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
    (
        tv_ms(usage.ru_utime),
        tv_ms(usage.ru_stime),
        usage.ru_maxrss.max(0) as u64,
    )
}

#[cfg(not(unix))]
pub fn collect_rusage() -> (u64, u64, u64) {
    (0, 0, 0)
}

/// Apply the full OS sandbox for this process.
///
/// On non-Linux hosts the sandbox is a no-op unless an enforce flag is
/// set, in which case inability to confine is fatal.
pub fn apply_os_sandbox(cfg: Option<&OsSandboxConfig>) -> Result<(), SandboxSetupError> {
    let Some(cfg) = cfg else {
        return Ok(());
    };
    if !cfg!(target_os = "linux") {
        if cfg.seccomp_enforce || cfg.fs_enforce {
            return Err(fail("OS sandbox requires Linux support"));
        }
        return Ok(());
    }
    #[cfg(target_os = "linux")]
    {
        apply_fs_sandbox(cfg)?;
        if cfg.seccomp_profile.is_some() || cfg.no_network {
            linux::apply_seccomp(cfg)?;
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply_fs_sandbox(cfg: &OsSandboxConfig) -> Result<(), SandboxSetupError> {
    match cfg.fs_mode {
        FsMode::None => Ok(()),
        FsMode::Tmp => {
            let dir = match &cfg.tmp_dir {
                Some(d) => std::path::PathBuf::from(d),
                None => tempfile::Builder::new()
                    .prefix("sandbox_")
                    .tempdir()
                    .map_err(|e| fail(format!("sandbox tmp dir: {e}")))?
                    .keep(),
            };
            for var in ["TMPDIR", "TEMP", "TMP"] {
                // SAFETY: the worker is single-threaded at setup time.
                unsafe { std::env::set_var(var, &dir) };
            }
            std::env::set_current_dir(&dir)
                .map_err(|e| fail(format!("chdir into sandbox tmp dir: {e}")))?;
            if cfg.fs_chroot {
                let chrooted = nix::unistd::chroot(&dir)
                    .and_then(|_| nix::unistd::chdir("/"));
                if chrooted.is_err() && cfg.fs_enforce {
                    return Err(fail("fs_chroot failed"));
                }
            }
            Ok(())
        }
        FsMode::Ro => {
            let status = std::process::Command::new("/bin/mount")
                .args(["-o", "remount,ro", "/"])
                .status();
            let ok = status.map(|s| s.success()).unwrap_or(false);
            if !ok && cfg.fs_enforce {
                return Err(fail("remount ro failed"));
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::BTreeMap;

    use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule};

    use super::*;

    pub fn apply_seccomp(cfg: &OsSandboxConfig) -> Result<(), SandboxSetupError> {
        if let Some(path) = &cfg.seccomp_profile {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| fail(format!("seccomp profile {path}: {e}")))?;
            let profile: Json = serde_json::from_str(&raw)
                .map_err(|e| fail(format!("seccomp profile {path}: {e}")))?;
            validate_seccomp_profile(&profile)?;
            install_profile(&profile, cfg.seccomp_enforce)?;
        }
        if cfg.no_network {
            install_network_deny(cfg.seccomp_enforce)?;
        }
        Ok(())
    }

    /// Deny network syscalls with EACCES, allowing everything else.
    fn install_network_deny(enforce: bool) -> Result<(), SandboxSetupError> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for name in NETWORK_SYSCALLS {
            match syscall_name_to_nr(name) {
                Some(nr) => {
                    rules.insert(nr, vec![]);
                }
                None if enforce => {
                    return Err(fail(format!("unknown syscall for deny rule: {name}")));
                }
                None => tracing::warn!(syscall = name, "Skipping unmapped syscall"),
            }
        }
        let filter = build_filter(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EACCES as u32),
        )?;
        apply(&filter)
    }

    /// Install a validated profile. Filters stack, so each action group
    /// becomes one filter; groups a single filter cannot express under a
    /// non-allow default are fatal only when enforcement is requested.
    fn install_profile(profile: &Json, enforce: bool) -> Result<(), SandboxSetupError> {
        let doc = profile.as_object().expect("validated profile");
        let default_action = doc
            .get("defaultAction")
            .and_then(Json::as_str)
            .expect("validated defaultAction");
        let empty = vec![];
        let syscalls = doc
            .get("syscalls")
            .and_then(Json::as_array)
            .unwrap_or(&empty);

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rule in syscalls {
            let action = rule
                .get("action")
                .and_then(Json::as_str)
                .unwrap_or("SCMP_ACT_ALLOW");
            let names = rule
                .get("names")
                .and_then(Json::as_array)
                .map(|a| a.iter().filter_map(Json::as_str).map(String::from))
                .into_iter()
                .flatten();
            groups.entry(action.to_string()).or_default().extend(names);
        }

        if default_action == "SCMP_ACT_ALLOW" {
            for (action, names) in &groups {
                if action == "SCMP_ACT_ALLOW" {
                    continue;
                }
                let rules = names_to_rules(names, enforce)?;
                let filter =
                    build_filter(rules, SeccompAction::Allow, action_from_str(action))?;
                apply(&filter)?;
            }
        } else {
            for action in groups.keys() {
                if action != "SCMP_ACT_ALLOW" && action != default_action && enforce {
                    return Err(fail(format!(
                        "seccomp profile mixes actions under non-allow default: {action}"
                    )));
                }
            }
            let names = groups.remove("SCMP_ACT_ALLOW").unwrap_or_default();
            let rules = names_to_rules(&names, enforce)?;
            let filter = build_filter(
                rules,
                action_from_str(default_action),
                SeccompAction::Allow,
            )?;
            apply(&filter)?;
        }
        Ok(())
    }

    fn names_to_rules(
        names: &[String],
        enforce: bool,
    ) -> Result<BTreeMap<i64, Vec<SeccompRule>>, SandboxSetupError> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for name in names {
            match syscall_name_to_nr(name) {
                Some(nr) => {
                    rules.insert(nr, vec![]);
                }
                None if enforce => {
                    return Err(fail(format!("unknown syscall in profile: {name}")));
                }
                None => tracing::warn!(syscall = %name, "Skipping unmapped syscall"),
            }
        }
        Ok(rules)
    }

    fn build_filter(
        rules: BTreeMap<i64, Vec<SeccompRule>>,
        mismatch: SeccompAction,
        matched: SeccompAction,
    ) -> Result<BpfProgram, SandboxSetupError> {
        let filter = SeccompFilter::new(rules, mismatch, matched, target_arch())
            .map_err(|e| fail(format!("seccomp filter: {e}")))?;
        filter
            .try_into()
            .map_err(|e: seccompiler::BackendError| fail(format!("seccomp compile: {e}")))
    }

    fn apply(program: &BpfProgram) -> Result<(), SandboxSetupError> {
        seccompiler::apply_filter(program).map_err(|e| fail(format!("seccomp apply: {e}")))
    }

    fn action_from_str(action: &str) -> SeccompAction {
        match action {
            "SCMP_ACT_ERRNO" => SeccompAction::Errno(libc::EACCES as u32),
            "SCMP_ACT_KILL" | "SCMP_ACT_KILL_THREAD" => SeccompAction::KillThread,
            "SCMP_ACT_KILL_PROCESS" => SeccompAction::KillProcess,
            "SCMP_ACT_TRAP" => SeccompAction::Trap,
            "SCMP_ACT_LOG" => SeccompAction::Log,
            _ => SeccompAction::Allow,
        }
    }

    fn target_arch() -> seccompiler::TargetArch {
        #[cfg(target_arch = "x86_64")]
        {
            seccompiler::TargetArch::x86_64
        }
        #[cfg(target_arch = "aarch64")]
        {
            seccompiler::TargetArch::aarch64
        }
    }

    /// Syscall names mapped to numbers for the architectures this crate
    /// targets. Names outside this table are skipped (or fatal under
    /// enforcement).
    fn syscall_name_to_nr(name: &str) -> Option<i64> {
        let nr = match name {
            "socket" => libc::SYS_socket,
            "connect" => libc::SYS_connect,
            "accept" => libc::SYS_accept,
            "accept4" => libc::SYS_accept4,
            "bind" => libc::SYS_bind,
            "listen" => libc::SYS_listen,
            "sendto" => libc::SYS_sendto,
            "recvfrom" => libc::SYS_recvfrom,
            "sendmsg" => libc::SYS_sendmsg,
            "recvmsg" => libc::SYS_recvmsg,
            "getsockopt" => libc::SYS_getsockopt,
            "setsockopt" => libc::SYS_setsockopt,
            "getpeername" => libc::SYS_getpeername,
            "getsockname" => libc::SYS_getsockname,
            "shutdown" => libc::SYS_shutdown,
            "read" => libc::SYS_read,
            "write" => libc::SYS_write,
            "readv" => libc::SYS_readv,
            "writev" => libc::SYS_writev,
            "close" => libc::SYS_close,
            "openat" => libc::SYS_openat,
            "fstat" => libc::SYS_fstat,
            "lseek" => libc::SYS_lseek,
            "fcntl" => libc::SYS_fcntl,
            "getcwd" => libc::SYS_getcwd,
            "chdir" => libc::SYS_chdir,
            "mmap" => libc::SYS_mmap,
            "munmap" => libc::SYS_munmap,
            "mprotect" => libc::SYS_mprotect,
            "mremap" => libc::SYS_mremap,
            "madvise" => libc::SYS_madvise,
            "brk" => libc::SYS_brk,
            "rt_sigaction" => libc::SYS_rt_sigaction,
            "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
            "rt_sigreturn" => libc::SYS_rt_sigreturn,
            "sigaltstack" => libc::SYS_sigaltstack,
            "futex" => libc::SYS_futex,
            "sched_yield" => libc::SYS_sched_yield,
            "nanosleep" => libc::SYS_nanosleep,
            "clock_gettime" => libc::SYS_clock_gettime,
            "clock_nanosleep" => libc::SYS_clock_nanosleep,
            "gettimeofday" => libc::SYS_gettimeofday,
            "getrandom" => libc::SYS_getrandom,
            "getpid" => libc::SYS_getpid,
            "gettid" => libc::SYS_gettid,
            "getuid" => libc::SYS_getuid,
            "geteuid" => libc::SYS_geteuid,
            "getgid" => libc::SYS_getgid,
            "getegid" => libc::SYS_getegid,
            "getrusage" => libc::SYS_getrusage,
            "uname" => libc::SYS_uname,
            "prctl" => libc::SYS_prctl,
            "exit" => libc::SYS_exit,
            "exit_group" => libc::SYS_exit_group,
            "wait4" => libc::SYS_wait4,
            "kill" => libc::SYS_kill,
            "tgkill" => libc::SYS_tgkill,
            "set_tid_address" => libc::SYS_set_tid_address,
            "set_robust_list" => libc::SYS_set_robust_list,
            "pipe2" => libc::SYS_pipe2,
            "dup" => libc::SYS_dup,
            "dup3" => libc::SYS_dup3,
            "epoll_create1" => libc::SYS_epoll_create1,
            "epoll_ctl" => libc::SYS_epoll_ctl,
            "epoll_pwait" => libc::SYS_epoll_pwait,
            _ => return None,
        };
        Some(nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_profile() -> Json {
        json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "syscalls": [
                {"names": ["read", "write"], "action": "SCMP_ACT_ALLOW"},
                {"names": ["socket"], "action": "SCMP_ACT_ERRNO"},
            ],
        })
    }

    #[test]
    fn valid_profile_passes() {
        validate_seccomp_profile(&valid_profile()).unwrap();
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut p = valid_profile();
        p["architectures"] = json!(["SCMP_ARCH_X86_64"]);
        validate_seccomp_profile(&p).unwrap();
    }

    #[test]
    fn missing_default_action_fails() {
        let err = validate_seccomp_profile(&json!({"syscalls": []})).unwrap_err();
        assert!(err.0.contains("defaultAction"));
    }

    #[test]
    fn unknown_action_strings_are_rejected() {
        let mut p = valid_profile();
        p["defaultAction"] = json!("SCMP_ACT_PONDER");
        assert!(validate_seccomp_profile(&p).is_err());

        let mut p = valid_profile();
        p["syscalls"][0]["action"] = json!("SCMP_ACT_PONDER");
        assert!(validate_seccomp_profile(&p).is_err());
    }

    #[test]
    fn empty_or_invalid_names_are_rejected() {
        let mut p = valid_profile();
        p["syscalls"][0]["names"] = json!([]);
        assert!(validate_seccomp_profile(&p).is_err());

        let mut p = valid_profile();
        p["syscalls"][0]["names"] = json!(["read", ""]);
        assert!(validate_seccomp_profile(&p).is_err());

        let mut p = valid_profile();
        p["syscalls"] = json!("nope");
        assert!(validate_seccomp_profile(&p).is_err());
    }

    #[test]
    fn merge_extends_the_allow_rule_sorted() {
        let mut p = valid_profile();
        merge_allow_syscalls(&mut p, &["close", "brk"]).unwrap();
        assert_eq!(
            p["syscalls"][0]["names"],
            json!(["brk", "close", "read", "write"])
        );
    }

    #[test]
    fn merge_dedups_existing_names() {
        let mut p = json!({
            "defaultAction": "SCMP_ACT_ERRNO",
            "syscalls": [
                {"names": ["open", "open", "read"], "action": "SCMP_ACT_ALLOW"},
            ],
        });
        merge_allow_syscalls(&mut p, &["read", "brk"]).unwrap();
        assert_eq!(p["syscalls"][0]["names"], json!(["brk", "open", "read"]));
    }

    #[test]
    fn merge_creates_an_allow_rule_when_absent() {
        let mut p = json!({
            "defaultAction": "SCMP_ACT_ALLOW",
            "syscalls": [{"names": ["socket"], "action": "SCMP_ACT_ERRNO"}],
        });
        merge_allow_syscalls(&mut p, &["read"]).unwrap();
        assert_eq!(p["syscalls"][1]["names"], json!(["read"]));
        assert_eq!(p["syscalls"][1]["action"], json!("SCMP_ACT_ALLOW"));
    }

    #[test]
    fn sandbox_noop_without_config() {
        apply_os_sandbox(None).unwrap();
    }
}
