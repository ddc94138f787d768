//! Transports across the isolation boundary, plus the timeout supervisor.
//!
//! Both transports put the worker in its own process group and guarantee
//! it is terminated before returning: on expiry the supervisor sends a
//! group TERM, a process TERM, polls for exit with a small backoff, and
//! finishes with KILL.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use cordon_core::wire::{WireRequest, WireResponse};
use cordon_runtime::worker::LiveBindings;

/// Why a transport produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The supervisor killed the worker at the deadline.
    Timeout,
    /// Infrastructure failure: spawn error, missing or invalid payload.
    Worker { kind: String, message: String },
}

impl TransportFailure {
    fn worker(message: impl Into<String>) -> Self {
        TransportFailure::Worker {
            kind: "WorkerError".into(),
            message: message.into(),
        }
    }
}

/// Run the request in a forked child of this process.
#[cfg(unix)]
pub fn execute_inline(
    req: &WireRequest,
    live: &LiveBindings,
    timeout_ms: u64,
) -> Result<WireResponse, TransportFailure> {
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::unistd::{fork, ForkResult};

    let (read_fd, write_fd): (OwnedFd, OwnedFd) =
        nix::unistd::pipe().map_err(|e| TransportFailure::worker(format!("pipe: {e}")))?;

    // SAFETY: the child immediately runs the worker pipeline and leaves
    // via _exit without touching the parent's runtime state.
    let fork_result =
        unsafe { fork() }.map_err(|e| TransportFailure::worker(format!("fork: {e}")))?;

    match fork_result {
        ForkResult::Child => {
            drop(read_fd);
            let response = cordon_runtime::worker::run_worker(req, Some(live));
            let payload = serde_json::to_vec(&response).unwrap_or_default();
            write_all(write_fd.as_raw_fd(), &payload);
            drop(write_fd);
            // SAFETY: _exit skips atexit handlers, which must not run in
            // the forked child.
            unsafe { libc::_exit(0) };
        }
        ForkResult::Parent { child } => {
            drop(write_fd);
            let deadline = Instant::now() + Duration::from_millis(timeout_ms);
            let payload = read_until_eof_or_deadline(read_fd.as_raw_fd(), deadline);
            match payload {
                Some(bytes) => {
                    reap(child);
                    decode_response(&bytes, String::new())
                }
                None => {
                    terminate_child(child);
                    Err(TransportFailure::Timeout)
                }
            }
        }
    }
}

#[cfg(not(unix))]
pub fn execute_inline(
    _req: &WireRequest,
    _live: &LiveBindings,
    _timeout_ms: u64,
) -> Result<WireResponse, TransportFailure> {
    Err(TransportFailure::worker(
        "inline transport requires a Unix host",
    ))
}

/// Spawn an external worker command and exchange one JSON payload pair.
#[cfg(unix)]
pub fn execute_command(
    req: &WireRequest,
    command: &[String],
    env: Option<&BTreeMap<String, String>>,
    cwd: Option<&PathBuf>,
    timeout_ms: u64,
) -> Result<WireResponse, TransportFailure> {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let Some(program) = command.first() else {
        return Err(TransportFailure::worker("empty worker command"));
    };
    let payload = serde_json::to_vec(req)
        .map_err(|e| TransportFailure::worker(format!("encode request: {e}")))?;

    let mut cmd = Command::new(program);
    cmd.args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(env) = env {
        cmd.env_clear().envs(env);
    }
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TransportFailure::worker(format!("{e}")))?;
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);

    let mut stdin = child.stdin.take();
    let writer = std::thread::spawn(move || {
        if let Some(stdin) = stdin.as_mut() {
            let _ = stdin.write_all(&payload);
        }
        drop(stdin);
    });
    let mut stderr = child.stderr.take();
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let stdout = child.stdout.take().expect("stdout was piped");
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let payload = read_until_eof_or_deadline(stdout.as_raw_fd(), deadline);
    drop(stdout);

    let outcome = match payload {
        Some(bytes) => {
            let _ = child.wait();
            let _ = writer.join();
            let stderr_text = stderr_reader.join().unwrap_or_default();
            if bytes.is_empty() {
                let message = if stderr_text.is_empty() {
                    "no payload from worker".to_string()
                } else {
                    stderr_text
                };
                Err(TransportFailure::worker(message))
            } else {
                decode_response(&bytes, stderr_text)
            }
        }
        None => {
            terminate_child(pid);
            let _ = child.wait();
            let _ = writer.join();
            let _ = stderr_reader.join();
            Err(TransportFailure::Timeout)
        }
    };
    outcome
}

#[cfg(not(unix))]
pub fn execute_command(
    _req: &WireRequest,
    _command: &[String],
    _env: Option<&BTreeMap<String, String>>,
    _cwd: Option<&PathBuf>,
    _timeout_ms: u64,
) -> Result<WireResponse, TransportFailure> {
    Err(TransportFailure::worker(
        "command transport requires a Unix host",
    ))
}

fn decode_response(bytes: &[u8], stderr_text: String) -> Result<WireResponse, TransportFailure> {
    serde_json::from_slice(bytes).map_err(|_| {
        TransportFailure::worker(format!("invalid payload: {stderr_text}"))
    })
}

/// Blocking read of the whole stream, bounded by the deadline. `None`
/// means the deadline passed before EOF.
#[cfg(unix)]
fn read_until_eof_or_deadline(fd: std::os::fd::RawFd, deadline: Instant) -> Option<Vec<u8>> {
    set_nonblocking(fd);
    let mut out = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: poll reads the single pollfd we hand it.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms.max(1)) };
        if rc <= 0 {
            if rc < 0 && last_errno_is_eintr() {
                continue;
            }
            return None;
        }
        loop {
            // SAFETY: read writes at most buf.len() bytes into buf.
            let n = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            match n {
                0 => return Some(out),
                n if n > 0 => out.extend_from_slice(&buf[..n as usize]),
                _ => {
                    if last_errno_is_wouldblock() {
                        break;
                    }
                    if last_errno_is_eintr() {
                        continue;
                    }
                    return Some(out);
                }
            }
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: std::os::fd::RawFd) {
    // SAFETY: fcntl with F_GETFL/F_SETFL only manipulates fd flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(unix)]
fn last_errno_is_wouldblock() -> bool {
    let err = std::io::Error::last_os_error();
    matches!(err.kind(), std::io::ErrorKind::WouldBlock)
}

#[cfg(unix)]
fn last_errno_is_eintr() -> bool {
    let err = std::io::Error::last_os_error();
    matches!(err.kind(), std::io::ErrorKind::Interrupted)
}

/// The supervisor's kill ladder: group TERM, TERM, poll with backoff,
/// group KILL, KILL, final reap.
#[cfg(unix)]
fn terminate_child(pid: nix::unistd::Pid) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    let _ = killpg(pid, Signal::SIGTERM);
    let _ = kill(pid, Signal::SIGTERM);
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(50));
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                let _ = killpg(pid, Signal::SIGKILL);
                let _ = kill(pid, Signal::SIGKILL);
            }
            _ => return,
        }
    }
    let _ = waitpid(pid, None);
}

#[cfg(unix)]
fn reap(pid: nix::unistd::Pid) {
    let _ = nix::sys::wait::waitpid(pid, None);
}

#[cfg(unix)]
fn write_all(fd: std::os::fd::RawFd, bytes: &[u8]) {
    let mut written = 0;
    while written < bytes.len() {
        // SAFETY: write reads from the remaining byte slice only.
        let n = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if n <= 0 {
            if last_errno_is_eintr() {
                continue;
            }
            return;
        }
        written += n as usize;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use cordon_core::policy::Policy;
    use cordon_core::wire::ExecMode;
    use serde_json::json;

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

    #[test]
    fn inline_transport_round_trips() {
        let live = LiveBindings::default();
        let resp = execute_inline(&request("__result__ = 21 * 2\n"), &live, 5_000).unwrap();
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, json!(42));
    }

    #[test]
    fn inline_transport_enforces_the_deadline() {
        let live = LiveBindings::default();
        let mut req = request("n = 0\nwhile True:\n    n = n + 1\n");
        req.policy.max_steps = u64::MAX;
        let started = Instant::now();
        let err = execute_inline(&req, &live, 150).unwrap_err();
        assert_eq!(err, TransportFailure::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_command_is_a_worker_failure() {
        let err = execute_command(&request("x = 1"), &[], None, None, 1_000).unwrap_err();
        assert!(matches!(err, TransportFailure::Worker { .. }));
    }

    #[test]
    fn command_transport_surfaces_empty_payloads() {
        let err = execute_command(
            &request("x = 1"),
            &["/bin/true".to_string()],
            None,
            None,
            2_000,
        )
        .unwrap_err();
        let TransportFailure::Worker { message, .. } = err else {
            panic!("expected worker failure");
        };
        assert_eq!(message, "no payload from worker");
    }
}
