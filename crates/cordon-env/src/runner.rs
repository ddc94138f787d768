use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where and how the worker process is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSpec {
    /// Inline subprocess: fork this process and run the worker in the
    /// child. Parameters cross a memory pipe, so live objects (registry
    /// entries, in-memory audit sinks) stay available.
    Local,
    /// External command: spawn `command`, write one JSON request to its
    /// stdin and read one JSON response from its stdout.
    Command {
        command: Vec<String>,
        env: Option<BTreeMap<String, String>>,
        cwd: Option<PathBuf>,
    },
}

impl RunnerSpec {
    pub fn local() -> Self {
        RunnerSpec::Local
    }

    pub fn command(command: Vec<String>) -> Self {
        RunnerSpec::Command {
            command,
            env: None,
            cwd: None,
        }
    }

    pub fn with_env(self, env: BTreeMap<String, String>) -> Self {
        match self {
            RunnerSpec::Command { command, cwd, .. } => RunnerSpec::Command {
                command,
                env: Some(env),
                cwd,
            },
            local => local,
        }
    }

    pub fn with_cwd(self, cwd: impl Into<PathBuf>) -> Self {
        match self {
            RunnerSpec::Command { command, env, .. } => RunnerSpec::Command {
                command,
                env,
                cwd: Some(cwd.into()),
            },
            local => local,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, RunnerSpec::Command { .. })
    }
}
