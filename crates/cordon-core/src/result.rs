use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Which pipeline stage rejected or aborted the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parse,
    Policy,
    Runtime,
    Timeout,
    Worker,
    Schema,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Parse => "parse",
            Stage::Policy => "policy",
            Stage::Runtime => "runtime",
            Stage::Timeout => "timeout",
            Stage::Worker => "worker",
            Stage::Schema => "schema",
        };
        f.write_str(s)
    }
}

/// Typed description of why a run was rejected or aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub stage: Stage,
    /// Error class name, e.g. "StepLimitError" or "CapabilityBudgetError".
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub lineno: Option<u32>,
    #[serde(default)]
    pub col: Option<u32>,
    /// The offending source line.
    #[serde(default)]
    pub excerpt: Option<String>,
    /// Caret line pointing at `col` within `excerpt`.
    #[serde(default)]
    pub caret: Option<String>,
    /// Trimmed traceback (runtime errors only).
    #[serde(default)]
    pub tb: Option<String>,
}

impl ErrorInfo {
    pub fn new(stage: Stage, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: kind.into(),
            message: message.into(),
            lineno: None,
            col: None,
            excerpt: None,
            caret: None,
            tb: None,
        }
    }

    /// Attach source coordinates plus the excerpt/caret rendered from
    /// `code`. Columns are 1-based; a missing column with a known line
    /// defaults to 1.
    pub fn with_location(
        mut self,
        code: &str,
        lineno: Option<u32>,
        col: Option<u32>,
    ) -> Self {
        self.lineno = lineno;
        self.col = match (col, lineno) {
            (Some(c), _) => Some(c.max(1)),
            (None, Some(_)) => Some(1),
            (None, None) => None,
        };
        let (excerpt, caret) = code_excerpt(code, self.lineno, self.col);
        self.excerpt = excerpt;
        self.caret = caret;
        self
    }
}

/// Render the offending source line and a caret column marker.
fn code_excerpt(
    code: &str,
    lineno: Option<u32>,
    col: Option<u32>,
) -> (Option<String>, Option<String>) {
    let Some(lineno) = lineno else {
        return (None, None);
    };
    let line = match code.lines().nth(lineno.saturating_sub(1) as usize) {
        Some(l) => l.trim_end_matches('\n').to_string(),
        None => return (None, None),
    };
    let caret = col.map(|c| format!("{}^", " ".repeat(c.saturating_sub(1) as usize)));
    (Some(line), caret)
}

/// One captured output/audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since run start, monotonic-nondecreasing.
    pub ts_ms: i64,
    /// stdout | stderr | cap | user | info (user events may carry any tag).
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Json,
}

impl Event {
    pub fn new(ts_ms: i64, kind: impl Into<String>, data: Json) -> Self {
        Self {
            ts_ms,
            kind: kind.into(),
            data,
        }
    }
}

/// Resource accounting for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub wall_ms: u64,
    pub ast_nodes: u64,
    pub steps: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub user_ms: u64,
    pub sys_ms: u64,
    pub max_rss_kb: u64,
    #[serde(default)]
    pub cap_calls: BTreeMap<String, u64>,
    #[serde(default)]
    pub cap_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub cap_bytes_out: BTreeMap<String, u64>,
    #[serde(default)]
    pub cap_bytes_in: BTreeMap<String, u64>,
}

/// Remaining token balances per scope at run end. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenScopeSnapshot {
    pub exec: Option<u64>,
    pub session: Option<u64>,
    pub tenant: Option<u64>,
}

/// Run statistics: the user-declared stats binding plus token balances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub user: Json,
    pub token_scopes: TokenScopeSnapshot,
}

/// Structured outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub ok: bool,
    #[serde(default)]
    pub result: Json,
    #[serde(default)]
    pub locals: Json,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub stats: Option<RunStats>,
}

impl SandboxResult {
    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            ok: false,
            result: Json::Null,
            locals: Json::Null,
            error: Some(error),
            events: Vec::new(),
            metrics: Metrics::default(),
            stats: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Stage::Policy).unwrap(), "\"policy\"");
        assert_eq!(serde_json::to_string(&Stage::Timeout).unwrap(), "\"timeout\"");
    }

    #[test]
    fn error_kind_serializes_as_type() {
        let e = ErrorInfo::new(Stage::Parse, "SyntaxError", "bad");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "SyntaxError");
        assert_eq!(v["stage"], "parse");
    }

    #[test]
    fn location_renders_excerpt_and_caret() {
        let code = "a = 1\nb = ][\n";
        let e = ErrorInfo::new(Stage::Parse, "SyntaxError", "bad")
            .with_location(code, Some(2), Some(5));
        assert_eq!(e.excerpt.as_deref(), Some("b = ]["));
        assert_eq!(e.caret.as_deref(), Some("    ^"));
    }

    #[test]
    fn missing_column_defaults_to_one() {
        let e = ErrorInfo::new(Stage::Runtime, "TypeError", "bad")
            .with_location("x = 1", Some(1), None);
        assert_eq!(e.col, Some(1));
        assert_eq!(e.excerpt.as_deref(), Some("x = 1"));
    }

    #[test]
    fn out_of_range_line_yields_no_excerpt() {
        let e = ErrorInfo::new(Stage::Runtime, "TypeError", "bad")
            .with_location("x = 1", Some(9), Some(1));
        assert_eq!(e.excerpt, None);
        assert_eq!(e.caret, None);
    }
}
