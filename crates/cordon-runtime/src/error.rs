//! Evaluation errors.
//!
//! The dialect's exception semantics are confined to the worker: every
//! failure is an [`ExecError`] value, classified with the error names the
//! wire contract uses. Sandbox-abort errors (step limit, capability
//! budget) are not catchable by user `try` blocks.

use cordon_core::capability::BudgetError;

#[derive(Debug, Clone)]
pub struct ExecError {
    /// Error class name, e.g. "TypeError" or "StepLimitError".
    pub kind: String,
    pub message: String,
    /// 1-based source line where the error was raised.
    pub lineno: Option<u32>,
    /// Call-chain lines, outermost first, for the trimmed traceback.
    pub frames: Vec<String>,
    /// Whether a user `try` block may catch this.
    pub catchable: bool,
}

impl ExecError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            lineno: None,
            frames: Vec::new(),
            catchable: true,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }

    pub fn index_error() -> Self {
        Self::new("IndexError", "index out of range")
    }

    pub fn key_error(key: &str) -> Self {
        Self::new("KeyError", key.to_string())
    }

    pub fn zero_division() -> Self {
        Self::new("ZeroDivisionError", "division by zero")
    }

    pub fn overflow() -> Self {
        Self::new("OverflowError", "integer overflow")
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn recursion() -> Self {
        Self::new("RecursionError", "maximum recursion depth exceeded")
    }

    pub fn not_supported(construct: &str) -> Self {
        Self::new(
            "NotSupportedError",
            format!("{construct} is not supported by the sandbox dialect"),
        )
    }

    pub fn step_limit(max_steps: u64) -> Self {
        Self {
            kind: "StepLimitError".into(),
            message: format!("step limit exceeded: {max_steps}"),
            lineno: None,
            frames: Vec::new(),
            catchable: false,
        }
    }

    pub fn budget(err: BudgetError) -> Self {
        Self {
            kind: "CapabilityBudgetError".into(),
            message: err.to_string(),
            lineno: None,
            frames: Vec::new(),
            catchable: false,
        }
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new("CapabilityError", message)
    }

    /// Attach a source line if none is recorded yet; the first (deepest)
    /// line wins.
    pub fn at_line(mut self, lineno: u32) -> Self {
        if self.lineno.is_none() {
            self.lineno = Some(lineno);
        }
        self
    }

    /// Render the trimmed traceback (at most `limit` frames).
    pub fn traceback(&self, limit: usize) -> Option<String> {
        if self.frames.is_empty() && self.lineno.is_none() {
            return None;
        }
        let mut out = String::from("Traceback (most recent call last):\n");
        let skip = self.frames.len().saturating_sub(limit);
        for frame in self.frames.iter().skip(skip) {
            out.push_str(frame);
            out.push('\n');
        }
        if let Some(line) = self.lineno {
            out.push_str(&format!("  File \"<sandbox>\", line {line}\n"));
        }
        out.push_str(&format!("{}: {}", self.kind, self.message));
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_sticks() {
        let e = ExecError::type_error("bad").at_line(3).at_line(9);
        assert_eq!(e.lineno, Some(3));
    }

    #[test]
    fn abort_errors_are_not_catchable() {
        assert!(!ExecError::step_limit(10).catchable);
        assert!(!ExecError::budget(BudgetError::TokenBudgetScopes).catchable);
        assert!(ExecError::type_error("x").catchable);
    }

    #[test]
    fn traceback_renders_kind_and_line() {
        let e = ExecError::zero_division().at_line(2);
        let tb = e.traceback(3).unwrap();
        assert!(tb.contains("line 2"));
        assert!(tb.ends_with("ZeroDivisionError: division by zero"));
    }
}
