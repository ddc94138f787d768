use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a capability exceeds any of its budget dimensions.
///
/// The message strings are part of the wire contract: the locale layer
/// canonicalises them by exact/pattern match, so callers can match on them
/// programmatically.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    #[error("cap max_call_ms exceeded ({0}ms)")]
    MaxCallMs(u64),
    #[error("cap max_ret_bytes exceeded ({0} bytes)")]
    MaxRetBytes(u64),
    #[error("cap max_calls exceeded ({0})")]
    MaxCalls(u64),
    #[error("cap max_total_ms exceeded ({0}ms)")]
    MaxTotalMs(u64),
    #[error("cap max_total_bytes exceeded ({0} bytes)")]
    MaxTotalBytes(u64),
    #[error("cap max_qps exceeded ({0})")]
    MaxQps(f64),
    #[error("cap max_bandwidth exceeded ({0} bytes/sec)")]
    MaxBandwidth(u64),
    #[error("token budget exceeded: need {need}, remaining {remaining}")]
    TokenBudget { need: u64, remaining: u64 },
    #[error("token budget exceeded across scopes")]
    TokenBudgetScopes,
}

/// What one capability invocation cost, charged whether it succeeded or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCost {
    pub calls: u64,
    pub ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens: u64,
}

/// Per-capability quantitative limits. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSpec {
    /// Per-run call count.
    pub max_calls: Option<u64>,
    /// Per-run cumulative wall time.
    pub max_total_ms: Option<u64>,
    /// Rate limit on calls per second.
    pub max_qps: Option<f64>,
    /// Rate limit on bytes_out per second.
    pub max_bandwidth: Option<u64>,
    /// Size of a single serialized return.
    pub max_ret_bytes: Option<u64>,
    /// Wall time of a single call.
    pub max_call_ms: Option<u64>,
    /// Per-run cumulative bytes_out.
    pub max_total_bytes: Option<u64>,
    /// Initialises the exec token scope when it is otherwise unlimited.
    pub max_tokens: Option<u64>,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            max_calls: Some(100),
            max_total_ms: Some(200),
            max_qps: None,
            max_bandwidth: None,
            max_ret_bytes: Some(200_000),
            max_call_ms: None,
            max_total_bytes: None,
            max_tokens: None,
        }
    }
}

/// Capability definition with built-in budget config.
///
/// The `*_ref` fields are keys into the worker's named registry (the
/// serialisable analog of passing a callable): `func_ref` resolves the
/// underlying function, `validator_ref`/`serializer_ref` the optional arg
/// validator and return serializer, and `init_ref`/`close_ref` the per-run
/// lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    #[serde(default)]
    pub func_ref: Option<String>,
    #[serde(default)]
    pub init_ref: Option<String>,
    #[serde(default)]
    pub close_ref: Option<String>,
    #[serde(default)]
    pub validator_ref: Option<String>,
    #[serde(default)]
    pub serializer_ref: Option<String>,
    #[serde(default)]
    pub budget: BudgetSpec,
    #[serde(default)]
    pub tokens_per_call: u64,
    #[serde(default)]
    pub tokens_per_byte: f64,
    #[serde(default = "default_arg_repr_limit")]
    pub arg_repr_limit: usize,
}

fn default_arg_repr_limit() -> usize {
    400
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            func_ref: None,
            init_ref: None,
            close_ref: None,
            validator_ref: None,
            serializer_ref: None,
            budget: BudgetSpec::default(),
            tokens_per_call: 0,
            tokens_per_byte: 0.0,
            arg_repr_limit: default_arg_repr_limit(),
        }
    }

    pub fn with_func_ref(mut self, func_ref: impl Into<String>) -> Self {
        self.func_ref = Some(func_ref.into());
        self
    }

    pub fn with_budget(mut self, budget: BudgetSpec) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = tokens;
        self
    }
}

/// One tier of the token budget. `None` totals mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenScope {
    pub total: Option<u64>,
    pub remaining: Option<u64>,
}

impl TokenScope {
    pub fn new(tokens: Option<u64>) -> Self {
        Self {
            total: tokens,
            remaining: tokens,
        }
    }

    pub fn consume(&mut self, n: u64) -> Result<(), BudgetError> {
        let Some(remaining) = self.remaining else {
            return Ok(());
        };
        if n > remaining {
            return Err(BudgetError::TokenBudget {
                need: n,
                remaining,
            });
        }
        self.remaining = Some(remaining - n);
        Ok(())
    }
}

/// The three token tiers drawn from in order: exec (per-run), session
/// (per façade), tenant (cross-façade).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeBundle {
    pub exec_scope: TokenScope,
    pub session_scope: TokenScope,
    pub tenant_scope: TokenScope,
}

impl ScopeBundle {
    pub fn new(
        exec: Option<u64>,
        session: Option<u64>,
        tenant: Option<u64>,
    ) -> Self {
        Self {
            exec_scope: TokenScope::new(exec),
            session_scope: TokenScope::new(session),
            tenant_scope: TokenScope::new(tenant),
        }
    }

    /// Draw `n` tokens from the first scope whose remaining balance covers
    /// it. All-unlimited bundles consume nothing; otherwise inability to
    /// place the draw is an error.
    pub fn consume(&mut self, n: u64) -> Result<(), BudgetError> {
        if n == 0 {
            return Ok(());
        }
        let scopes = [
            &mut self.exec_scope,
            &mut self.session_scope,
            &mut self.tenant_scope,
        ];
        let mut all_unlimited = true;
        for scope in scopes {
            match scope.remaining {
                None => continue,
                Some(remaining) => {
                    all_unlimited = false;
                    if remaining >= n {
                        return scope.consume(n);
                    }
                }
            }
        }
        if all_unlimited {
            return Ok(());
        }
        Err(BudgetError::TokenBudgetScopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_scope_consumes_nothing() {
        let mut s = TokenScope::new(None);
        s.consume(1_000_000).unwrap();
        assert_eq!(s.remaining, None);
    }

    #[test]
    fn scope_decrements_and_rejects_overdraw() {
        let mut s = TokenScope::new(Some(5));
        s.consume(2).unwrap();
        assert_eq!(s.remaining, Some(3));
        let err = s.consume(4).unwrap_err();
        assert_eq!(
            err,
            BudgetError::TokenBudget {
                need: 4,
                remaining: 3
            }
        );
    }

    #[test]
    fn bundle_walks_exec_then_session_then_tenant() {
        let mut b = ScopeBundle::new(Some(1), Some(3), Some(10));
        b.consume(2).unwrap();
        // exec cannot cover 2, session can.
        assert_eq!(b.exec_scope.remaining, Some(1));
        assert_eq!(b.session_scope.remaining, Some(1));
        b.consume(2).unwrap();
        assert_eq!(b.tenant_scope.remaining, Some(8));
    }

    #[test]
    fn bundle_all_unlimited_is_noop() {
        let mut b = ScopeBundle::new(None, None, None);
        b.consume(999).unwrap();
    }

    #[test]
    fn bundle_fails_when_no_scope_can_cover() {
        let mut b = ScopeBundle::new(Some(1), Some(1), Some(1));
        assert_eq!(b.consume(2).unwrap_err(), BudgetError::TokenBudgetScopes);
    }

    #[test]
    fn budget_spec_defaults() {
        let b = BudgetSpec::default();
        assert_eq!(b.max_calls, Some(100));
        assert_eq!(b.max_total_ms, Some(200));
        assert_eq!(b.max_ret_bytes, Some(200_000));
        assert_eq!(b.max_tokens, None);
    }
}
