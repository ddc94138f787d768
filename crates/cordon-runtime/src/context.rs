//! Shared per-run state: audit stream, metrics, token scopes, clocks, and
//! the capped stdout/stderr writers.
//!
//! The worker, the evaluator, and every capability wrapper hold the same
//! `Rc<RefCell<RunCtx>>`; the worker is single-threaded so the borrow
//! discipline is purely lexical.

use std::time::Instant;

use cordon_core::audit::AuditStream;
use cordon_core::capability::ScopeBundle;
use cordon_core::result::{Event, Metrics};
use serde_json::{json, Value as Json};

use crate::determinism::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn label(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Byte-capped capture buffer. Writes past the cap silently discard the
/// overflow tail but still report the full written length.
pub struct StreamBuf {
    limit: usize,
    buf: String,
}

impl StreamBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: String::new(),
        }
    }

    /// Accept up to the remaining capacity; returns the accepted chunk.
    fn accept(&mut self, s: &str) -> Option<String> {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if remaining == 0 || s.is_empty() {
            return None;
        }
        let chunk: String = if s.len() <= remaining {
            s.to_string()
        } else {
            s.chars().scan(0usize, |acc, c| {
                *acc += c.len_utf8();
                (*acc <= remaining).then_some(c)
            })
            .collect()
        };
        if chunk.is_empty() {
            return None;
        }
        self.buf.push_str(&chunk);
        Some(chunk)
    }

    pub fn byte_len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn contents(&self) -> &str {
        &self.buf
    }
}

/// All mutable state shared across one run.
pub struct RunCtx {
    pub audit: AuditStream,
    pub metrics: Metrics,
    pub scopes: ScopeBundle,
    pub float_format: Option<String>,
    clock: Clock,
    t0_s: f64,
    started: Instant,
    stdout: StreamBuf,
    stderr: StreamBuf,
}

impl RunCtx {
    pub fn new(
        audit: AuditStream,
        scopes: ScopeBundle,
        mut clock: Clock,
        max_stdout_bytes: usize,
        max_stderr_bytes: usize,
        float_format: Option<String>,
    ) -> Self {
        let t0_s = clock.now_s();
        Self {
            audit,
            metrics: Metrics::default(),
            scopes,
            float_format,
            clock,
            t0_s,
            started: Instant::now(),
            stdout: StreamBuf::new(max_stdout_bytes),
            stderr: StreamBuf::new(max_stderr_bytes),
        }
    }

    /// Event timestamp: milliseconds since run start on the (possibly
    /// fake) event clock.
    pub fn ts_ms(&mut self) -> i64 {
        ((self.clock.now_s() - self.t0_s) * 1000.0) as i64
    }

    /// Real elapsed milliseconds, for budgets and wall metrics.
    pub fn perf_elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Real elapsed seconds with a floor, for rate calculations.
    pub fn perf_elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64().max(1e-6)
    }

    pub fn emit(&mut self, kind: &str, data: Json) {
        let ts_ms = self.ts_ms();
        self.audit.emit(Event::new(ts_ms, kind, data));
    }

    /// Write to a captured stream, emitting one event per accepted chunk.
    pub fn write_stream(&mut self, kind: StreamKind, s: &str) {
        let buf = match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        if let Some(chunk) = buf.accept(s) {
            self.emit(kind.label(), json!({ "text": chunk }));
        }
    }

    pub fn stream_bytes(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Stdout => self.stdout.byte_len(),
            StreamKind::Stderr => self.stderr.byte_len(),
        }
    }

    pub fn stream_contents(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Stdout => self.stdout.contents(),
            StreamKind::Stderr => self.stderr.contents(),
        }
    }
}
