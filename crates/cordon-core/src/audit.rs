//! Event recording and fan-out.
//!
//! Every event produced during a run (stdout/stderr chunks, capability
//! calls, user-declared events) is appended to the run's event list and
//! offered to each configured sink. Sink failures are swallowed: audit must
//! never change execution outcomes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::result::Event;

/// Receives every event emitted during a run.
///
/// File/webhook/tracing sinks live outside this crate; implement this trait
/// to plug them in. Live sink instances cannot cross the wire — external
/// command transports accept only [`AuditSinkSpec`]s.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Sink that retains events in memory, for tests and inline transports.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Serializable sink descriptor carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSinkSpec {
    pub kind: String,
    #[serde(default)]
    pub options: BTreeMap<String, Json>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("unknown audit sink kind: {0}")]
    UnknownKind(String),
}

/// Instantiate sinks from wire descriptors. Only the `memory` kind is
/// built in; anything else must be registered by the embedder before the
/// worker runs.
pub fn build_audit_sinks(
    specs: &[AuditSinkSpec],
) -> Result<Vec<Arc<dyn AuditSink>>, AuditError> {
    let mut sinks: Vec<Arc<dyn AuditSink>> = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec.kind.as_str() {
            "memory" => sinks.push(Arc::new(MemoryAuditSink::new())),
            other => return Err(AuditError::UnknownKind(other.to_string())),
        }
    }
    Ok(sinks)
}

/// Appends events to the run record and fans them out to sinks.
pub struct AuditStream {
    events: Vec<Event>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditStream {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            events: Vec::new(),
            sinks,
        }
    }

    pub fn emit(&mut self, event: Event) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_records_and_fans_out() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut stream = AuditStream::new(vec![sink.clone()]);
        stream.emit(Event::new(1, "stdout", json!({"text": "hi"})));
        stream.emit(Event::new(2, "cap", json!({"name": "add"})));

        assert_eq!(stream.events().len(), 2);
        assert_eq!(sink.events().len(), 2);
        assert_eq!(stream.events()[0].kind, "stdout");
    }

    #[test]
    fn unknown_sink_kind_is_rejected() {
        let specs = vec![AuditSinkSpec {
            kind: "carrier-pigeon".into(),
            options: BTreeMap::new(),
        }];
        assert!(build_audit_sinks(&specs).is_err());
    }

    #[test]
    fn memory_specs_build() {
        let specs = vec![AuditSinkSpec {
            kind: "memory".into(),
            options: BTreeMap::new(),
        }];
        assert_eq!(build_audit_sinks(&specs).unwrap().len(), 1);
    }
}
