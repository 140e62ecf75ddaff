//! Call tracing: append-only sinks receiving one record per dispatched call.

use std::fmt;
use std::sync::{Arc, Mutex};

/// What happened to one backend while executing a candidate plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backend's implementation was invoked and returned.
    Called,
    /// The backend's `should_run` predicate deferred to the next candidate.
    Deferred,
    /// The backend's implementation returned an error (re-raised to the
    /// caller; no further backends were attempted).
    Errored,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Called => "called",
            Outcome::Deferred => "deferred",
            Outcome::Errored => "errored",
        })
    }
}

/// One record per call: the function id plus the per-backend outcomes in the
/// order the candidates were tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub function: Arc<str>,
    pub outcomes: Vec<(Arc<str>, Outcome)>,
}

/// Receives trace records. Must be thread-safe; the engine appends without
/// holding any of its own locks.
pub trait TraceSink: Send + Sync {
    fn record(&self, record: TraceRecord);
}

/// The sink handed to `BackendOpts`.
pub type SharedSink = Arc<dyn TraceSink>;

/// A sink that collects records into a vector, mainly for tests and
/// debugging sessions.
#[derive(Debug, Default)]
pub struct VecSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl VecSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.records.lock().expect("trace sink poisoned").clone()
    }
}

impl TraceSink for VecSink {
    fn record(&self, record: TraceRecord) {
        self.records.lock().expect("trace sink poisoned").push(record);
    }
}
