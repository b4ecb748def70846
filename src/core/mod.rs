//! Shared domain types for the replicated runtime core.

use std::fmt;

use bytes::Bytes;

/// Kind of a state-machine operation.
///
/// Commands may mutate state and schedule side effects; queries may do
/// neither.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    Command,
    Query,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Command => "command",
            OperationType::Query => "query",
        }
    }
}

/// Identity of a registered state-machine operation: an opaque name plus
/// its kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationId {
    name: String,
    kind: OperationType,
}

impl OperationId {
    pub fn command(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OperationType::Command,
        }
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OperationType::Query,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OperationType {
        self.kind
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind.as_str())
    }
}

/// A committed log entry delivered to the state machine.
///
/// `wall_clock_ms` is replicated logical time: every replica observes the
/// same value for the same log index. Nothing in this crate reads a real
/// clock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    operation: OperationId,
    payload: Bytes,
    wall_clock_ms: u64,
}

impl Commit {
    pub fn new(operation: OperationId, payload: impl Into<Bytes>, wall_clock_ms: u64) -> Self {
        Self {
            operation,
            payload: payload.into(),
            wall_clock_ms,
        }
    }

    pub fn operation(&self) -> &OperationId {
        &self.operation
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn wall_clock_ms(&self) -> u64 {
        self.wall_clock_ms
    }
}
