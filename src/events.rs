//! Event definitions for lifecycle progress reporting.
//!
//! Lifecycle operations send `Event`s over a channel while they run so the CLI
//! can print progress during the startup grace period and health check.

use crate::ports::ResolvedPort;

/// Signals that can be delivered to a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

/// Represents a step of a lifecycle operation.
#[derive(Debug, Clone)]
pub enum Event {
    /// A dead process was found behind a record and the record was dropped.
    StaleRecordDropped { name: String, pid: u32 },
    /// A server is about to be launched with the rendered command.
    Starting { name: String, command: String },
    /// The launch shell is running.
    Spawned { name: String, pid: u32 },
    /// The port the server is believed to use after the grace period.
    PortResolved { name: String, resolved: ResolvedPort },
    /// The health probe is about to run.
    HealthChecking { name: String, url: String },
    /// The server failed its health check and is being torn down.
    Terminating { name: String, pid: u32 },
}
