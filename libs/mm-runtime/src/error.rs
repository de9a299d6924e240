use core::fmt;

/// Error returned when waiting on a primitive that has been shut down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

/// Error returned by [`JoinHandle`](crate::task::JoinHandle) when the awaited
/// task did not run to completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinError {
    /// The task was cancelled before producing its output.
    Cancelled,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("task was cancelled"),
        }
    }
}

impl core::error::Error for JoinError {}

/// Error returned when a task could not be spawned.
#[derive(Debug)]
pub enum SpawnError {
    /// The target core has stopped accepting tasks.
    Stopped,
    /// There is no active core on this thread to spawn onto.
    NoCore,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Stopped => f.write_str("core is stopping"),
            SpawnError::NoCore => f.write_str("no active core on this thread"),
        }
    }
}

impl core::error::Error for SpawnError {}
