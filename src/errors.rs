use thiserror::Error;

/// Why a barrier rendezvous could not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BarrierError {
    /// Another party failed (or the barrier was broken from outside). Unrecoverable.
    #[error("barrier is broken")]
    Broken,
    /// The barrier action returned an error; only the party that ran it sees this.
    #[error("barrier action failed: {0}")]
    ActionFailed(String),
    /// The barrier action panicked; only the party that ran it sees this.
    #[error("barrier action panicked: {0}")]
    ActionPanicked(String),
}

/// Errors surfaced to the caller of a simulation run.
///
/// A run that was stopped on request is *not* an error; it completes with
/// `TerminationReason::Stopped`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run parameters: {0}")]
    InvalidParams(String),
    #[error("failed to spawn thread '{thread}': {source}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },
    #[error("barrier action failed, run aborted: {0}")]
    ActionFailed(String),
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },
    #[error("barrier broken, run aborted")]
    BarrierBroken,
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
