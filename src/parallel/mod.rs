// Parallel batch execution
//
// A bounded pool of worker threads pulls items from a shared queue, each item
// running with its own credential reservation and prefixed output.

mod context;
mod coordinator;
mod types;

pub use context::WorkerContext;
pub use coordinator::ParallelCoordinator;
pub use types::{
    CoordinatorError, CredentialPolicy, ExecutionResult, ProgressStats, ReservationPolicy,
    RunReport, CREDENTIAL_UNAVAILABLE, DEFAULT_MAX_WORKERS, MAX_WORKERS_CAP,
};
