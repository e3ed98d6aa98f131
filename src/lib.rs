// Clippy allows for reasonable defaults
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer

// Module declarations
pub mod config;
pub mod credentials;
pub mod output;
pub mod parallel;
pub mod sanitize;
pub mod shutdown;
pub mod utils;

// Re-export the types most callers need
pub use config::BatchConfig;
pub use credentials::{Credential, CredentialError, CredentialPool, CredentialStatus};
pub use output::{OutputSink, PrefixedWriter};
pub use parallel::{
    CoordinatorError, CredentialPolicy, ExecutionResult, ParallelCoordinator, ProgressStats,
    ReservationPolicy, RunReport, WorkerContext,
};
pub use sanitize::{sanitize_identifier, sanitize_path, SanitizeError};
pub use shutdown::ShutdownState;
