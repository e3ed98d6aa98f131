// Credential pooling, rotation and rate-limit backoff

pub mod clock;
pub mod pool;
pub mod rate_limit;

pub use clock::{Clock, ManualClock, SystemClock};
pub use pool::{
    Credential, CredentialError, CredentialPool, CredentialStatus, DEFAULT_BACKOFF_WINDOW,
    MAX_BACKOFF_WINDOW,
};
pub use rate_limit::{RateLimitDetector, RateLimitKind, RateLimitSignal};
