// Per-item handle passed to the worker callback

use crate::credentials::{Credential, CredentialError, CredentialPool, CredentialStatus};
use crate::output::{OutputSink, PrefixedWriter};
use crate::shutdown::ShutdownState;
use std::time::Duration;

/// What a worker can see and do while processing one item
pub struct WorkerContext<'a> {
    pub(crate) item_id: &'a str,
    pub(crate) credential: Option<&'a Credential>,
    pub(crate) pool: Option<&'a CredentialPool>,
    pub(crate) output: &'a mut PrefixedWriter<OutputSink>,
    pub(crate) shutdown: &'a ShutdownState,
}

impl<'a> WorkerContext<'a> {
    /// Validated item identifier
    pub fn item_id(&self) -> &str {
        self.item_id
    }

    /// Credential reserved for this item, if any
    pub fn credential(&self) -> Option<&Credential> {
        self.credential
    }

    /// Output writer prefixed with `[item_id]`
    pub fn output(&mut self) -> &mut PrefixedWriter<OutputSink> {
        &mut *self.output
    }

    /// Write text through the item's prefixed output
    pub fn print(&mut self, text: &str) {
        self.output.write_text(text);
    }

    /// Take this item's credential out of rotation for the pool's backoff window.
    /// It stays reserved until the item finishes. No-op without a credential.
    pub fn mark_rate_limited(&self) -> Result<(), CredentialError> {
        match (self.pool, self.credential) {
            (Some(pool), Some(credential)) => pool.mark_rate_limited(credential),
            _ => {
                log::debug!("[{}] No credential to mark as rate-limited", self.item_id);
                Ok(())
            }
        }
    }

    /// Like `mark_rate_limited`, with an explicit window
    pub fn mark_rate_limited_for(&self, window: Duration) -> Result<(), CredentialError> {
        match (self.pool, self.credential) {
            (Some(pool), Some(credential)) => pool.mark_rate_limited_for(credential, window),
            _ => {
                log::debug!("[{}] No credential to mark as rate-limited", self.item_id);
                Ok(())
            }
        }
    }

    pub fn credential_status(&self) -> Option<CredentialStatus> {
        self.pool.map(CredentialPool::status)
    }

    /// Long-running workers may poll this to stop early on their own terms
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_shutdown_requested()
    }
}
