//! Credential pool with reservation and rate-limit backoff
//!
//! Every credential is in exactly one of three states: available, reserved, or
//! rate-limited. A reserved credential can additionally carry a pending
//! rate-limit expiry; it is reported as reserved until released and then stays
//! excluded until the expiry passes. Expired rate limits are cleaned up lazily
//! at the start of `reserve()` and `status()` instead of by a timer thread.

use super::clock::{Clock, SystemClock};
use crate::utils::lock_mutex_recover;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default time a rate-limited credential is kept out of rotation
pub const DEFAULT_BACKOFF_WINDOW: Duration = Duration::from_secs(60);

/// Longest time a credential can be kept out of rotation; longer windows are clamped
pub const MAX_BACKOFF_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Credential pool requires at least one credential")]
    Empty,

    #[error("Credential {0} is not reserved")]
    NotReserved(String),

    #[error("Credential {0} is not managed by this pool")]
    Unknown(String),
}

/// Opaque access token handed to workers.
///
/// `Debug` and `Display` only show a redacted form so tokens never reach logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for handing to the external API
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short form safe for logs: first four characters plus length
    pub fn redacted(&self) -> String {
        let head: String = self.0.chars().take(4).collect();
        format!("{}…({} chars)", head, self.0.chars().count())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Point-in-time counts; `available + reserved + rate_limited == total`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub total: usize,
    pub available: usize,
    pub reserved: usize,
    pub rate_limited: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Free list, reserved from the front
    available: VecDeque<Credential>,
    reserved: HashSet<Credential>,
    /// Expiry per rate-limited credential; may overlap with `reserved`
    rate_limited: HashMap<Credential, Instant>,
}

/// Thread-safe pool of reusable credentials
pub struct CredentialPool {
    /// Every credential the pool owns, in configuration order
    known: HashSet<Credential>,
    total: usize,
    state: Mutex<PoolState>,
    backoff_window: Duration,
    clock: Arc<dyn Clock>,
}

impl CredentialPool {
    /// Create a pool with the default 60 second backoff window
    pub fn new<I, S>(credentials: I) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_backoff(credentials, DEFAULT_BACKOFF_WINDOW)
    }

    /// Create a pool with a custom backoff window
    pub fn with_backoff<I, S>(credentials: I, backoff_window: Duration) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_clock(credentials, backoff_window, Arc::new(SystemClock))
    }

    /// Create a pool driven by an explicit time source
    pub fn with_clock<I, S>(
        credentials: I,
        backoff_window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = HashSet::new();
        let mut available = VecDeque::new();

        for token in credentials {
            let token: String = token.into();
            if token.trim().is_empty() {
                log::warn!("[CredentialPool] Ignoring blank credential entry");
                continue;
            }
            let credential = Credential(token);
            if !known.insert(credential.clone()) {
                log::warn!(
                    "[CredentialPool] Ignoring duplicate credential {}",
                    credential
                );
                continue;
            }
            available.push_back(credential);
        }

        if available.is_empty() {
            return Err(CredentialError::Empty);
        }

        log::info!(
            "[CredentialPool] Initialized with {} credentials, backoff window {:?}",
            available.len(),
            backoff_window
        );

        Ok(Self {
            total: available.len(),
            known,
            state: Mutex::new(PoolState {
                available,
                ..PoolState::default()
            }),
            backoff_window: clamp_window(backoff_window),
            clock,
        })
    }

    pub fn backoff_window(&self) -> Duration {
        self.backoff_window
    }

    /// Take the first available credential, or `None` if every credential is
    /// reserved or rate-limited. Never blocks.
    pub fn reserve(&self) -> Option<Credential> {
        let mut state = lock_mutex_recover(&self.state);
        self.cleanup_expired(&mut state);

        let credential = state.available.pop_front()?;
        state.reserved.insert(credential.clone());
        log::debug!("[CredentialPool] Reserved {}", credential);
        Some(credential)
    }

    /// Return a reserved credential. It goes back to the free list unless it
    /// has been rate-limited in the meantime.
    pub fn release(&self, credential: &Credential) -> Result<(), CredentialError> {
        let mut state = lock_mutex_recover(&self.state);

        if !state.reserved.remove(credential) {
            return Err(CredentialError::NotReserved(credential.redacted()));
        }

        if state.rate_limited.contains_key(credential) {
            log::debug!(
                "[CredentialPool] Released {} into rate-limit backoff",
                credential
            );
        } else {
            state.available.push_back(credential.clone());
            log::debug!("[CredentialPool] Released {}", credential);
        }

        Ok(())
    }

    /// Exclude a credential for the pool's backoff window
    pub fn mark_rate_limited(&self, credential: &Credential) -> Result<(), CredentialError> {
        self.mark_rate_limited_for(credential, self.backoff_window)
    }

    /// Exclude a credential for an explicit window (e.g. a reported retry-after).
    /// The credential may be reserved or idle.
    pub fn mark_rate_limited_for(
        &self,
        credential: &Credential,
        window: Duration,
    ) -> Result<(), CredentialError> {
        if !self.known.contains(credential) {
            return Err(CredentialError::Unknown(credential.redacted()));
        }

        let window = clamp_window(window);
        let now = self.clock.now();
        let expiry = now.checked_add(window).unwrap_or(now);
        let mut state = lock_mutex_recover(&self.state);
        state.available.retain(|c| c != credential);
        state.rate_limited.insert(credential.clone(), expiry);

        log::warn!(
            "[CredentialPool] Credential {} rate-limited for {:?}",
            credential,
            window
        );
        Ok(())
    }

    /// Snapshot of the pool, after expiring stale rate limits
    pub fn status(&self) -> CredentialStatus {
        let mut state = lock_mutex_recover(&self.state);
        self.cleanup_expired(&mut state);

        let rate_limited = state
            .rate_limited
            .keys()
            .filter(|c| !state.reserved.contains(*c))
            .count();

        CredentialStatus {
            total: self.total,
            available: state.available.len(),
            reserved: state.reserved.len(),
            rate_limited,
        }
    }

    /// Restore expired rate-limited credentials that are not currently reserved.
    /// Reserved ones keep their entry and return through `release()`.
    fn cleanup_expired(&self, state: &mut PoolState) {
        let now = self.clock.now();
        let expired: Vec<Credential> = state
            .rate_limited
            .iter()
            .filter(|(c, expiry)| **expiry <= now && !state.reserved.contains(*c))
            .map(|(c, _)| c.clone())
            .collect();

        for credential in expired {
            state.rate_limited.remove(&credential);
            state.available.push_back(credential.clone());
            log::info!(
                "[CredentialPool] Rate limit expired for {}, back in rotation",
                credential
            );
        }
    }
}

fn clamp_window(window: Duration) -> Duration {
    if window > MAX_BACKOFF_WINDOW {
        log::warn!(
            "[CredentialPool] Backoff window {:?} exceeds maximum, clamping to {:?}",
            window,
            MAX_BACKOFF_WINDOW
        );
        MAX_BACKOFF_WINDOW
    } else {
        window
    }
}
