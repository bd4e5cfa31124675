//! Error classification and retry policy.
//!
//! Engines report failures as opaque strings, so [`classify`] is a
//! best-effort heuristic over the message text plus where the failure was
//! observed ([`Provenance`]). The table is ordered: the first matching rule
//! wins.
//!
//! ## Retry Strategy
//!
//! Unknown failures are retried; a wasted retry costs one more render while a
//! dropped page is lost for good. Cancellation, pool exhaustion and content
//! errors that will fail identically on every attempt are never retried.
//! Backoff doubles per attempt: with a 500 ms base the waits are
//! 500 ms → 1 s → 2 s.

use crate::error::{ErrorKind, RenderError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Reported by the render engine itself.
    Engine,
    /// Raised by a worker while handling a message.
    Worker,
    /// Raised by a coordinator on behalf of a worker.
    Coordinator,
    /// The processor-side timer fired.
    Timer,
    /// Raised by the worker pool.
    Pool,
    /// Anything else (I/O at the edges, callers).
    External,
}

static RE_ABORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(abort(ed)?|cancel(l)?ed|terminated)\b").unwrap());
static RE_PASSWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)password|encrypt(ed|ion)|security handler").unwrap());
static RE_CORRUPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)corrupt|damaged|xref|startxref|trailer|malformed|unexpected end of (file|stream)")
        .unwrap()
});
static RE_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)not a pdf|invalid pdf|bad header|unsupported|unknown format|format error")
        .unwrap()
});
static RE_MEMORY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)out of memory|\boom\b|allocation failed|memory").unwrap());
static RE_POOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)pool (is )?exhausted|no (idle )?worker available|worker pool").unwrap());
static RE_TIMEOUT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)timed? ?out|deadline").unwrap());
static RE_NETWORK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)network|connection (refused|reset)|dns|fetch failed").unwrap());
static RE_CLEANUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)clean ?up|release failed").unwrap());
static RE_COMMUNICATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)channel closed|disconnected|send failed|no reply|port closed|message").unwrap()
});
static RE_INIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)not initiali[sz]ed|failed to (start|initiali[sz]e)|bind|library|no engine").unwrap()
});
static RE_RENDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)render|rasteri[sz]|bitmap|page").unwrap());

/// Map a raw failure message to an [`ErrorKind`].
pub fn classify(message: &str, provenance: Provenance) -> ErrorKind {
    if RE_ABORT.is_match(message) {
        return ErrorKind::Abort;
    }
    if RE_PASSWORD.is_match(message) {
        return ErrorKind::PdfPasswordProtected;
    }
    if RE_CORRUPT.is_match(message) {
        return ErrorKind::PdfCorrupted;
    }
    if RE_FORMAT.is_match(message) {
        return ErrorKind::PdfFormat;
    }
    if RE_MEMORY.is_match(message) {
        return ErrorKind::PdfMemory;
    }
    if RE_POOL.is_match(message) {
        return ErrorKind::WorkerPool;
    }
    if RE_TIMEOUT.is_match(message) {
        return match provenance {
            Provenance::Worker | Provenance::Coordinator | Provenance::Timer => {
                ErrorKind::WorkerTimeout
            }
            _ => ErrorKind::Timeout,
        };
    }
    if RE_NETWORK.is_match(message) {
        return ErrorKind::Network;
    }
    if RE_CLEANUP.is_match(message) {
        return ErrorKind::WorkerCleanup;
    }
    if RE_COMMUNICATION.is_match(message) {
        return ErrorKind::WorkerCommunication;
    }
    if RE_INIT.is_match(message) {
        return ErrorKind::WorkerInit;
    }
    if provenance == Provenance::Engine && RE_RENDER.is_match(message) {
        return ErrorKind::PdfPageRender;
    }
    match provenance {
        Provenance::Pool => ErrorKind::WorkerPool,
        Provenance::Timer => ErrorKind::WorkerTimeout,
        _ => ErrorKind::Unknown,
    }
}

/// Classify and wrap in a [`RenderError`].
pub fn classify_error(message: impl Into<String>, provenance: Provenance) -> RenderError {
    let message = message.into();
    RenderError::new(classify(&message, provenance), message)
}

/// Whether a failure of this kind is worth another attempt.
pub fn should_retry(kind: ErrorKind) -> bool {
    !matches!(
        kind,
        ErrorKind::Abort
            | ErrorKind::WorkerPool
            | ErrorKind::PdfCorrupted
            | ErrorKind::PdfPasswordProtected
            | ErrorKind::PdfFormat
            | ErrorKind::PdfMemory
            | ErrorKind::PdfAllPagesFailed
            | ErrorKind::PdfSomePagesFailed
    )
}

/// Backoff requested for attempt number zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retry attempt must be ≥ 1, got {attempt}")]
pub struct InvalidAttempt {
    pub attempt: u32,
}

/// `base × 2^(attempt − 1)`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Result<Duration, InvalidAttempt> {
    if attempt < 1 {
        return Err(InvalidAttempt { attempt });
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    Ok(base.saturating_mul(factor))
}

/// Retry ceiling plus backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based) of a failure of `kind`,
    /// or `None` when the failure should surface to the caller.
    pub fn next_delay(&self, kind: ErrorKind, attempt: u32) -> Option<Duration> {
        if !should_retry(kind) || attempt > self.max_retries {
            return None;
        }
        backoff_delay(self.base_delay, attempt).ok()
    }
}
