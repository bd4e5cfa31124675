//! Error types for the pdfraster pipeline.
//!
//! Every failure the pipeline can surface is a [`RenderError`]: one
//! [`ErrorKind`] tag from a closed taxonomy plus a free-form message and,
//! for page-level failures, the page number. There is no hierarchy of error
//! structs; callers match on the kind.
//!
//! * Document-level failures (corrupt file, password, pool exhausted) reject
//!   `process_file` / `acquire_worker` directly.
//! * Page-level failures are recorded as an [`ErrorRecord`] scoped to one
//!   page, so a single bad page never fails the whole document. The
//!   aggregate outcome is computed by [`crate::report::DocumentReport`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // ── Worker / pool plumbing ────────────────────────────────────────────
    WorkerInit,
    WorkerTimeout,
    WorkerCleanup,
    WorkerCommunication,
    WorkerPool,
    Abort,

    // ── Document content ──────────────────────────────────────────────────
    PdfCorrupted,
    PdfPasswordProtected,
    PdfFormat,
    PdfMemory,
    PdfAllPagesFailed,
    PdfSomePagesFailed,
    PdfPageRender,

    // ── Generic ───────────────────────────────────────────────────────────
    Timeout,
    Network,
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 16] = [
        ErrorKind::WorkerInit,
        ErrorKind::WorkerTimeout,
        ErrorKind::WorkerCleanup,
        ErrorKind::WorkerCommunication,
        ErrorKind::WorkerPool,
        ErrorKind::Abort,
        ErrorKind::PdfCorrupted,
        ErrorKind::PdfPasswordProtected,
        ErrorKind::PdfFormat,
        ErrorKind::PdfMemory,
        ErrorKind::PdfAllPagesFailed,
        ErrorKind::PdfSomePagesFailed,
        ErrorKind::PdfPageRender,
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::Unknown,
    ];

    /// Stable, human-readable message shown to end users.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::WorkerInit => "The PDF renderer could not be started.",
            ErrorKind::WorkerTimeout => "Rendering took too long and was stopped.",
            ErrorKind::WorkerCleanup => "Rendering resources could not be released.",
            ErrorKind::WorkerCommunication => "The PDF renderer stopped responding.",
            ErrorKind::WorkerPool => "All PDF renderers are busy. Please try again shortly.",
            ErrorKind::Abort => "Processing was cancelled.",
            ErrorKind::PdfCorrupted => "The PDF file is damaged and cannot be opened.",
            ErrorKind::PdfPasswordProtected => "The PDF file is password protected.",
            ErrorKind::PdfFormat => "The file is not a supported PDF document.",
            ErrorKind::PdfMemory => "The PDF file is too large to process.",
            ErrorKind::PdfAllPagesFailed => "None of the pages in this PDF could be rendered.",
            ErrorKind::PdfSomePagesFailed => "Some pages in this PDF could not be rendered.",
            ErrorKind::PdfPageRender => "A page could not be rendered.",
            ErrorKind::Timeout => "The operation timed out.",
            ErrorKind::Network => "A network error occurred.",
            ErrorKind::Unknown => "An unexpected error occurred.",
        }
    }

    /// Kinds that describe pipeline internals rather than the document.
    ///
    /// These are hidden behind [`SYSTEM_ERROR_MESSAGE`] when masking is on.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            ErrorKind::WorkerInit
                | ErrorKind::WorkerTimeout
                | ErrorKind::WorkerCleanup
                | ErrorKind::WorkerCommunication
                | ErrorKind::WorkerPool
                | ErrorKind::Unknown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Generic text used in place of internal error details when masking.
pub const SYSTEM_ERROR_MESSAGE: &str = "A system error occurred. Please try again.";

/// A classified pipeline failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RenderError {
    pub kind: ErrorKind,
    pub message: String,
    /// Set for page-scoped failures.
    pub page_number: Option<usize>,
}

impl RenderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            page_number: None,
        }
    }

    /// Attach the page this failure belongs to.
    pub fn for_page(mut self, page_number: usize) -> Self {
        self.page_number = Some(page_number);
        self
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Abort, message)
    }

    /// The processor was cleaned up or never received a document.
    pub fn not_initialized() -> Self {
        Self::new(ErrorKind::WorkerInit, "PDF processor is not initialized")
    }

    pub fn file_too_large(len: usize, max: usize) -> Self {
        Self::new(
            ErrorKind::PdfMemory,
            format!("file is {len} bytes, larger than the {max} byte limit"),
        )
    }

    pub fn pool_exhausted(max_workers: usize, waited_ms: u64) -> Self {
        Self::new(
            ErrorKind::WorkerPool,
            format!("worker pool exhausted: all {max_workers} workers busy after {waited_ms}ms"),
        )
    }

    pub fn channel_closed(what: &str) -> Self {
        Self::new(
            ErrorKind::WorkerCommunication,
            format!("{what} channel closed"),
        )
    }

    /// Text suitable for end users.
    ///
    /// With `mask_internal` set, worker and communication failures collapse to
    /// [`SYSTEM_ERROR_MESSAGE`]; the structured kind remains on the error for
    /// logging.
    pub fn user_message(&self, mask_internal: bool) -> &'static str {
        if mask_internal && self.kind.is_internal() {
            SYSTEM_ERROR_MESSAGE
        } else {
            self.kind.user_message()
        }
    }

    /// The error as a user sees it: the full detail, or
    /// [`SYSTEM_ERROR_MESSAGE`] for internal kinds when `mask_internal` is set.
    pub fn display_masked(&self, mask_internal: bool) -> String {
        if mask_internal && self.kind.is_internal() {
            SYSTEM_ERROR_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

/// A recorded failure, kept per document for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub file_name: String,
    pub page_number: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn from_error(file_name: impl Into<String>, error: &RenderError) -> Self {
        Self {
            file_name: file_name.into(),
            page_number: error.page_number,
            kind: error.kind,
            message: error.message.clone(),
        }
    }
}

/// Builder validation failure for [`crate::config::PipelineConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
