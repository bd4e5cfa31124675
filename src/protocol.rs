//! Messages exchanged between a processor and its worker.
//!
//! ```text
//! InitPdf { bytes }                      → PdfInitialized { total_pages } | Error
//! ProcessPage { page_number, config, .. } → PageProcessed { .. }           | Error
//! AbortProcessing                        → (no reply)
//! ```
//!
//! Every request travels in a [`WorkerMessage`] envelope carrying the
//! request id and document id; every reply echoes both in a
//! [`WorkerReply`], which is how the processor correlates responses that
//! may arrive in any order.

use crate::config::TierSettings;
use crate::engine::RenderedPage;
use crate::error::ErrorKind;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Correlates one request with its reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// One opened document session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

/// A worker, and the client id it uses towards a coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl DocumentId {
    /// A process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Viewport the page will be shown in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_pixel_ratio: f32,
}

/// Orchestrator → worker.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    InitPdf {
        bytes: Arc<[u8]>,
    },
    ProcessPage {
        page_number: usize,
        config: TierSettings,
        display_info: Option<DisplayInfo>,
    },
    AbortProcessing,
}

/// Worker → orchestrator.
#[derive(Debug, Clone)]
pub enum WorkerResponse {
    PdfInitialized {
        total_pages: usize,
    },
    PageProcessed {
        page_number: usize,
        page: RenderedPage,
    },
    Error {
        page_number: Option<usize>,
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub request_id: RequestId,
    pub document_id: DocumentId,
    pub request: WorkerRequest,
}

#[derive(Debug, Clone)]
pub struct WorkerReply {
    pub request_id: RequestId,
    pub document_id: DocumentId,
    pub response: WorkerResponse,
}

/// A rendered page as handed to callers.
///
/// `data` is shared, so clones are cheap and the cache, the caller and any
/// recovery subscriber can all hold the same image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub document_id: DocumentId,
    pub page_number: usize,
    pub data: Arc<[u8]>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

impl PageImage {
    pub fn new(document_id: DocumentId, page_number: usize, page: RenderedPage) -> Self {
        Self {
            document_id,
            page_number,
            data: page.data,
            mime_type: page.mime_type,
            width: page.width,
            height: page.height,
        }
    }

    /// `data:` URL for direct display.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
