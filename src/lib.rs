//! # pdfraster
//!
//! Concurrent PDF page rendering: a bounded pool of render workers, per
//! document request queues with de-duplication and retries, a time-bounded
//! page cache, and a recovery bus that keeps results whose requester went
//! away.
//!
//! ## Why this crate?
//!
//! Rasterising a page blocks for tens to hundreds of milliseconds inside a C
//! library that must not be called from two threads at once. A viewer that
//! asks for pages as the user scrolls needs those renders off its own
//! threads, bounded in number, never duplicated, cancelled when the user
//! moves on, and cached while the user might come back.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PdfProcessor (one per open document)
//!  │  get_page(n) → cache hit? → queue (dedup, ≤ k in flight, retry/backoff)
//!  ▼
//! WorkerPool (≤ max_workers, reuse, wait, exhaustion error)
//!  │
//!  ├─ dedicated: Worker ─▶ EngineHost thread ─▶ RenderEngine
//!  └─ shared:    Worker ─▶ Coordinator ─▶ EngineHost thread ─▶ RenderEngine
//!                                 (one engine, many workers, FIFO)
//!
//! Results nobody is waiting for ─▶ RecoveryBus ─▶ subscribers / retained
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfraster::{PdfProcessor, PipelineConfig, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = WorkerPool::with_pdfium(PipelineConfig::default());
//!     let processor = PdfProcessor::new(pool, "document.pdf").await?;
//!
//!     let doc = processor.process_file(std::fs::read("document.pdf")?).await?;
//!     let first = processor.get_page(1).await?;
//!     println!("{} pages; page 1 is {}x{}", doc.total_pages, first.width, first.height);
//!
//!     processor.cleanup().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfraster` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `test-utils` | off | Exposes [`testing`], a scripted engine for tests |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod input;
pub mod pool;
pub mod processor;
pub mod protocol;
pub mod queue;
pub mod recovery;
pub mod report;
pub mod retry;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheKey, ImageReleaser, PageCache};
pub use config::{
    AssignmentPolicy, EngineStrategy, PageSelection, PipelineConfig, PipelineConfigBuilder,
    QualityTier, TierSettings,
};
pub use coordinator::{CleanupClient, CoordinatorHandle, CoordinatorReady, CoordinatorStatus};
pub use engine::pdfium::{PdfiumEngine, PdfiumEngineFactory};
pub use engine::{EngineError, EngineFactory, RenderEngine, RenderParams, RenderedPage};
pub use error::{ConfigError, ErrorKind, ErrorRecord, RenderError, SYSTEM_ERROR_MESSAGE};
pub use input::{read_file, InputError, LoadedFile};
pub use pool::{PoolStats, WorkerPool};
pub use processor::{DocumentInfo, PdfProcessor, ProcessorStats};
pub use protocol::{DisplayInfo, DocumentId, PageImage, RequestId, WorkerId};
pub use queue::PageResult;
pub use recovery::{EventKind, RecoveryBus, RecoveryEvent, RecoveryStream, Subscription};
pub use report::{DocumentReport, RenderedSummary};
pub use retry::{backoff_delay, classify, classify_error, should_retry, Provenance, RetryPolicy};
pub use worker::{CoordinatorAssignment, WorkerHandle};
