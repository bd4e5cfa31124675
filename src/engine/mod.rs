//! Render engine interface.
//!
//! The PDF library is an external collaborator reached through the narrow
//! [`RenderEngine`] trait: open a byte buffer, rasterise one page, close.
//! Instances are assumed single-threaded and expensive to build, so the
//! pipeline never calls one from more than one thread: each instance is
//! created by an [`EngineFactory`] on, and confined to, its own
//! [`host::EngineHost`] thread.
//!
//! ```text
//! RenderEngine (trait)
//!  ├─ pdfium::PdfiumEngine      production adapter over pdfium-render
//!  └─ testing::ScriptedEngine   deterministic engine for tests
//! ```

pub mod host;
pub mod pdfium;

use crate::config::TierSettings;
use crate::protocol::DisplayInfo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Opaque failure reported by an engine. Classified by message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-page rasterisation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub scale: f32,
    /// Encoder quality 1–100; 100 means lossless.
    pub quality: u8,
    /// Longest edge of the output in pixels.
    pub max_dimension: u32,
}

impl RenderParams {
    /// Tier settings, optionally narrowed to what a display can show.
    ///
    /// A display never raises the tier's cap, only lowers it.
    pub fn for_display(tier: TierSettings, display: Option<&DisplayInfo>) -> Self {
        let mut max_dimension = tier.max_dimension;
        if let Some(d) = display {
            let longest = d.viewport_width.max(d.viewport_height) as f32;
            let physical = (longest * d.device_pixel_ratio.max(1.0)).ceil() as u32;
            if physical > 0 {
                max_dimension = max_dimension.min(physical);
            }
        }
        Self {
            scale: tier.scale,
            quality: tier.quality,
            max_dimension,
        }
    }
}

/// Encoded page image plus its pixel dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub data: Arc<[u8]>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// One PDF parsing / rasterisation engine instance.
///
/// Not required to be `Send`: the instance is built and used on one thread.
/// `page_number` is 1-indexed.
pub trait RenderEngine {
    /// Open a document, replacing any previously open one. Returns its page count.
    fn open(&mut self, bytes: &[u8]) -> Result<usize, EngineError>;

    fn render_page(
        &mut self,
        page_number: usize,
        params: &RenderParams,
    ) -> Result<RenderedPage, EngineError>;

    /// Release the open document, if any.
    fn close(&mut self);
}

/// Builds engine instances on the thread that will own them.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Box<dyn RenderEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn RenderEngine>, EngineError> + Send + Sync + 'static,
{
    fn create(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        self()
    }
}
