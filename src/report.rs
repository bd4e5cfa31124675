//! Whole-document outcome.
//!
//! One bad page never fails a document: [`DocumentReport`] keeps what
//! rendered next to what did not, and [`DocumentReport::outcome`] turns that
//! into `PdfAllPagesFailed`, `PdfSomePagesFailed` or success.

use crate::error::{ErrorKind, ErrorRecord, RenderError};
use crate::queue::PageResult;
use serde::Serialize;
use std::collections::BTreeMap;

/// A page that rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedSummary {
    pub page_number: usize,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub file_name: String,
    pub total_pages: usize,
    /// Ascending by page.
    pub rendered: Vec<RenderedSummary>,
    pub failed: BTreeMap<usize, ErrorRecord>,
}

impl DocumentReport {
    pub fn collect(
        file_name: &str,
        total_pages: usize,
        results: impl IntoIterator<Item = (usize, PageResult)>,
    ) -> Self {
        let mut rendered = Vec::new();
        let mut failed = BTreeMap::new();
        for (page_number, result) in results {
            match result {
                Ok(image) => rendered.push(RenderedSummary {
                    page_number,
                    width: image.width,
                    height: image.height,
                    bytes: image.byte_len(),
                    mime_type: image.mime_type,
                }),
                Err(e) => {
                    let e = e.for_page(page_number);
                    failed.insert(page_number, ErrorRecord::from_error(file_name, &e));
                }
            }
        }
        rendered.sort_by_key(|r| r.page_number);
        Self {
            file_name: file_name.to_string(),
            total_pages,
            rendered,
            failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Aggregate result of the document.
    pub fn outcome(&self) -> Result<(), RenderError> {
        if self.failed.is_empty() {
            return Ok(());
        }
        if self.rendered.is_empty() {
            let first = self
                .failed
                .values()
                .next()
                .map(|r| r.message.as_str())
                .unwrap_or_default();
            return Err(RenderError::new(
                ErrorKind::PdfAllPagesFailed,
                format!(
                    "all {} pages of '{}' failed; first error: {}",
                    self.failed.len(),
                    self.file_name,
                    first
                ),
            ));
        }
        let pages: Vec<String> = self.failed.keys().map(usize::to_string).collect();
        Err(RenderError::new(
            ErrorKind::PdfSomePagesFailed,
            format!(
                "{} of {} pages of '{}' failed (pages {})",
                self.failed.len(),
                self.total_pages,
                self.file_name,
                pages.join(", ")
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RenderedPage;
    use crate::protocol::{DocumentId, PageImage};
    use std::sync::Arc;

    fn ok(page: usize) -> (usize, PageResult) {
        (
            page,
            Ok(PageImage::new(
                DocumentId(1),
                page,
                RenderedPage {
                    data: Arc::from(&b"x"[..]),
                    mime_type: "image/jpeg",
                    width: 100,
                    height: 200,
                },
            )),
        )
    }

    fn failed(page: usize) -> (usize, PageResult) {
        (page, Err(RenderError::new(ErrorKind::PdfPageRender, "bitmap error")))
    }

    #[test]
    fn partial_failure_is_some_pages_failed() {
        let report = DocumentReport::collect("a.pdf", 3, vec![ok(1), failed(2), ok(3)]);
        let err = report.outcome().unwrap_err();
        assert_eq!(err.kind, ErrorKind::PdfSomePagesFailed);
        assert_eq!(report.failed[&2].page_number, Some(2));
        assert_eq!(report.rendered.len(), 2);
    }

    #[test]
    fn total_failure_is_all_pages_failed() {
        let report = DocumentReport::collect("b.pdf", 2, vec![failed(1), failed(2)]);
        assert_eq!(report.outcome().unwrap_err().kind, ErrorKind::PdfAllPagesFailed);
    }

    #[test]
    fn clean_run_succeeds() {
        let report = DocumentReport::collect("c.pdf", 2, vec![ok(2), ok(1)]);
        assert!(report.outcome().is_ok());
        assert_eq!(report.rendered[0].page_number, 1);
    }
}
