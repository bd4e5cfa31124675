//! Production engine over `pdfium-render`.
//!
//! ## Library binding
//!
//! `Pdfium` is neither `Send` nor `Sync`, so each engine thread binds the
//! library once and keeps the binding in a thread-local. The binding is never
//! freed, which lets every open document be a `PdfDocument<'static>` owned by
//! its engine. Lookup order:
//!
//! 1. `PDFIUM_LIB_PATH` environment variable
//! 2. the platform library name in the working directory
//! 3. the system library search path
//!
//! ## Output encoding
//!
//! Quality below 100 encodes JPEG at that quality; 100 encodes lossless PNG.

use super::{EngineError, EngineFactory, RenderEngine, RenderParams, RenderedPage};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use once_cell::unsync::OnceCell;
use pdfium_render::prelude::*;
use std::io::Cursor;
use tracing::{debug, info};

thread_local! {
    static PDFIUM: OnceCell<&'static Pdfium> = const { OnceCell::new() };
}

fn pdfium() -> Result<&'static Pdfium, EngineError> {
    PDFIUM.with(|cell| {
        cell.get_or_try_init(|| {
            let bindings = bind()?;
            info!(
                "pdfium library bound on thread '{}'",
                std::thread::current().name().unwrap_or("unnamed")
            );
            let pdfium: &'static Pdfium = Box::leak(Box::new(Pdfium::new(bindings)));
            Ok(pdfium)
        })
        .copied()
    })
}

fn bind() -> Result<Box<dyn PdfiumLibraryBindings>, EngineError> {
    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        return Pdfium::bind_to_library(&path).map_err(|e| {
            EngineError::new(format!("failed to bind pdfium library at '{path}': {e}"))
        });
    }
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| EngineError::new(format!("unable to bind pdfium library: {e}")))
}

/// One pdfium-backed engine with at most one open document.
#[derive(Default)]
pub struct PdfiumEngine {
    document: Option<PdfDocument<'static>>,
}

impl PdfiumEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderEngine for PdfiumEngine {
    fn open(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        self.document = None;
        let pdfium = pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_vec(bytes.to_vec(), None)
            .map_err(|e| EngineError::new(describe_load_error(&format!("{e:?}"))))?;
        let total_pages = document.pages().len() as usize;
        debug!("pdfium opened {} bytes: {} pages", bytes.len(), total_pages);
        self.document = Some(document);
        Ok(total_pages)
    }

    fn render_page(
        &mut self,
        page_number: usize,
        params: &RenderParams,
    ) -> Result<RenderedPage, EngineError> {
        let document = self
            .document
            .as_ref()
            .ok_or_else(|| EngineError::new("render requested but no document is open"))?;

        let index = page_number
            .checked_sub(1)
            .and_then(|i| u16::try_from(i).ok())
            .ok_or_else(|| EngineError::new(format!("page {page_number} is out of range")))?;
        let page = document.pages().get(index).map_err(|e| {
            EngineError::new(format!("page {page_number} could not be loaded: {e:?}"))
        })?;

        let max = i32::try_from(params.max_dimension).unwrap_or(i32::MAX);
        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(params.scale)
            .set_maximum_width(max)
            .set_maximum_height(max);

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            EngineError::new(format!("failed to render page {page_number}: {e:?}"))
        })?;
        let image = bitmap.as_image();
        let (width, height) = (image.width(), image.height());
        let (data, mime_type) = encode(&image, params.quality)?;

        debug!(
            "Rendered page {} → {}x{} px, {} bytes {}",
            page_number,
            width,
            height,
            data.len(),
            mime_type
        );

        Ok(RenderedPage {
            data: data.into(),
            mime_type,
            width,
            height,
        })
    }

    fn close(&mut self) {
        self.document = None;
    }
}

/// Creates [`PdfiumEngine`]s, binding the library on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfiumEngineFactory;

impl EngineFactory for PdfiumEngineFactory {
    fn create(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        pdfium()?;
        Ok(Box::new(PdfiumEngine::new()))
    }
}

/// Rewrite pdfium's load error into text the classifier understands.
fn describe_load_error(raw: &str) -> String {
    if raw.contains("Password") || raw.contains("password") {
        format!("document is password protected ({raw})")
    } else if raw.contains("FormatError") {
        format!("invalid PDF: format error ({raw})")
    } else if raw.contains("FileError") {
        format!("file is corrupt or truncated ({raw})")
    } else {
        raw.to_string()
    }
}

/// Encode a rendered page: JPEG below quality 100, PNG at 100.
pub(crate) fn encode(
    image: &DynamicImage,
    quality: u8,
) -> Result<(Vec<u8>, &'static str), EngineError> {
    let mut buf = Vec::new();
    if quality >= 100 {
        image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| EngineError::new(format!("png encoding failed: {e}")))?;
        Ok((buf, "image/png"))
    } else {
        let rgb = image.to_rgb8();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.max(1));
        encoder
            .encode_image(&rgb)
            .map_err(|e| EngineError::new(format!("jpeg encoding failed: {e}")))?;
        Ok((buf, "image/jpeg"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn sample() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(12, 8, Rgba([200, 10, 10, 255])))
    }

    #[test]
    fn lossy_quality_encodes_jpeg() {
        let (data, mime) = encode(&sample(), 80).expect("encode should succeed");
        assert_eq!(mime, "image/jpeg");
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn full_quality_encodes_png() {
        let (data, mime) = encode(&sample(), 100).expect("encode should succeed");
        assert_eq!(mime, "image/png");
        assert_eq!(&data[1..4], b"PNG");
    }

    #[test]
    fn render_without_document_fails() {
        let mut engine = PdfiumEngine::new();
        let params = RenderParams {
            scale: 1.0,
            quality: 90,
            max_dimension: 100,
        };
        assert!(engine.render_page(1, &params).is_err());
    }

    #[test]
    fn missing_library_fails_engine_creation() {
        std::env::set_var("PDFIUM_LIB_PATH", "/nonexistent/libpdfium.so");
        let created = std::thread::spawn(|| PdfiumEngineFactory.create().map(|_| ()))
            .join()
            .expect("engine thread");
        std::env::remove_var("PDFIUM_LIB_PATH");

        let err = created.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/libpdfium.so"), "{err}");
    }

    #[test]
    fn load_errors_are_rewritten_for_classification() {
        use crate::error::ErrorKind;
        use crate::retry::{classify, Provenance};

        let cases = [
            ("PdfiumLibraryInternalError(PasswordError)", ErrorKind::PdfPasswordProtected),
            ("PdfiumLibraryInternalError(FormatError)", ErrorKind::PdfFormat),
            ("PdfiumLibraryInternalError(FileError)", ErrorKind::PdfCorrupted),
        ];
        for (raw, kind) in cases {
            assert_eq!(classify(&describe_load_error(raw), Provenance::Engine), kind, "{raw}");
        }
    }
}
