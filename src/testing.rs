//! Deterministic engine for tests.
//!
//! [`ScriptedEngine`] never touches pdfium. Documents are byte buffers made
//! by [`pdf_bytes`], which encode their own page count, and every behaviour
//! a test cares about (failing pages, flaky pages, slow renders, a blocked
//! render) comes from an [`EngineScript`]. An [`EngineProbe`] shared by all
//! engines of one factory counts what actually happened.
//!
//! ```rust
//! use pdfraster::testing::EngineScript;
//!
//! let (factory, probe) = EngineScript::new(10).failing([3, 7]).into_factory();
//! # let _ = (factory, probe);
//! ```

use crate::engine::{EngineError, EngineFactory, RenderEngine, RenderParams, RenderedPage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A minimal document body recognised by [`ScriptedEngine`].
pub fn pdf_bytes(pages: usize) -> Vec<u8> {
    format!("%PDF-1.7 pages={pages}\n%%EOF").into_bytes()
}

/// Behaviour of every engine built from one factory.
#[derive(Debug, Clone)]
pub struct EngineScript {
    /// Page count for documents that do not declare one.
    pub page_count: usize,
    /// Natural page size at scale 1.
    pub width: u32,
    pub height: u32,
    /// Pages that fail on every attempt.
    pub failing_pages: HashSet<usize>,
    /// Pages that fail their first `n` attempts.
    pub flaky_pages: HashMap<usize, u32>,
    pub open_error: Option<String>,
    pub create_error: Option<String>,
    pub panic_on_page: Option<usize>,
    pub render_delay: Duration,
}

impl EngineScript {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            width: 600,
            height: 800,
            failing_pages: HashSet::new(),
            flaky_pages: HashMap::new(),
            open_error: None,
            create_error: None,
            panic_on_page: None,
            render_delay: Duration::ZERO,
        }
    }

    pub fn failing(mut self, pages: impl IntoIterator<Item = usize>) -> Self {
        self.failing_pages.extend(pages);
        self
    }

    pub fn flaky(mut self, page: usize, failures: u32) -> Self {
        self.flaky_pages.insert(page, failures);
        self
    }

    pub fn open_error(mut self, message: impl Into<String>) -> Self {
        self.open_error = Some(message.into());
        self
    }

    pub fn fail_create(mut self, message: impl Into<String>) -> Self {
        self.create_error = Some(message.into());
        self
    }

    pub fn panic_on(mut self, page: usize) -> Self {
        self.panic_on_page = Some(page);
        self
    }

    pub fn render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    pub fn into_factory(self) -> (Arc<ScriptedFactory>, Arc<EngineProbe>) {
        let probe = Arc::new(EngineProbe::default());
        let factory = Arc::new(ScriptedFactory {
            script: Arc::new(self),
            probe: Arc::clone(&probe),
        });
        (factory, probe)
    }
}

/// Blocks renders while closed. Open by default.
#[derive(Debug, Default)]
pub struct Gate {
    closed: Mutex<bool>,
    changed: Condvar,
    held: AtomicUsize,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.changed.notify_all();
    }

    /// Renders currently blocked on the closed gate.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    fn wait(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        self.held.fetch_add(1, Ordering::SeqCst);
        while *closed {
            closed = self
                .changed
                .wait(closed)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters shared by every engine of one factory.
#[derive(Debug, Default)]
pub struct EngineProbe {
    created: AtomicUsize,
    opens: AtomicUsize,
    renders: AtomicUsize,
    closes: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    render_log: Mutex<Vec<usize>>,
    gate: Gate,
}

impl EngineProbe {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Render calls that reached the engine, successful or not.
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Highest number of renders observed running at the same moment.
    pub fn max_concurrent_renders(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// How many times `page` reached an engine.
    pub fn renders_of(&self, page: usize) -> usize {
        self.render_log().iter().filter(|p| **p == page).count()
    }

    pub fn render_log(&self) -> Vec<usize> {
        self.render_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }
}

#[derive(Debug)]
pub struct ScriptedFactory {
    script: Arc<EngineScript>,
    probe: Arc<EngineProbe>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        if let Some(message) = &self.script.create_error {
            return Err(EngineError::new(message.clone()));
        }
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            script: Arc::clone(&self.script),
            probe: Arc::clone(&self.probe),
            open_pages: None,
            attempts: HashMap::new(),
        }))
    }
}

pub struct ScriptedEngine {
    script: Arc<EngineScript>,
    probe: Arc<EngineProbe>,
    open_pages: Option<usize>,
    attempts: HashMap<usize, u32>,
}

impl ScriptedEngine {
    fn declared_pages(bytes: &[u8]) -> Option<usize> {
        let text = std::str::from_utf8(bytes).ok()?;
        let rest = &text[text.find("pages=")? + "pages=".len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }
}

impl RenderEngine for ScriptedEngine {
    fn open(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        self.open_pages = None;
        if let Some(message) = &self.script.open_error {
            return Err(EngineError::new(message.clone()));
        }
        if !bytes.starts_with(b"%PDF") {
            return Err(EngineError::new("not a PDF file: bad header"));
        }
        let pages = Self::declared_pages(bytes).unwrap_or(self.script.page_count);
        self.open_pages = Some(pages);
        Ok(pages)
    }

    fn render_page(
        &mut self,
        page_number: usize,
        params: &RenderParams,
    ) -> Result<RenderedPage, EngineError> {
        let total = self
            .open_pages
            .ok_or_else(|| EngineError::new("render requested but no document is open"))?;

        self.probe.gate.wait();
        self.probe.renders.fetch_add(1, Ordering::SeqCst);
        self.probe
            .render_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(page_number);

        let now_active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(now_active, Ordering::SeqCst);
        let result = self.render_inner(total, page_number, params);
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn close(&mut self) {
        if self.open_pages.take().is_some() {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedEngine {
    fn render_inner(
        &mut self,
        total: usize,
        page_number: usize,
        params: &RenderParams,
    ) -> Result<RenderedPage, EngineError> {
        if !self.script.render_delay.is_zero() {
            std::thread::sleep(self.script.render_delay);
        }
        if page_number == 0 || page_number > total {
            return Err(EngineError::new(format!("page {page_number} is out of range")));
        }
        if self.script.panic_on_page == Some(page_number) {
            panic!("scripted panic on page {page_number}");
        }
        if self.script.failing_pages.contains(&page_number) {
            return Err(EngineError::new(format!(
                "failed to render page {page_number}: bitmap error"
            )));
        }
        let attempt = self.attempts.entry(page_number).or_default();
        *attempt += 1;
        if let Some(failures) = self.script.flaky_pages.get(&page_number) {
            if *attempt <= *failures {
                return Err(EngineError::new(format!(
                    "failed to render page {page_number}: transient bitmap error"
                )));
            }
        }

        let (width, height) = fit(self.script.width, self.script.height, params);
        Ok(RenderedPage {
            data: format!("page-{page_number}").into_bytes().into(),
            mime_type: if params.quality >= 100 {
                "image/png"
            } else {
                "image/jpeg"
            },
            width,
            height,
        })
    }
}

fn fit(width: u32, height: u32, params: &RenderParams) -> (u32, u32) {
    let w = (width as f32 * params.scale).round().max(1.0);
    let h = (height as f32 * params.scale).round().max(1.0);
    let longest = w.max(h);
    let cap = params.max_dimension as f32;
    if longest <= cap {
        return (w as u32, h as u32);
    }
    let ratio = cap / longest;
    (
        (w * ratio).round().max(1.0) as u32,
        (h * ratio).round().max(1.0) as u32,
    )
}
