//! Per-document orchestration.
//!
//! A [`PdfProcessor`] owns one worker for its whole life and drives one
//! document at a time through it:
//!
//! ```text
//! process_file ──▶ InitPdf ──▶ Ready { total_pages }
//!                                   │
//! get_page(n) ─┬─ cached            → image (access time refreshed)
//!              ├─ already pending   → joins the existing waiters
//!              └─ new               → queue ─▶ dispatch (≤ max_concurrent)
//!                                               │
//!                      PageProcessed ◀──────────┤
//!                      Error ─▶ retry? ─ yes ─▶ park, backoff, front of queue
//!                                       └ no ─▶ reject waiters, record error
//! ```
//!
//! ## Why an actor?
//!
//! Every piece of per-document state (queue, cache, retry bookkeeping) lives
//! in one spawned task and is touched only by it. The public handle sends
//! commands over a channel, so no lock is ever held across an await and the
//! ordering of events is the ordering of the channel. Timers and retries
//! hold only a weak sender: once the handle is gone they cannot keep the
//! task alive.

use crate::cache::{CacheKey, ImageReleaser, PageCache};
use crate::config::{PipelineConfig, QualityTier};
use crate::error::{ErrorKind, ErrorRecord, RenderError};
use crate::pool::WorkerPool;
use crate::protocol::{
    DisplayInfo, DocumentId, PageImage, RequestId, WorkerId, WorkerMessage, WorkerReply, WorkerRequest,
    WorkerResponse,
};
use crate::queue::{Enqueued, PageResult, RequestQueue};
use crate::recovery::RecoveryEvent;
use crate::report::DocumentReport;
use crate::retry::RetryPolicy;
use crate::worker::WorkerHandle;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The document a processor currently has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentInfo {
    pub document_id: DocumentId,
    pub total_pages: usize,
    pub tier: QualityTier,
    pub byte_len: usize,
}

/// Point-in-time view of a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub document_id: Option<DocumentId>,
    pub total_pages: Option<usize>,
    pub tier: Option<QualityTier>,
    /// Renders in flight.
    pub active: usize,
    /// Pages waiting for a slot.
    pub queued: usize,
    /// Pages waiting out a retry backoff.
    pub parked: usize,
    pub cached: usize,
    pub max_concurrent: usize,
    /// Highest `active` seen since the document was opened.
    pub peak_active: usize,
    /// Render requests sent to the worker, retries included.
    pub dispatched: u64,
    pub cache_hits: u64,
    pub failed_pages: usize,
}

enum Command {
    ProcessFile {
        bytes: Arc<[u8]>,
        reply: oneshot::Sender<Result<DocumentInfo, RenderError>>,
    },
    GetPage {
        page_number: usize,
        reply: oneshot::Sender<PageResult>,
    },
    Abort {
        reply: oneshot::Sender<usize>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
    SetConcurrency {
        n: usize,
        reply: oneshot::Sender<usize>,
    },
    SetDisplay {
        display: Option<DisplayInfo>,
    },
    Stats {
        reply: oneshot::Sender<ProcessorStats>,
    },
    Errors {
        reply: oneshot::Sender<Vec<ErrorRecord>>,
    },
    RequestTimeout {
        request_id: RequestId,
    },
    RetryDue {
        document_id: DocumentId,
        page_number: usize,
    },
}

/// Renders pages of one document at a time.
///
/// Dropping the processor cleans it up: queued callers are rejected, the
/// cache is released and the worker is retired from the pool.
pub struct PdfProcessor {
    commands: mpsc::UnboundedSender<Command>,
    file_name: String,
    worker_id: WorkerId,
    mask_internal_errors: bool,
    cleaned_up: AtomicBool,
}

impl std::fmt::Debug for PdfProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfProcessor")
            .field("file_name", &self.file_name)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl PdfProcessor {
    /// Acquire a worker from `pool` and start the processor.
    pub async fn new(
        pool: Arc<WorkerPool>,
        file_name: impl Into<String>,
    ) -> Result<Self, RenderError> {
        Self::with_releaser(pool, file_name, None).await
    }

    /// Like [`Self::new`], running `releaser` for every page leaving the cache.
    pub async fn with_releaser(
        pool: Arc<WorkerPool>,
        file_name: impl Into<String>,
        releaser: Option<Arc<dyn ImageReleaser>>,
    ) -> Result<Self, RenderError> {
        let file_name = file_name.into();
        let worker = pool.acquire_worker().await?;
        let worker_id = worker.id();
        let config = pool.config();
        let mask_internal_errors = config.mask_internal_errors;

        let mut cache = PageCache::new(config.cache_max_age());
        if let Some(releaser) = releaser {
            cache = cache.with_releaser(releaser);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            retry: RetryPolicy::new(config.max_retries, config.retry_base_delay()),
            max_concurrent: config.default_concurrency,
            config,
            pool,
            worker,
            file_name: file_name.clone(),
            commands: rx,
            timers: tx.downgrade(),
            events_tx,
            events_rx,
            session: Session::Empty,
            cache,
            next_request_id: 1,
            display: None,
            errors: Vec::new(),
            failed: BTreeMap::new(),
            orphaned: HashSet::new(),
            dispatched: 0,
            peak_active: 0,
            cache_hits: 0,
        };
        tokio::spawn(actor.run());
        info!("Processor for '{}' started on {}", file_name, worker_id);

        Ok(Self {
            commands: tx,
            file_name,
            worker_id,
            mask_internal_errors,
            cleaned_up: AtomicBool::new(false),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Text to show a user for `err`, masked per `mask_internal_errors`.
    /// The kind and detail go to the log.
    pub fn describe_error(&self, err: &RenderError) -> String {
        debug!(
            kind = ?err.kind,
            page = ?err.page_number,
            "'{}': {}", self.file_name, err.message
        );
        err.display_masked(self.mask_internal_errors)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RenderError> {
        if self.cleaned_up.load(Ordering::Acquire) {
            return Err(RenderError::not_initialized());
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| RenderError::not_initialized())?;
        rx.await.map_err(|_| RenderError::not_initialized())
    }

    /// Open a document, replacing the current one if any.
    ///
    /// Files over the configured size limit are rejected before reaching the
    /// worker.
    pub async fn process_file(&self, bytes: impl Into<Arc<[u8]>>) -> Result<DocumentInfo, RenderError> {
        let bytes = bytes.into();
        self.request(|reply| Command::ProcessFile { bytes, reply })
            .await?
    }

    /// Rendered image of `page_number` (1-indexed).
    pub async fn get_page(&self, page_number: usize) -> PageResult {
        self.request(|reply| Command::GetPage { page_number, reply })
            .await?
    }

    /// Render every page concurrently (bounded by the concurrency cap) and
    /// collect the outcome.
    pub async fn render_all(&self) -> Result<DocumentReport, RenderError> {
        let stats = self.stats().await?;
        let total_pages = stats.total_pages.ok_or_else(RenderError::not_initialized)?;
        let results = join_all((1..=total_pages).map(|p| async move { (p, self.get_page(p).await) })).await;
        Ok(DocumentReport::collect(&self.file_name, total_pages, results))
    }

    /// Cancel all queued and in-flight pages of the current document.
    ///
    /// Returns how many callers were rejected. A second call with nothing
    /// pending does nothing.
    pub async fn abort(&self) -> usize {
        self.request(|reply| Command::Abort { reply })
            .await
            .unwrap_or(0)
    }

    /// Release the document, the cache and the worker. Idempotent; afterwards
    /// every call fails as not initialized.
    pub async fn cleanup(&self) {
        if self.cleaned_up.load(Ordering::Acquire) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Cleanup { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        self.cleaned_up.store(true, Ordering::Release);
    }

    /// Change the concurrency cap. Values are clamped to the configured
    /// bounds; returns the value applied.
    pub async fn set_max_concurrent(&self, n: usize) -> Result<usize, RenderError> {
        self.request(|reply| Command::SetConcurrency { n, reply }).await
    }

    /// Set the display pages are rendered for. Cached pages are dropped when
    /// the display changes.
    pub fn set_display_info(&self, display: Option<DisplayInfo>) {
        let _ = self.commands.send(Command::SetDisplay { display });
    }

    pub async fn stats(&self) -> Result<ProcessorStats, RenderError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Every failure recorded for this processor, oldest first.
    pub async fn errors(&self) -> Result<Vec<ErrorRecord>, RenderError> {
        self.request(|reply| Command::Errors { reply }).await
    }
}

impl Drop for PdfProcessor {
    fn drop(&mut self) {
        // Closing the command channel makes the actor tear down.
        if !self.cleaned_up.load(Ordering::Acquire) {
            debug!("Processor for '{}' dropped without cleanup", self.file_name);
        }
    }
}

// ── Actor ────────────────────────────────────────────────────────────────

enum Session {
    Empty,
    Opening {
        document_id: DocumentId,
        request_id: RequestId,
        tier: QualityTier,
        byte_len: usize,
        reply: oneshot::Sender<Result<DocumentInfo, RenderError>>,
    },
    Ready {
        info: DocumentInfo,
        queue: RequestQueue,
    },
}

struct Actor {
    config: Arc<PipelineConfig>,
    pool: Arc<WorkerPool>,
    worker: WorkerHandle,
    file_name: String,
    commands: mpsc::UnboundedReceiver<Command>,
    timers: mpsc::WeakUnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<WorkerReply>,
    events_rx: mpsc::UnboundedReceiver<WorkerReply>,
    session: Session,
    cache: PageCache,
    retry: RetryPolicy,
    next_request_id: u64,
    display: Option<DisplayInfo>,
    max_concurrent: usize,
    errors: Vec<ErrorRecord>,
    failed: BTreeMap<usize, ErrorRecord>,
    /// Requests whose callers were rejected by `abort`; their replies go to
    /// the recovery bus.
    orphaned: HashSet<RequestId>,
    dispatched: u64,
    peak_active: usize,
    cache_hits: u64,
}

/// What happens to replies still owed to a session being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LateReplies {
    Recover,
    Discard,
}

/// Deliver `command` to the actor after `delay`, unless it is gone by then.
fn schedule(timers: &mpsc::WeakUnboundedSender<Command>, delay: Duration, command: Command) {
    let timers = timers.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(tx) = timers.upgrade() {
            let _ = tx.send(command);
        }
    });
}

impl Actor {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.cache_sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Cleanup { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.teardown();
                        return;
                    }
                },
                Some(reply) = self.events_rx.recv() => self.on_reply(reply),
                _ = sweep.tick() => {
                    let swept = self.cache.sweep(Instant::now());
                    if swept > 0 {
                        debug!("'{}': swept {} idle pages from cache", self.file_name, swept);
                    }
                }
            }
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::ProcessFile { bytes, reply } => self.process_file(bytes, reply),
            Command::GetPage { page_number, reply } => self.get_page(page_number, reply),
            Command::Abort { reply } => {
                let rejected = self.abort_session("processing aborted", LateReplies::Recover);
                let _ = reply.send(rejected);
            }
            Command::SetConcurrency { n, reply } => {
                let applied = self.config.clamp_concurrency(n);
                if applied != n {
                    debug!("Concurrency {} clamped to {}", n, applied);
                }
                self.max_concurrent = applied;
                if let Session::Ready { queue, .. } = &mut self.session {
                    queue.set_max_concurrent(applied);
                }
                self.pump();
                let _ = reply.send(applied);
            }
            Command::SetDisplay { display } => {
                if display != self.display {
                    self.display = display;
                    let released = self.cache.clear();
                    debug!("Display changed, {} cached pages dropped", released);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Errors { reply } => {
                let _ = reply.send(self.errors.clone());
            }
            Command::RequestTimeout { request_id } => self.on_timeout(request_id),
            Command::RetryDue {
                document_id,
                page_number,
            } => {
                if let Session::Ready { info, queue } = &mut self.session {
                    if info.document_id == document_id && queue.unpark(page_number, Instant::now()) {
                        debug!("Page {}: retry due", page_number);
                    }
                }
                self.pump();
            }
            Command::Cleanup { .. } => {}
        }
    }

    fn process_file(
        &mut self,
        bytes: Arc<[u8]>,
        reply: oneshot::Sender<Result<DocumentInfo, RenderError>>,
    ) {
        let byte_len = bytes.len();
        if byte_len > self.config.max_file_size {
            let err = RenderError::file_too_large(byte_len, self.config.max_file_size);
            warn!("'{}': {}", self.file_name, err);
            self.record(&err);
            let _ = reply.send(Err(err));
            return;
        }

        self.abort_session("document replaced", LateReplies::Discard);
        self.failed.clear();
        self.peak_active = 0;

        let document_id = DocumentId::next();
        let tier = self.config.tier_for(byte_len);
        let request_id = self.next_id();
        let message = WorkerMessage {
            request_id,
            document_id,
            request: WorkerRequest::InitPdf { bytes },
        };
        if let Err(e) = self.worker.send(message, self.events_tx.clone()) {
            self.record(&e);
            let _ = reply.send(Err(e));
            return;
        }

        info!(
            "Opening '{}' as {} ({} bytes, {:?} tier)",
            self.file_name, document_id, byte_len, tier
        );
        schedule(
            &self.timers,
            self.config.init_timeout(),
            Command::RequestTimeout { request_id },
        );
        self.session = Session::Opening {
            document_id,
            request_id,
            tier,
            byte_len,
            reply,
        };
    }

    fn get_page(&mut self, page_number: usize, reply: oneshot::Sender<PageResult>) {
        let Session::Ready { info, queue } = &mut self.session else {
            let _ = reply.send(Err(RenderError::not_initialized().for_page(page_number)));
            return;
        };
        if page_number == 0 || page_number > info.total_pages {
            let err = RenderError::new(
                ErrorKind::PdfPageRender,
                format!(
                    "page {page_number} is out of range (document has {} pages)",
                    info.total_pages
                ),
            )
            .for_page(page_number);
            let _ = reply.send(Err(err));
            return;
        }

        let now = Instant::now();
        let key = CacheKey {
            document_id: info.document_id,
            page_number,
        };
        if let Some(image) = self.cache.get(&key, now) {
            self.cache_hits += 1;
            let _ = reply.send(Ok(image));
            return;
        }

        if queue.enqueue(page_number, reply, now) == Enqueued::Attached {
            debug!("Page {} already pending, sharing its result", page_number);
        }
        self.pump();
    }

    /// Dispatch queued pages while slots are free.
    fn pump(&mut self) {
        if self.worker_gone() {
            if matches!(&self.session, Session::Ready { queue, .. } if queue.has_work()) {
                self.abort_session("worker pool terminated", LateReplies::Discard);
            }
            return;
        }
        let Session::Ready { info, queue } = &mut self.session else {
            return;
        };
        let settings = self.config.tier_settings(info.tier);
        let mut send_failed = None;

        while let Some(request) = queue.next_dispatch() {
            let request_id = RequestId(self.next_request_id);
            self.next_request_id += 1;
            let message = WorkerMessage {
                request_id,
                document_id: info.document_id,
                request: WorkerRequest::ProcessPage {
                    page_number: request.page_number,
                    config: settings,
                    display_info: self.display,
                },
            };
            match self.worker.send(message, self.events_tx.clone()) {
                Ok(()) => {
                    queue.mark_dispatched(request_id, &request, Instant::now());
                    self.dispatched += 1;
                    self.peak_active = self.peak_active.max(queue.active());
                    schedule(
                        &self.timers,
                        self.config.request_timeout(),
                        Command::RequestTimeout { request_id },
                    );
                }
                Err(e) => {
                    send_failed = Some(e);
                    break;
                }
            }
        }

        // A send only fails once the worker has exited.
        if let Some(e) = send_failed {
            warn!("'{}': {}", self.file_name, e);
            self.abort_session("worker terminated", LateReplies::Discard);
        }
    }

    fn worker_gone(&self) -> bool {
        !self.worker.is_alive() || self.pool.is_terminated()
    }

    fn on_reply(&mut self, reply: WorkerReply) {
        if matches!(&self.session, Session::Opening { request_id, .. } if *request_id == reply.request_id)
        {
            self.finish_open(reply);
            return;
        }
        if self.orphaned.remove(&reply.request_id) {
            info!(
                "'{}': {:?} finished after abort, publishing for recovery",
                self.file_name, reply.request_id
            );
            self.pool.bus().publish(RecoveryEvent::from_reply(reply));
            return;
        }

        let Session::Ready { info, queue } = &mut self.session else {
            debug!("Discarding {:?}: no document open", reply.request_id);
            return;
        };
        if reply.document_id != info.document_id {
            debug!("Discarding {:?} for replaced {}", reply.request_id, reply.document_id);
            return;
        }
        let Some(in_flight) = queue.complete(reply.request_id) else {
            debug!("Discarding late {:?}", reply.request_id);
            return;
        };

        let mut failure = None;
        let mut worker_stopped = false;
        match reply.response {
            WorkerResponse::PageProcessed { page_number, page } => {
                let image = PageImage::new(info.document_id, page_number, page);
                let key = CacheKey {
                    document_id: info.document_id,
                    page_number,
                };
                self.cache.insert(key, image.clone(), Instant::now());
                self.failed.remove(&page_number);
                let delivered = queue.resolve(page_number, Ok(image));
                debug!(
                    "Page {} rendered (attempt {}, {} waiters)",
                    page_number, in_flight.attempt, delivered
                );
            }
            // The worker only aborts a live session's request when it shuts down.
            WorkerResponse::Error {
                kind: ErrorKind::Abort,
                ..
            } => worker_stopped = true,
            WorkerResponse::Error {
                page_number,
                kind,
                message,
            } => {
                let page = page_number.unwrap_or(in_flight.page_number);
                let err = RenderError::new(kind, message).for_page(page);
                failure = Some((page, in_flight.attempt, err));
            }
            WorkerResponse::PdfInitialized { .. } => {
                warn!("Unexpected PdfInitialized reply to a page request");
            }
        }

        if worker_stopped {
            self.abort_session("worker terminated", LateReplies::Discard);
            return;
        }
        if let Some((page, attempt, err)) = failure {
            self.page_failed(page, attempt, err);
        }
        self.pump();
    }

    fn finish_open(&mut self, reply: WorkerReply) {
        let Session::Opening {
            document_id,
            tier,
            byte_len,
            reply: waiter,
            ..
        } = std::mem::replace(&mut self.session, Session::Empty)
        else {
            return;
        };

        let result = match reply.response {
            WorkerResponse::PdfInitialized { total_pages: 0 } => Err(RenderError::new(
                ErrorKind::PdfFormat,
                "document has no pages",
            )),
            WorkerResponse::PdfInitialized { total_pages } => Ok(DocumentInfo {
                document_id,
                total_pages,
                tier,
                byte_len,
            }),
            WorkerResponse::Error { kind, message, .. } => Err(RenderError::new(kind, message)),
            WorkerResponse::PageProcessed { .. } => Err(RenderError::new(
                ErrorKind::WorkerCommunication,
                "page reply received for a document open request",
            )),
        };

        match &result {
            Ok(info) => {
                info!("'{}' opened: {} pages", self.file_name, info.total_pages);
                self.session = Session::Ready {
                    info: info.clone(),
                    queue: RequestQueue::new(document_id, self.max_concurrent),
                };
            }
            Err(e) => {
                error!(kind = ?e.kind, "Failed to open '{}': {}", self.file_name, e.message);
                self.record(e);
            }
        }
        let _ = waiter.send(result);
    }

    fn on_timeout(&mut self, request_id: RequestId) {
        let opening = matches!(
            &self.session,
            Session::Opening { request_id: id, .. } if *id == request_id
        );
        if opening {
            let Session::Opening { reply, .. } = std::mem::replace(&mut self.session, Session::Empty)
            else {
                return;
            };
            let err = RenderError::new(
                ErrorKind::WorkerTimeout,
                format!("document did not open within {}ms", self.config.init_timeout_ms),
            );
            warn!("'{}': {}", self.file_name, err.message);
            self.record(&err);
            let _ = reply.send(Err(err));
            return;
        }

        let Session::Ready { queue, .. } = &mut self.session else {
            return;
        };
        let Some(in_flight) = queue.complete(request_id) else {
            return;
        };
        let page = in_flight.page_number;
        let err = RenderError::new(
            ErrorKind::WorkerTimeout,
            format!(
                "page {page} did not render within {}ms",
                self.config.request_timeout_ms
            ),
        )
        .for_page(page);
        warn!("'{}': {}", self.file_name, err.message);
        self.page_failed(page, in_flight.attempt, err);
        self.pump();
    }

    /// Retry a failed page or surface the failure to its waiters.
    fn page_failed(&mut self, page_number: usize, attempt: u32, err: RenderError) {
        if self.worker_gone() {
            self.abort_session("worker pool terminated", LateReplies::Discard);
            return;
        }
        let next_attempt = attempt + 1;
        if let Some(delay) = self.retry.next_delay(err.kind, next_attempt) {
            if let Session::Ready { info, queue } = &mut self.session {
                warn!(
                    "Page {}: retry {}/{} in {}ms ({})",
                    page_number,
                    next_attempt,
                    self.retry.max_retries,
                    delay.as_millis(),
                    err
                );
                queue.park(page_number, next_attempt);
                schedule(
                    &self.timers,
                    delay,
                    Command::RetryDue {
                        document_id: info.document_id,
                        page_number,
                    },
                );
                return;
            }
        }

        error!(kind = ?err.kind, "Page {} failed: {}", page_number, err.message);
        let record = self.record(&err);
        self.failed.insert(page_number, record);
        if let Session::Ready { queue, .. } = &mut self.session {
            queue.resolve(page_number, Err(err));
        }
    }

    fn record(&mut self, err: &RenderError) -> ErrorRecord {
        let record = ErrorRecord::from_error(&self.file_name, err);
        self.errors.push(record.clone());
        record
    }

    /// Drop the current session, rejecting everyone waiting on it.
    fn abort_session(&mut self, reason: &str, late: LateReplies) -> usize {
        let rejected = match std::mem::replace(&mut self.session, Session::Empty) {
            Session::Empty => return 0,
            Session::Opening {
                document_id,
                request_id,
                reply,
                ..
            } => {
                let _ = reply.send(Err(RenderError::aborted(reason)));
                if late == LateReplies::Recover {
                    self.orphaned.insert(request_id);
                }
                self.notify_worker_abort(document_id);
                1
            }
            Session::Ready { info, mut queue } => {
                let had_work = queue.has_work();
                if late == LateReplies::Recover {
                    self.orphaned.extend(queue.in_flight_ids());
                }
                let rejected = queue.abort_all(&RenderError::aborted(reason));
                if had_work {
                    self.notify_worker_abort(info.document_id);
                }
                rejected
            }
        };
        let released = self.cache.clear();
        info!(
            "'{}': {} ({} callers rejected, {} cached pages released)",
            self.file_name, reason, rejected, released
        );
        rejected
    }

    fn notify_worker_abort(&mut self, document_id: DocumentId) {
        let message = WorkerMessage {
            request_id: self.next_id(),
            document_id,
            request: WorkerRequest::AbortProcessing,
        };
        if let Err(e) = self.worker.send(message, self.events_tx.clone()) {
            debug!("Abort not delivered to {}: {}", self.worker.id(), e);
        }
    }

    fn teardown(&mut self) {
        self.abort_session("processor cleaned up", LateReplies::Discard);
        self.cache.clear();
        self.pool.retire_worker(&self.worker);
        info!("Processor for '{}' cleaned up", self.file_name);
    }

    fn stats(&self) -> ProcessorStats {
        let mut stats = ProcessorStats {
            cached: self.cache.len(),
            max_concurrent: self.max_concurrent,
            peak_active: self.peak_active,
            dispatched: self.dispatched,
            cache_hits: self.cache_hits,
            failed_pages: self.failed.len(),
            ..ProcessorStats::default()
        };
        match &self.session {
            Session::Empty => {}
            Session::Opening {
                document_id, tier, ..
            } => {
                stats.document_id = Some(*document_id);
                stats.tier = Some(*tier);
            }
            Session::Ready { info, queue } => {
                stats.document_id = Some(info.document_id);
                stats.total_pages = Some(info.total_pages);
                stats.tier = Some(info.tier);
                stats.active = queue.active();
                stats.queued = queue.queued();
                stats.parked = queue.parked();
            }
        }
        stats
    }
}
