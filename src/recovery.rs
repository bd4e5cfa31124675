//! Recovery bus for orphaned results.
//!
//! A worker or coordinator may finish a job after the processor that asked
//! for it has gone away (cleaned up, replaced, dropped). Instead of losing
//! the result, the component that failed to deliver it publishes a
//! [`RecoveryEvent`] here.
//!
//! ```text
//! publish(event)
//!   ├─ subscribers for event.kind() → each callback runs once
//!   └─ no subscriber               → retained, replayed to the first
//!                                    subscriber of that kind, or expired
//! ```
//!
//! Retained events older than the expiration are pruned on every bus
//! operation, so the bus never grows without bound. Callbacks run outside
//! the bus lock and may publish or subscribe themselves.

use crate::engine::host::{EngineCompletion, EngineOutput};
use crate::error::ErrorKind;
use crate::protocol::{DocumentId, PageImage, RequestId, WorkerId, WorkerReply, WorkerResponse};
use futures::Stream;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

const DEFAULT_EXPIRATION: Duration = Duration::from_secs(300);
const MAX_RETAINED: usize = 1024;

/// Channel an event is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PageProcessed,
    PdfInitialized,
    Error,
    Cleanup,
    Abort,
}

impl EventKind {
    pub fn channel_name(self) -> &'static str {
        match self {
            EventKind::PageProcessed => "page-processed",
            EventKind::PdfInitialized => "pdf-initialized",
            EventKind::Error => "error",
            EventKind::Cleanup => "cleanup",
            EventKind::Abort => "abort",
        }
    }
}

/// A result nobody was waiting for any more.
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    PageProcessed {
        image: PageImage,
    },
    PdfInitialized {
        document_id: DocumentId,
        total_pages: usize,
    },
    Error {
        document_id: Option<DocumentId>,
        request_id: Option<RequestId>,
        page_number: Option<usize>,
        kind: ErrorKind,
        message: String,
    },
    Cleanup {
        client_id: Option<WorkerId>,
        request_id: Option<RequestId>,
        success: bool,
    },
    Abort {
        document_id: DocumentId,
        request_id: RequestId,
        page_number: Option<usize>,
    },
}

impl RecoveryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RecoveryEvent::PageProcessed { .. } => EventKind::PageProcessed,
            RecoveryEvent::PdfInitialized { .. } => EventKind::PdfInitialized,
            RecoveryEvent::Error { .. } => EventKind::Error,
            RecoveryEvent::Cleanup { .. } => EventKind::Cleanup,
            RecoveryEvent::Abort { .. } => EventKind::Abort,
        }
    }

    pub(crate) fn from_reply(reply: WorkerReply) -> Self {
        let WorkerReply {
            request_id,
            document_id,
            response,
        } = reply;
        match response {
            WorkerResponse::PdfInitialized { total_pages } => RecoveryEvent::PdfInitialized {
                document_id,
                total_pages,
            },
            WorkerResponse::PageProcessed { page_number, page } => RecoveryEvent::PageProcessed {
                image: PageImage::new(document_id, page_number, page),
            },
            WorkerResponse::Error {
                page_number,
                kind: ErrorKind::Abort,
                ..
            } => RecoveryEvent::Abort {
                document_id,
                request_id,
                page_number,
            },
            WorkerResponse::Error {
                page_number,
                kind,
                message,
            } => RecoveryEvent::Error {
                document_id: Some(document_id),
                request_id: Some(request_id),
                page_number,
                kind,
                message,
            },
        }
    }

    pub(crate) fn from_completion(done: EngineCompletion) -> Self {
        let response = match done.result {
            Ok(EngineOutput::Opened { total_pages }) => {
                WorkerResponse::PdfInitialized { total_pages }
            }
            Ok(EngineOutput::Rendered { page_number, page }) => {
                WorkerResponse::PageProcessed { page_number, page }
            }
            Err(e) => WorkerResponse::Error {
                page_number: done.page_number,
                kind: e.kind,
                message: e.message,
            },
        };
        Self::from_reply(WorkerReply {
            request_id: done.request_id,
            document_id: done.document_id,
            response,
        })
    }
}

type Callback = Arc<dyn Fn(&RecoveryEvent) + Send + Sync>;

struct Retained {
    at: Instant,
    event: RecoveryEvent,
}

struct BusState {
    next_id: u64,
    expiration: Duration,
    subscribers: HashMap<EventKind, Vec<(u64, Callback)>>,
    retained: VecDeque<Retained>,
}

impl BusState {
    fn prune(&mut self, now: Instant) {
        let expiration = self.expiration;
        let before = self.retained.len();
        self.retained
            .retain(|r| now.saturating_duration_since(r.at) <= expiration);
        let pruned = before - self.retained.len();
        if pruned > 0 {
            debug!("Recovery bus expired {} orphaned events", pruned);
        }
    }
}

struct BusInner {
    state: Mutex<BusState>,
}

/// Publish/subscribe hub for orphaned results. Cloning shares the bus.
#[derive(Clone)]
pub struct RecoveryBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for RecoveryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryBus").finish_non_exhaustive()
    }
}

impl Default for RecoveryBus {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION)
    }
}

static GLOBAL: Lazy<RecoveryBus> = Lazy::new(RecoveryBus::default);

impl RecoveryBus {
    pub fn new(expiration: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    next_id: 1,
                    expiration,
                    subscribers: HashMap::new(),
                    retained: VecDeque::new(),
                }),
            }),
        }
    }

    /// The process-wide bus used by pools that were not given their own.
    pub fn global() -> RecoveryBus {
        GLOBAL.clone()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_expiration(&self, expiration: Duration) {
        self.state().expiration = expiration;
    }

    /// Register `callback` for one event kind.
    ///
    /// Retained events of that kind are handed to this subscriber before the
    /// call returns and are not replayed again.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&RecoveryEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let (id, replay) = {
            let mut state = self.state();
            state.prune(Instant::now());
            let id = state.next_id;
            state.next_id += 1;
            state
                .subscribers
                .entry(kind)
                .or_default()
                .push((id, Arc::clone(&callback)));

            let (replay, keep): (VecDeque<Retained>, VecDeque<Retained>) =
                std::mem::take(&mut state.retained)
                    .into_iter()
                    .partition(|r| r.event.kind() == kind);
            state.retained = keep;
            (id, replay)
        };

        if !replay.is_empty() {
            info!(
                "Replaying {} orphaned '{}' events",
                replay.len(),
                kind.channel_name()
            );
        }
        for retained in replay {
            callback(&retained.event);
        }

        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
            active: true,
        }
    }

    /// Subscribe through a stream instead of a callback.
    pub fn subscribe_stream(&self, kind: EventKind) -> RecoveryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        RecoveryStream {
            inner: UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }

    /// Hand `event` to current subscribers, or retain it. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: RecoveryEvent) -> usize {
        let kind = event.kind();
        let callbacks: Vec<Callback> = {
            let mut state = self.state();
            let now = Instant::now();
            state.prune(now);
            let callbacks: Vec<Callback> = state
                .subscribers
                .get(&kind)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            if callbacks.is_empty() {
                if state.retained.len() >= MAX_RETAINED {
                    state.retained.pop_front();
                }
                debug!("Retaining orphaned '{}' event", kind.channel_name());
                state.retained.push_back(Retained { at: now, event });
                return 0;
            }
            callbacks
        };

        for callback in &callbacks {
            callback(&event);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.state().subscribers.get(&kind).map_or(0, Vec::len)
    }

    /// Retained events not yet expired.
    pub fn retained_count(&self) -> usize {
        let mut state = self.state();
        state.prune(Instant::now());
        state.retained.len()
    }

    /// Drop all subscribers and retained events.
    pub fn clear(&self) {
        let mut state = self.state();
        state.subscribers.clear();
        state.retained.clear();
    }
}

/// Active subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = state.subscribers.get_mut(&self.kind) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                state.subscribers.remove(&self.kind);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Stream of recovery events of one kind.
pub struct RecoveryStream {
    inner: UnboundedReceiverStream<RecoveryEvent>,
    _subscription: Subscription,
}

impl Stream for RecoveryStream {
    type Item = RecoveryEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
