//! Per-document request queue.
//!
//! Tracks three disjoint sets of pages:
//!
//! * **pending**: waiting for a dispatch slot, in FIFO order
//! * **in flight**: sent to the worker, keyed by request id
//! * **parked**: failed, waiting out a retry backoff
//!
//! Callers waiting for a page are attached to the page, not to a request,
//! so a second `get_page` for a page already pending, in flight or parked
//! never causes a second render: it joins the existing waiters and receives
//! the same result.

use crate::error::RenderError;
use crate::protocol::{DocumentId, PageImage, RequestId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type PageResult = Result<PageImage, RenderError>;
pub(crate) type Waiter = oneshot::Sender<PageResult>;

/// A page waiting for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub document_id: DocumentId,
    pub page_number: usize,
    pub requested_at: Instant,
    /// 0 for the first try, n for the n-th retry.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub page_number: usize,
    pub attempt: u32,
    pub dispatched_at: Instant,
}

/// What [`RequestQueue::enqueue`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// New page; queued for dispatch.
    Queued,
    /// Already pending; the caller joins the existing waiters.
    Attached,
}

#[derive(Debug)]
pub struct RequestQueue {
    document_id: DocumentId,
    pending: VecDeque<PageRequest>,
    waiters: HashMap<usize, Vec<Waiter>>,
    in_flight: HashMap<RequestId, InFlight>,
    parked: HashMap<usize, u32>,
    max_concurrent: usize,
}

impl RequestQueue {
    pub fn new(document_id: DocumentId, max_concurrent: usize) -> Self {
        Self {
            document_id,
            pending: VecDeque::new(),
            waiters: HashMap::new(),
            in_flight: HashMap::new(),
            parked: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub(crate) fn enqueue(&mut self, page_number: usize, waiter: Waiter, now: Instant) -> Enqueued {
        if let Some(waiting) = self.waiters.get_mut(&page_number) {
            waiting.push(waiter);
            return Enqueued::Attached;
        }
        self.waiters.insert(page_number, vec![waiter]);
        self.pending.push_back(PageRequest {
            document_id: self.document_id,
            page_number,
            requested_at: now,
            attempt: 0,
        });
        Enqueued::Queued
    }

    /// Whether some caller is already waiting for `page_number`.
    pub fn is_pending(&self, page_number: usize) -> bool {
        self.waiters.contains_key(&page_number)
    }

    /// Next request to send, if a slot is free.
    pub fn next_dispatch(&mut self) -> Option<PageRequest> {
        if self.in_flight.len() >= self.max_concurrent {
            return None;
        }
        self.pending.pop_front()
    }

    pub fn mark_dispatched(&mut self, request_id: RequestId, request: &PageRequest, now: Instant) {
        self.in_flight.insert(
            request_id,
            InFlight {
                page_number: request.page_number,
                attempt: request.attempt,
                dispatched_at: now,
            },
        );
    }

    /// Free the slot held by `request_id`. `None` for unknown or late ids.
    pub fn complete(&mut self, request_id: RequestId) -> Option<InFlight> {
        self.in_flight.remove(&request_id)
    }

    /// Hold a failed page out of the queue until its retry is due.
    pub fn park(&mut self, page_number: usize, attempt: u32) {
        self.parked.insert(page_number, attempt);
    }

    /// Put a parked page at the front of the queue. False if it was not parked
    /// (resolved or aborted in the meantime).
    pub fn unpark(&mut self, page_number: usize, now: Instant) -> bool {
        let Some(attempt) = self.parked.remove(&page_number) else {
            return false;
        };
        self.pending.push_front(PageRequest {
            document_id: self.document_id,
            page_number,
            requested_at: now,
            attempt,
        });
        true
    }

    /// Deliver a final result to every caller waiting for the page.
    pub fn resolve(&mut self, page_number: usize, result: PageResult) -> usize {
        self.parked.remove(&page_number);
        let waiters = self.waiters.remove(&page_number).unwrap_or_default();
        let delivered = waiters.len();
        for waiter in waiters {
            // A caller that stopped waiting simply misses the result.
            let _ = waiter.send(result.clone());
        }
        delivered
    }

    /// Reject every waiter and forget all work. Returns the waiter count.
    pub fn abort_all(&mut self, reason: &RenderError) -> usize {
        self.pending.clear();
        self.in_flight.clear();
        self.parked.clear();
        let mut rejected = 0;
        for (page_number, waiters) in self.waiters.drain() {
            for waiter in waiters {
                rejected += 1;
                let _ = waiter.send(Err(reason.clone().for_page(page_number)));
            }
        }
        rejected
    }

    /// Request ids currently in flight.
    pub fn in_flight_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.in_flight.keys().copied()
    }

    pub fn has_work(&self) -> bool {
        !self.waiters.is_empty() || !self.in_flight.is_empty()
    }

    pub fn active(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn set_max_concurrent(&mut self, n: usize) {
        self.max_concurrent = n.max(1);
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }
}
