//! Workers: the unit the pool hands out.
//!
//! A worker is a tokio task that translates [`WorkerMessage`]s into engine
//! jobs and engine completions back into [`WorkerReply`]s. How it reaches an
//! engine is decided once, at creation:
//!
//! * **dedicated**: it owns an [`EngineHost`] thread outright
//! * **shared**: it is bound to one coordinator through an
//!   `AssignCoordinator` handshake, after which it forwards jobs over a
//!   private port; the binding never changes
//!
//! Replies go to the `reply_to` sender that came with each request. If that
//! sender is closed the requester is gone and the reply is published on the
//! [`RecoveryBus`] instead.

use crate::coordinator::CoordinatorHandle;
use crate::engine::host::{AbortEpoch, EngineCompletion, EngineHost, EngineJob, EngineOp, EngineOutput};
use crate::engine::RenderParams;
use crate::error::{ErrorKind, RenderError};
use crate::protocol::{
    DocumentId, RequestId, WorkerId, WorkerMessage, WorkerReply, WorkerRequest, WorkerResponse,
};
use crate::recovery::{RecoveryBus, RecoveryEvent};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Which coordinator a worker was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorAssignment {
    pub worker_id: WorkerId,
    pub coordinator_index: usize,
}

/// Channels a coordinator hands a newly registered worker.
pub(crate) struct CoordinatorLink {
    pub port: mpsc::UnboundedSender<EngineJob>,
    pub completions: mpsc::UnboundedReceiver<EngineCompletion>,
    pub control: CoordinatorHandle,
}

pub(crate) enum WorkerCommand {
    Request {
        message: WorkerMessage,
        reply_to: mpsc::UnboundedSender<WorkerReply>,
    },
    AssignCoordinator {
        assignment: CoordinatorAssignment,
        link: CoordinatorLink,
        ack: oneshot::Sender<Result<(), RenderError>>,
    },
    Terminate,
}

/// Handle to a worker task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    pub(crate) coordinator_index: Option<usize>,
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Coordinator this worker forwards to, in shared-engine mode.
    pub fn coordinator_index(&self) -> Option<usize> {
        self.coordinator_index
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Send one request; its reply arrives on `reply_to`.
    pub fn send(
        &self,
        message: WorkerMessage,
        reply_to: mpsc::UnboundedSender<WorkerReply>,
    ) -> Result<(), RenderError> {
        self.tx
            .send(WorkerCommand::Request { message, reply_to })
            .map_err(|_| RenderError::channel_closed("worker"))
    }

    /// Bind the worker to a coordinator and wait for its acknowledgement.
    pub(crate) async fn assign(
        &self,
        assignment: CoordinatorAssignment,
        link: CoordinatorLink,
    ) -> Result<(), RenderError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::AssignCoordinator {
                assignment,
                link,
                ack,
            })
            .map_err(|_| RenderError::channel_closed("worker"))?;
        rx.await.map_err(|_| {
            RenderError::new(
                ErrorKind::WorkerInit,
                format!("{} exited before acknowledging its coordinator", self.id),
            )
        })?
    }

    pub(crate) fn terminate(&self) {
        let _ = self.tx.send(WorkerCommand::Terminate);
    }
}

enum EngineLink {
    Dedicated {
        host: EngineHost,
        done_tx: mpsc::UnboundedSender<EngineCompletion>,
        done_rx: mpsc::UnboundedReceiver<EngineCompletion>,
    },
    Shared {
        assignment: CoordinatorAssignment,
        port: mpsc::UnboundedSender<EngineJob>,
        done_rx: mpsc::UnboundedReceiver<EngineCompletion>,
        control: CoordinatorHandle,
    },
}

impl EngineLink {
    fn submit(&self, job: EngineJob) -> Result<(), RenderError> {
        match self {
            EngineLink::Dedicated { host, done_tx, .. } => host.submit(job, done_tx.clone()),
            EngineLink::Shared { port, .. } => port
                .send(job)
                .map_err(|_| RenderError::channel_closed("coordinator port")),
        }
    }

    fn completions(&mut self) -> &mut mpsc::UnboundedReceiver<EngineCompletion> {
        match self {
            EngineLink::Dedicated { done_rx, .. } | EngineLink::Shared { done_rx, .. } => done_rx,
        }
    }
}

struct PendingReply {
    reply_to: mpsc::UnboundedSender<WorkerReply>,
    document_id: DocumentId,
    page_number: Option<usize>,
}

struct Worker {
    id: WorkerId,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    link: Option<EngineLink>,
    pending: HashMap<RequestId, PendingReply>,
    abort: AbortEpoch,
    bus: RecoveryBus,
}

/// Start a worker that owns `host`.
pub(crate) fn spawn_dedicated(id: WorkerId, host: EngineHost, bus: RecoveryBus) -> WorkerHandle {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    spawn(
        id,
        Some(EngineLink::Dedicated {
            host,
            done_tx,
            done_rx,
        }),
        bus,
    )
}

/// Start a worker that waits for a coordinator assignment.
pub(crate) fn spawn_unassigned(id: WorkerId, bus: RecoveryBus) -> WorkerHandle {
    spawn(id, None, bus)
}

fn spawn(id: WorkerId, link: Option<EngineLink>, bus: RecoveryBus) -> WorkerHandle {
    let (tx, commands) = mpsc::unbounded_channel();
    let worker = Worker {
        id,
        commands,
        link,
        pending: HashMap::new(),
        abort: AbortEpoch::default(),
        bus,
    };
    tokio::spawn(worker.run());
    WorkerHandle {
        id,
        coordinator_index: None,
        tx,
    }
}

async fn next_completion(link: &mut Option<EngineLink>) -> Option<EngineCompletion> {
    match link {
        Some(link) => link.completions().recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self) {
        debug!("{} started", self.id);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Request { message, reply_to }) => {
                        self.handle_request(message, reply_to);
                    }
                    Some(WorkerCommand::AssignCoordinator { assignment, link, ack }) => {
                        let _ = ack.send(self.assign(assignment, link));
                    }
                    Some(WorkerCommand::Terminate) | None => break,
                },
                Some(done) = next_completion(&mut self.link) => self.deliver(done),
            }
        }
        self.shutdown();
    }

    fn assign(
        &mut self,
        assignment: CoordinatorAssignment,
        link: CoordinatorLink,
    ) -> Result<(), RenderError> {
        match &self.link {
            Some(EngineLink::Shared { assignment: current, .. }) => {
                warn!(
                    "{} already assigned to coordinator {}, rejecting reassignment",
                    self.id, current.coordinator_index
                );
                return Err(RenderError::new(
                    ErrorKind::WorkerInit,
                    format!(
                        "{} is already assigned to coordinator {}",
                        self.id, current.coordinator_index
                    ),
                ));
            }
            Some(EngineLink::Dedicated { host, .. }) => {
                return Err(RenderError::new(
                    ErrorKind::WorkerInit,
                    format!("{} owns engine '{}' and cannot be assigned", self.id, host.name()),
                ));
            }
            None => {}
        }
        debug!(
            "{} assigned to coordinator {}",
            self.id, assignment.coordinator_index
        );
        self.link = Some(EngineLink::Shared {
            assignment,
            port: link.port,
            done_rx: link.completions,
            control: link.control,
        });
        Ok(())
    }

    fn handle_request(&mut self, message: WorkerMessage, reply_to: mpsc::UnboundedSender<WorkerReply>) {
        let WorkerMessage {
            request_id,
            document_id,
            request,
        } = message;

        let (op, page_number) = match request {
            WorkerRequest::AbortProcessing => {
                self.abort.bump();
                debug!("{}: abort requested, queued jobs cancelled", self.id);
                return;
            }
            WorkerRequest::InitPdf { bytes } => (EngineOp::Open { bytes }, None),
            WorkerRequest::ProcessPage {
                page_number,
                config,
                display_info,
            } => (
                EngineOp::Render {
                    page_number,
                    params: RenderParams::for_display(config, display_info.as_ref()),
                },
                Some(page_number),
            ),
        };

        let submitted = match &self.link {
            Some(link) => link.submit(EngineJob {
                client: self.id,
                request_id,
                document_id,
                op,
                cancel: self.abort.token(),
            }),
            None => Err(RenderError::new(
                ErrorKind::WorkerInit,
                format!("{} has no engine: coordinator not assigned", self.id),
            )),
        };

        match submitted {
            Ok(()) => {
                self.pending.insert(
                    request_id,
                    PendingReply {
                        reply_to,
                        document_id,
                        page_number,
                    },
                );
            }
            Err(e) => {
                let reply = WorkerReply {
                    request_id,
                    document_id,
                    response: WorkerResponse::Error {
                        page_number,
                        kind: e.kind,
                        message: e.message,
                    },
                };
                self.reply(&reply_to, reply);
            }
        }
    }

    fn deliver(&mut self, done: EngineCompletion) {
        let request_id = done.request_id;
        let response = match done.result {
            Ok(EngineOutput::Opened { total_pages }) => WorkerResponse::PdfInitialized { total_pages },
            Ok(EngineOutput::Rendered { page_number, page }) => {
                WorkerResponse::PageProcessed { page_number, page }
            }
            Err(e) => WorkerResponse::Error {
                page_number: done.page_number,
                kind: e.kind,
                message: e.message,
            },
        };
        let reply = WorkerReply {
            request_id,
            document_id: done.document_id,
            response,
        };

        match self.pending.remove(&request_id) {
            Some(pending) => self.reply(&pending.reply_to, reply),
            None => {
                debug!("{}: completion for unknown {:?}", self.id, request_id);
                self.bus.publish(RecoveryEvent::from_reply(reply));
            }
        }
    }

    fn reply(&self, reply_to: &mpsc::UnboundedSender<WorkerReply>, reply: WorkerReply) {
        if let Err(mpsc::error::SendError(reply)) = reply_to.send(reply) {
            info!(
                "{}: requester gone, publishing {:?} for recovery",
                self.id, reply.request_id
            );
            self.bus.publish(RecoveryEvent::from_reply(reply));
        }
    }

    fn shutdown(&mut self) {
        self.abort.bump();
        let pending: Vec<(RequestId, PendingReply)> = self.pending.drain().collect();
        for (request_id, pending) in pending {
            let reply = WorkerReply {
                request_id,
                document_id: pending.document_id,
                response: WorkerResponse::Error {
                    page_number: pending.page_number,
                    kind: ErrorKind::Abort,
                    message: format!("{} terminated", self.id),
                },
            };
            self.reply(&pending.reply_to, reply);
        }

        if let Some(EngineLink::Shared { control, .. }) = &self.link {
            control.cleanup_detached(self.id);
        }
        self.link = None;
        info!("{} terminated", self.id);
    }
}
