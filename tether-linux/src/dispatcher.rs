//! Inbound dispatcher. The network side classifies frames and either handles
//! them inline or hands an owned copy to the worker through a bounded queue;
//! the worker owns the protocol controller and runs one message at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tether_core::dispatch::{self, FrameKind, InboundEvent, Route};
use tether_core::progress::ProgressSample;
use tether_core::protocol::AckKind;
use tether_core::storage::Filesystem;
use tether_core::{Action, Outbound, SessionCore};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::transfer::{self, ByteTransport};

/// Network-context half: must return quickly and never parse or touch storage.
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    queue: mpsc::Sender<Vec<u8>>,
    enqueue_timeout: Duration,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, queue: mpsc::Sender<Vec<u8>>, enqueue_timeout: Duration) -> Self {
        Self {
            session,
            queue,
            enqueue_timeout,
        }
    }

    pub async fn on_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Connected => {
                info!(endpoint = %self.session.identity().endpoint(), "connected");
                self.session.on_connected();
            }
            InboundEvent::Disconnected(code) => {
                info!(?code, "disconnected");
                self.session.on_disconnected();
            }
            InboundEvent::Error(code) => {
                warn!(?code, "link error");
                self.session.on_disconnected();
            }
            InboundEvent::Data(payload, kind) => self.on_data(payload, kind).await,
        }
    }

    async fn on_data(&self, payload: Vec<u8>, kind: FrameKind) {
        match dispatch::route(kind, &payload) {
            Route::Control | Route::Empty => {}
            Route::Trivial(AckKind::Online) => {
                let files = self.session.mirror().snapshot();
                if let Err(e) = self.session.outbox().try_send(&Outbound::file_list(&files)) {
                    warn!(error = %e, "file list dropped");
                }
            }
            Route::Trivial(ack) => debug!(?ack, "ack"),
            Route::Enqueue => {
                let len = payload.len();
                match self.queue.send_timeout(payload, self.enqueue_timeout).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(len, "dispatcher queue full, frame dropped")
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        warn!(len, "dispatcher worker gone, frame dropped")
                    }
                }
            }
        }
    }
}

/// Worker half: drains the queue until every sender is gone. Transfers run
/// inline, so nothing else is processed while a job is active; a job that
/// makes no progress for `idle` is failed.
pub async fn run_worker<F, T>(
    mut core: SessionCore<F>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    session: Arc<Session>,
    transport: T,
    idle: Duration,
) where
    F: Filesystem + Send + Sync,
    T: ByteTransport,
{
    while let Some(frame) = queue.recv().await {
        let actions = core.on_frame(&frame);
        drop(frame);
        execute(&mut core, &session, &transport, idle, actions).await;
    }
    debug!("dispatcher worker stopped");
}

async fn execute<F, T>(
    core: &mut SessionCore<F>,
    session: &Session,
    transport: &T,
    idle: Duration,
    actions: Vec<Action>,
)
where
    F: Filesystem + Send + Sync,
    T: ByteTransport,
{
    let mut pending: VecDeque<Action> = actions.into();
    while let Some(action) = pending.pop_front() {
        match action {
            Action::Send(msg, delivery) => {
                if let Err(e) = session.outbox().deliver(&msg, delivery).await {
                    warn!(kind = msg.kind(), error = %e, "send failed");
                }
            }
            Action::Transfer(job) => {
                let ticket = session.begin_job();
                let limits = core.limits();
                let outbox = session.outbox().clone();
                let progress = |sample: &ProgressSample| {
                    if let Err(e) = outbox.try_send(&job.progress_message(sample)) {
                        debug!(job = %sample.job, error = %e, "progress dropped");
                    }
                };
                let result = transfer::run(
                    core.storage_mut(),
                    transport,
                    &job,
                    limits,
                    &ticket,
                    idle,
                    progress,
                )
                .await;
                session.end_job();
                pending.extend(core.on_transfer_finished(&job, result));
            }
        }
    }
}
