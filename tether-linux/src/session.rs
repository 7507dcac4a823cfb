//! Shared session context: connection state, timers, the active job ticket and
//! the outbound handle. Every context (link task, timers, worker) transitions
//! the connection through here.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tether_core::connection::{ConnAction, ConnState, Connection};
use tether_core::storage::FileListMirror;
use tether_core::{Outbound, SessionIdentity, DEVICE_VERSION};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::heartbeat;
use crate::outbox::Outbox;
use crate::transfer::Ticket;

/// Requests from the session to the link task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    Connect,
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

pub struct Session {
    identity: SessionIdentity,
    conn: Mutex<Connection>,
    timers: Mutex<Timers>,
    ticket: Mutex<Option<Ticket>>,
    outbox: Outbox,
    mirror: FileListMirror,
    link_tx: mpsc::UnboundedSender<LinkCommand>,
    heartbeat_interval: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    pub fn new(
        identity: SessionIdentity,
        conn: Connection,
        outbox: Outbox,
        mirror: FileListMirror,
        link_tx: mpsc::UnboundedSender<LinkCommand>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            conn: Mutex::new(conn),
            timers: Mutex::new(Timers::default()),
            ticket: Mutex::new(None),
            outbox,
            mirror,
            link_tx,
            heartbeat_interval,
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn mirror(&self) -> &FileListMirror {
        &self.mirror
    }

    pub fn state(&self) -> ConnState {
        lock(&self.conn).state()
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.conn).attempts()
    }

    pub fn start(self: &Arc<Self>) {
        self.transition(|c| c.start());
    }

    pub fn on_connected(self: &Arc<Self>) {
        self.transition(|c| c.on_connected());
    }

    pub fn on_disconnected(self: &Arc<Self>) {
        self.transition(|c| c.on_disconnected());
    }

    pub fn on_reconnect_timer(self: &Arc<Self>) -> ConnState {
        let transport_connected = self.outbox.is_online();
        self.transition(|c| c.on_reconnect_timer(transport_connected))
    }

    /// Open a cancellation ticket for a new job.
    pub fn begin_job(&self) -> Ticket {
        let ticket = Ticket::default();
        *lock(&self.ticket) = Some(ticket.clone());
        ticket
    }

    pub fn end_job(&self) {
        *lock(&self.ticket) = None;
    }

    /// Stop all timers. The link and worker tasks end with the runtime.
    pub fn shutdown(&self) {
        let mut timers = lock(&self.timers);
        if let Some(h) = timers.heartbeat.take() {
            h.abort();
        }
        if let Some(h) = timers.reconnect.take() {
            h.abort();
        }
    }

    /// Apply one transition and its side effects under the connection lock, so
    /// effects from racing contexts are never interleaved.
    fn transition(self: &Arc<Self>, f: impl FnOnce(&mut Connection) -> Vec<ConnAction>) -> ConnState {
        let mut conn = lock(&self.conn);
        let actions = f(&mut *conn);
        for action in actions {
            self.apply(action, &*conn);
        }
        conn.state()
    }

    fn apply(self: &Arc<Self>, action: ConnAction, conn: &Connection) {
        debug!(?action, state = ?conn.state(), "connection action");
        match action {
            ConnAction::Connect => {
                if self.link_tx.send(LinkCommand::Connect).is_err() {
                    warn!("link task gone, connect request dropped");
                }
            }
            ConnAction::AnnounceOnline => {
                let mac = self.identity.mac().to_string();
                match self.outbox.try_send(&Outbound::online(DEVICE_VERSION, &mac)) {
                    Ok(()) => info!(node = %self.identity.node_id(), %mac, "online"),
                    Err(e) => warn!(error = %e, "online announcement dropped"),
                }
            }
            ConnAction::StartHeartbeat => {
                let task = tokio::spawn(heartbeat::run(self.outbox.clone(), self.heartbeat_interval));
                if let Some(old) = lock(&self.timers).heartbeat.replace(task) {
                    old.abort();
                }
            }
            ConnAction::StopHeartbeat => {
                if let Some(h) = lock(&self.timers).heartbeat.take() {
                    h.abort();
                }
            }
            ConnAction::ArmReconnectTimer => {
                let task = tokio::spawn(reconnect_timer(Arc::clone(self)));
                if let Some(old) = lock(&self.timers).reconnect.replace(task) {
                    old.abort();
                }
            }
            ConnAction::CancelReconnectTimer => {
                if let Some(h) = lock(&self.timers).reconnect.take() {
                    h.abort();
                }
            }
            ConnAction::FailActiveTransfer => {
                if let Some(ticket) = lock(&self.ticket).as_ref() {
                    info!("cancelling active transfer");
                    ticket.cancel();
                }
            }
        }
    }

    fn next_reconnect_delay(&self) -> Duration {
        let conn = lock(&self.conn);
        conn.policy()
            .jittered(conn.attempts(), &mut rand::thread_rng())
    }
}

/// Fires once per backoff delay; each firing is one attempt.
async fn reconnect_timer(session: Arc<Session>) {
    loop {
        let delay = session.next_reconnect_delay();
        tokio::time::sleep(delay).await;
        if session.on_reconnect_timer() == ConnState::ReconnectExhausted {
            warn!(attempts = session.attempts(), "giving up on the control link until restart");
            break;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::session;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn connect_announces_online() {
        let mut h = session(10, FileListMirror::default());
        h.session.start();
        assert_eq!(h.link.recv().await, Some(LinkCommand::Connect));
        h.session.outbox().set_online(true);
        h.session.on_connected();
        let online = h.outbound.recv().await.unwrap();
        assert_eq!(
            online,
            r#"{"type":"online","data":{"version":"1.0.0","mac":"A4:CF:12:0B:9E:7F"}}"#
        );
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.outbound.recv().await.unwrap().contains("heartbeat"));
        h.session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_then_exhausts() {
        let mut h = session(3, FileListMirror::default());
        h.session.start();
        assert_eq!(h.link.recv().await, Some(LinkCommand::Connect));
        for attempt in 1..=3 {
            h.session.on_disconnected();
            assert_eq!(h.link.recv().await, Some(LinkCommand::Connect));
            assert_eq!(h.session.attempts(), attempt);
        }
        h.session.on_disconnected();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.session.state(), ConnState::ReconnectExhausted);
        assert!(h.link.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_job_and_stops_heartbeat() {
        let mut h = session(10, FileListMirror::default());
        h.session.start();
        h.session.outbox().set_online(true);
        h.session.on_connected();
        let _ = h.outbound.recv().await;
        let ticket = h.session.begin_job();
        h.session.outbox().set_online(false);
        h.session.on_disconnected();
        assert!(ticket.is_cancelled());
        assert_eq!(h.session.state(), ConnState::ReconnectScheduled);
        h.session.end_job();

        // The transport reports up again but the connection is not yet back,
        // so a live heartbeat task would get frames through.
        h.session.outbox().set_online(true);
        tokio::time::sleep(Duration::from_secs(95)).await;
        while let Ok(frame) = h.outbound.try_recv() {
            assert!(!frame.contains("heartbeat"), "heartbeat after disconnect: {frame}");
        }
        h.session.shutdown();
    }
}
