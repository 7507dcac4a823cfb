//! Outbound send handle: encodes messages and queues them for the link writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::wire::{self, EncodeError};
use tether_core::{Delivery, Outbound};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("not connected")]
    Offline,
    #[error("outbound buffer full")]
    Full,
    #[error("send timed out")]
    Timeout,
    #[error("link closed")]
    Closed,
}

/// Cloneable sender side. Frames only go out while the link is up; the link
/// flips `online` as it connects and disconnects.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<String>,
    online: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl Outbox {
    pub fn channel(depth: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            Self {
                tx,
                online: Arc::new(AtomicBool::new(false)),
                send_timeout,
            },
            rx,
        )
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Never waits. Used for heartbeats, progress and sends from the network context.
    pub fn try_send(&self, msg: &Outbound) -> Result<(), SendError> {
        if !self.is_online() {
            return Err(SendError::Offline);
        }
        let text = wire::encode(msg)?;
        self.tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Waits up to the bounded send timeout for buffer space.
    pub async fn send(&self, msg: &Outbound) -> Result<(), SendError> {
        if !self.is_online() {
            return Err(SendError::Offline);
        }
        let text = wire::encode(msg)?;
        self.tx
            .send_timeout(text, self.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::Timeout,
                SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }

    pub async fn deliver(&self, msg: &Outbound, delivery: Delivery) -> Result<(), SendError> {
        match delivery {
            Delivery::BestEffort => self.try_send(msg),
            Delivery::Bounded => self.send(msg).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_refuses_everything() {
        let (outbox, mut rx) = Outbox::channel(4, Duration::from_millis(10));
        assert!(matches!(
            outbox.try_send(&Outbound::heartbeat(1)),
            Err(SendError::Offline)
        ));
        assert!(matches!(
            outbox.send(&Outbound::heartbeat(1)).await,
            Err(SendError::Offline)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn best_effort_drops_when_full_bounded_times_out() {
        let (outbox, mut rx) = Outbox::channel(1, Duration::from_millis(20));
        outbox.set_online(true);
        outbox.try_send(&Outbound::heartbeat(1)).unwrap();
        assert!(matches!(
            outbox.try_send(&Outbound::heartbeat(2)),
            Err(SendError::Full)
        ));
        assert!(matches!(
            outbox
                .deliver(&Outbound::heartbeat(3), Delivery::Bounded)
                .await,
            Err(SendError::Timeout)
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"{"type":"heartbeat","timestamp":1}"#
        );
    }
}
