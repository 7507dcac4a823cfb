//! Inbound frame classification for the network callback context.

use crate::protocol::AckKind;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl FrameKind {
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Ping | FrameKind::Pong | FrameKind::Close)
    }
}

/// Event produced by the network context. The payload is owned and moves with the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Connected,
    Disconnected(Option<u16>),
    Data(Vec<u8>, FrameKind),
    Error(Option<u16>),
}

/// Where a frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Ping/pong/close: handled by the link, never queued.
    Control,
    /// Nothing to do.
    Empty,
    /// Hot-path acknowledgement handled inline.
    Trivial(AckKind),
    /// Everything else goes to the worker.
    Enqueue,
}

/// Classify one frame without parsing it.
pub fn route(kind: FrameKind, payload: &[u8]) -> Route {
    if kind.is_control() {
        return Route::Control;
    }
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Route::Empty;
    }
    match wire::probe_type(payload).and_then(AckKind::from_type) {
        Some(ack) if ack.is_trivial() => Route::Trivial(ack),
        _ => Route::Enqueue,
    }
}
