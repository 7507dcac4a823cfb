//! Control link: owns the WebSocket. Reads frames into the dispatcher and
//! writes whatever the outbox queued, one connection at a time.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_core::dispatch::{FrameKind, InboundEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::session::{LinkCommand, Session};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How a served connection ended.
enum Ended {
    Closed(Option<u16>),
    Failed,
}

/// Serve connect requests until the session drops its command sender.
pub async fn run(
    session: Arc<Session>,
    dispatcher: Dispatcher,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    mut outbound: mpsc::Receiver<String>,
    connect_timeout: Duration,
) {
    while let Some(LinkCommand::Connect) = commands.recv().await {
        let endpoint = session.identity().endpoint().to_string();
        debug!(%endpoint, "connecting");
        let ws = match tokio::time::timeout(connect_timeout, connect_async(endpoint.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                warn!(%endpoint, error = %e, "connect failed");
                dispatcher.on_event(InboundEvent::Error(None)).await;
                continue;
            }
            Err(_) => {
                warn!(%endpoint, timeout = ?connect_timeout, "connect timed out");
                dispatcher.on_event(InboundEvent::Error(None)).await;
                continue;
            }
        };
        let stale = drain(&mut outbound);
        if stale > 0 {
            debug!(stale, "discarded frames queued while offline");
        }
        session.outbox().set_online(true);
        dispatcher.on_event(InboundEvent::Connected).await;
        let ended = serve(ws, &dispatcher, &mut outbound).await;
        session.outbox().set_online(false);
        debug!(state = ?session.state(), "link down");
        match ended {
            Ended::Closed(code) => dispatcher.on_event(InboundEvent::Disconnected(code)).await,
            Ended::Failed => dispatcher.on_event(InboundEvent::Error(None)).await,
        }
    }
    debug!("link task stopped");
}

fn drain(outbound: &mut mpsc::Receiver<String>) -> usize {
    let mut n = 0;
    while outbound.try_recv().is_ok() {
        n += 1;
    }
    n
}

async fn serve(
    ws: WsStream,
    dispatcher: &Dispatcher,
    outbound: &mut mpsc::Receiver<String>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(error = %e, "link read failed");
                        return Ended::Failed;
                    }
                    None => return Ended::Closed(None),
                };
                match msg {
                    Message::Text(text) => {
                        dispatcher
                            .on_event(InboundEvent::Data(text.into_bytes(), FrameKind::Text))
                            .await;
                    }
                    Message::Binary(data) => {
                        dispatcher
                            .on_event(InboundEvent::Data(data, FrameKind::Binary))
                            .await;
                    }
                    // tungstenite queues the pong itself; flushing sends it.
                    Message::Ping(_) => {
                        if let Err(e) = sink.flush().await {
                            warn!(error = %e, "pong failed");
                            return Ended::Failed;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(frame) => {
                        let code = close_code(frame.as_ref());
                        info!(?code, "server closed link");
                        let _ = sink.close().await;
                        return Ended::Closed(code);
                    }
                    Message::Frame(_) => {}
                }
            }
            queued = outbound.recv() => {
                let Some(text) = queued else {
                    return Ended::Closed(None);
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "link write failed");
                    return Ended::Failed;
                }
            }
        }
    }
}

fn close_code(frame: Option<&CloseFrame<'_>>) -> Option<u16> {
    frame.map(|f| u16::from(f.code))
}
