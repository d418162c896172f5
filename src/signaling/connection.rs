#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients.
//
// No business logic runs here: inbound frames are enqueued onto the
// signaling loop, outbound frames arrive through a bounded channel and
// are written by a dedicated send task. The loop closes a socket by
// pushing a Close frame through the same channel.

use crate::metrics::ServerMetrics;
use crate::router::{RouterEvent, RouterHandle};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

/// Bounded channel capacity per client. Signaling traffic is light;
/// anything queued beyond this is stale and dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close the connection if no frame arrives within this
/// duration. Prevents dead sockets from holding semaphore permits.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One frame headed for a client's WebSocket.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A text frame: a signaling message, or a plain-text error string
    Text(Arc<String>),
    /// Close the socket after flushing what came before
    Close,
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    router: RouterHandle,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let conn = router.next_conn_id();

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);

    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Text(json) => {
                    send_metrics.inc_messages_sent();
                    if ws_sender
                        .send(Message::Text((*json).clone().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!("send task finished for connection {conn}");
    });

    router.enqueue(RouterEvent::SocketOpened { conn, sender: tx });

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("idle timeout for connection {conn}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();
                router.enqueue(RouterEvent::SocketMessage {
                    conn,
                    text: text.to_string(),
                });
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket-level keepalive is handled by axum.
            }
            _ => {
                warn!("unexpected binary frame from connection {conn}");
            }
        }
    }

    router.enqueue(RouterEvent::SocketClosed { conn });

    let _ = send_task.await;
    debug!("connection handler finished for connection {conn}");
}
