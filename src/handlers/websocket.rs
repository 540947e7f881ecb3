//! WebSocket upgrade and per-connection pumps
//!
//! Each upgraded socket gets a read pump (decodes frames, runs control
//! messages) and a write pump (drains the outbound queue, sends keepalive
//! pings). Either pump failing unregisters the connection from the hub.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use futures_util::{Sink, Stream};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::Reply;

use crate::core::connection::{Connection, Payload};
use crate::core::hub::Hub;
use crate::core::message::{ControlKind, Envelope};
use crate::error::{HubError, Result};

/// Upgrade entrypoint. Refuses with 503 once the hub has stopped.
pub fn handle_upgrade(ws: Ws, user_id: Option<String>, hub: Hub) -> Box<dyn Reply> {
    if !hub.is_running() {
        warn!("Rejecting websocket upgrade, hub is not running");
        return Box::new(warp::reply::with_status(
            "hub is not running",
            StatusCode::SERVICE_UNAVAILABLE,
        ));
    }

    let max_message_size = hub.config().max_message_size;
    Box::new(
        ws.max_message_size(max_message_size)
            .on_upgrade(move |socket| serve_client(socket, hub, user_id)),
    )
}

/// Handle an upgraded WebSocket until either pump exits
pub async fn serve_client(socket: WebSocket, hub: Hub, user_id: Option<String>) {
    let (ws_tx, ws_rx) = socket.split();
    let (conn, outbound) = Connection::new(user_id, hub.config().send_buffer);

    if let Err(e) = hub.register(conn.clone()) {
        warn!("Failed to register connection {}: {}", conn.id(), e);
        conn.close();
        return;
    }
    info!("New websocket connection {} (user {})", conn.id(), conn.user_id());

    tokio::spawn(write_pump(hub.clone(), conn.clone(), outbound, ws_tx));
    read_pump(hub, conn, ws_rx).await;
}

/// Read frames until the peer goes away, a frame is too large, the read
/// deadline passes, or the connection is closed by the hub.
pub async fn read_pump<S, E>(hub: Hub, conn: Arc<Connection>, mut stream: S)
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let pong_wait = hub.config().read_timeout();
    let max_message_size = hub.config().max_message_size;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            frame = timeout_at(deadline, stream.next()) => frame,
        };

        let msg = match frame {
            Err(_) => {
                warn!("Read deadline exceeded for connection {}", conn.id());
                break;
            }
            Ok(None) => {
                debug!("Connection {} stream ended", conn.id());
                break;
            }
            Ok(Some(Err(e))) => {
                debug!("WebSocket read error on connection {}: {}", conn.id(), e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        deadline = Instant::now() + pong_wait;

        if msg.is_close() {
            debug!("Connection {} sent close frame", conn.id());
            break;
        }
        // Pings and pongs only renew the deadline
        if !msg.is_text() && !msg.is_binary() {
            continue;
        }

        let bytes = msg.as_bytes();
        if bytes.len() > max_message_size {
            warn!(
                "Connection {} sent oversized frame: {}",
                conn.id(),
                HubError::MessageTooLarge(bytes.len())
            );
            break;
        }

        if let Err(e) = process_frame(&hub, &conn, bytes) {
            warn!("Skipping frame from connection {}: {}", conn.id(), e);
        }
    }

    hub.unregister(&conn);
}

/// Decode, stamp, notify the message hook, then interpret control types.
///
/// Every error here is non-fatal to the connection.
pub fn process_frame(hub: &Hub, conn: &Arc<Connection>, bytes: &[u8]) -> Result<()> {
    let mut envelope = Envelope::from_slice(bytes)?;
    envelope.stamp(conn.user_id());

    hub.config().hooks.message(conn, &envelope);

    match envelope.control() {
        Some(ControlKind::JoinRoom) => {
            let room = envelope.room_name().ok_or(HubError::InvalidRoomName)?;
            hub.join_room(conn, room)
        }
        Some(ControlKind::LeaveRoom) => {
            let room = envelope.room_name().ok_or(HubError::InvalidRoomName)?;
            hub.leave_room(conn, room)
        }
        Some(ControlKind::RoomBroadcast) => {
            let room = envelope.room_name().ok_or(HubError::InvalidRoomName)?;
            hub.broadcast_envelope_to_room(room, &envelope, Some(conn.as_ref()))
        }
        Some(ControlKind::Broadcast) => hub.broadcast_envelope(&envelope),
        None => Ok(()),
    }
}

/// Drain the outbound queue onto the socket and keep the peer alive with pings.
///
/// Pings go out every `ping_period` whether or not payloads were written in
/// between. The read deadline is renewed only by inbound frames, so a client
/// that only listens relies on answering these pings while it is being sent
/// a steady stream of messages.
///
/// Ends when the hub closes the queue (a close frame is sent) or a write fails
/// or misses its deadline.
pub async fn write_pump<K>(
    hub: Hub,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Payload>,
    mut sink: K,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let write_wait = hub.config().write_wait;
    let ping_period = hub.config().ping_period();
    let coalesce = hub.config().coalesce_writes;
    let max_batch = hub.config().send_buffer;

    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(mut payload) = next else {
                    debug!("Outbound queue closed for connection {}", conn.id());
                    let _ = write_frame(&mut sink, Message::close(), write_wait).await;
                    break;
                };

                if coalesce {
                    for _ in 0..max_batch {
                        match outbound.try_recv() {
                            Ok(more) => {
                                payload.push(b'\n');
                                payload.extend_from_slice(&more);
                            }
                            Err(_) => break,
                        }
                    }
                }

                if let Err(e) = write_frame(&mut sink, to_ws_message(payload), write_wait).await {
                    warn!("Write failed for connection {}: {}", conn.id(), e);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut sink, Message::ping(Vec::new()), write_wait).await {
                    warn!("Keepalive failed for connection {}: {}", conn.id(), e);
                    break;
                }
            }
        }
    }

    hub.unregister(&conn);
    let _ = timeout(write_wait, sink.close()).await;
}

async fn write_frame<K>(sink: &mut K, msg: Message, write_wait: Duration) -> Result<()>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match timeout(write_wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HubError::TransportError(e.to_string())),
        Err(_) => Err(HubError::TransportError("write deadline exceeded".to_string())),
    }
}

/// UTF-8 payloads go out as text frames, anything else as binary
fn to_ws_message(payload: Payload) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}
