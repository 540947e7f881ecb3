//! Hub dispatcher
//!
//! The hub owns the connection set and the room registry. Registration,
//! unregistration and broadcast fan-out are funneled through a single
//! dispatcher task; producers only ever do non-blocking sends onto the
//! dispatcher's queues. Room joins and leaves go straight to the registry
//! so the caller sees its own membership change before the call returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::core::connection::{Connection, Payload};
use crate::core::message::Envelope;
use crate::core::room::{Membership, RoomRegistry};
use crate::error::{HubError, Result};

/// Lifecycle of a hub. There is no way back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Running,
    ShuttingDown,
    Stopped,
}

impl HubState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Point-in-time hub counters
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub state: HubState,
    pub connections: usize,
    pub rooms: usize,
    pub dropped_broadcasts: u64,
    pub dropped_room_broadcasts: u64,
    pub slow_consumers_disconnected: u64,
}

struct RoomBroadcast {
    room: String,
    payload: Payload,
    exclude: Option<String>,
}

/// State shared by every hub handle and the dispatcher
struct Shared {
    config: HubConfig,
    state: AtomicU8,
    /// Written only by the dispatcher; read by the query methods
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    rooms: RoomRegistry,
    dropped_broadcasts: AtomicU64,
    dropped_room_broadcasts: AtomicU64,
    slow_consumers: AtomicU64,
}

/// Cloneable handle to a hub
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    register_tx: mpsc::UnboundedSender<Arc<Connection>>,
    unregister_tx: mpsc::UnboundedSender<Arc<Connection>>,
    broadcast_tx: mpsc::Sender<Payload>,
    room_broadcast_tx: mpsc::Sender<RoomBroadcast>,
}

/// The hub's event loop. Consumed by [`Dispatcher::run`].
pub struct Dispatcher {
    shared: Arc<Shared>,
    register_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    unregister_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    broadcast_rx: mpsc::Receiver<Payload>,
    room_broadcast_rx: mpsc::Receiver<RoomBroadcast>,
}

impl Hub {
    /// Create a hub and the dispatcher that must be run for it to make progress
    pub fn new(config: HubConfig) -> (Self, Dispatcher) {
        if let Err(e) = config.validate() {
            warn!("Hub config out of range, clamping: {}", e);
        }
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_buffer.max(1));
        let (room_broadcast_tx, room_broadcast_rx) =
            mpsc::channel(config.room_broadcast_buffer.max(1));

        let shared = Arc::new(Shared {
            config,
            state: AtomicU8::new(HubState::Running as u8),
            connections: RwLock::new(HashMap::new()),
            rooms: RoomRegistry::new(),
            dropped_broadcasts: AtomicU64::new(0),
            dropped_room_broadcasts: AtomicU64::new(0),
            slow_consumers: AtomicU64::new(0),
        });

        let hub = Self {
            shared: shared.clone(),
            register_tx,
            unregister_tx,
            broadcast_tx,
            room_broadcast_tx,
        };
        let dispatcher = Dispatcher {
            shared,
            register_rx,
            unregister_rx,
            broadcast_rx,
            room_broadcast_rx,
        };
        (hub, dispatcher)
    }

    /// Create a hub and spawn its dispatcher on the current runtime
    pub fn spawn(config: HubConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (hub, dispatcher) = Self::new(config);
        let handle = tokio::spawn(dispatcher.run(cancel));
        (hub, handle)
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn state(&self) -> HubState {
        HubState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == HubState::Running
    }

    /// Hand a new connection to the dispatcher
    pub fn register(&self, conn: Arc<Connection>) -> Result<()> {
        if !self.is_running() {
            return Err(HubError::HubStopped);
        }
        self.register_tx.send(conn).map_err(|_| HubError::HubStopped)
    }

    /// Ask the dispatcher to drop a connection. Duplicate requests are harmless.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        if self.unregister_tx.send(conn.clone()).is_err() {
            // Dispatcher is gone; shutdown already cleared the hub state
            conn.close();
        }
    }

    /// Queue a payload for every registered connection.
    ///
    /// Never blocks: a full request queue drops the payload and bumps
    /// [`HubStats::dropped_broadcasts`].
    pub fn broadcast(&self, payload: Payload) {
        match self.broadcast_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.dropped_broadcasts.fetch_add(1, Ordering::Relaxed);
                warn!("Broadcast queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.dropped_broadcasts.fetch_add(1, Ordering::Relaxed);
                debug!("Broadcast after hub shutdown, dropping message");
            }
        }
    }

    /// Queue a payload for every member of `room` except `exclude`. Same drop policy as [`Hub::broadcast`].
    pub fn broadcast_to_room(&self, room: &str, payload: Payload, exclude: Option<&Connection>) {
        let request = RoomBroadcast {
            room: room.to_string(),
            payload,
            exclude: exclude.map(|conn| conn.id().to_string()),
        };
        match self.room_broadcast_tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                self.shared.dropped_room_broadcasts.fetch_add(1, Ordering::Relaxed);
                warn!("Room broadcast queue full, dropping message for room {}", request.room);
            }
            Err(TrySendError::Closed(request)) => {
                self.shared.dropped_room_broadcasts.fetch_add(1, Ordering::Relaxed);
                debug!("Room broadcast after hub shutdown, dropping message for room {}", request.room);
            }
        }
    }

    /// Encode then [`Hub::broadcast`]; only encoding can fail
    pub fn broadcast_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.broadcast(envelope.to_bytes()?);
        Ok(())
    }

    /// Encode then [`Hub::broadcast_to_room`]; only encoding can fail
    pub fn broadcast_envelope_to_room(
        &self,
        room: &str,
        envelope: &Envelope,
        exclude: Option<&Connection>,
    ) -> Result<()> {
        self.broadcast_to_room(room, envelope.to_bytes()?, exclude);
        Ok(())
    }

    /// Add a connection to a room.
    ///
    /// The join hook fires on every call, including repeated joins of a room
    /// the connection is already in.
    pub fn join_room(&self, conn: &Arc<Connection>, room: &str) -> Result<()> {
        if self.shared.rooms.join(conn, room)? == Membership::Changed {
            info!("Connection {} joined room {}", conn.id(), room);
        }
        self.shared.config.hooks.joined(conn, room);
        Ok(())
    }

    /// Remove a connection from a room. Leaving a room you are not in is a no-op.
    pub fn leave_room(&self, conn: &Arc<Connection>, room: &str) -> Result<()> {
        match self.shared.rooms.leave(conn, room)? {
            Membership::Unchanged => {}
            membership => {
                info!("Connection {} left room {}", conn.id(), room);
                if membership == Membership::RoomRemoved {
                    debug!("Room {} removed", room);
                }
                self.shared.config.hooks.left(conn, room);
            }
        }
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.shared.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Snapshot of the registered connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .connections
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.shared.connections.read().ok()?.get(id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.shared.rooms.room_count()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.shared.rooms.room_names()
    }

    pub fn room_exists(&self, room: &str) -> bool {
        self.shared.rooms.contains(room)
    }

    pub fn room_client_count(&self, room: &str) -> usize {
        self.shared.rooms.client_count(room)
    }

    /// Connection IDs currently in `room`
    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.shared.rooms.member_ids(room)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            state: self.state(),
            connections: self.client_count(),
            rooms: self.room_count(),
            dropped_broadcasts: self.shared.dropped_broadcasts.load(Ordering::Relaxed),
            dropped_room_broadcasts: self.shared.dropped_room_broadcasts.load(Ordering::Relaxed),
            slow_consumers_disconnected: self.shared.slow_consumers.load(Ordering::Relaxed),
        }
    }
}

impl Dispatcher {
    /// Process hub requests until `cancel` fires, then close every connection.
    ///
    /// Returns without waiting for connection pumps to finish.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Hub dispatcher started");

        loop {
            // Registrations are polled before unregistrations so a connection's
            // register request is always seen before its own unregister request
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                Some(conn) = self.register_rx.recv() => self.add_connection(conn),
                Some(conn) = self.unregister_rx.recv() => self.remove_connection(&conn),
                Some(payload) = self.broadcast_rx.recv() => self.fan_out_all(payload),
                Some(request) = self.room_broadcast_rx.recv() => self.fan_out_room(request),
                else => break,
            }
        }

        self.shutdown();
    }

    fn add_connection(&self, conn: Arc<Connection>) {
        if conn.is_closed() {
            debug!("Ignoring registration of already closed connection {}", conn.id());
            return;
        }

        let total = match self.shared.connections.write() {
            Ok(mut connections) => {
                connections.insert(conn.id().to_string(), conn.clone());
                connections.len()
            }
            Err(e) => {
                error!("Failed to register connection {}: {}", conn.id(), e);
                conn.close();
                return;
            }
        };

        info!("Connection registered: {} (user {})", conn.id(), conn.user_id());
        debug!("Current connections: {}", total);
        self.shared.config.hooks.connected(&conn);
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        let removed = match self.shared.connections.write() {
            Ok(mut connections) => connections.remove(conn.id()),
            Err(e) => {
                error!("Failed to unregister connection {}: {}", conn.id(), e);
                None
            }
        };

        // Closing is idempotent, so also close strays that never made it into the set
        conn.close();

        // Strays may still hold room memberships taken before registration
        match self.shared.rooms.leave_all(conn) {
            Ok(rooms) => {
                for room in rooms {
                    self.shared.config.hooks.left(conn, &room);
                }
            }
            Err(e) => error!("Failed to remove connection {} from rooms: {}", conn.id(), e),
        }

        let Some(conn) = removed else {
            return;
        };

        info!(
            "Connection unregistered: {} after {:?}",
            conn.id(),
            conn.connection_duration()
        );
        self.shared.config.hooks.disconnected(&conn);
    }

    fn fan_out_all(&self, payload: Payload) {
        let recipients = match self.shared.connections.read() {
            Ok(connections) => connections.values().cloned().collect::<Vec<_>>(),
            Err(e) => {
                error!("Failed to read connections for broadcast: {}", e);
                return;
            }
        };
        self.deliver(recipients, payload);
    }

    fn fan_out_room(&self, request: RoomBroadcast) {
        let recipients = match self
            .shared
            .rooms
            .members_except(&request.room, request.exclude.as_deref())
        {
            Ok(members) => members,
            Err(e) => {
                error!("Failed to read members of room {}: {}", request.room, e);
                return;
            }
        };
        if recipients.is_empty() {
            debug!("Room {} has no recipients, skipping broadcast", request.room);
            return;
        }
        self.deliver(recipients, request.payload);
    }

    /// Enqueue on each recipient; anyone who cannot take it is dropped from the hub
    fn deliver(&self, recipients: Vec<Arc<Connection>>, payload: Payload) {
        let mut failed = Vec::new();

        for conn in recipients {
            match conn.send(payload.clone()) {
                Ok(()) => {}
                Err(HubError::SendBufferFull) => {
                    warn!("Disconnecting slow consumer {}", conn.id());
                    self.shared.slow_consumers.fetch_add(1, Ordering::Relaxed);
                    failed.push(conn);
                }
                Err(e) => {
                    debug!("Dropping connection {} during fan-out: {}", conn.id(), e);
                    failed.push(conn);
                }
            }
        }

        for conn in failed {
            self.remove_connection(&conn);
        }
    }

    fn shutdown(mut self) {
        self.shared
            .state
            .store(HubState::ShuttingDown as u8, Ordering::Release);
        info!("Hub shutting down");

        self.register_rx.close();
        self.unregister_rx.close();
        self.broadcast_rx.close();
        self.room_broadcast_rx.close();

        let connections: Vec<Arc<Connection>> = match self.shared.connections.write() {
            Ok(mut connections) => connections.drain().map(|(_, conn)| conn).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, conn)| conn).collect(),
        };
        // Registrations that raced with cancellation never get a pump-side unregister
        let mut pending = Vec::new();
        while let Ok(conn) = self.register_rx.try_recv() {
            pending.push(conn);
        }

        for conn in &connections {
            conn.close();
        }
        for conn in &pending {
            conn.close();
        }
        if let Err(e) = self.shared.rooms.clear() {
            error!("Failed to clear rooms during shutdown: {}", e);
        }
        for conn in &connections {
            self.shared.config.hooks.disconnected(conn);
        }

        self.shared
            .state
            .store(HubState::Stopped as u8, Ordering::Release);
        info!("Hub stopped, closed {} connections", connections.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let cancel = CancellationToken::new();
        let (hub, _handle) = Hub::spawn(HubConfig::default(), cancel.clone());
        let (conn, _rx) = Connection::new(Some("alice".to_string()), 4);

        hub.register(conn.clone()).unwrap();
        eventually(|| hub.client_count() == 1).await;
        assert!(hub.connection(conn.id()).is_some());

        hub.unregister(&conn);
        hub.unregister(&conn);
        eventually(|| hub.client_count() == 0).await;
        assert!(conn.is_closed());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_request_queue_drops_and_counts() {
        let config = HubConfig::default().with_broadcast_buffer(1).with_room_broadcast_buffer(1);
        // dispatcher intentionally not running so the queues fill up
        let (hub, _dispatcher) = Hub::new(config);

        hub.broadcast(b"a".to_vec());
        hub.broadcast(b"b".to_vec());
        hub.broadcast(b"c".to_vec());
        hub.broadcast_to_room("general", b"x".to_vec(), None);
        hub.broadcast_to_room("general", b"y".to_vec(), None);

        let stats = hub.stats();
        assert_eq!(stats.dropped_broadcasts, 2);
        assert_eq!(stats.dropped_room_broadcasts, 1);
    }

    #[tokio::test]
    async fn test_register_after_stop_fails() {
        let cancel = CancellationToken::new();
        let (hub, handle) = Hub::spawn(HubConfig::default(), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(hub.state(), HubState::Stopped);
        let (conn, _rx) = Connection::new(None, 1);
        assert!(matches!(hub.register(conn.clone()), Err(HubError::HubStopped)));

        // unregister against a stopped hub still closes the connection
        hub.unregister(&conn);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_evicted_stray_leaves_its_rooms() {
        let disconnects = Arc::new(AtomicU64::new(0));
        let counter = disconnects.clone();
        let config = HubConfig::default().on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let cancel = CancellationToken::new();
        let (hub, _handle) = Hub::spawn(config, cancel.clone());

        // joined a room but never registered
        let (stray, _rx) = Connection::new(None, 1);
        hub.join_room(&stray, "general").unwrap();
        stray.send(b"backlog".to_vec()).unwrap();

        hub.broadcast_to_room("general", b"hello".to_vec(), None);
        eventually(|| stray.is_closed() && !hub.room_exists("general")).await;

        assert_eq!(hub.room_count(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }
}
