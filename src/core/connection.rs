//! Connection endpoint state
//! One per upgraded socket, shared between its pumps and the hub

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::message::Envelope;
use crate::error::{HubError, Result};

/// Raw outbound payload as queued for the write pump
pub type Payload = Vec<u8>;

/// Represents the state of a single client connection
pub struct Connection {
    id: String,
    user_id: String,
    connected_at: Instant,
    /// Outbound queue; `None` once closed
    sender: RwLock<Option<mpsc::Sender<Payload>>>,
    /// Room names this connection belongs to, kept in step with the hub's registry
    pub(crate) rooms: RwLock<HashSet<String>>,
    metadata: RwLock<HashMap<String, Value>>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a connection with a fresh ID and its outbound queue.
    ///
    /// The returned receiver is meant for exactly one write pump. `user_id`
    /// defaults to the connection ID when absent or empty.
    pub fn new(user_id: Option<String>, send_buffer: usize) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(send_buffer.max(1));
        let id = Uuid::new_v4().to_string();
        let user_id = user_id.filter(|u| !u.is_empty()).unwrap_or_else(|| id.clone());

        let connection = Arc::new(Self {
            id,
            user_id,
            connected_at: Instant::now(),
            sender: RwLock::new(Some(tx)),
            rooms: RwLock::new(HashSet::new()),
            metadata: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        (connection, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Best-effort non-blocking enqueue.
    ///
    /// A full queue yields [`HubError::SendBufferFull`]; the caller is expected
    /// to treat the peer as too slow and disconnect it, never to retry or wait.
    pub fn send(&self, payload: Payload) -> Result<()> {
        let guard = self.sender.read()?;
        let sender = guard.as_ref().ok_or(HubError::ConnectionClosed)?;

        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Send buffer full for connection {}", self.id);
                Err(HubError::SendBufferFull)
            }
            Err(TrySendError::Closed(_)) => Err(HubError::ConnectionClosed),
        }
    }

    /// Encode an envelope and enqueue it
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(envelope.to_bytes()?)
    }

    /// Close the outbound queue and signal the read pump. Safe to call repeatedly.
    pub fn close(&self) {
        let taken = match self.sender.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if taken.is_some() {
            debug!("Closing outbound queue for connection {}", self.id);
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Snapshot of the rooms this connection is in
    pub fn rooms(&self) -> Vec<String> {
        match self.rooms.read() {
            Ok(rooms) => rooms.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.read().map(|rooms| rooms.contains(room)).unwrap_or(false)
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.metadata.write()?.insert(key.into(), value);
        Ok(())
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().ok()?.get(key).cloned()
    }

    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.write().ok()?.remove(key)
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
