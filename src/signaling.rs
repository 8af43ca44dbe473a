//! Room-keyed relay of opaque call-setup messages.
//!
//! Offers, answers and ICE candidates pass through untouched; the relay only
//! knows who is in which room.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Rooms hold one call: the creator and one guest.
pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueMessage(pub Vec<u8>);

impl From<&str> for OpaqueMessage {
    fn from(text: &str) -> Self {
        OpaqueMessage(text.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    PeerJoined { room: String },
    Message { room: String, message: OpaqueMessage },
    PeerLeft { room: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("room {0} already exists")]
    RoomExists(String),

    #[error("room {0} does not exist")]
    RoomNotFound(String),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("not a member of room {0}")]
    NotInRoom(String),
}

/// One participant's connection to a relay.
#[async_trait]
pub trait SignalingRelay: Send {
    async fn create_room(&mut self, code: &str) -> Result<(), SignalingError>;

    async fn join_room(&mut self, code: &str) -> Result<(), SignalingError>;

    /// Deliver `message` to everyone else in the room.
    async fn send_to_room(&mut self, code: &str, message: OpaqueMessage) -> Result<(), SignalingError>;

    async fn leave_room(&mut self, code: &str) -> Result<(), SignalingError>;

    /// Next event for this participant; `None` once the relay is gone.
    async fn next_event(&mut self) -> Option<RelayEvent>;
}

type PeerId = u64;

#[derive(Default)]
struct Hub {
    rooms: Mutex<HashMap<String, Vec<(PeerId, mpsc::UnboundedSender<RelayEvent>)>>>,
    next_peer: AtomicU64,
}

impl Hub {
    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Vec<(PeerId, mpsc::UnboundedSender<RelayEvent>)>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leave(&self, code: &str, peer: PeerId) -> Result<(), SignalingError> {
        let mut rooms = self.rooms();
        let members = rooms
            .get_mut(code)
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;
        let before = members.len();
        members.retain(|(id, _)| *id != peer);
        if members.len() == before {
            return Err(SignalingError::NotInRoom(code.to_string()));
        }

        for (_, tx) in members.iter() {
            let _ = tx.send(RelayEvent::PeerLeft {
                room: code.to_string(),
            });
        }
        if members.is_empty() {
            rooms.remove(code);
            tracing::debug!("Room {} closed", code);
        }
        Ok(())
    }
}

/// In-process relay, for demos and tests.
#[derive(Clone, Default)]
pub struct LocalRelay {
    hub: Arc<Hub>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> LocalPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        LocalPeer {
            id: self.hub.next_peer.fetch_add(1, Ordering::Relaxed),
            hub: Arc::clone(&self.hub),
            tx,
            rx,
            rooms: Vec::new(),
        }
    }

    pub fn room_count(&self) -> usize {
        self.hub.rooms().len()
    }
}

pub struct LocalPeer {
    id: PeerId,
    hub: Arc<Hub>,
    tx: mpsc::UnboundedSender<RelayEvent>,
    rx: mpsc::UnboundedReceiver<RelayEvent>,
    rooms: Vec<String>,
}

#[async_trait]
impl SignalingRelay for LocalPeer {
    async fn create_room(&mut self, code: &str) -> Result<(), SignalingError> {
        let mut rooms = self.hub.rooms();
        if rooms.contains_key(code) {
            return Err(SignalingError::RoomExists(code.to_string()));
        }
        rooms.insert(code.to_string(), vec![(self.id, self.tx.clone())]);
        drop(rooms);
        self.rooms.push(code.to_string());
        tracing::debug!("Peer {} created room {}", self.id, code);
        Ok(())
    }

    async fn join_room(&mut self, code: &str) -> Result<(), SignalingError> {
        let mut rooms = self.hub.rooms();
        let members = rooms
            .get_mut(code)
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;
        if members.len() >= ROOM_CAPACITY {
            return Err(SignalingError::RoomFull(code.to_string()));
        }
        for (_, tx) in members.iter() {
            let _ = tx.send(RelayEvent::PeerJoined {
                room: code.to_string(),
            });
        }
        members.push((self.id, self.tx.clone()));
        drop(rooms);
        self.rooms.push(code.to_string());
        tracing::debug!("Peer {} joined room {}", self.id, code);
        Ok(())
    }

    async fn send_to_room(&mut self, code: &str, message: OpaqueMessage) -> Result<(), SignalingError> {
        let rooms = self.hub.rooms();
        let members = rooms
            .get(code)
            .ok_or_else(|| SignalingError::RoomNotFound(code.to_string()))?;
        if !members.iter().any(|(id, _)| *id == self.id) {
            return Err(SignalingError::NotInRoom(code.to_string()));
        }
        for (_, tx) in members.iter().filter(|(id, _)| *id != self.id) {
            let _ = tx.send(RelayEvent::Message {
                room: code.to_string(),
                message: message.clone(),
            });
        }
        Ok(())
    }

    async fn leave_room(&mut self, code: &str) -> Result<(), SignalingError> {
        self.hub.leave(code, self.id)?;
        self.rooms.retain(|room| room != code);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        for room in self.rooms.drain(..) {
            let _ = self.hub.leave(&room, self.id);
        }
    }
}
