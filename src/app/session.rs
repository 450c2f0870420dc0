use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::audio::{SourceStream, StreamId};

/// Unique identifier for a connected participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form keeps log lines readable
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A connected participant: their own microphone, any sounds they inject, and the
/// state of the mix stream going back to them.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    microphone: SourceStream,
    injectors: BTreeMap<StreamId, SourceStream>,
    sequence: u16,
    active: bool,
    address: Option<SocketAddr>,
}

impl Session {
    pub fn new(id: SessionId, microphone: SourceStream) -> Self {
        Self {
            id,
            microphone,
            injectors: BTreeMap::new(),
            sequence: 0,
            active: true,
            address: None,
        }
    }

    /// Where this session's mixes are sent
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The stream whose pose is this session's listening position
    pub fn microphone(&self) -> &SourceStream {
        &self.microphone
    }

    pub fn add_injector(&mut self, stream: SourceStream) -> StreamId {
        let id = stream.id();
        self.injectors.insert(id, stream);
        id
    }

    pub fn remove_injector(&mut self, id: &StreamId) -> Option<SourceStream> {
        self.injectors.remove(id)
    }

    pub fn injector_count(&self) -> usize {
        self.injectors.len()
    }

    /// Microphone first, then injectors in id order
    pub fn streams(&self) -> impl Iterator<Item = &SourceStream> {
        std::iter::once(&self.microphone).chain(self.injectors.values())
    }

    pub fn streams_mut(&mut self) -> impl Iterator<Item = &mut SourceStream> {
        std::iter::once(&mut self.microphone).chain(self.injectors.values_mut())
    }

    /// Whether this session currently wants a mix sent to it
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Returns the sequence number for the next outbound frame and advances it
    pub fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }
}
