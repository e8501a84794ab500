//! Stream id allocation and the table of live streams.

use crate::error::ProtocolError;
use crate::protocol::{MAX_STREAM_ID, StreamId};

use std::collections::HashMap;

/// Which end of the connection this side is.
///
/// Clients allocate odd stream ids and servers allocate even ones, so the
/// two sides never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that sent SETUP.
    Client,
    /// The side that accepted SETUP.
    Server,
}

impl Role {
    /// First stream id this role allocates.
    #[must_use]
    pub const fn first_stream_id(self) -> StreamId {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether `stream_id` belongs to this role's id space.
    #[must_use]
    pub const fn owns(self, stream_id: StreamId) -> bool {
        stream_id != 0 && stream_id % 2 == self.first_stream_id() % 2
    }
}

/// Table of live streams keyed by stream id.
///
/// Entries are removed once a stream reaches a terminal state, so the table
/// holds only streams that can still receive frames.
#[derive(Debug)]
pub struct StreamRegistry<T> {
    role: Role,
    next_stream_id: StreamId,
    streams: HashMap<StreamId, T>,
}

impl<T> StreamRegistry<T> {
    /// Create an empty registry for `role`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            next_stream_id: role.first_stream_id(),
            streams: HashMap::new(),
        }
    }

    /// The role this registry allocates ids for.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Allocates the next free locally-owned stream id.
    ///
    /// Ids advance by two and wrap around at the 31-bit limit, skipping ids
    /// still held by live streams. Returns `None` when every id of this
    /// parity is in use.
    pub fn allocate(&mut self) -> Option<StreamId> {
        let capacity = (MAX_STREAM_ID / 2) as usize + 1;
        if self.streams.len() >= capacity {
            return None;
        }

        loop {
            let candidate = self.next_stream_id;
            self.next_stream_id = match candidate.checked_add(2) {
                Some(next) if next <= MAX_STREAM_ID => next,
                _ => self.role.first_stream_id(),
            };
            if !self.streams.contains_key(&candidate) {
                return Some(candidate);
            }
        }
    }

    /// Registers a stream under `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] for stream id 0 or an id that is
    /// already registered. The existing entry is left untouched.
    pub fn register(&mut self, stream_id: StreamId, stream: T) -> Result<(), ProtocolError> {
        if stream_id == 0 || stream_id > MAX_STREAM_ID {
            return Err(ProtocolError::Invalid(format!(
                "stream id {stream_id} cannot carry a request"
            )));
        }
        if self.streams.contains_key(&stream_id) {
            return Err(ProtocolError::Invalid(format!(
                "stream id {stream_id} is already in use"
            )));
        }
        self.streams.insert(stream_id, stream);
        Ok(())
    }

    /// The stream registered under `stream_id`.
    pub fn lookup(&mut self, stream_id: StreamId) -> Option<&mut T> {
        self.streams.get_mut(&stream_id)
    }

    /// Whether `stream_id` is registered.
    #[must_use]
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Removes and returns the stream registered under `stream_id`.
    pub fn remove(&mut self, stream_id: StreamId) -> Option<T> {
        self.streams.remove(&stream_id)
    }

    /// Removes every stream, returning them for teardown.
    pub fn drain(&mut self) -> Vec<(StreamId, T)> {
        self.streams.drain().collect()
    }

    /// Whether `stream_id` was allocated by the peer.
    #[must_use]
    pub const fn is_peer_initiated(&self, stream_id: StreamId) -> bool {
        stream_id != 0 && !self.role.owns(stream_id)
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if no stream is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
