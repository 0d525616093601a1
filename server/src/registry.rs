//! Live connection tracking for the session server
//!
//! This module owns the server-side view of every open connection:
//! - Connection lifecycle (open, close) and id assignment
//! - Per-connection logic state used to gate dispatch
//! - Identity binding after login, unique per identity
//! - Capacity enforcement
//!
//! Both the logic state and the identity of a connection live in one
//! [`Session`] record behind a single lock, so closing a connection removes
//! everything about it in one step and no caller can observe a session that
//! is half torn down.

use log::{debug, info};
use parking_lot::RwLock;
use shared::{states, Identity, State};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Opaque handle to a live connection owned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Server-side state attached to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Logic state consulted by the dispatch gate
    pub state: State,
    /// Identity bound by a successful login
    pub identity: Option<Identity>,
    /// When the connection was opened
    pub opened_at: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            state: states::NONE,
            identity: None,
            opened_at: Instant::now(),
        }
    }
}

struct Inner {
    sessions: HashMap<ConnectionId, Session>,
    next_id: u64,
}

/// Maps live connections to their logic state and identity
///
/// Every operation is safe to call from any worker thread. Lookups for an
/// unknown connection return `None` or `false` instead of failing, and no
/// operation other than [`open`](Self::open) ever creates an entry.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    /// Maximum number of concurrent connections allowed
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Creates an empty registry with the given capacity limit
    ///
    /// Connection ids start from 1 and are never reused for the lifetime
    /// of the registry.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            max_connections,
        }
    }

    /// Registers a newly opened connection
    ///
    /// The session starts in the default state with no identity. Returns
    /// `None` when the registry is at capacity.
    pub fn open(&self) -> Option<ConnectionId> {
        let mut inner = self.inner.write();
        if inner.sessions.len() >= self.max_connections {
            return None;
        }

        let id = ConnectionId(inner.next_id);
        inner.next_id += 1;
        inner.sessions.insert(id, Session::new());
        debug!("{} opened ({} live)", id, inner.sessions.len());

        Some(id)
    }

    /// Removes a connection along with its state and identity binding
    ///
    /// Returns the removed session, or `None` if it was already gone.
    pub fn close(&self, connection: ConnectionId) -> Option<Session> {
        let removed = self.inner.write().sessions.remove(&connection);
        if let Some(session) = &removed {
            info!(
                "{} closed (identity {:?}, open for {:.1}s)",
                connection,
                session.identity,
                session.opened_at.elapsed().as_secs_f32()
            );
        }
        removed
    }

    /// Returns true while the connection is registered
    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.inner.read().sessions.contains_key(&connection)
    }

    /// Returns a snapshot of the connection's session
    pub fn session(&self, connection: ConnectionId) -> Option<Session> {
        self.inner.read().sessions.get(&connection).cloned()
    }

    /// Current logic state of the connection
    pub fn state(&self, connection: ConnectionId) -> Option<State> {
        self.inner
            .read()
            .sessions
            .get(&connection)
            .map(|session| session.state)
    }

    /// Overwrites the logic state of a known connection
    ///
    /// Does nothing for an unknown connection. Returns whether a session
    /// was updated.
    pub fn set_state(&self, connection: ConnectionId, state: State) -> bool {
        match self.inner.write().sessions.get_mut(&connection) {
            Some(session) => {
                session.state = state;
                true
            }
            None => false,
        }
    }

    /// Binds an identity to a connection
    ///
    /// Any other connection holding the same identity loses it first, all
    /// under one write lock, so at most one connection holds a given identity
    /// at any time and the last call wins. Does nothing for an unknown
    /// connection.
    pub fn bind_identity(&self, connection: ConnectionId, identity: Identity) -> bool {
        let mut inner = self.inner.write();
        if !inner.sessions.contains_key(&connection) {
            return false;
        }

        for (id, session) in inner.sessions.iter_mut() {
            if *id != connection && session.identity == Some(identity) {
                debug!("identity {} unbound from {}", identity, id);
                session.identity = None;
            }
        }

        if let Some(session) = inner.sessions.get_mut(&connection) {
            session.identity = Some(identity);
        }
        true
    }

    /// Finds the connection currently bound to an identity
    ///
    /// Linear scan over live sessions.
    pub fn lookup_by_identity(&self, identity: Identity) -> Option<ConnectionId> {
        self.inner
            .read()
            .sessions
            .iter()
            .find(|(_, session)| session.identity == Some(identity))
            .map(|(id, _)| *id)
    }

    /// Identity bound to the connection, if any
    pub fn lookup_identity(&self, connection: ConnectionId) -> Option<Identity> {
        self.inner
            .read()
            .sessions
            .get(&connection)
            .and_then(|session| session.identity)
    }

    /// Ids of all live connections
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.read().sessions.keys().copied().collect()
    }

    /// Returns the number of live connections
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Returns true if no connections are open
    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}
