//! Connection identity and the concurrent connection set used for bootstrap reconciliation

use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

/// One direction of a TCP connection: source endpoint -> destination endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl ConnectionId {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Identity of the opposite direction of the same connection.
    pub fn reverse(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// A set of connection identities shared between tasks.
///
/// Every operation takes the single lock for its duration; operations that
/// involve a second set snapshot it first so two locks are never held at once.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    inner: RwLock<HashSet<ConnectionId>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id`; returns false if it was already present.
    pub fn add(&self, id: ConnectionId) -> bool {
        self.inner.write().insert(id)
    }

    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.inner.write().remove(id)
    }

    pub fn has(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Adds every member of `other`.
    pub fn add_all(&self, other: &ConnectionSet) {
        if std::ptr::eq(self, other) {
            return;
        }
        let snapshot = other.snapshot();
        self.inner.write().extend(snapshot);
    }

    /// Removes every member of `other` (set difference in place).
    pub fn remove_all(&self, other: &ConnectionSet) {
        if std::ptr::eq(self, other) {
            self.inner.write().clear();
            return;
        }
        let snapshot = other.snapshot();
        let mut inner = self.inner.write();
        for id in snapshot.iter() {
            inner.remove(id);
        }
    }

    /// Members present in both sets. Iterates whichever side is smaller.
    pub fn intersection(&self, other: &ConnectionSet) -> ConnectionSet {
        let mine = self.snapshot();
        if std::ptr::eq(self, other) {
            return ConnectionSet::from_iter(mine);
        }
        let theirs = other.snapshot();
        let (small, large) = if mine.len() <= theirs.len() {
            (&mine, &theirs)
        } else {
            (&theirs, &mine)
        };
        small
            .iter()
            .filter(|id| large.contains(*id))
            .copied()
            .collect()
    }

    /// Copy of the current members.
    pub fn snapshot(&self) -> HashSet<ConnectionId> {
        self.inner.read().clone()
    }
}

impl Clone for ConnectionSet {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.snapshot()),
        }
    }
}

impl FromIterator<ConnectionId> for ConnectionSet {
    fn from_iter<I: IntoIterator<Item = ConnectionId>>(iter: I) -> Self {
        Self {
            inner: RwLock::new(iter.into_iter().collect()),
        }
    }
}
