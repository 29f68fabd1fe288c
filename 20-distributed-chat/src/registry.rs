//! Sessions connected to this instance.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::message::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live connection and the user it is logged in as, if any.
///
/// Outbound events go through a bounded queue drained by the connection's
/// writer task. When the queue is full new events are dropped for this
/// session only; enqueueing never waits.
pub struct Session {
    id: SessionId,
    user: Mutex<Option<String>>,
    outbound: mpsc::Sender<ServerEvent>,
    dropped: AtomicU64,
}

impl Session {
    pub fn new(id: SessionId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id,
            user: Mutex::new(None),
            outbound,
            dropped: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn user_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.user.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user(&self) -> Option<String> {
        self.user_slot().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_slot().is_some()
    }

    /// Binds `name` unless the session is already bound, queueing `greeting`
    /// before any broadcast can observe the binding. Returns whether the
    /// binding happened.
    pub fn bind(&self, name: &str, greeting: ServerEvent) -> bool {
        let mut slot = self.user_slot();
        if slot.is_some() {
            return false;
        }
        self.deliver(greeting);
        *slot = Some(name.to_string());
        true
    }

    /// Clears the binding and hands back the name. Only the first caller
    /// after a login gets `Some`, which makes logout run once.
    pub fn unbind(&self) -> Option<String> {
        self.user_slot().take()
    }

    /// Queues `event` for the writer task. Returns false if it was dropped.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(session = %self.id, dropped, "outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Events dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Table of sessions hosted by this instance.
///
/// One mutex guards the map. Iteration works on a snapshot taken under the
/// lock, so visitors never run while the lock is held.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Creates a session with a fresh id and registers it.
    pub fn open(&self, capacity: usize) -> (Arc<Session>, mpsc::Receiver<ServerEvent>) {
        let (session, rx) = Session::new(self.next_id(), capacity);
        self.add(Arc::clone(&session));
        (session, rx)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions().insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }

    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<Session>),
    {
        for session in self.snapshot() {
            visitor(&session);
        }
    }
}
