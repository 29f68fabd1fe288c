//! Shared state that every server instance sees: who is online, what was
//! said, and the bus that fans events out to all instances.
//!
//! Each concern is a trait so the router does not care whether the backend
//! is the in-process [`memory::MemoryBackend`] or [`redis::RedisBackend`].

pub mod memory;
pub mod redis;

use std::{collections::BTreeSet, fmt, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::StoreResult, message::ChatMessage};

/// Fan-out channels. Every instance subscribes to all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Join,
    Leave,
    Message,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Join, Channel::Leave, Channel::Message];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Join => "join",
            Channel::Leave => "leave",
            Channel::Message => "message",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Channel::ALL.into_iter().find(|channel| channel.as_str() == name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One distributed notification. Join/leave carry the raw username; message
/// carries a JSON-encoded [`ChatMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutEvent {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

/// Outcome of adding a name to the presence set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    AlreadyPresent,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Atomically adds `name` across all instances.
    async fn try_add(&self, name: &str) -> StoreResult<Admission>;

    /// Removes `name`; absent names are not an error.
    async fn remove(&self, name: &str) -> StoreResult<()>;

    async fn list_all(&self) -> StoreResult<BTreeSet<String>>;

    /// Room keys of every direct conversation `name` took part in, plus the
    /// public key, in sorted order.
    async fn rooms_for(&self, name: &str) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Files `message` under `room`. Direct messages also record the
    /// author/recipient relationship used by [`PresenceStore::rooms_for`].
    async fn append(&self, room: &str, message: &ChatMessage) -> StoreResult<()>;

    /// Up to `limit` messages of `room`, most recent first.
    async fn range(&self, room: &str, limit: usize) -> StoreResult<Vec<ChatMessage>>;
}

#[async_trait]
pub trait FanoutBus: Send + Sync {
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> StoreResult<()>;

    /// Opens a subscription to all channels. Events published by this
    /// instance are delivered too. The receiver yields `None` once the
    /// subscription is lost for good.
    async fn subscribe(&self) -> StoreResult<mpsc::Receiver<FanoutEvent>>;
}

/// The three collaborators a server instance needs, usually backed by one
/// store.
#[derive(Clone)]
pub struct Backends {
    pub presence: Arc<dyn PresenceStore>,
    pub history: Arc<dyn HistoryStore>,
    pub bus: Arc<dyn FanoutBus>,
}

impl Backends {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: PresenceStore + HistoryStore + FanoutBus + 'static,
    {
        Self {
            presence: store.clone(),
            history: store.clone(),
            bus: store,
        }
    }

    /// Builds backends from a store locator: `memory` or a `redis://` URL.
    pub async fn connect(locator: &str) -> Result<Self> {
        if locator == memory::LOCATOR {
            return Ok(Self::from_shared(Arc::new(memory::MemoryBackend::new())));
        }

        let backend = redis::RedisBackend::connect(locator)
            .await
            .with_context(|| format!("failed to connect to store at {locator}"))?;
        Ok(Self::from_shared(Arc::new(backend)))
    }
}

/// Derives the sorted room list from the peers `name` has talked to.
pub(crate) fn rooms_from_peers<'a, I>(name: &str, peers: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut rooms: BTreeSet<String> = peers
        .into_iter()
        .map(|peer| crate::room::room(name, peer))
        .collect();
    rooms.insert(crate::room::PUBLIC.to_string());
    rooms.into_iter().collect()
}
