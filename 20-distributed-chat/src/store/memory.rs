//! In-process backend.
//!
//! Every server instance that holds a clone of the same `Arc<MemoryBackend>`
//! shares one presence set, one history and one bus, which is how several
//! instances run inside a single process (tests, local demos).

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{Admission, Channel, FanoutBus, FanoutEvent, HistoryStore, PresenceStore};
use crate::{error::StoreResult, message::ChatMessage};

/// Store locator selecting this backend.
pub const LOCATOR: &str = "memory";

const BUS_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Default)]
struct State {
    users: BTreeSet<String>,
    /// name -> names it exchanged direct messages with
    peers: HashMap<String, BTreeSet<String>>,
    /// room key -> messages, most recent first
    messages: HashMap<String, VecDeque<ChatMessage>>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    bus: broadcast::Sender<FanoutEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            bus,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PresenceStore for MemoryBackend {
    async fn try_add(&self, name: &str) -> StoreResult<Admission> {
        if self.state().users.insert(name.to_string()) {
            Ok(Admission::Added)
        } else {
            Ok(Admission::AlreadyPresent)
        }
    }

    async fn remove(&self, name: &str) -> StoreResult<()> {
        self.state().users.remove(name);
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.state().users.clone())
    }

    async fn rooms_for(&self, name: &str) -> StoreResult<Vec<String>> {
        let state = self.state();
        let peers = state.peers.get(name).into_iter().flatten();
        Ok(super::rooms_from_peers(name, peers))
    }
}

#[async_trait]
impl HistoryStore for MemoryBackend {
    async fn append(&self, room: &str, message: &ChatMessage) -> StoreResult<()> {
        let mut state = self.state();
        state
            .messages
            .entry(room.to_string())
            .or_default()
            .push_front(message.clone());

        if !message.is_public() {
            state
                .peers
                .entry(message.author.clone())
                .or_default()
                .insert(message.recipient.clone());
            state
                .peers
                .entry(message.recipient.clone())
                .or_default()
                .insert(message.author.clone());
        }
        Ok(())
    }

    async fn range(&self, room: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let state = self.state();
        let messages = state
            .messages
            .get(room)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(messages)
    }
}

#[async_trait]
impl FanoutBus for MemoryBackend {
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> StoreResult<()> {
        // No subscribers is not a failure: nobody is online to notify.
        let _ = self.bus.send(FanoutEvent { channel, payload });
        Ok(())
    }

    async fn subscribe(&self) -> StoreResult<mpsc::Receiver<FanoutEvent>> {
        let mut source = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fan-out subscriber lagged; events were lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn message(author: &str, recipient: &str, body: &str, sent_at: i64) -> ChatMessage {
        ChatMessage {
            author: author.into(),
            recipient: recipient.into(),
            body: body.into(),
            sent_at,
        }
    }

    #[tokio::test]
    async fn concurrent_try_add_admits_exactly_one() {
        let store = Arc::new(MemoryBackend::new());
        let (a, b) = tokio::join!(
            {
                let store = Arc::clone(&store);
                async move { store.try_add("alice").await }
            },
            {
                let store = Arc::clone(&store);
                async move { store.try_add("alice").await }
            }
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let added = outcomes
            .iter()
            .filter(|outcome| **outcome == Admission::Added)
            .count();
        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_frees_the_name() {
        let store = MemoryBackend::new();
        assert_eq!(store.try_add("bob").await.unwrap(), Admission::Added);
        store.remove("bob").await.unwrap();
        store.remove("bob").await.unwrap();
        assert_eq!(store.try_add("bob").await.unwrap(), Admission::Added);
        assert_eq!(
            store.list_all().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["bob"]
        );
    }

    #[tokio::test]
    async fn range_returns_most_recent_first_up_to_limit() {
        let store = MemoryBackend::new();
        for i in 0..5 {
            store
                .append("", &message("alice", "", &format!("m{i}"), i))
                .await
                .unwrap();
        }

        let bodies: Vec<_> = store
            .range("", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["m4", "m3", "m2"]);
        assert!(store.range("alice:bob", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_messages_register_rooms_for_both_sides() {
        let store = MemoryBackend::new();
        let dm = message("bob", "alice", "hi", 1);
        store.append(&dm.room(), &dm).await.unwrap();
        store.append("", &message("carol", "", "hey all", 2)).await.unwrap();

        assert_eq!(store.rooms_for("alice").await.unwrap(), vec!["", "alice:bob"]);
        assert_eq!(store.rooms_for("bob").await.unwrap(), vec!["", "alice:bob"]);
        assert_eq!(store.rooms_for("carol").await.unwrap(), vec![""]);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let store = MemoryBackend::new();
        let mut first = store.subscribe().await.unwrap();
        let mut second = store.subscribe().await.unwrap();

        store.publish(Channel::Join, b"alice".to_vec()).await.unwrap();
        store.publish(Channel::Leave, b"alice".to_vec()).await.unwrap();

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap().channel, Channel::Join);
            assert_eq!(rx.recv().await.unwrap().channel, Channel::Leave);
        }
    }
}
