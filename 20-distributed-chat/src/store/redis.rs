//! Redis backend for running several server processes as one chat.
//!
//! Layout:
//! - `users`: set of online names
//! - `messages` / `messages:<room>`: lists, newest at the head
//! - `rooms:<name>`: set of peers `name` exchanged direct messages with
//! - pub/sub channels `join`, `leave`, `message`

use std::collections::BTreeSet;

use ::redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Admission, Channel, FanoutBus, FanoutEvent, HistoryStore, PresenceStore};
use crate::{
    error::StoreResult,
    message::{self, ChatMessage},
};

const USERS_KEY: &str = "users";
const MESSAGES_PREFIX: &str = "messages";
const ROOMS_PREFIX: &str = "rooms";
const SUBSCRIPTION_BUFFER: usize = 256;

fn rooms_key(name: &str) -> String {
    format!("{ROOMS_PREFIX}:{name}")
}

fn messages_key(room: &str) -> String {
    if room.is_empty() {
        MESSAGES_PREFIX.to_string()
    } else {
        format!("{MESSAGES_PREFIX}:{room}")
    }
}

pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl PresenceStore for RedisBackend {
    async fn try_add(&self, name: &str) -> StoreResult<Admission> {
        let added: i64 = self.conn().sadd(USERS_KEY, name).await?;
        if added == 0 {
            Ok(Admission::AlreadyPresent)
        } else {
            Ok(Admission::Added)
        }
    }

    async fn remove(&self, name: &str) -> StoreResult<()> {
        let _: i64 = self.conn().srem(USERS_KEY, name).await?;
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<BTreeSet<String>> {
        let names: Vec<String> = self.conn().smembers(USERS_KEY).await?;
        Ok(names.into_iter().collect())
    }

    async fn rooms_for(&self, name: &str) -> StoreResult<Vec<String>> {
        let peers: Vec<String> = self.conn().smembers(rooms_key(name)).await?;
        Ok(super::rooms_from_peers(name, &peers))
    }
}

#[async_trait]
impl HistoryStore for RedisBackend {
    async fn append(&self, room: &str, message: &ChatMessage) -> StoreResult<()> {
        let encoded = message::encode(message)?;

        let mut pipe = ::redis::pipe();
        pipe.atomic().lpush(messages_key(room), encoded).ignore();
        if !message.is_public() {
            pipe.sadd(rooms_key(&message.author), &message.recipient)
                .ignore()
                .sadd(rooms_key(&message.recipient), &message.author)
                .ignore();
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn range(&self, room: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw: Vec<Vec<u8>> = self.conn().lrange(messages_key(room), 0, stop).await?;

        // Entries that fail to decode are skipped rather than failing the page.
        let messages = raw
            .iter()
            .filter_map(|bytes| match message::decode::<ChatMessage>(bytes) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(room, error = ?err, "skipping undecodable history entry");
                    None
                }
            })
            .collect();
        Ok(messages)
    }
}

#[async_trait]
impl FanoutBus for RedisBackend {
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> StoreResult<()> {
        let _: i64 = self.conn().publish(channel.as_str(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> StoreResult<mpsc::Receiver<FanoutEvent>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in Channel::ALL {
            pubsub.subscribe(channel.as_str()).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let Some(channel) = Channel::from_name(msg.get_channel_name()) else {
                    debug!(channel = msg.get_channel_name(), "ignoring unknown channel");
                    continue;
                };
                let event = FanoutEvent {
                    channel,
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            warn!("redis pub/sub connection ended");
        });

        Ok(rx)
    }
}
