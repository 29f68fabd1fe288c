//! Request handling and fan-out delivery.
//!
//! Requests from a session go out to the shared stores and the bus; nothing
//! is delivered locally on that path. Deliveries happen only in
//! [`MessageRouter::dispatch`], which every instance runs for every fan-out
//! event, its own included. A co-located author and recipient therefore get
//! exactly one copy each.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    error::{RelayError, StoreError},
    message::{
        self, ChatMessage, ClientRequest, HistoryResponse, LoginResponse, MessageDraft, Presence,
        ServerEvent,
    },
    registry::{Session, SessionRegistry},
    room::{self, PUBLIC},
    store::{Admission, Backends, Channel, FanoutBus, FanoutEvent, HistoryStore, PresenceStore},
};

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    presence: Arc<dyn PresenceStore>,
    history: Arc<dyn HistoryStore>,
    bus: Arc<dyn FanoutBus>,
    history_size: usize,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, backends: Backends, history_size: usize) -> Self {
        Self {
            registry,
            presence: backends.presence,
            history: backends.history,
            bus: backends.bus,
            history_size,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs one client request. Replies are queued on `session`; failures
    /// come back as errors for the caller to report.
    pub async fn handle(
        &self,
        session: &Session,
        request: ClientRequest,
    ) -> Result<(), RelayError> {
        match request {
            ClientRequest::Login(name) => {
                self.login(session, &name).await?;
            }
            ClientRequest::History(peer) => {
                let response = self.history(session, peer).await?;
                session.deliver(ServerEvent::History(response));
            }
            ClientRequest::Message(draft) => self.send(session, draft).await?,
            ClientRequest::Logout => {
                self.logout(session).await?;
            }
        }
        Ok(())
    }

    /// Claims `requested` in the presence set and binds it to `session`.
    ///
    /// The login response is queued before the join event is published, so
    /// the client always sees it first.
    pub async fn login(
        &self,
        session: &Session,
        requested: &str,
    ) -> Result<LoginResponse, RelayError> {
        if session.is_authenticated() {
            return Err(RelayError::AlreadyLoggedIn);
        }
        let name = room::normalize_username(requested)
            .ok_or_else(|| RelayError::InvalidName(requested.to_string()))?;

        if self.presence.try_add(&name).await? == Admission::AlreadyPresent {
            info!(session = %session.id(), user = %name, "login rejected, name taken");
            return Err(RelayError::NameTaken(name));
        }

        let response = match self.login_snapshot(&name).await {
            Ok(response) => response,
            Err(err) => {
                self.release(&name).await;
                return Err(err);
            }
        };

        if !session.bind(&name, ServerEvent::Login(response.clone())) {
            self.release(&name).await;
            return Err(RelayError::AlreadyLoggedIn);
        }
        info!(session = %session.id(), user = %name, "user logged in");

        if let Err(err) = self.bus.publish(Channel::Join, name.clone().into_bytes()).await {
            warn!(user = %name, error = ?err, "failed to publish join");
        }

        Ok(response)
    }

    async fn login_snapshot(&self, name: &str) -> Result<LoginResponse, RelayError> {
        let users = self.presence.list_all().await?.into_iter().collect();
        let rooms = self.presence.rooms_for(name).await?;
        let messages = self.history.range(PUBLIC, self.history_size).await?;

        Ok(LoginResponse {
            username: name.to_string(),
            users,
            rooms,
            messages,
        })
    }

    async fn release(&self, name: &str) {
        if let Err(err) = self.presence.remove(name).await {
            warn!(user = %name, error = ?err, "failed to release presence");
        }
    }

    /// Unbinds `session` and announces the departure. Safe to call from any
    /// teardown path: only the call that actually unbinds does the work.
    /// Returns whether this call logged a user out.
    pub async fn logout(&self, session: &Session) -> Result<bool, RelayError> {
        let Some(name) = session.unbind() else {
            return Ok(false);
        };
        info!(session = %session.id(), user = %name, "user logged out");

        let removed = self.presence.remove(&name).await;
        if let Err(err) = &removed {
            warn!(user = %name, error = ?err, "failed to remove presence");
        }
        let published = self.bus.publish(Channel::Leave, name.clone().into_bytes()).await;
        if let Err(err) = &published {
            warn!(user = %name, error = ?err, "failed to publish leave");
        }

        removed?;
        published?;
        Ok(true)
    }

    /// Logs the session out and drops it from the registry.
    pub async fn disconnect(&self, session: &Session) {
        if let Err(err) = self.logout(session).await {
            warn!(session = %session.id(), error = %err, "logout during disconnect failed");
        }
        self.registry.remove(session.id());
        debug!(session = %session.id(), "session closed");
    }

    /// Stamps, stores, then publishes a message from the session's user.
    pub async fn send(&self, session: &Session, draft: MessageDraft) -> Result<(), RelayError> {
        let author = session.user().ok_or(RelayError::NotLoggedIn)?;
        if draft.body.trim().is_empty() {
            return Ok(());
        }

        let recipient = draft.recipient.trim();
        if !recipient.is_empty() {
            check_peer(&author, recipient)?;
        }

        let message = ChatMessage {
            author,
            recipient: recipient.to_string(),
            body: draft.body,
            sent_at: Utc::now().timestamp(),
        };

        self.history.append(&message.room(), &message).await?;
        let payload = message::encode(&message)
            .map_err(StoreError::from)?
            .into_bytes();
        self.bus.publish(Channel::Message, payload).await?;
        Ok(())
    }

    /// Recent messages for the public room (`peer == None`) or for the direct
    /// room shared with `peer`.
    pub async fn history(
        &self,
        session: &Session,
        peer: Option<String>,
    ) -> Result<HistoryResponse, RelayError> {
        let user = session.user().ok_or(RelayError::NotLoggedIn)?;
        let peer = peer
            .map(|peer| peer.trim().to_string())
            .filter(|peer| !peer.is_empty());

        let room_key = match &peer {
            Some(peer) => {
                check_peer(&user, peer)?;
                room::room(&user, peer)
            }
            None => PUBLIC.to_string(),
        };
        let messages = self.history.range(&room_key, self.history_size).await?;
        Ok(HistoryResponse { peer, messages })
    }

    /// Delivers a fan-out event to the sessions of this instance that should
    /// see it.
    pub fn dispatch(&self, event: &FanoutEvent) {
        match event.channel {
            Channel::Join | Channel::Leave => {
                let name = String::from_utf8_lossy(&event.payload).into_owned();
                debug!(channel = %event.channel, user = %name, "presence change");
                let presence = Presence { name };
                let notice = match event.channel {
                    Channel::Join => ServerEvent::Join(presence),
                    _ => ServerEvent::Leave(presence),
                };
                self.broadcast(&notice);
            }
            Channel::Message => match message::decode::<ChatMessage>(&event.payload) {
                Ok(chat) => self.deliver_message(chat),
                Err(err) => warn!(error = ?err, "dropping undecodable fan-out message"),
            },
        }
    }

    fn deliver_message(&self, chat: ChatMessage) {
        debug!(author = %chat.author, recipient = %chat.recipient, "delivering message");
        if chat.is_public() {
            self.broadcast(&ServerEvent::Message(chat));
            return;
        }

        let event = ServerEvent::Message(chat.clone());
        self.registry.for_each(|session| {
            if session.user().is_some_and(|user| chat.is_visible_to(&user)) {
                session.deliver(event.clone());
            }
        });
    }

    /// Sends `event` to every logged-in local session.
    fn broadcast(&self, event: &ServerEvent) {
        self.registry.for_each(|session| {
            if session.is_authenticated() {
                session.deliver(event.clone());
            }
        });
    }
}

/// A direct conversation needs another user with a valid name.
fn check_peer(me: &str, peer: &str) -> Result<(), RelayError> {
    if peer == me || room::normalize_username(peer).as_deref() != Some(peer) {
        return Err(RelayError::InvalidRecipient(peer.to_string()));
    }
    Ok(())
}
