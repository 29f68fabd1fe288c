//! One WebSocket connection: a reader loop on the current task and a writer
//! task draining the session's outbound queue.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    message::{self, ClientRequest, ServerEvent},
    registry::Session,
    router::MessageRouter,
};

/// Time the writer gets to flush queued events once the instance closes.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Why the reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Client,
    Writer,
    Closing,
}

pub(crate) async fn serve(
    socket: WebSocket,
    router: Arc<MessageRouter>,
    queue_capacity: usize,
    mut closing: watch::Receiver<bool>,
) {
    let (session, outbox) = router.registry().open(queue_capacity);
    info!(session = %session.id(), "session opened");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_outbound(sink, outbox, closing.clone()));

    let exit = read_inbound(stream, &router, &session, &mut writer, &mut closing).await;
    router.disconnect(&session).await;

    // On close the writer still owes the client its queued events.
    let flushed = match exit {
        Exit::Closing => timeout(FLUSH_TIMEOUT, &mut writer).await.is_ok(),
        Exit::Client | Exit::Writer => false,
    };
    if !flushed {
        writer.abort();
    }
    info!(session = %session.id(), dropped = session.dropped(), "session ended");
}

/// Reads frames until the client goes away, the writer stops or the
/// instance closes. Requests are never cancelled halfway: the other two are
/// only checked between frames.
async fn read_inbound(
    mut stream: SplitStream<WebSocket>,
    router: &MessageRouter,
    session: &Session,
    writer: &mut JoinHandle<()>,
    closing: &mut watch::Receiver<bool>,
) -> Exit {
    loop {
        let frame = select! {
            biased;
            _ = closing.wait_for(|closing| *closing) => return Exit::Closing,
            _ = &mut *writer => {
                debug!(session = %session.id(), "writer stopped");
                return Exit::Writer;
            }
            frame = stream.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => return Exit::Client,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(session = %session.id(), error = ?err, "read failed");
                return Exit::Client;
            }
        };

        handle_frame(&bytes, router, session).await;
    }
}

async fn handle_frame(bytes: &[u8], router: &MessageRouter, session: &Session) {
    let request = match message::decode::<ClientRequest>(bytes) {
        Ok(request) => request,
        Err(err) => {
            debug!(session = %session.id(), error = %err, "dropping malformed request");
            return;
        }
    };

    if let Err(err) = router.handle(session, request).await {
        report(session, &err);
    }
}

fn report(session: &Session, err: &RelayError) {
    if err.is_transient() {
        warn!(session = %session.id(), error = ?err, "request failed");
    } else {
        debug!(session = %session.id(), error = %err, "request rejected");
    }
    session.deliver(ServerEvent::error(err.to_string()));
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<ServerEvent>,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        let event = select! {
            event = outbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = async { drop(closing.wait_for(|closing| *closing).await) } => {
                flush(&mut sink, &mut outbox).await;
                break;
            }
        };
        if !send_event(&mut sink, &event).await {
            return;
        }
    }
    let _ = sink.close().await;
}

/// Sends whatever is already queued, without waiting for more.
async fn flush(sink: &mut SplitSink<WebSocket, Message>, outbox: &mut mpsc::Receiver<ServerEvent>) {
    while let Ok(event) = outbox.try_recv() {
        if !send_event(sink, &event).await {
            return;
        }
    }
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    let text = match message::encode(event) {
        Ok(text) => text,
        Err(err) => {
            debug!(error = ?err, "failed to encode event");
            return true;
        }
    };
    if let Err(err) = sink.send(Message::Text(text)).await {
        debug!(error = ?err, "write failed");
        return false;
    }
    true
}
