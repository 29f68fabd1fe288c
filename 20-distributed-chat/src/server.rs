use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::RelayConfig,
    connection,
    message::ServerEvent,
    registry::SessionRegistry,
    router::MessageRouter,
    store::{Backends, FanoutBus, FanoutEvent},
};

/// How long connections get to log out and flush once the instance closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One chat server instance: the sessions it hosts, its single fan-out
/// subscription and the HTTP listener.
pub struct Server {
    listener: TcpListener,
    config: RelayConfig,
    router: Arc<MessageRouter>,
    bus: Arc<dyn FanoutBus>,
}

#[derive(Clone)]
struct AppState {
    router: Arc<MessageRouter>,
    queue_capacity: usize,
    closing: watch::Receiver<bool>,
    /// Held by every connection task; the receiver sees `None` once all
    /// of them are gone.
    alive: mpsc::Sender<()>,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig, backends: Backends) -> Self {
        let bus = Arc::clone(&backends.bus);
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(MessageRouter::new(registry, backends, config.history_size));
        Self {
            listener,
            config,
            router,
            bus,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves.
    ///
    /// Fails if the fan-out subscription closes: the instance would keep
    /// serving its own sessions while silently missing every other instance.
    /// Either way every session is logged out before this returns, so the
    /// shared presence set never keeps names of a stopped instance.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            config,
            router,
            bus,
        } = self;

        let events = bus
            .subscribe()
            .await
            .context("failed to subscribe to the fan-out bus")?;
        let mut fanout = tokio::spawn(run_fanout_loop(events, Arc::clone(&router)));

        let (closing_tx, closing_rx) = watch::channel(false);
        let closing_tx = Arc::new(closing_tx);
        let (alive_tx, alive_rx) = mpsc::channel(1);

        let state = AppState {
            router: Arc::clone(&router),
            queue_capacity: config.queue_capacity,
            closing: closing_rx,
            alive: alive_tx,
        };
        let app = build_app(&config, state);

        let shutdown_router = Arc::clone(&router);
        let shutdown_closing = Arc::clone(&closing_tx);
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.await;
            begin_close(&shutdown_router, &shutdown_closing);
        });

        let result = select! {
            served = serve.into_future() => served.context("http server failed"),
            _ = &mut fanout => Err(anyhow!("fan-out subscription closed")),
        };

        fanout.abort();
        begin_close(&router, &closing_tx);
        drain_sessions(&router, alive_rx).await;
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn build_app(config: &RelayConfig, state: AppState) -> Router {
    Router::new()
        .route(&config.endpoint, get(upgrade))
        .fallback_service(ServeDir::new(&config.web_root))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let AppState {
        router,
        queue_capacity,
        closing,
        alive,
    } = state;
    ws.on_upgrade(move |socket| async move {
        connection::serve(socket, router, queue_capacity, closing).await;
        drop(alive);
    })
}

async fn run_fanout_loop(mut events: mpsc::Receiver<FanoutEvent>, router: Arc<MessageRouter>) {
    while let Some(event) = events.recv().await {
        router.dispatch(&event);
    }
    error!("fan-out subscription closed");
}

/// Tells every session the instance is going away and signals the
/// connection tasks to stop. Only the first call does anything.
fn begin_close(router: &MessageRouter, closing: &watch::Sender<bool>) {
    if closing.send_replace(true) {
        return;
    }
    info!(sessions = router.registry().len(), "server shutting down");
    router.registry().for_each(|session| {
        session.deliver(ServerEvent::error("server shutting down"));
    });
}

/// Waits for the connection tasks to finish, then logs out whatever they
/// left behind.
async fn drain_sessions(router: &MessageRouter, mut alive: mpsc::Receiver<()>) {
    if timeout(DRAIN_TIMEOUT, alive.recv()).await.is_err() {
        warn!(
            sessions = router.registry().len(),
            "connections still open after shutdown"
        );
    }
    for session in router.registry().snapshot() {
        router.disconnect(&session).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::oneshot;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    use super::*;
    use crate::{
        error::{StoreError, StoreResult},
        message::{self, ClientRequest},
        store::{Channel, PresenceStore, memory::MemoryBackend},
    };

    /// Bus whose subscription ends right away, as after a lost connection.
    struct SeveredBus {
        refuse: bool,
    }

    #[async_trait]
    impl FanoutBus for SeveredBus {
        async fn publish(&self, _channel: Channel, _payload: Vec<u8>) -> StoreResult<()> {
            Ok(())
        }

        async fn subscribe(&self) -> StoreResult<mpsc::Receiver<FanoutEvent>> {
            if self.refuse {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    async fn server_with_bus(bus: SeveredBus) -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let backends = Backends {
            presence: memory.clone(),
            history: memory,
            bus: Arc::new(bus),
        };
        Server::new(listener, RelayConfig::default(), backends)
    }

    #[tokio::test]
    async fn closed_subscription_stops_the_instance() {
        let server = server_with_bus(SeveredBus { refuse: false }).await;
        let result = timeout(Duration::from_secs(2), server.run_until(std::future::pending()))
            .await
            .expect("server should stop on its own");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("fan-out subscription closed"));
    }

    #[tokio::test]
    async fn failed_subscription_prevents_startup() {
        let server = server_with_bus(SeveredBus { refuse: true }).await;
        let result = server.run_until(std::future::pending()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_a_healthy_instance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backends = Backends::from_shared(Arc::new(MemoryBackend::new()));
        let server = Server::new(listener, RelayConfig::default(), backends);

        let result = timeout(Duration::from_secs(2), server.run_until(async {}))
            .await
            .expect("server should honour shutdown");
        assert!(result.is_ok());
    }

    /// Memory bus whose subscription can be cut from the outside.
    struct SeverableBus {
        inner: Arc<MemoryBackend>,
        sever: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl FanoutBus for SeverableBus {
        async fn publish(&self, channel: Channel, payload: Vec<u8>) -> StoreResult<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self) -> StoreResult<mpsc::Receiver<FanoutEvent>> {
            let mut events = self.inner.subscribe().await?;
            let mut sever = self.sever.lock().unwrap().take().unwrap();
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                loop {
                    select! {
                        _ = &mut sever => return,
                        event = events.recv() => match event {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        },
                    }
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn lost_subscription_logs_out_every_session() {
        let memory = Arc::new(MemoryBackend::new());
        let (cut, sever) = oneshot::channel();
        let backends = Backends {
            presence: memory.clone(),
            history: memory.clone(),
            bus: Arc::new(SeverableBus {
                inner: memory.clone(),
                sever: Mutex::new(Some(sever)),
            }),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, RelayConfig::default(), backends);
        let addr = server.local_addr().unwrap();
        let running = tokio::spawn(server.run_until(std::future::pending()));

        let (mut socket, _) = connect_async(format!("ws://{addr}/chat")).await.unwrap();
        let login = message::encode(&ClientRequest::Login("alice".into())).unwrap();
        socket.send(Message::Text(login)).await.unwrap();
        let reply = timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(reply.to_text().unwrap().contains("\"login\""));
        assert!(memory.list_all().await.unwrap().contains("alice"));

        cut.send(()).unwrap();
        let result = timeout(Duration::from_secs(3), running).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(memory.list_all().await.unwrap().is_empty());

        let mut saw_notice = false;
        while let Ok(Some(Ok(frame))) = timeout(Duration::from_secs(2), socket.next()).await {
            if let Message::Text(text) = frame {
                saw_notice |= text.contains("server shutting down");
            }
        }
        assert!(saw_notice);
    }
}
