//! `MapServer` builder and server loop.
//!
//! This is the entry point for running a map server. It ties together
//! all the layers: transport → protocol → session/state → dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mapforge_protocol::{EmptyPayload, Message};
use mapforge_session::{Authenticator, ClientRegistry};
use mapforge_state::{GameStateHandle, MessageIdAllocator, PreambleService};
use mapforge_transport::{TcpTransport, Transport};
#[cfg(feature = "websocket")]
use mapforge_transport::WebSocketTransport;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::handler::handle_connection;
use crate::{
    BasicDiceRoller, DiceRoller, Persistence, ProtocolDispatcher, ServerConfig, ServerError,
    Services,
};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<A, P> {
    pub(crate) dispatcher: ProtocolDispatcher<A, P>,
    pub(crate) config: ServerConfig,
}

/// Builder for configuring and starting a map server.
///
/// # Example
///
/// ```rust,no_run
/// use mapforge::prelude::*;
///
/// # async fn start() -> Result<(), ServerError> {
/// let server = MapServer::builder()
///     .bind("0.0.0.0:2323")
///     .init_file("server.init")
///     .build(OpenAuthenticator::new(), MemoryStore::new())
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct MapServerBuilder {
    config: ServerConfig,
    dice: Option<Box<dyn DiceRoller>>,
}

impl MapServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            dice: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the init file holding the client preamble.
    pub fn init_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.init_file = Some(path.into());
        self
    }

    /// Sets how often clients are pinged. Zero disables pings.
    pub fn ping_interval(mut self, every: Duration) -> Self {
        self.config.ping_interval = every;
        self
    }

    /// Logs every protocol line at `trace` level.
    pub fn trace_messages(mut self, enabled: bool) -> Self {
        self.config.trace_messages = enabled;
        self
    }

    /// Uses `roller` instead of [`BasicDiceRoller`].
    pub fn dice_roller(mut self, roller: impl DiceRoller) -> Self {
        self.dice = Some(Box::new(roller));
        self
    }

    /// Binds a TCP listener and builds the server.
    pub async fn build<A: Authenticator, P: Persistence>(
        self,
        auth: A,
        persistence: P,
    ) -> Result<MapServer<TcpTransport, A, P>, ServerError> {
        let transport = TcpTransport::bind(&self.config.bind_addr).await?;
        self.build_with(transport, auth, persistence).await
    }

    /// Binds a WebSocket listener and builds the server.
    #[cfg(feature = "websocket")]
    pub async fn build_websocket<A: Authenticator, P: Persistence>(
        self,
        auth: A,
        persistence: P,
    ) -> Result<MapServer<WebSocketTransport, A, P>, ServerError> {
        let transport = WebSocketTransport::bind(&self.config.bind_addr).await?;
        self.build_with(transport, auth, persistence).await
    }

    /// Builds the server on an already bound transport.
    ///
    /// Starts the registry, game state, ID, and preamble actors and
    /// reads the init file. A bad init file is logged and the server
    /// starts with an empty preamble.
    pub async fn build_with<T: Transport, A: Authenticator, P: Persistence>(
        self,
        transport: T,
        auth: A,
        persistence: P,
    ) -> Result<MapServer<T, A, P>, ServerError> {
        let services = Services {
            registry: ClientRegistry::spawn(self.config.channel_size),
            state: GameStateHandle::spawn(self.config.channel_size),
            ids: MessageIdAllocator::spawn(),
            preamble: PreambleService::spawn(self.config.init_file.clone()),
        };
        if services.preamble.reload().await.is_err() {
            tracing::warn!("starting with an empty preamble");
        }

        let dice = self
            .dice
            .unwrap_or_else(|| Box::new(BasicDiceRoller::new()));
        let state = Arc::new(ServerState {
            dispatcher: ProtocolDispatcher::new(services, auth, persistence, dice),
            config: self.config,
        });
        let (shutdown, _) = watch::channel(false);

        Ok(MapServer {
            transport,
            state,
            shutdown: Arc::new(shutdown),
        })
    }
}

impl Default for MapServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops a running [`MapServer`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Tells every client to drop, then stops the accept loop.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }
}

/// A map server ready to run.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct MapServer<T, A, P> {
    transport: T,
    state: Arc<ServerState<A, P>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MapServer<TcpTransport, mapforge_session::OpenAuthenticator, crate::MemoryStore> {
    /// Creates a new builder.
    pub fn builder() -> MapServerBuilder {
        MapServerBuilder::new()
    }
}

impl<T, A, P> MapServer<T, A, P>
where
    T: Transport,
    A: Authenticator,
    P: Persistence,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The preamble service, for reloading the init file while running.
    pub fn preamble(&self) -> PreambleService {
        self.state.dispatcher.services().preamble.clone()
    }

    /// A handle that stops [`run()`](Self::run).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    /// Runs the server accept loop until shut down.
    ///
    /// Alongside the accept loop this runs the `MARCO` ping loop and the
    /// task that pushes peer lists to GM clients when someone connects.
    pub async fn run(mut self) -> Result<(), ServerError> {
        tracing::info!(addr = ?self.transport.local_addr().ok(), "mapforge server running");

        let services = self.state.dispatcher.services().clone();
        let ping_interval = self.state.config.ping_interval;
        let pinger = (!ping_interval.is_zero()).then(|| {
            tokio::spawn(ping_loop(
                services.registry.clone(),
                ping_interval,
                self.shutdown.subscribe(),
            ))
        });
        let roster = tokio::spawn(roster_loop(Arc::clone(&self.state), self.shutdown.subscribe()));

        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        let stop = self.shutdown.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state, stop).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                _ = stop.changed() => break,
            }
        }

        let clients = services.registry.snapshot();
        tracing::info!(clients = clients.len(), "shutting down, closing clients");
        for client in clients.iter() {
            client.close();
        }
        if let Some(pinger) = pinger {
            let _ = pinger.await;
        }
        let _ = roster.await;
        Ok(())
    }
}

/// Sends `MARCO` to every authenticated client each interval.
async fn ping_loop(registry: ClientRegistry, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let clients = registry.snapshot();
                let mut pinged = 0;
                for client in clients.iter().filter(|c| c.auth().is_some()) {
                    match client.send(Message::Marco(EmptyPayload {})) {
                        Ok(()) => pinged += 1,
                        Err(e) => tracing::debug!(error = %e, "ping not delivered"),
                    }
                }
                tracing::trace!(pinged, "ping sent");
            }
            _ = stop.changed() => break,
        }
    }
}

/// Pushes peer lists to GM clients whenever the roster grows.
async fn roster_loop<A: Authenticator, P: Persistence>(
    state: Arc<ServerState<A, P>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut changes = state.dispatcher.services().registry.roster_changes();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                state.dispatcher.push_peer_lists();
            }
            _ = stop.changed() => break,
        }
    }
}
