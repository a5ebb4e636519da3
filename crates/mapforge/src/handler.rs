//! Per-connection handler: greeting, read loop, and teardown.
//!
//! Each accepted connection gets its own Tokio task running this handler,
//! plus a writer task that drains the client's outbox. The flow is:
//!   1. Register the client, send the preamble and the `OK` challenge
//!   2. Loop: receive lines → decode → dispatch
//!   3. On EOF, I/O error, `DENIED`, a stopped writer, or server
//!      shutdown: unregister, then let the writer flush and close

use std::sync::Arc;

use mapforge_protocol::{ChallengePayload, Codec, LineCodec, Message, PROTOCOL_VERSION};
use mapforge_session::{new_challenge, Client, ClientReceiver, ClientRegistry, Outbound};
use mapforge_transport::Connection;
use tokio::sync::watch;

use crate::server::ServerState;
use crate::{Authenticator, Persistence, ServerError};

/// Unregisters a client when the handler exits.
///
/// The normal exit path calls [`release`](Self::release), which removes
/// the client from the registry and waits for the registry to publish a
/// snapshot without it. Only then does the handler go on, so by the time
/// this connection's task is done, no relay, chat, ping, or peer list
/// built from a fresh snapshot can include the dead client.
///
/// If the handler never reaches `release` (a panic in dispatch, or the
/// task being aborted), `Drop` still cleans up. `Drop` is synchronous, so
/// that fallback removal runs on a fire-and-forget task and the registry
/// may briefly keep listing the client.
struct RegistrationGuard {
    client: Arc<Client>,
    registry: ClientRegistry,
    armed: bool,
}

impl RegistrationGuard {
    /// Closes the client and removes it from the registry, then disarms
    /// the drop fallback.
    async fn release(mut self) {
        self.armed = false;
        self.client.close();
        if let Err(e) = self.registry.remove(Arc::clone(&self.client)).await {
            tracing::debug!(client = %self.client.id(), error = %e, "client not unregistered");
        }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.client.close();
        let client = Arc::clone(&self.client);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.remove(client).await {
                tracing::debug!(error = %e, "client not unregistered");
            }
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C, A, P>(
    conn: C,
    state: Arc<ServerState<A, P>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    C: Connection,
    A: Authenticator,
    P: Persistence,
{
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    let (client, outbox) = Client::channel(conn_id, conn.peer_addr());
    let client = Arc::new(client);
    tracing::info!(%conn_id, addr = %client.addr(), "client connected");

    let trace = state.config.trace_messages;
    let mut writer = tokio::spawn(write_loop(Arc::clone(&conn), outbox, trace));
    let mut writer_done = false;

    let services = state.dispatcher.services();
    services.registry.add(Arc::clone(&client)).await?;
    let guard = RegistrationGuard {
        client: Arc::clone(&client),
        registry: services.registry.clone(),
        armed: true,
    };

    // --- Greeting ---
    for line in services.preamble.fetch().preamble {
        client.send_line(line)?;
    }
    let challenge = new_challenge();
    client.send(Message::Challenge(ChallengePayload {
        protocol: PROTOCOL_VERSION,
        challenge: challenge.clone(),
    }))?;

    // --- Read loop ---
    loop {
        let line = tokio::select! {
            received = conn.recv() => match received {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::info!(%conn_id, user = client.username().unwrap_or_default(), "client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::debug!(%conn_id, error = %e, "recv error");
                    break;
                }
            },
            _ = shutdown.changed() => {
                tracing::debug!(%conn_id, "server shutting down, dropping client");
                break;
            }
            // The writer stops on its own when a send fails or the client
            // was cut off for lagging. Nothing more can reach this client,
            // so stop reading from it too.
            _ = &mut writer => {
                tracing::debug!(%conn_id, "writer stopped, dropping client");
                writer_done = true;
                break;
            }
        };

        if trace {
            tracing::trace!(%conn_id, %line, "recv");
        }
        if line.trim().is_empty() {
            continue;
        }
        let msg = match LineCodec.decode(&line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%conn_id, error = %e, "undecodable line");
                client.send(Message::comment(format!("unable to understand that: {e}")))?;
                continue;
            }
        };
        if state.dispatcher.handle(&client, &challenge, msg).await {
            break;
        }
    }

    // Unregister before anything else: once `release` returns, every new
    // registry snapshot is free of this client. It also queues Close, so
    // the writer finishes after flushing what was already queued (DENIED,
    // for one).
    guard.release().await;
    if !writer_done {
        if let Err(e) = writer.await {
            tracing::debug!(%conn_id, error = %e, "writer task failed");
        }
    }
    Ok(())
}

/// Drains a client's outbox onto its connection until told to close.
async fn write_loop<C: Connection>(conn: Arc<C>, mut outbox: ClientReceiver, trace: bool) {
    let codec = LineCodec;
    while let Some(item) = outbox.recv().await {
        let line = match item {
            Outbound::Message(msg) => match codec.encode(&msg) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id(), kind = msg.tag(), error = %e, "message not encodable, dropped");
                    continue;
                }
            },
            Outbound::Line(line) => line,
            Outbound::Close => break,
        };
        if trace {
            tracing::trace!(conn_id = %conn.id(), %line, "send");
        }
        if let Err(e) = conn.send(&line).await {
            tracing::debug!(conn_id = %conn.id(), error = %e, "send failed, stopping writer");
            break;
        }
    }
    if let Err(e) = conn.close().await {
        tracing::debug!(conn_id = %conn.id(), error = %e, "close failed");
    }
}
