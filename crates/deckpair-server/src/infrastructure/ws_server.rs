//! WebSocket server: accept loop and per-connection task.
//!
//! This module is responsible for:
//!
//! 1. Loading the key file and binding the listener.  A port that is already
//!    taken means another instance is running ([`ServerError::ListenerConflict`]).
//! 2. Upgrading each TCP connection to WebSocket, taking the peer identifier
//!    from the first `Sec-WebSocket-Protocol` value and echoing it back.
//! 3. Running one task per connection that drives a [`ConnectionSession`]:
//!    - inbound frames, strictly in arrival order;
//!    - broadcast frames from the session's outbound queue;
//!    - the challenge deadline.
//! 4. Keeping the [`ConnectionRegistry`] and the host's connectivity view in
//!    step with connection lifetimes.
//!
//! Session state is owned by its task; nothing here takes a lock except
//! through [`KeyStore`] and [`ConnectionRegistry`].

use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use deckpair_core::{
    ConnectOutcome, ConnectionSession, HandshakePolicy, KeyStore, MessageOutcome, PeerId,
    SessionError, SharedKey, WireFrame,
};

use crate::application::{Broadcaster, ConnectionRegistry, HostBridge, SessionHandle};
use crate::domain::ServerConfig;
use crate::infrastructure::key_file::{KeyFile, KeyFileError};

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("address {addr} is already in use; another instance is running")]
    ListenerConflict { addr: SocketAddr },

    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
}

/// State shared by every connection task.
struct ServerState {
    policy: HandshakePolicy,
    queue_capacity: usize,
    store: Arc<KeyStore>,
    registry: Arc<ConnectionRegistry>,
    host: Arc<dyn HostBridge>,
    key_file: Option<Arc<KeyFile>>,
}

/// A bound, not yet running, server.
pub struct DeckpairServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl DeckpairServer {
    /// Loads persisted keys and binds the listener.
    ///
    /// # Errors
    ///
    /// - [`ServerError::KeyFile`] if the configured key file cannot be read.
    /// - [`ServerError::ListenerConflict`] if the address is already in use.
    /// - [`ServerError::Bind`] for any other bind failure.
    pub async fn bind(config: ServerConfig, host: Arc<dyn HostBridge>) -> Result<Self, ServerError> {
        let key_file = config.key_file.as_ref().map(|p| Arc::new(KeyFile::new(p)));
        let store = match &key_file {
            Some(file) => {
                let store = file.load()?;
                info!(peers = store.len(), path = %file.path().display(), "loaded paired keys");
                store
            }
            None => KeyStore::new(),
        };

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| bind_error(config.bind_addr, source))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| bind_error(config.bind_addr, source))?;

        let state = Arc::new(ServerState {
            policy: config.handshake_policy(),
            queue_capacity: config.outbound_queue_capacity.max(1),
            store: Arc::new(store),
            registry: Arc::new(ConnectionRegistry::new()),
            host,
            key_file,
        });

        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Outbound entry point for the host application.
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(Arc::clone(&self.state.registry), Arc::clone(&self.state.store))
    }

    pub fn key_store(&self) -> Arc<KeyStore> {
        Arc::clone(&self.state.store)
    }

    /// Runs the accept loop until `running` is set to `false`.
    ///
    /// Each accepted connection gets its own task; one slow peer never
    /// delays the others.  Connection tasks already running are not
    /// interrupted by shutdown.
    pub async fn run(self, running: Arc<AtomicBool>) {
        info!("deckpair server listening on {}", self.local_addr);

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                Ok(Ok((stream, remote))) => {
                    debug!("new connection from {remote}");
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        handle_connection(stream, remote, state).await;
                    });
                }
                Ok(Err(e)) => {
                    error!("accept error: {e}");
                }
                Err(_) => {
                    // No connection within the poll interval.
                }
            }
        }
    }
}

fn bind_error(addr: SocketAddr, source: io::Error) -> ServerError {
    if source.kind() == io::ErrorKind::AddrInUse {
        ServerError::ListenerConflict { addr }
    } else {
        ServerError::Bind { addr, source }
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// The socket halves and channels owned by one connection task.
struct SessionIo {
    peer_id: PeerId,
    ws_tx: WsSink,
    ws_rx: WsSource,
    outbound: mpsc::Receiver<String>,
    key_tx: watch::Sender<Option<Arc<SharedKey>>>,
}

impl SessionIo {
    async fn send_frame(&mut self, frame: &WireFrame) -> anyhow::Result<()> {
        let text = frame.encode().context("frame encoding failed")?;
        self.ws_tx
            .send(WsMessage::Text(text))
            .await
            .context("WebSocket send failed")
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, state: Arc<ServerState>) {
    match run_connection(stream, remote, state).await {
        Ok(()) => debug!("connection {remote} closed"),
        Err(e) => warn!("connection {remote} closed with error: {e:#}"),
    }
}

async fn run_connection(
    stream: TcpStream,
    remote: SocketAddr,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let mut declared: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
        capture_subprotocol(req, resp, &mut declared)
    })
    .await
    .with_context(|| format!("WebSocket handshake failed with {remote}"))?;

    let (mut ws_tx, ws_rx) = ws_stream.split();
    let mut session = ConnectionSession::new(state.policy);

    let initial = match session.on_connect(declared.as_deref(), &state.store, Instant::now()) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("connection {remote} rejected: {e}");
            let _ = ws_tx.close().await;
            return Ok(());
        }
    };
    let peer_id = session
        .peer_id()
        .cloned()
        .context("identified session has no peer id")?;

    let session_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::channel(state.queue_capacity);
    let (key_tx, key_rx) = watch::channel(session.paired_key());
    state
        .registry
        .register(SessionHandle::new(session_id, peer_id.clone(), out_tx, key_rx));
    state.host.notify_connectivity(true);
    info!(peer = %peer_id, session = %session_id, %remote, "connection accepted");

    let mut io = SessionIo {
        peer_id,
        ws_tx,
        ws_rx,
        outbound: out_rx,
        key_tx,
    };
    let result = drive_session(&mut session, initial, &mut io, &state).await;

    state.registry.deregister(session_id);
    session.on_close();
    state.host.notify_connectivity(false);
    let _ = io.ws_tx.close().await;
    info!(peer = %io.peer_id, session = %session_id, "connection closed");

    result
}

/// Handshake callback: records the first offered subprotocol as the peer id
/// and selects it in the response.
fn capture_subprotocol(
    req: &Request,
    mut resp: Response,
    declared: &mut Option<String>,
) -> Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(first_subprotocol);

    if let Some(id) = offered {
        if let Ok(value) = HeaderValue::from_str(id) {
            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        *declared = Some(id.to_owned());
    }
    Ok(resp)
}

/// First non-empty entry of a comma-separated `Sec-WebSocket-Protocol` value.
fn first_subprotocol(header: &str) -> Option<&str> {
    header.split(',').map(str::trim).find(|s| !s.is_empty())
}

async fn drive_session(
    session: &mut ConnectionSession,
    initial: ConnectOutcome,
    io: &mut SessionIo,
    state: &ServerState,
) -> anyhow::Result<()> {
    if let ConnectOutcome::Challenged(challenge) = initial {
        io.send_frame(&challenge).await?;
    }

    loop {
        let deadline = session.deadline();

        tokio::select! {
            inbound = io.ws_rx.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e).context("WebSocket read failed"),
                };

                let now = Instant::now();
                let result = match message {
                    WsMessage::Text(text) => session.on_message(&text, &state.store, now),
                    WsMessage::Binary(bytes) => session.on_binary_message(&bytes, &state.store, now),
                    WsMessage::Close(_) => return Ok(()),
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                };

                if !apply_outcome(session, result, io, state).await? {
                    return Ok(());
                }
            }

            Some(frame) = io.outbound.recv() => {
                io.ws_tx
                    .send(WsMessage::Text(frame))
                    .await
                    .context("WebSocket send failed")?;
            }

            () = wait_until(deadline) => {
                if let Err(e) = session.poll_deadline(Instant::now()) {
                    warn!(peer = %io.peer_id, "{e}; closing connection");
                    return Ok(());
                }
            }
        }
    }
}

/// Acts on one processed inbound frame.  Returns `false` when the
/// connection must close.
async fn apply_outcome(
    session: &ConnectionSession,
    result: Result<MessageOutcome, SessionError>,
    io: &mut SessionIo,
    state: &ServerState,
) -> anyhow::Result<bool> {
    match result {
        Ok(MessageOutcome::Delivered(envelope)) => {
            debug!(
                peer = %io.peer_id,
                action = envelope.action().unwrap_or_default(),
                "message delivered to host"
            );
            state.host.apply_incoming_settings(envelope);
        }
        Ok(MessageOutcome::Paired { ack }) => {
            persist_keys(state).await;
            // Broadcasts queued from here on are only drained after the ack
            // has been written, so the peer always sees the ack first.
            io.key_tx.send_replace(session.paired_key());
            io.send_frame(&ack).await?;
        }
        Ok(MessageOutcome::Rechallenged { challenge, reason }) => {
            io.key_tx.send_replace(None);
            let dropped = discard_queued(&mut io.outbound);
            info!(peer = %io.peer_id, ?reason, dropped, "session re-challenged");
            io.send_frame(&challenge).await?;
        }
        Err(e) if e.is_terminal() => {
            warn!(peer = %io.peer_id, "{e}; closing connection");
            return Ok(false);
        }
        Err(e) => {
            debug!(peer = %io.peer_id, "frame dropped: {e}");
        }
    }
    Ok(true)
}

async fn persist_keys(state: &ServerState) {
    let Some(key_file) = state.key_file.clone() else {
        return;
    };
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || key_file.save(&store)).await {
        Ok(Ok(())) => debug!("key file updated"),
        Ok(Err(e)) => error!("failed to save key file: {e}"),
        Err(e) => error!("key file task failed: {e}"),
    }
}

/// Empties the outbound queue without sending; those frames were sealed
/// under a key the session no longer holds.  Returns how many were dropped.
fn discard_queued(outbound: &mut mpsc::Receiver<String>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// Resolves at `deadline`, or never when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
