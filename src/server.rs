//! TCP listener and client registry (component C4 of spec.md §4.4), wired
//! up to the handshake/frame codec (C2/C1), the dispatcher (C6) and the
//! keepalive supervisor (C5).
//!
//! Concurrency model (spec.md §5): everything that mutates the client
//! registry or the dispatcher's deferred table happens in one task — the
//! loop in [`run`]. Per-connection reader/writer tasks only move bytes;
//! they never touch shared state. Inbound messages are handed to the
//! dispatcher through a channel rather than inline from the read callback,
//! so a deep synchronous handler chain cannot grow the read task's stack
//! and delivery is always a fresh turn of the loop ("next tick").

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::connection::{ClientConnection, ClientState, ConnectionEvent};
use crate::dispatcher::{encode_notification, DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::ids::ClientId;
use crate::keepalive::{KeepaliveAction, KeepaliveSupervisor};
use crate::registry::ToolRegistry;

/// Configuration for one [`Server`] instance. This core never reads files or
/// environment variables itself (§1 "Out of scope": configuration
/// loading); the embedder builds this by hand.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port_range: RangeInclusive<u16>,
    pub auth_token: Option<String>,
    pub keepalive_interval: Duration,
    pub bind_addr: Ipv4Addr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_range: 9001..=9099,
            auth_token: None,
            keepalive_interval: Duration::from_millis(30_000),
            bind_addr: Ipv4Addr::LOCALHOST,
        }
    }
}

/// The four lifecycle callbacks surfaced outward (spec.md §6). Every
/// callback is optional; unset ones are no-ops.
pub struct Callbacks {
    pub on_connect: Box<dyn Fn(&ClientId) + Send + Sync>,
    pub on_message: Box<dyn Fn(&ClientId, &str) + Send + Sync>,
    pub on_disconnect: Box<dyn Fn(&ClientId, u16, &str) + Send + Sync>,
    pub on_error: Box<dyn Fn(&str) + Send + Sync>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connect: Box::new(|_| {}),
            on_message: Box::new(|_, _| {}),
            on_disconnect: Box::new(|_, _, _| {}),
            on_error: Box::new(|_| {}),
        }
    }
}

enum WriteCommand {
    Bytes(Vec<u8>),
    CloseAfterFlush,
}

enum RawEvent {
    Data { id: ClientId, bytes: Vec<u8> },
    Eof { id: ClientId },
    ReadError { id: ClientId, message: String },
}

enum ServerCommand {
    Send { client: ClientId, method: String, params: Value },
    Broadcast { method: String, params: Value },
    Stop { reply: oneshot::Sender<()> },
}

struct ClientEntry {
    conn: ClientConnection,
    write_tx: mpsc::UnboundedSender<WriteCommand>,
    reader_handle: JoinHandle<()>,
}

/// A running server. Dropping this without calling [`ServerHandle::stop`]
/// leaves the background task running; `stop` is the clean shutdown path.
pub struct ServerHandle {
    port: u16,
    command_tx: mpsc::UnboundedSender<ServerCommand>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send a server-initiated JSON-RPC notification to one client.
    pub fn send(&self, client: ClientId, method: impl Into<String>, params: Value) -> Result<()> {
        self.command_tx
            .send(ServerCommand::Send { client, method: method.into(), params })
            .map_err(|_| Error::NotRunning)
    }

    /// Send a server-initiated JSON-RPC notification to every client.
    pub fn broadcast(&self, method: impl Into<String>, params: Value) -> Result<()> {
        self.command_tx
            .send(ServerCommand::Broadcast { method: method.into(), params })
            .map_err(|_| Error::NotRunning)
    }

    /// Stop the server (spec.md §4.4 "Shutdown"): every client is closed
    /// with 1001, the deferred table is cleared, and the listener is
    /// dropped. Returns once teardown has completed.
    pub async fn stop(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ServerCommand::Stop { reply: reply_tx })
            .map_err(|_| Error::NotRunning)?;
        let _ = reply_rx.await;
        let _ = self.join.await;
        Ok(())
    }
}

/// Bind a listener to the first free port in `range` on `addr`, trying ports
/// in random order (spec.md §4.4 "Startup").
async fn bind_in_range(
    addr: Ipv4Addr,
    range: RangeInclusive<u16>,
) -> Result<(TcpListener, u16)> {
    let mut ports: Vec<u16> = range.clone().collect();
    ports.shuffle(&mut rand::rng());
    for port in ports {
        if let Ok(listener) = TcpListener::bind((addr, port)).await {
            return Ok((listener, port));
        }
    }
    Err(Error::PortRangeExhausted { min: *range.start(), max: *range.end() })
}

/// Start the server: binds a port, then spawns the accept/event loop as a
/// background task and returns a handle to it.
pub async fn start(
    config: ServerConfig,
    registry: Arc<dyn ToolRegistry>,
    callbacks: Callbacks,
) -> Result<ServerHandle> {
    start_with_clock(config, registry, callbacks, Arc::new(SystemClock::new())).await
}

/// Same as [`start`], but with an injectable [`Clock`] — used by tests that
/// need deterministic keepalive timing.
pub async fn start_with_clock(
    config: ServerConfig,
    registry: Arc<dyn ToolRegistry>,
    callbacks: Callbacks,
    clock: Arc<dyn Clock>,
) -> Result<ServerHandle> {
    if config.auth_token.is_none() {
        log::warn!("no auth token configured; accepting any loopback client");
    }

    let (listener, port) = bind_in_range(config.bind_addr, config.port_range.clone()).await?;
    log::info!("listening on {}:{port}", config.bind_addr);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(run(listener, config, registry, callbacks, clock, command_rx));

    Ok(ServerHandle { port, command_tx, join })
}

async fn run(
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<dyn ToolRegistry>,
    callbacks: Callbacks,
    clock: Arc<dyn Clock>,
    mut command_rx: mpsc::UnboundedReceiver<ServerCommand>,
) {
    let mut clients: HashMap<ClientId, ClientEntry> = HashMap::new();
    let mut dispatcher = Dispatcher::new(registry, "ide-mcp-bridge", env!("CARGO_PKG_VERSION"));
    let keepalive_ms = config.keepalive_interval.as_millis() as u64;
    let mut supervisor = KeepaliveSupervisor::new(keepalive_ms, clock.monotonic_ms());
    let mut ticker = tokio::time::interval(config.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<RawEvent>();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<(ClientId, Vec<u8>)>();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _addr)) = accepted else { continue };
                accept_client(stream, &config, clock.as_ref(), &callbacks, &raw_tx, &mut clients);
            }

            Some(event) = raw_rx.recv() => {
                handle_raw_event(event, clock.as_ref(), &mut clients, &callbacks, &mut dispatcher, &msg_tx);
            }

            Some((id, payload)) = msg_rx.recv() => {
                handle_message(&id, &payload, &mut clients, &callbacks, &mut dispatcher);
            }

            completion = dispatcher.next_completion() => {
                if let Some((client, bytes)) = dispatcher.resolve_completion(completion) {
                    send_raw(&mut clients, &client, ClientConnection::encode_message(&bytes));
                }
            }

            _ = ticker.tick() => {
                let actions = supervisor.tick(
                    clock.as_ref(),
                    clients.iter_mut().map(|(id, entry)| (id, &mut entry.conn)),
                );
                for (id, action) in actions {
                    match action {
                        KeepaliveAction::Ping(payload) => {
                            send_raw(&mut clients, &id, ClientConnection::encode_ping(&payload));
                        }
                        KeepaliveAction::Timeout => {
                            log::info!("client {id} keepalive timeout");
                            disconnect(&mut clients, &callbacks, &mut dispatcher, &id, 1006, "Connection timeout");
                        }
                    }
                }
            }

            Some(command) = command_rx.recv() => {
                match command {
                    ServerCommand::Send { client, method, params } => {
                        let bytes = encode_notification(&method, params);
                        send_raw(&mut clients, &client, ClientConnection::encode_message(&bytes));
                    }
                    ServerCommand::Broadcast { method, params } => {
                        let bytes = encode_notification(&method, params);
                        let frame = ClientConnection::encode_message(&bytes);
                        let ids: Vec<ClientId> = clients.keys().cloned().collect();
                        for id in ids {
                            send_raw(&mut clients, &id, frame.clone());
                        }
                    }
                    ServerCommand::Stop { reply } => {
                        shutdown(&mut clients, &callbacks, &mut dispatcher);
                        let _ = reply.send(());
                        return;
                    }
                }
            }
        }
    }
}

fn accept_client(
    stream: TcpStream,
    config: &ServerConfig,
    clock: &dyn Clock,
    callbacks: &Callbacks,
    raw_tx: &mpsc::UnboundedSender<RawEvent>,
    clients: &mut HashMap<ClientId, ClientEntry>,
) {
    let _ = stream.set_nodelay(true);
    let id = ClientId::generate();
    let (mut read_half, mut write_half) = stream.into_split();

    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteCommand>();
    tokio::spawn(async move {
        while let Some(cmd) = write_rx.recv().await {
            match cmd {
                WriteCommand::Bytes(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                WriteCommand::CloseAfterFlush => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    let reader_id = id.clone();
    let reader_tx = raw_tx.clone();
    let reader_handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = reader_tx.send(RawEvent::Eof { id: reader_id });
                    break;
                }
                Ok(n) => {
                    let _ = reader_tx.send(RawEvent::Data {
                        id: reader_id.clone(),
                        bytes: buf[..n].to_vec(),
                    });
                }
                Err(e) => {
                    let _ = reader_tx.send(RawEvent::ReadError { id: reader_id, message: e.to_string() });
                    break;
                }
            }
        }
    });

    let conn = ClientConnection::new(id.clone(), config.auth_token.clone(), clock.monotonic_ms());
    clients.insert(id.clone(), ClientEntry { conn, write_tx, reader_handle });
    log::info!("client {id} connected");
    (callbacks.on_connect)(&id);
}

fn handle_raw_event(
    event: RawEvent,
    clock: &dyn Clock,
    clients: &mut HashMap<ClientId, ClientEntry>,
    callbacks: &Callbacks,
    dispatcher: &mut Dispatcher,
    msg_tx: &mpsc::UnboundedSender<(ClientId, Vec<u8>)>,
) {
    match event {
        RawEvent::Data { id, bytes } => {
            let now = clock.monotonic_ms();
            let Some(entry) = clients.get_mut(&id) else { return };
            let events = entry.conn.feed(&bytes, now);
            let mut to_disconnect = None;
            for ev in events {
                match ev {
                    ConnectionEvent::Send(out) => {
                        let _ = entry.write_tx.send(WriteCommand::Bytes(out));
                    }
                    ConnectionEvent::Message(payload) => {
                        let _ = msg_tx.send((id.clone(), payload));
                    }
                    ConnectionEvent::PeerClose { code, reason } => {
                        to_disconnect = Some((code, reason));
                    }
                    ConnectionEvent::ProtocolError { message, close_code } => {
                        (callbacks.on_error)(&message);
                        log::warn!("client {id} protocol error: {message}");
                        to_disconnect = Some((close_code, message));
                    }
                    ConnectionEvent::HandshakeRejected => {
                        let _ = entry.write_tx.send(WriteCommand::CloseAfterFlush);
                    }
                }
            }
            if let Some((code, reason)) = to_disconnect {
                disconnect(clients, callbacks, dispatcher, &id, code, &reason);
            }
        }
        RawEvent::Eof { id } => {
            disconnect(clients, callbacks, dispatcher, &id, 1006, "EOF");
        }
        RawEvent::ReadError { id, message } => {
            let full = format!("Client read error: {message}");
            (callbacks.on_error)(&full);
            disconnect(clients, callbacks, dispatcher, &id, 1006, &full);
        }
    }
}

/// The single idempotent disconnect path (spec.md §4.4 "Disconnect
/// discipline"). Removing the entry first makes every caller's repeated
/// invocation for the same client a no-op.
fn disconnect(
    clients: &mut HashMap<ClientId, ClientEntry>,
    callbacks: &Callbacks,
    dispatcher: &mut Dispatcher,
    id: &ClientId,
    code: u16,
    reason: &str,
) {
    if disconnect_registry_only(clients, callbacks, id, code, reason) {
        dispatcher.forget_client(id);
    }
}

fn disconnect_registry_only(
    clients: &mut HashMap<ClientId, ClientEntry>,
    callbacks: &Callbacks,
    id: &ClientId,
    code: u16,
    reason: &str,
) -> bool {
    let Some(mut entry) = clients.remove(id) else { return false };
    log::info!("client {id} disconnected: {code} {reason}");
    (callbacks.on_disconnect)(id, code, reason);
    entry.conn.mark_closed();
    let _ = entry.write_tx.send(WriteCommand::CloseAfterFlush);
    entry.reader_handle.abort();
    true
}

fn handle_message(
    id: &ClientId,
    payload: &[u8],
    clients: &mut HashMap<ClientId, ClientEntry>,
    callbacks: &Callbacks,
    dispatcher: &mut Dispatcher,
) {
    let text = String::from_utf8_lossy(payload);
    (callbacks.on_message)(id, &text);

    if !clients.contains_key(id) {
        return;
    }
    match dispatcher.dispatch(id, payload) {
        DispatchOutcome::Respond(bytes) => {
            send_raw(clients, id, ClientConnection::encode_message(&bytes));
        }
        DispatchOutcome::NoResponse => {}
    }
}

fn send_raw(clients: &mut HashMap<ClientId, ClientEntry>, id: &ClientId, bytes: Vec<u8>) {
    if let Some(entry) = clients.get(id) {
        if entry.conn.state() == ClientState::Connected {
            let _ = entry.write_tx.send(WriteCommand::Bytes(bytes));
        }
    }
}

fn shutdown(clients: &mut HashMap<ClientId, ClientEntry>, callbacks: &Callbacks, dispatcher: &mut Dispatcher) {
    log::info!("server shutting down, closing {} client(s)", clients.len());
    let ids: Vec<ClientId> = clients.keys().cloned().collect();
    for id in ids {
        if let Some(entry) = clients.get_mut(&id) {
            if let Some(close_bytes) = entry.conn.initiate_close(1001, "Server shutting down") {
                let _ = entry.write_tx.send(WriteCommand::Bytes(close_bytes));
            }
        }
        disconnect(clients, callbacks, dispatcher, &id, 1001, "Server shutting down");
    }
    dispatcher.clear_deferred();
}
