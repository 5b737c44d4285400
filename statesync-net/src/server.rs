//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌─▶ Channel (users + entities)
//!             ├── WebSocket ── Engine ┤
//! Client B ──┘    (JSON text)         └─▶ Scheduler tick after each frame
//! ```
//!
//! Each connection gets an outbound queue; the engine delivers frames into
//! it through the connection's [`OutputSink`] and a per-connection task pumps
//! the queue onto the socket. The engine is `Rc`-based and not `Send`, so the
//! whole server must run inside a [`tokio::task::LocalSet`]; connections are
//! spawned with `spawn_local` and share the engine without locks.
//!
//! Inbound frames that fail to parse are counted and dropped; the connection
//! stays up.

use std::rc::Rc;

use futures_util::{SinkExt, StreamExt};
use std::cell::RefCell;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::engine::Engine;
use crate::protocol::{Input, Output};
use crate::user::OutputSink;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections: 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_inputs: u64,
    pub total_outputs: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Delivers engine outputs into a connection's outbound queue.
struct ConnectionSink {
    tx: mpsc::UnboundedSender<Output>,
}

impl OutputSink for ConnectionSink {
    fn deliver(&self, output: &Output) {
        // A closed queue means the connection is going away; drop quietly.
        let _ = self.tx.send(output.clone());
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Engine,
    stats: Rc<RefCell<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, engine: Engine) -> Self {
        Self {
            config,
            engine,
            stats: Rc::new(RefCell::new(ServerStats::default())),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.borrow().clone()
    }

    /// Accept connections forever. Must be called from inside a
    /// `tokio::task::LocalSet`.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            {
                let mut stats = self.stats.borrow_mut();
                if stats.active_connections >= self.config.max_connections as u64 {
                    log::warn!("connection limit reached, dropping {addr}");
                    continue;
                }
                stats.total_connections += 1;
                stats.active_connections += 1;
            }

            let engine = self.engine.clone();
            let stats = Rc::clone(&self.stats);
            tokio::task::spawn_local(async move {
                if let Err(e) = handle_connection(stream, engine, Rc::clone(&stats)).await {
                    log::debug!("connection from {addr} ended with error: {e}");
                }
                stats.borrow_mut().active_connections -= 1;
            });
        }
    }
}

/// Run one connection: decode inbound frames into the engine, pump the
/// outbound queue onto the socket, tick after every applied input.
async fn handle_connection(
    stream: TcpStream,
    engine: Engine,
    stats: Rc<RefCell<ServerStats>>,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let user = engine.connect(Rc::new(ConnectionSink { tx }));
    engine.tick();

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match Input::decode(text.as_str()) {
                            Ok(input) => {
                                stats.borrow_mut().total_inputs += 1;
                                engine.apply(&user, &input);
                                engine.tick();
                            }
                            Err(e) => {
                                stats.borrow_mut().malformed_frames += 1;
                                log::debug!("malformed frame from user {}: {e}", user.id());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws_sender.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and other frame types are not part of the
                        // protocol.
                        stats.borrow_mut().malformed_frames += 1;
                    }
                    Some(Err(e)) => {
                        log::debug!("websocket error from user {}: {e}", user.id());
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                let Some(output) = outbound else { break };
                match output.encode() {
                    Ok(text) => {
                        stats.borrow_mut().total_outputs += 1;
                        ws_sender.send(Message::Text(text.into())).await?;
                    }
                    Err(e) => log::error!("failed to encode output frame: {e}"),
                }
            }
        }
    }

    engine.disconnect(&user);
    engine.tick();
    log::debug!("connection for user {} closed", user.id());
    Ok(())
}
