//! WebSocket front door.
//!
//! Architecture:
//! ```text
//! Client A ──┐                               ┌── Engine 1 (bound)
//!             ├── client listener ── Registry ─┤
//! Client B ──┘        │                  │     └── Engine 2 (idle, pooled)
//!                     ▼                  ▼              ▲
//!              ClientSession ──► DocumentBroker ◄───────┘
//!                                                 engine listener
//! ```
//!
//! Clients connect to `ws://<client addr>/?doc=<uri>[&user=..][&name=..][&permission=readonly]`.
//! Rendering engines connect to the engine listener and wait in the pool
//! until a document needs one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;
use uuid::Uuid;

use crate::broker::{BrokerConfig, BrokerHandle};
use crate::engine::{EngineProvider, EnginePool};
use crate::protocol::error_message;
use crate::registry::{DocumentRegistry, RegistryError};
use crate::session::{ClientSession, OutboundFrame, SessionId, UserInfo};
use crate::storage::Storage;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address clients connect to
    pub client_bind_addr: String,
    /// Address rendering engines connect to
    pub engine_bind_addr: String,
    /// Settings for every document broker
    pub broker: BrokerConfig,
    /// Attempts to reach a document that is being unloaded
    pub unload_retry_attempts: u32,
    pub unload_retry_delay: Duration,
    /// How long shutdown waits for each document's final save
    pub shutdown_save_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_bind_addr: "127.0.0.1:9980".to_string(),
            engine_bind_addr: "127.0.0.1:9981".to_string(),
            broker: BrokerConfig::default(),
            unload_retry_attempts: 20,
            unload_retry_delay: Duration::from_millis(100),
            shutdown_save_timeout: Duration::from_secs(10),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
    pub engines_connected: u64,
    pub engines_waiting: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Query parameters of a client connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub doc: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub read_only: bool,
}

impl ConnectParams {
    /// Parse the request target, e.g. `/?doc=file%3A%2F%2F%2Ftmp%2Fa.odt&permission=readonly`.
    pub fn from_request_target(target: &str) -> Self {
        let query = target.split_once('?').map_or("", |(_, q)| q);
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "doc" => params.doc = Some(value.into_owned()),
                "user" => params.user_id = value.into_owned(),
                "name" => params.user_name = value.into_owned(),
                "permission" => params.read_only = value == "readonly",
                _ => {}
            }
        }
        params
    }
}

/// The document server: client listener, engine listener and registry.
pub struct DocumentServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    engines: Arc<EnginePool>,
    stats: Arc<RwLock<ServerStats>>,
}

impl DocumentServer {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        let engines = Arc::new(EnginePool::new());
        let registry = Arc::new(DocumentRegistry::new(
            storage,
            engines.clone(),
            config.broker.clone(),
        ));
        Self {
            config,
            registry,
            engines,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind both listeners and serve until an accept fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let clients = TcpListener::bind(&self.config.client_bind_addr).await?;
        let engines = TcpListener::bind(&self.config.engine_bind_addr).await?;
        self.serve(clients, engines).await
    }

    /// Serve on already bound listeners.
    pub async fn serve(&self, clients: TcpListener, engines: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Document server listening for clients on {} and engines on {}",
            clients.local_addr()?,
            engines.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = clients.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New client TCP connection from {addr}");
                    let registry = self.registry.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream, addr, registry, stats, config).await {
                            log::error!("Client connection error from {addr}: {e}");
                        }
                    });
                }
                accepted = engines.accept() => {
                    let (stream, addr) = accepted?;
                    let pool = self.engines.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => {
                                let id = pool.attach(ws);
                                log::info!("Engine {id} connected from {addr}");
                                stats.write().await.engines_connected += 1;
                            }
                            Err(e) => log::error!("Engine handshake from {addr} failed: {e}"),
                        }
                    });
                }
            }
        }
    }

    /// Find (or create) the document's broker and hand it a session,
    /// retrying while an old broker for the same document unloads.
    async fn attach_session(
        registry: &DocumentRegistry,
        config: &ServerConfig,
        uri: &Url,
        id: SessionId,
        params: &ConnectParams,
        outbound: &mpsc::UnboundedSender<OutboundFrame>,
    ) -> Result<BrokerHandle, (&'static str, &'static str)> {
        let user = UserInfo::new(params.user_id.clone(), params.user_name.clone());
        for attempt in 0..=config.unload_retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(config.unload_retry_delay).await;
            }
            let handle = match registry.find_or_create(uri).await {
                Ok(handle) => handle,
                Err(RegistryError::DocumentUnloading(key)) => {
                    log::debug!("{key} is unloading; retrying ({attempt})");
                    continue;
                }
                Err(RegistryError::Engine(e)) => {
                    log::error!("No engine for {uri}: {e}");
                    return Err(("internal", "unavailable"));
                }
            };
            let session = ClientSession::new(id, user.clone(), params.read_only, outbound.clone());
            match handle.attach_session(session).await {
                Ok(()) => return Ok(handle),
                Err(e) => log::debug!("{} refused session {id}: {e}; retrying", handle.doc_key()),
            }
        }
        Err(("load", "docunloading"))
    }

    /// Handle a single client WebSocket connection.
    async fn handle_client(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let mut target = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = request.uri().to_string();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, ws_receiver) = ws.split();
        let params = ConnectParams::from_request_target(&target);
        log::info!("WebSocket connection established from {addr}");

        let uri = match params.doc.as_deref().map(Url::parse) {
            Some(Ok(uri)) => uri,
            _ => {
                log::warn!("Client {addr} sent no valid document URI in `{target}`");
                ws_sender
                    .send(Message::Text(error_message("load", "syntax").into()))
                    .await?;
                ws_sender.close().await?;
                return Ok(());
            }
        };

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let attached =
            Self::attach_session(&registry, &config, &uri, id, &params, &out_tx).await;
        drop(out_tx);

        let result = match attached {
            Ok(handle) => {
                log::info!("Session {id} from {addr} attached to {}", handle.doc_key());
                let result = Self::pump(&handle, id, ws_sender, ws_receiver, out_rx, &stats).await;
                handle.disconnect(id);
                result
            }
            Err((cmd, kind)) => {
                let _ = ws_sender
                    .send(Message::Text(error_message(cmd, kind).into()))
                    .await;
                let _ = ws_sender.close().await;
                Ok(())
            }
        };

        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }

    /// Shuttle frames between the socket and the session until either side
    /// closes.
    async fn pump(
        handle: &BrokerHandle,
        id: SessionId,
        mut ws_sender: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        mut ws_receiver: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    let data: Vec<u8> = match msg {
                        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from session {id}: {e}");
                            return Ok(());
                        }
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += data.len() as u64;
                    }
                    if handle.client_input(id, data).is_err() {
                        return Ok(());
                    }
                }

                // Outgoing frame from the broker
                frame = out_rx.recv() => match frame {
                    Some(OutboundFrame::Text(text)) => {
                        ws_sender.send(Message::Text(text.into())).await?;
                    }
                    Some(OutboundFrame::Binary(data)) => {
                        ws_sender.send(Message::Binary(data.into())).await?;
                    }
                    Some(OutboundFrame::Close) | None => {
                        let _ = ws_sender.close().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Force-save every open document and stop all brokers. Returns how
    /// many documents were saved.
    pub async fn shutdown(&self) -> usize {
        log::info!("Shutting down; saving {} documents", self.registry.document_count().await);
        let saved = self
            .registry
            .auto_save_all(self.config.shutdown_save_timeout)
            .await;
        log::info!("Saved {saved} documents before shutdown");
        self.registry.stop_all().await;
        saved
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.registry.document_count().await;
        stats.engines_waiting = self.engines.idle_count();
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }
}
