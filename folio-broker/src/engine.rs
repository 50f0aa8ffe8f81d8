//! Rendering-engine channel and engine pool.
//!
//! Engines connect to the engine listener over WebSocket and wait in a FIFO
//! pool. A new broker takes the oldest idle engine and binds it to its event
//! queue; from then on everything the engine says arrives as
//! [`BrokerEvent::Engine`] and its disconnect as [`BrokerEvent::EngineClosed`].
//!
//! ```text
//!   engine ──ws──▶ reader task ──BrokerEvent──▶ broker inbox
//!   engine ◀──ws── writer task ◀──Message────── WsEngine (owned by broker)
//! ```
//!
//! Session-scoped lines are prefixed `child-<id> ` on the way out and
//! `client-<id> ` on the way back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broker::{BrokerEvent, EventSender};
use crate::protocol::{binary_frame, first_line, payload};
use crate::session::SessionId;

/// Errors raised by engine channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no rendering engine available")]
    Unavailable,
    #[error("rendering engine connection closed")]
    Closed,
    #[error("malformed engine message: {0}")]
    Malformed(String),
}

/// Outbound half of the link to one rendering engine.
pub trait EngineChannel: Send {
    fn send_text(&self, line: &str) -> Result<(), EngineError>;

    fn send_binary(&self, data: &[u8]) -> Result<(), EngineError>;

    /// Send a session-scoped command, prefixed `child-<id> `.
    fn send_to_session(&self, session: &SessionId, line: &str) -> Result<(), EngineError> {
        self.send_text(&format!("child-{session} {line}"))
    }

    /// Forward a raw client frame on behalf of `session`, keeping any
    /// binary payload after the first line.
    fn forward(&self, session: &SessionId, frame: &[u8]) -> Result<(), EngineError> {
        let body = payload(frame);
        let line = first_line(frame);
        if body.is_empty() {
            self.send_to_session(session, line)
        } else {
            self.send_binary(&binary_frame(&format!("child-{session} {line}"), body))
        }
    }
}

/// Source of engines for new brokers.
pub trait EngineProvider: Send + Sync {
    /// Take an engine and route its output to `events`.
    fn acquire(&self, events: EventSender) -> Result<Box<dyn EngineChannel>, EngineError>;

    /// Engines waiting for a document.
    fn idle_count(&self) -> usize;
}

/// One frame received from an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMessage {
    /// Target session for `client-<id>` lines; `None` for document-wide output
    pub session: Option<SessionId>,
    /// First line with the session prefix removed
    pub header: String,
    /// Bytes after the first newline
    pub payload: Vec<u8>,
}

impl EngineMessage {
    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        let line = first_line(data);
        if line.trim().is_empty() {
            return Err(EngineError::Malformed(format!(
                "empty or non-UTF-8 header ({} bytes)",
                data.len()
            )));
        }
        let (session, header) = match line.strip_prefix("client-") {
            Some(rest) => {
                let (id, header) = rest
                    .split_once(' ')
                    .ok_or_else(|| EngineError::Malformed(line.to_string()))?;
                let id = Uuid::parse_str(id)
                    .map_err(|_| EngineError::Malformed(format!("bad session id `{id}`")))?;
                (Some(id), header)
            }
            None => (None, line),
        };
        Ok(Self {
            session,
            header: header.to_string(),
            payload: payload(data).to_vec(),
        })
    }

    /// First token of the header, e.g. `tile:` or `status:`.
    pub fn command(&self) -> &str {
        self.header.split_whitespace().next().unwrap_or("")
    }

    /// The message as a client frame (header, newline, payload).
    pub fn to_frame(&self) -> Vec<u8> {
        if self.payload.is_empty() {
            self.header.clone().into_bytes()
        } else {
            binary_frame(&self.header, &self.payload)
        }
    }
}

/// Engine reached over a WebSocket, bound to one broker.
pub struct WsEngine {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
}

impl WsEngine {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl EngineChannel for WsEngine {
    fn send_text(&self, line: &str) -> Result<(), EngineError> {
        log::trace!("-> engine {}: {}", self.id, line);
        self.outbound
            .send(Message::Text(line.to_string().into()))
            .map_err(|_| EngineError::Closed)
    }

    fn send_binary(&self, data: &[u8]) -> Result<(), EngineError> {
        log::trace!("-> engine {}: {}", self.id, first_line(data));
        self.outbound
            .send(Message::Binary(data.to_vec().into()))
            .map_err(|_| EngineError::Closed)
    }
}

/// An engine connection waiting for a document.
struct EngineLink {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    bind: oneshot::Sender<EventSender>,
}

impl EngineLink {
    fn is_alive(&self) -> bool {
        !self.outbound.is_closed() && !self.bind.is_closed()
    }
}

/// FIFO pool of connected, unbound engines.
#[derive(Default)]
pub struct EnginePool {
    idle: Mutex<VecDeque<EngineLink>>,
}

impl EnginePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted engine connection.
    ///
    /// Spawns the writer and reader tasks. Output from an engine that has
    /// not been bound yet is dropped.
    pub fn attach<S>(&self, ws: WebSocketStream<S>) -> Uuid
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (bind_tx, mut bind_rx) = oneshot::channel::<EventSender>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    log::warn!("Engine {id} write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let events = loop {
                tokio::select! {
                    bound = &mut bind_rx => match bound {
                        Ok(events) => break events,
                        Err(_) => return,
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            log::info!("Idle engine {id} disconnected");
                            // Bound while closing: the broker still has to hear about it
                            if let Ok(events) = bind_rx.try_recv() {
                                let _ = events.send(BrokerEvent::EngineClosed);
                            }
                            return;
                        }
                        Some(Ok(_)) => log::debug!("Dropping output from unbound engine {id}"),
                    },
                }
            };

            log::info!("Engine {id} bound to a document");
            while let Some(msg) = stream.next().await {
                let data: Vec<u8> = match msg {
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Binary(bytes)) => bytes.to_vec(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Engine {id} read failed: {e}");
                        break;
                    }
                };
                match EngineMessage::parse(&data) {
                    Ok(message) => {
                        if events.send(BrokerEvent::Engine(message)).is_err() {
                            // Broker is gone
                            return;
                        }
                    }
                    Err(e) => log::warn!("Engine {id}: {e}"),
                }
            }
            log::info!("Engine {id} disconnected");
            let _ = events.send(BrokerEvent::EngineClosed);
        });

        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(EngineLink {
                id,
                outbound: out_tx,
                bind: bind_tx,
            });
        log::info!("Engine {id} joined the pool");
        id
    }
}

impl EngineProvider for EnginePool {
    fn acquire(&self, events: EventSender) -> Result<Box<dyn EngineChannel>, EngineError> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(link) = idle.pop_front() {
            if !link.is_alive() {
                log::debug!("Skipping dead engine {}", link.id);
                continue;
            }
            if link.bind.send(events.clone()).is_err() {
                continue;
            }
            return Ok(Box::new(WsEngine {
                id: link.id,
                outbound: link.outbound,
            }));
        }
        Err(EngineError::Unavailable)
    }

    fn idle_count(&self) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.retain(EngineLink::is_alive);
        idle.len()
    }
}

#[derive(Debug, Default)]
struct Recording {
    sent: Vec<String>,
    events: Option<EventSender>,
    acquired: usize,
    closed: bool,
}

/// In-process engine that records every command it is sent.
///
/// Clones share state, so a test can keep one handle while a broker owns
/// another. Replies are injected with [`RecordingEngine::reply`].
#[derive(Debug, Clone, Default)]
pub struct RecordingEngine {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every frame sent so far, lossily decoded as text.
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Drain the recorded frames.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.state().sent)
    }

    /// Recorded frames whose text contains `needle`.
    pub fn sent_matching(&self, needle: &str) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }

    /// Times this engine was handed to a broker.
    pub fn acquired(&self) -> usize {
        self.state().acquired
    }

    /// Deliver a frame to the bound broker as if the engine sent it.
    pub fn reply(&self, frame: &[u8]) -> Result<(), EngineError> {
        let message = EngineMessage::parse(frame)?;
        let state = self.state();
        let events = state.events.as_ref().ok_or(EngineError::Unavailable)?;
        events
            .send(BrokerEvent::Engine(message))
            .map_err(|_| EngineError::Closed)
    }

    /// Simulate the engine going away: sends fail and the broker is told.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.closed = true;
        if let Some(events) = &state.events {
            let _ = events.send(BrokerEvent::EngineClosed);
        }
    }

    fn record(&self, data: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.sent.push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }
}

impl EngineChannel for RecordingEngine {
    fn send_text(&self, line: &str) -> Result<(), EngineError> {
        self.record(line.as_bytes())
    }

    fn send_binary(&self, data: &[u8]) -> Result<(), EngineError> {
        self.record(data)
    }
}

impl EngineProvider for RecordingEngine {
    fn acquire(&self, events: EventSender) -> Result<Box<dyn EngineChannel>, EngineError> {
        let mut state = self.state();
        if state.closed {
            return Err(EngineError::Unavailable);
        }
        state.events = Some(events);
        state.acquired += 1;
        Ok(Box::new(self.clone()))
    }

    fn idle_count(&self) -> usize {
        usize::from(!self.state().closed)
    }
}
