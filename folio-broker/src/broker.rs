//! Per-document broker.
//!
//! One broker owns one open document: its sessions, its tile cache, its
//! rendering engine and its save policy. It runs as a single tokio task and
//! all of its state is touched only from that task. Everyone else talks to it
//! through a [`BrokerHandle`], which posts [`BrokerEvent`]s into its queue.
//!
//! ```text
//!  connection ──ClientInput──┐
//!  connection ──AddSession───┤                    ┌──► TileCache
//!  registry ────AutoSave─────┼──► inbox ──► loop ─┼──► engine (tile, load, .uno:Save)
//!  engine reader ──Engine────┘        ▲           └──► sessions (outbound queues)
//!                                     │
//!                             interval ticker (autosave check)
//! ```
//!
//! Lifetime: `Unloaded → Loading → Loaded → (Saving ⇄ Loaded) → Destroying → Destroyed`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;
use uuid::Uuid;

use crate::engine::{EngineChannel, EngineError, EngineMessage, EngineProvider};
use crate::protocol::{
    binary_frame, error_message, get_token, tokenize, ClientCommand, CommandClass, SaveRequest,
};
use crate::registry::DocKey;
use crate::session::{ClientSession, Route, SessionId};
use crate::storage::{canonical_uri, Credentials, FileInfo, SaveResult, Storage, StorageError};
use crate::tile::{InvalidateRegion, TileBatch, TileDesc};
use crate::tile_cache::{StreamKind, TileCache, DEFAULT_MAX_CACHE_SIZE, DEFAULT_RENDER_TIMEOUT};

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Broker tunables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Save a modified document once nobody has edited it for this long
    pub idle_save_threshold: Duration,
    /// Save a modified document at least this often
    pub max_save_interval: Duration,
    /// How often the autosave policy is evaluated
    pub autosave_check_interval: Duration,
    /// How long the last session's save may take before the broker gives up
    pub final_save_timeout: Duration,
    /// Tile cache ceiling in bytes
    pub max_tile_cache_size: usize,
    /// Age after which an unanswered render is re-issued
    pub tile_render_timeout: Duration,
    /// Each broker works in `<work_root>/<broker id>/`
    pub work_root: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_save_threshold: Duration::from_secs(30),
            max_save_interval: Duration::from_secs(300),
            autosave_check_interval: Duration::from_secs(30),
            final_save_timeout: Duration::from_secs(15),
            max_tile_cache_size: DEFAULT_MAX_CACHE_SIZE,
            tile_render_timeout: DEFAULT_RENDER_TIMEOUT,
            work_root: std::env::temp_dir().join("folio"),
        }
    }
}

impl BrokerConfig {
    /// Defaults with the work directory under `work_root`.
    pub fn for_testing(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            ..Self::default()
        }
    }
}

/// Lifetime of an open document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Unloaded,
    Loading,
    Loaded,
    Saving,
    Destroying,
    Destroyed,
}

/// Counters kept by one broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub tile_requests: u64,
    pub cache_hits: u64,
    pub renders_issued: u64,
    pub renders_coalesced: u64,
    pub tiles_rendered: u64,
    pub saves_requested: u64,
    pub saves_completed: u64,
    pub engine_messages: u64,
}

/// Save completion signal shared with [`BrokerHandle`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveProgress {
    /// Saves finished, successfully or not
    pub completed: u64,
    /// Time of the last successful save
    pub last_save: Instant,
}

/// Work posted to a broker.
#[derive(Debug)]
pub enum BrokerEvent {
    /// Add a session; the broker answers the client itself if it is unloading
    AddSession(ClientSession),
    /// Add a session and report back whether it was taken
    AttachSession {
        session: ClientSession,
        attached: oneshot::Sender<Result<(), BrokerError>>,
    },
    ClientInput { session: SessionId, data: Vec<u8> },
    ClientDisconnected { session: SessionId },
    Engine(EngineMessage),
    EngineClosed,
    /// Run the autosave policy; `started` learns whether a save was issued
    AutoSave {
        force: bool,
        started: oneshot::Sender<bool>,
    },
    /// Close every session and shut down without saving
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("document is being unloaded")]
    Unloading,
    #[error("broker has stopped")]
    Stopped,
}

/// Cheap, cloneable way to reach a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    id: Uuid,
    doc_key: DocKey,
    events: EventSender,
    marked: Arc<AtomicBool>,
    progress: watch::Receiver<SaveProgress>,
}

impl BrokerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn doc_key(&self) -> &DocKey {
        &self.doc_key
    }

    pub fn is_marked_for_destruction(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        !self.events.is_closed()
    }

    /// Hand a new session to the broker without waiting for it.
    pub fn queue_session(&self, session: ClientSession) -> Result<(), BrokerError> {
        if self.is_marked_for_destruction() {
            return Err(BrokerError::Unloading);
        }
        self.events
            .send(BrokerEvent::AddSession(session))
            .map_err(|_| BrokerError::Stopped)
    }

    /// Hand a new session to the broker and wait until it is taken.
    ///
    /// Fails with [`BrokerError::Unloading`] when the broker is going away,
    /// including when the session was still queued as it stopped.
    pub async fn attach_session(&self, session: ClientSession) -> Result<(), BrokerError> {
        if self.is_marked_for_destruction() {
            return Err(BrokerError::Unloading);
        }
        let (tx, rx) = oneshot::channel();
        self.events
            .send(BrokerEvent::AttachSession {
                session,
                attached: tx,
            })
            .map_err(|_| BrokerError::Stopped)?;
        rx.await.unwrap_or(Err(BrokerError::Stopped))
    }

    pub fn client_input(&self, session: SessionId, data: Vec<u8>) -> Result<(), BrokerError> {
        self.events
            .send(BrokerEvent::ClientInput { session, data })
            .map_err(|_| BrokerError::Stopped)
    }

    pub fn disconnect(&self, session: SessionId) {
        let _ = self.events.send(BrokerEvent::ClientDisconnected { session });
    }

    pub fn stop(&self) {
        let _ = self.events.send(BrokerEvent::Stop);
    }

    /// Ask the broker to run its save policy.
    ///
    /// With a zero `wait` this returns whether a save was issued. Otherwise
    /// it waits up to `wait` for that save to finish and returns whether the
    /// document was actually stored.
    pub async fn auto_save(&self, force: bool, wait: Duration) -> bool {
        let mut progress = self.progress.clone();
        let before = *progress.borrow_and_update();
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(BrokerEvent::AutoSave { force, started: tx })
            .is_err()
        {
            return false;
        }
        let started = rx.await.unwrap_or(false);
        if !started || wait.is_zero() {
            return started;
        }
        if tokio::time::timeout(wait, progress.wait_for(|p| p.completed != before.completed))
            .await
            .is_err()
        {
            log::warn!("Timed out waiting for {} to save", self.doc_key);
        }
        let after = *progress.borrow();
        after.last_save != before.last_save
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingSave {
    session: SessionId,
    started: Instant,
    is_autosave: bool,
    is_final: bool,
}

/// `unocommandresult:` payload.
#[derive(Debug, Deserialize)]
struct UnoCommandResult {
    #[serde(rename = "commandName")]
    command_name: String,
    success: bool,
    #[serde(default)]
    result: Option<UnoResultValue>,
}

#[derive(Debug, Deserialize)]
struct UnoResultValue {
    #[serde(default)]
    value: serde_json::Value,
}

fn font_key(font: &str, character: Option<&str>) -> String {
    match character {
        Some(c) => format!("{font}|{c}"),
        None => font.to_string(),
    }
}

/// Everything after the command word of a header line.
fn header_args(header: &str) -> &str {
    header.split_once(' ').map_or("", |(_, rest)| rest.trim())
}

/// One open document.
pub struct DocumentBroker {
    id: Uuid,
    doc_key: DocKey,
    public_uri: Url,
    credentials: Credentials,
    config: BrokerConfig,
    work_dir: PathBuf,
    local_path: Option<PathBuf>,
    file_info: Option<FileInfo>,
    storage: Arc<dyn Storage>,
    engine: Box<dyn EngineChannel>,
    engine_alive: bool,
    sessions: IndexMap<SessionId, ClientSession>,
    edit_lock_holder: Option<SessionId>,
    tile_cache: TileCache,
    state: DocumentState,
    modified: bool,
    last_save_time: Instant,
    last_activity_time: Instant,
    /// Modification time of the work copy when it was last stored
    last_file_modified: Option<SystemTime>,
    pending_save: Option<PendingSave>,
    final_save_deadline: Option<Instant>,
    marked: Arc<AtomicBool>,
    progress: watch::Sender<SaveProgress>,
    inbox: Option<EventReceiver>,
    stats: BrokerStats,
}

impl DocumentBroker {
    /// Create a broker for `uri` and bind an engine to it.
    pub fn new(
        uri: &Url,
        config: BrokerConfig,
        storage: Arc<dyn Storage>,
        engines: &dyn EngineProvider,
    ) -> Result<(Self, BrokerHandle), EngineError> {
        let (events, inbox) = event_channel();
        let engine = engines.acquire(events.clone())?;
        let id = Uuid::new_v4();
        let doc_key = DocKey::from_uri(uri);
        let now = Instant::now();
        let marked = Arc::new(AtomicBool::new(false));
        let (progress, progress_rx) = watch::channel(SaveProgress {
            completed: 0,
            last_save: now,
        });

        let handle = BrokerHandle {
            id,
            doc_key: doc_key.clone(),
            events,
            marked: marked.clone(),
            progress: progress_rx,
        };
        let broker = Self {
            id,
            doc_key,
            public_uri: canonical_uri(uri),
            credentials: Credentials::from_uri(uri),
            work_dir: config.work_root.join(id.to_string()),
            tile_cache: TileCache::new(config.max_tile_cache_size, config.tile_render_timeout),
            config,
            local_path: None,
            file_info: None,
            storage,
            engine,
            engine_alive: true,
            sessions: IndexMap::new(),
            edit_lock_holder: None,
            state: DocumentState::Unloaded,
            modified: false,
            last_save_time: now,
            last_activity_time: now,
            last_file_modified: None,
            pending_save: None,
            final_save_deadline: None,
            marked,
            progress,
            inbox: Some(inbox),
            stats: BrokerStats::default(),
        };
        Ok((broker, handle))
    }

    /// Drive the broker until the document is destroyed.
    pub async fn run(mut self) {
        let Some(mut inbox) = self.inbox.take() else {
            log::error!("Broker {} started twice", self.id);
            return;
        };
        let mut ticker = tokio::time::interval(self.config.autosave_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        log::info!("Broker {} started for {}", self.id, self.doc_key);

        while self.state != DocumentState::Destroyed {
            let deadline = self.final_save_deadline;
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        log::debug!("Broker {} inbox closed", self.id);
                        self.destroy().await;
                    }
                },
                _ = ticker.tick() => self.on_timer().await,
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => self.on_final_save_timeout().await,
            }
        }
        inbox.close();
        while let Ok(event) = inbox.try_recv() {
            Self::refuse(event);
        }
        log::info!("Broker {} for {} finished", self.id, self.doc_key);
    }

    /// Process one event. `run` calls this for every queued event.
    pub async fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::AddSession(session) => self.add_session(session).await,
            BrokerEvent::AttachSession { session, attached } => {
                let result = if self.is_marked_for_destruction() {
                    Err(BrokerError::Unloading)
                } else {
                    self.add_session(session).await;
                    Ok(())
                };
                let _ = attached.send(result);
            }
            BrokerEvent::ClientInput { session, data } => self.handle_client_input(session, &data),
            BrokerEvent::ClientDisconnected { session } => self.remove_session(&session).await,
            BrokerEvent::Engine(message) => self.handle_engine_message(message).await,
            BrokerEvent::EngineClosed => self.on_engine_closed().await,
            BrokerEvent::AutoSave { force, started } => {
                let issued = self.auto_save(force);
                let _ = started.send(issued);
            }
            BrokerEvent::Stop => {
                log::info!("Stopping broker for {}", self.doc_key);
                self.destroy().await;
            }
        }
    }

    /// Answer an event that arrived after the broker stopped.
    fn refuse(event: BrokerEvent) {
        match event {
            BrokerEvent::AddSession(mut session) => {
                session.send_error("load", "docunloading");
                session.close();
            }
            BrokerEvent::AttachSession { attached, .. } => {
                let _ = attached.send(Err(BrokerError::Unloading));
            }
            BrokerEvent::AutoSave { started, .. } => {
                let _ = started.send(false);
            }
            _ => {}
        }
    }

    // ── Sessions ────────────────────────────────────────────────────────

    fn mark_for_destruction(&mut self) {
        self.marked.store(true, Ordering::Release);
    }

    async fn load_on_first_use(&mut self) -> Result<(), StorageError> {
        if self.local_path.is_some() {
            return Ok(());
        }
        self.state = DocumentState::Loading;
        let (local_path, info) = self
            .storage
            .load_file(&self.public_uri, &self.credentials, &self.work_dir)
            .await?;
        self.last_file_modified = tokio::fs::metadata(&local_path)
            .await
            .and_then(|m| m.modified())
            .ok();
        log::info!(
            "Loaded {} ({} bytes) into {}",
            info.filename,
            info.size,
            local_path.display()
        );
        self.local_path = Some(local_path);
        self.file_info = Some(info);
        Ok(())
    }

    /// Add a session, loading the document on first use. The first session
    /// gets the edit lock.
    pub async fn add_session(&mut self, mut session: ClientSession) {
        let id = session.id();
        if self.is_marked_for_destruction() {
            session.send_error("load", "docunloading");
            session.close();
            return;
        }

        if let Err(e) = self.load_on_first_use().await {
            log::error!("Loading {} for session {} failed: {}", self.doc_key, id, e);
            session.send_error("load", e.kind());
            session.close();
            self.state = DocumentState::Unloaded;
            if self.sessions.is_empty() {
                self.destroy().await;
            }
            return;
        }

        let first = self.sessions.is_empty();
        session.set_edit_lock(first);
        if first {
            self.edit_lock_holder = Some(id);
        }
        log::info!(
            "Session {} ({}) joined {}; {} sessions",
            id,
            session.user().user_name,
            self.doc_key,
            self.sessions.len() + 1
        );
        self.sessions.insert(id, session);
    }

    /// Remove a session.
    ///
    /// A lock it held moves to the first remaining session. When the last
    /// session leaves a modified document, a save is issued on its behalf and
    /// the broker waits for it (bounded) before destroying itself.
    pub async fn remove_session(&mut self, id: &SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            log::debug!("Session {id} already removed");
            return;
        };
        session.mark_disconnected();
        session.mark_closing();

        let last = self.sessions.len() == 1;
        if last {
            self.mark_for_destruction();
            if self.modified && self.engine_alive && self.pending_save.is_none() {
                log::info!("Last session left modified {}; saving", self.doc_key);
                if self.issue_save(*id, true, false, true, true) {
                    self.final_save_deadline =
                        Some(Instant::now() + self.config.final_save_timeout);
                }
            }
        }

        self.cancel_tiles(id);
        if self.engine_alive {
            self.to_engine_for(id, "disconnect");
        }

        if let Some(mut removed) = self.sessions.shift_remove(id) {
            removed.close();
        }
        if self.edit_lock_holder == Some(*id) {
            self.edit_lock_holder = None;
            if let Some((next_id, next)) = self.sessions.first_mut() {
                next.set_edit_lock(true);
                self.edit_lock_holder = Some(*next_id);
                log::info!("Edit lock passed to {next_id}");
            }
        }
        log::info!(
            "Session {} left {}; {} sessions",
            id,
            self.doc_key,
            self.sessions.len()
        );

        if self.sessions.is_empty() {
            if self.pending_save.is_some() {
                self.state = DocumentState::Destroying;
            } else {
                self.destroy().await;
            }
        }
    }

    /// Give the edit lock to `id` alone and tell every session.
    pub fn take_edit_lock(&mut self, id: &SessionId) -> bool {
        if !self.sessions.contains_key(id) {
            return false;
        }
        for (sid, session) in self.sessions.iter_mut() {
            session.set_edit_lock(sid == id);
        }
        self.edit_lock_holder = Some(*id);
        log::debug!("Session {id} took the edit lock on {}", self.doc_key);
        true
    }

    fn handle_client_input(&mut self, id: SessionId, data: &[u8]) {
        let Some(session) = self.sessions.get_mut(&id) else {
            log::warn!("Input for unknown session {id} on {}", self.doc_key);
            return;
        };
        match session.route(data) {
            Route::Ignore => {}
            Route::Reply(text) => {
                session.send_text(text);
            }
            Route::Reject { cmd, kind, close } => {
                log::debug!("Session {id}: rejected `{cmd}` ({kind})");
                session.send_error(&cmd, kind);
                if close {
                    session.close();
                }
            }
            Route::Forward(command) => self.handle_command(id, command, data),
        }
    }

    fn handle_command(&mut self, id: SessionId, command: ClientCommand, data: &[u8]) {
        match command {
            ClientCommand::Handshake { .. } => {}
            ClientCommand::Load(request) => {
                let target = Url::parse(&request.url).map(|u| DocKey::from_uri(&u));
                let local_url = self.local_path.as_deref().map(|path| {
                    Url::from_file_path(path)
                        .map(String::from)
                        .unwrap_or_else(|_| path.display().to_string())
                });
                match (target, local_url) {
                    (Ok(key), Some(local_url)) if key == self.doc_key => {
                        let line = request.engine_command(&local_url, self.public_uri.as_str());
                        self.last_activity_time = Instant::now();
                        if !self.to_engine_for(&id, &line) {
                            self.send_error_to(&id, "load", "enginedied");
                        }
                    }
                    _ => {
                        log::warn!("Session {id} asked to load `{}` on {}", request.url, self.doc_key);
                        if let Some(session) = self.sessions.get_mut(&id) {
                            session.send_error("load", "syntax");
                            session.close();
                        }
                    }
                }
            }
            ClientCommand::Tile(desc) => self.handle_tile_request(desc, id),
            ClientCommand::TileCombine(batch) => self.handle_tile_batch(batch, id),
            ClientCommand::CancelTiles => self.cancel_tiles(&id),
            ClientCommand::Status => {
                self.reply_from_stream(id, StreamKind::Status, "status", data);
            }
            ClientCommand::CommandValues { command } => {
                self.reply_from_stream(id, StreamKind::CommandValues, &command, data);
            }
            ClientCommand::RenderFont { font, character } => {
                let key = font_key(&font, character.as_deref());
                self.reply_from_stream(id, StreamKind::Font, &key, data);
            }
            ClientCommand::TakeEdit => {
                self.take_edit_lock(&id);
            }
            ClientCommand::Save(request) => self.save_on_behalf(id, request),
            ClientCommand::UserActive => self.set_user_active(id, true, data),
            ClientCommand::UserInactive => self.set_user_active(id, false, data),
            ClientCommand::Forward { class, .. } => {
                if class == CommandClass::Mutating {
                    self.last_activity_time = Instant::now();
                }
                self.forward_to_engine(&id, data);
            }
        }
    }

    fn set_user_active(&mut self, id: SessionId, active: bool, data: &[u8]) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_active(active);
        }
        if active {
            self.last_activity_time = Instant::now();
        }
        self.forward_to_engine(&id, data);
    }

    fn reply_from_stream(&self, id: SessionId, kind: StreamKind, name: &str, data: &[u8]) {
        match (self.tile_cache.lookup_stream(kind, name), self.sessions.get(&id)) {
            (Some(cached), Some(session)) => {
                if kind == StreamKind::Font {
                    session.send_binary(cached.to_vec());
                } else {
                    session.send_text(String::from_utf8_lossy(cached).into_owned());
                }
            }
            _ => self.forward_to_engine(&id, data),
        }
    }

    // ── Tiles ───────────────────────────────────────────────────────────

    /// Answer a tile from cache or make sure exactly one render is in flight.
    pub fn handle_tile_request(&mut self, desc: TileDesc, session: SessionId) {
        self.stats.tile_requests += 1;
        if let Some(data) = self.tile_cache.lookup(&desc) {
            self.stats.cache_hits += 1;
            let header = desc.serialize("tile:", " renderid=cached");
            if let Some(s) = self.sessions.get(&session) {
                s.send_binary(binary_frame(&header, data));
            }
            return;
        }

        if self
            .tile_cache
            .subscribe_to_render(&desc, session, Instant::now())
        {
            self.stats.renders_coalesced += 1;
            return;
        }
        if let Some(render) = self.tile_cache.pending(&desc.key()) {
            let line = render.render_desc().serialize("tile", "");
            self.stats.renders_issued += 1;
            self.to_engine(&line);
        }
    }

    /// Serve a batch: cache hits go back at once as one `tilecombine:`
    /// frame, misses are rendered with as few engine commands as possible.
    pub fn handle_tile_batch(&mut self, batch: TileBatch, session: SessionId) {
        let now = Instant::now();
        let mut hits = Vec::new();
        let mut hit_data = Vec::new();
        let mut misses = Vec::new();

        for mut desc in batch.into_tiles() {
            self.stats.tile_requests += 1;
            if let Some(data) = self.tile_cache.lookup(&desc) {
                self.stats.cache_hits += 1;
                desc.img_size = Some(data.len());
                hit_data.extend_from_slice(data);
                hits.push(desc);
                continue;
            }
            if self.tile_cache.subscribe_to_render(&desc, session, now) {
                self.stats.renders_coalesced += 1;
            } else if let Some(render) = self.tile_cache.pending(&desc.key()) {
                misses.push(render.render_desc());
            }
        }

        if !hits.is_empty() {
            if let (Ok(reply), Some(s)) = (TileBatch::new(hits), self.sessions.get(&session)) {
                let header = reply.serialize("tilecombine:", " renderid=cached");
                s.send_binary(binary_frame(&header, &hit_data));
            }
        }

        self.stats.renders_issued += misses.len() as u64;
        match misses.len() {
            0 => {}
            1 => {
                let line = misses[0].serialize("tile", "");
                self.to_engine(&line);
            }
            _ => match TileBatch::new(misses.clone()) {
                Ok(batch) => {
                    let line = batch.serialize("tilecombine", "");
                    self.to_engine(&line);
                }
                Err(e) => {
                    log::warn!("Cannot combine {} renders ({e}); sending singly", misses.len());
                    for desc in &misses {
                        let line = desc.serialize("tile", "");
                        self.to_engine(&line);
                    }
                }
            },
        }
    }

    fn cancel_tiles(&mut self, id: &SessionId) {
        let orphans = self.tile_cache.cancel_subscriptions(id);
        if orphans.is_empty() || !self.engine_alive {
            return;
        }
        let wids = orphans
            .iter()
            .map(|desc| desc.wire_id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.to_engine(&format!("canceltiles {wids}"));
    }

    /// Evict the region named by an `invalidatetiles:` line.
    pub fn invalidate_tiles(&mut self, line: &str) -> usize {
        match InvalidateRegion::parse(line) {
            Ok(region) => {
                let removed = self.tile_cache.invalidate(&region);
                log::trace!("Invalidated {removed} tiles in {region:?}");
                removed
            }
            Err(e) => {
                log::warn!("Bad invalidation `{line}`: {e}");
                0
            }
        }
    }

    // ── Saving ──────────────────────────────────────────────────────────

    fn should_save(&self, now: Instant) -> bool {
        if !self.modified {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_activity_time);
        let since_save = now.saturating_duration_since(self.last_save_time);
        idle >= self.config.idle_save_threshold || since_save >= self.config.max_save_interval
    }

    /// Run the save policy. Returns whether a save was issued.
    ///
    /// Saves when forced, or when the document is modified and either idle
    /// long enough or unsaved for too long. The save runs on behalf of the
    /// edit-lock holder; with no holder there is nobody to save as.
    pub fn auto_save(&mut self, force: bool) -> bool {
        if self.pending_save.is_some() {
            log::debug!("Save already in flight for {}", self.doc_key);
            return false;
        }
        if !self.engine_alive || self.local_path.is_none() {
            return false;
        }
        if !force && !self.should_save(Instant::now()) {
            return false;
        }
        let Some(holder) = self.edit_lock_holder else {
            log::error!("Cannot save {}: no session holds the edit lock", self.doc_key);
            return false;
        };
        log::info!(
            "{} {}",
            if force { "Forced save of" } else { "Autosaving" },
            self.doc_key
        );
        self.issue_save(holder, true, !force, true, false)
    }

    fn save_on_behalf(&mut self, id: SessionId, request: SaveRequest) {
        if self.pending_save.is_some() {
            log::debug!("Session {id} asked to save while a save is in flight");
            self.send_error_to(&id, "save", "busy");
            return;
        }
        self.issue_save(
            id,
            request.dont_terminate_edit,
            request.dont_save_if_unmodified,
            false,
            false,
        );
    }

    fn issue_save(
        &mut self,
        session: SessionId,
        dont_terminate_edit: bool,
        dont_save_if_unmodified: bool,
        is_autosave: bool,
        is_final: bool,
    ) -> bool {
        let args = serde_json::json!({
            "DontTerminateEdit": { "type": "boolean", "value": dont_terminate_edit },
            "DontSaveIfUnmodified": { "type": "boolean", "value": dont_save_if_unmodified },
        });
        if !self.to_engine_for(&session, &format!("uno .uno:Save {args}")) {
            return false;
        }
        self.pending_save = Some(PendingSave {
            session,
            started: Instant::now(),
            is_autosave,
            is_final,
        });
        if self.state == DocumentState::Loaded {
            self.state = DocumentState::Saving;
        }
        self.stats.saves_requested += 1;
        true
    }

    /// Store the engine's saved work copy.
    ///
    /// An unchanged work copy is not uploaded again unless this is the final
    /// save. Disk-full and conflict outcomes concern everyone and are
    /// broadcast; other failures go to `session` only.
    pub async fn save_to_storage(&mut self, session: SessionId, success: bool, result: &str) -> bool {
        let pending = self.pending_save.take();
        let is_autosave = pending.is_some_and(|p| p.is_autosave);
        let is_final = pending.map_or(self.is_marked_for_destruction(), |p| p.is_final);
        let saved = self
            .store_work_copy(session, success, result, is_autosave, is_final)
            .await;
        self.finish_save(saved).await;
        saved
    }

    async fn store_work_copy(
        &mut self,
        session: SessionId,
        success: bool,
        result: &str,
        is_autosave: bool,
        is_final: bool,
    ) -> bool {
        if !success {
            if result == "unmodified" {
                log::debug!("Engine skipped saving unmodified {}", self.doc_key);
            } else {
                log::error!("Engine failed to save {}: {}", self.doc_key, result);
                self.send_error_to(&session, "save", "failed");
            }
            return false;
        }
        let Some(local_path) = self.local_path.clone() else {
            return false;
        };

        let modified_time = tokio::fs::metadata(&local_path)
            .await
            .and_then(|m| m.modified())
            .ok();
        let now = Instant::now();
        if !is_final && modified_time.is_some() && modified_time == self.last_file_modified {
            log::debug!("{} unchanged on disk; skipping upload", local_path.display());
            self.modified = false;
            self.last_save_time = now;
            return true;
        }

        let outcome = self
            .storage
            .save_file(&local_path, &self.public_uri, &self.credentials, is_autosave)
            .await;
        match outcome {
            SaveResult::Ok => {
                self.modified = false;
                self.last_file_modified = modified_time;
                self.last_save_time = now;
                self.stats.saves_completed += 1;
                log::info!("Saved {}", self.doc_key);
                true
            }
            SaveResult::DiskFull => {
                log::error!("Disk full while saving {}; all sessions now read-only", self.doc_key);
                for s in self.sessions.values_mut() {
                    s.send_error("storage", "savediskfull");
                    s.set_read_only();
                }
                false
            }
            SaveResult::Conflict => {
                log::warn!("{} was changed by someone else", self.doc_key);
                self.broadcast_text(&error_message("storage", "documentconflict"));
                false
            }
            SaveResult::Unauthorized => {
                log::error!("Not authorized to save {}", self.doc_key);
                self.send_error_to(&session, "storage", "saveunauthorized");
                false
            }
            SaveResult::Failed => {
                log::error!("Saving {} failed", self.doc_key);
                self.send_error_to(&session, "storage", "savefailed");
                false
            }
        }
    }

    async fn finish_save(&mut self, saved: bool) {
        if self.state == DocumentState::Saving {
            self.state = DocumentState::Loaded;
        }
        let last_save = self.last_save_time;
        self.progress.send_modify(|p| {
            p.completed += 1;
            if saved {
                p.last_save = last_save;
            }
        });
        if self.is_marked_for_destruction() && self.sessions.is_empty() {
            self.final_save_deadline = None;
            self.destroy().await;
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        if let Some(pending) = self.pending_save {
            let age = now.saturating_duration_since(pending.started);
            if !pending.is_final && age > self.config.final_save_timeout {
                log::warn!("Save of {} never completed; giving up", self.doc_key);
                self.pending_save = None;
                self.finish_save(false).await;
            }
        }
        if self.state == DocumentState::Loaded && !self.is_marked_for_destruction() {
            self.auto_save(false);
        }
    }

    async fn on_final_save_timeout(&mut self) {
        self.final_save_deadline = None;
        if self.pending_save.take().is_some() {
            log::warn!("Final save of {} timed out", self.doc_key);
            self.finish_save(false).await;
        } else if self.sessions.is_empty() {
            self.destroy().await;
        }
    }

    // ── Engine output ───────────────────────────────────────────────────

    async fn handle_engine_message(&mut self, message: EngineMessage) {
        self.stats.engine_messages += 1;
        log::trace!("<- engine: {}", message.header);
        let command = message.command().to_string();
        match command.as_str() {
            "tile:" => self.on_tile_rendered(message),
            "tilecombine:" => self.on_tiles_rendered(message),
            "error:" => self.on_engine_error(message),
            "status:" => {
                if let Some(id) = message.session {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.mark_loaded();
                    }
                }
                if self.state == DocumentState::Loading {
                    self.state = DocumentState::Loaded;
                    log::info!("{} is loaded", self.doc_key);
                }
                self.tile_cache
                    .save_stream(StreamKind::Status, "status", message.header.clone().into_bytes());
                self.forward_to_clients(&message);
            }
            "invalidatetiles:" => {
                self.invalidate_tiles(&message.header);
                self.forward_to_clients(&message);
            }
            "statechanged:" => {
                let tokens = tokenize(&message.header);
                if let Some(value) = get_token(&tokens, ".uno:ModifiedStatus") {
                    self.modified = value == "true";
                    log::debug!("{} modified: {}", self.doc_key, self.modified);
                }
                self.forward_to_clients(&message);
            }
            "unocommandresult:" => {
                match serde_json::from_str::<UnoCommandResult>(header_args(&message.header)) {
                    Ok(result) if result.command_name == ".uno:Save" => {
                        let value = result.result.map(|r| match r.value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        });
                        let session = message
                            .session
                            .or(self.pending_save.map(|p| p.session))
                            .unwrap_or_default();
                        self.save_to_storage(session, result.success, value.as_deref().unwrap_or(""))
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Bad command result from engine: {e}"),
                }
                self.forward_to_clients(&message);
            }
            "commandvalues:" => {
                let json: Result<serde_json::Value, _> =
                    serde_json::from_str(header_args(&message.header));
                match json.as_ref().ok().and_then(|v| v.get("commandName")?.as_str()) {
                    Some(name) => self.tile_cache.save_stream(
                        StreamKind::CommandValues,
                        name,
                        message.header.clone().into_bytes(),
                    ),
                    None => log::warn!("commandvalues without commandName"),
                }
                self.forward_to_clients(&message);
            }
            "renderfont:" => {
                let tokens = tokenize(&message.header);
                if let Some(font) = get_token(&tokens, "font") {
                    let key = font_key(font, get_token(&tokens, "char"));
                    self.tile_cache
                        .save_stream(StreamKind::Font, &key, message.to_frame());
                }
                self.forward_to_clients(&message);
            }
            _ => self.forward_to_clients(&message),
        }
    }

    fn on_tile_rendered(&mut self, message: EngineMessage) {
        let desc = match TileDesc::parse(&message.header) {
            Ok(desc) => desc,
            Err(e) => {
                log::warn!("Malformed tile from engine: {e}");
                return;
            }
        };
        self.stats.tiles_rendered += 1;
        let delivered = self
            .tile_cache
            .save_and_notify(&desc, message.payload, &self.sessions);
        log::trace!("Tile delivered to {delivered} sessions");
    }

    fn on_tiles_rendered(&mut self, message: EngineMessage) {
        let batch = match TileBatch::parse(&message.header) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Malformed tilecombine from engine: {e}");
                return;
            }
        };
        let mut offset = 0;
        let mut rendered = Vec::with_capacity(batch.len());
        for desc in batch.into_tiles() {
            let Some(size) = desc.img_size else {
                log::warn!("tilecombine from engine without imgsize");
                return;
            };
            let Some(bytes) = message.payload.get(offset..offset + size) else {
                log::warn!("tilecombine from engine is truncated");
                return;
            };
            offset += size;
            rendered.push((desc, bytes.to_vec()));
        }
        self.stats.tiles_rendered += rendered.len() as u64;
        let delivered = self
            .tile_cache
            .save_and_notify_batch(rendered, &self.sessions);
        log::trace!("Combined tiles delivered to {delivered} sessions");
    }

    fn on_engine_error(&mut self, message: EngineMessage) {
        let tokens = tokenize(&message.header);
        if get_token(&tokens, "cmd") == Some("tile") {
            let kind = get_token(&tokens, "kind").unwrap_or("internal");
            match TileDesc::parse(&message.header) {
                Ok(desc) => {
                    if let Some(render) = self.tile_cache.forget_render(&desc.key()) {
                        log::debug!("Engine declined render {}: {kind}", render.render_id());
                        for id in render.subscribers() {
                            self.send_error_to(id, "tile", kind);
                        }
                    }
                }
                Err(e) => log::warn!("Tile error without tile fields: {e}"),
            }
            return;
        }
        self.forward_to_clients(&message);
    }

    async fn on_engine_closed(&mut self) {
        if !self.engine_alive {
            return;
        }
        self.engine_alive = false;
        log::error!("Engine for {} died", self.doc_key);
        self.mark_for_destruction();
        self.tile_cache.clear();
        if self.pending_save.take().is_some() {
            self.finish_save(false).await;
        }
        for session in self.sessions.values_mut() {
            session.send_error("internal", "enginedied");
            session.close();
        }
        if self.sessions.is_empty() {
            self.destroy().await;
        }
    }

    async fn destroy(&mut self) {
        if self.state == DocumentState::Destroyed {
            return;
        }
        self.mark_for_destruction();
        self.state = DocumentState::Destroyed;
        self.final_save_deadline = None;
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
        self.edit_lock_holder = None;
        self.tile_cache.clear();
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Removing {} failed: {}", self.work_dir.display(), e);
            }
        }
        log::info!("{} destroyed", self.doc_key);
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    fn to_engine(&self, line: &str) -> bool {
        match self.engine.send_text(line) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Sending to engine for {} failed: {}", self.doc_key, e);
                false
            }
        }
    }

    fn to_engine_for(&self, session: &SessionId, line: &str) -> bool {
        match self.engine.send_to_session(session, line) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Sending to engine for {} failed: {}", self.doc_key, e);
                false
            }
        }
    }

    fn forward_to_engine(&self, session: &SessionId, data: &[u8]) {
        if let Err(e) = self.engine.forward(session, data) {
            log::warn!("Forwarding to engine for {} failed: {}", self.doc_key, e);
        }
    }

    fn send_error_to(&self, session: &SessionId, cmd: &str, kind: &str) {
        if let Some(s) = self.sessions.get(session) {
            s.send_error(cmd, kind);
        }
    }

    fn broadcast_text(&self, text: &str) {
        for session in self.sessions.values() {
            session.send_text(text);
        }
    }

    /// Route engine output: to its session if prefixed, else to every
    /// loaded session.
    fn forward_to_clients(&self, message: &EngineMessage) {
        let send = |session: &ClientSession| {
            if message.payload.is_empty() {
                session.send_text(message.header.clone())
            } else {
                session.send_binary(message.to_frame())
            }
        };
        match message.session {
            Some(id) => match self.sessions.get(&id) {
                Some(session) => {
                    send(session);
                }
                None => log::debug!("Engine output for departed session {id}"),
            },
            None => {
                for session in self.sessions.values().filter(|s| s.is_loaded()) {
                    send(session);
                }
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn doc_key(&self) -> &DocKey {
        &self.doc_key
    }

    pub fn session(&self, id: &SessionId) -> Option<&ClientSession> {
        self.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn edit_lock_holder(&self) -> Option<SessionId> {
        self.edit_lock_holder
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_marked_for_destruction(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub fn has_pending_save(&self) -> bool {
        self.pending_save.is_some()
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.tile_cache
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.file_info.as_ref()
    }

    pub fn last_save_time(&self) -> Instant {
        self.last_save_time
    }
}
