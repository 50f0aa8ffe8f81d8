//! Per-connection client session.
//!
//! A session is owned by its document broker. It keeps the user's
//! permissions and edit-lock flag, decides which commands may reach the
//! broker, and queues outbound frames for the connection's writer task.
//!
//! State machine: `Connected → AwaitingLoad → Loaded → Closing → Closed`.

use indexmap::IndexMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{error_message, ClientCommand, CommandClass, ProtocolError, PROTOCOL_VERSION};
use crate::tile_cache::TileSubscribers;

/// Identity of one client connection.
pub type SessionId = Uuid;

/// Lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, no `load` yet
    Connected,
    /// `load` forwarded, waiting for the engine's status
    AwaitingLoad,
    /// Document open in this session
    Loaded,
    /// Removal from the broker in progress
    Closing,
    /// Removed; no further frames are sent
    Closed,
}

/// Frame queued for the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Close the connection after everything queued before it
    Close,
}

/// Who is on the other end of the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Outcome of checking one inbound client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Nothing to do (blank frame)
    Ignore,
    /// Answer directly with this text
    Reply(String),
    /// Answer with `error: cmd=<cmd> kind=<kind>`, optionally closing afterwards
    Reject {
        cmd: String,
        kind: &'static str,
        close: bool,
    },
    /// Hand the command to the broker
    Forward(ClientCommand),
}

/// One connected client.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    user: UserInfo,
    read_only: bool,
    has_edit_lock: bool,
    active: bool,
    state: SessionState,
    disconnected: bool,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl ClientSession {
    pub fn new(
        id: SessionId,
        user: UserInfo,
        read_only: bool,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        Self {
            id,
            user,
            read_only,
            has_edit_lock: false,
            active: true,
            state: SessionState::Connected,
            disconnected: false,
            outbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn has_edit_lock(&self) -> bool {
        self.has_edit_lock
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == SessionState::Loaded
    }

    /// Whether frames can still reach the client.
    pub fn is_connected(&self) -> bool {
        !self.disconnected && !self.outbound.is_closed()
    }

    fn push(&self, frame: OutboundFrame) -> bool {
        if self.disconnected || matches!(self.state, SessionState::Closed) {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(OutboundFrame::Text(text.into()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.push(OutboundFrame::Binary(data))
    }

    pub fn send_error(&self, cmd: &str, kind: &str) -> bool {
        self.send_text(error_message(cmd, kind))
    }

    /// Queue a close and stop sending.
    pub fn close(&mut self) {
        self.push(OutboundFrame::Close);
        self.state = SessionState::Closed;
    }

    /// Update the lock flag and tell the client.
    pub fn set_edit_lock(&mut self, locked: bool) {
        self.has_edit_lock = locked;
        self.send_text(format!("editlock: {}", u8::from(locked)));
    }

    /// Force the session read-only (e.g. the disk is full).
    pub fn set_read_only(&mut self) {
        if self.read_only {
            return;
        }
        self.read_only = true;
        self.send_text("perm: readonly");
    }

    pub fn mark_loaded(&mut self) {
        if self.state == SessionState::AwaitingLoad {
            self.state = SessionState::Loaded;
        }
    }

    pub fn mark_closing(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }

    /// Decide what to do with one inbound frame.
    ///
    /// Only the handshake and `load` pass before the document is loaded.
    /// Read-only sessions may not run lock or mutating commands, and mutating
    /// commands also need the edit lock.
    pub fn route(&mut self, data: &[u8]) -> Route {
        let command = match ClientCommand::parse(data) {
            Ok(command) => command,
            Err(ProtocolError::Empty) => return Route::Ignore,
            Err(ProtocolError::UnknownCommand(cmd)) => {
                return Route::Reject {
                    cmd,
                    kind: "unknown",
                    close: false,
                }
            }
            Err(ProtocolError::Syntax { cmd, reason }) => {
                log::warn!("Session {}: bad syntax in `{}`: {}", self.id, cmd, reason);
                let close = cmd == "load";
                return Route::Reject {
                    cmd,
                    kind: "syntax",
                    close,
                };
            }
        };

        let rejection = match command.class() {
            CommandClass::Handshake => {
                return Route::Reply(format!("folioserver {PROTOCOL_VERSION}"));
            }
            CommandClass::Load if self.state != SessionState::Connected => Some("alreadyloaded"),
            CommandClass::Load => {
                self.state = SessionState::AwaitingLoad;
                None
            }
            _ if self.state != SessionState::Loaded => Some("nodocloaded"),
            CommandClass::Lock | CommandClass::Mutating if self.read_only => Some("readonly"),
            CommandClass::Mutating if !self.has_edit_lock => Some("editlock"),
            _ => None,
        };

        match rejection {
            Some(kind) => Route::Reject {
                cmd: command.name().to_string(),
                kind,
                close: false,
            },
            None => Route::Forward(command),
        }
    }
}

impl TileSubscribers for IndexMap<SessionId, ClientSession> {
    fn deliver(&self, session: &SessionId, frame: Vec<u8>) -> bool {
        self.get(session)
            .filter(|s| s.is_connected())
            .is_some_and(|s| s.send_binary(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(read_only: bool) -> (ClientSession, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = ClientSession::new(Uuid::new_v4(), UserInfo::new("u1", "Alice"), read_only, tx);
        (s, rx)
    }

    fn loaded(read_only: bool) -> (ClientSession, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (mut s, rx) = session(read_only);
        assert!(matches!(s.route(b"load url=file:///a.odt"), Route::Forward(_)));
        s.mark_loaded();
        (s, rx)
    }

    fn kind(route: Route) -> &'static str {
        match route {
            Route::Reject { kind, .. } => kind,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_reply() {
        let (mut s, _rx) = session(false);
        assert_eq!(s.route(b"folioclient 1.0"), Route::Reply("folioserver 1.0".into()));
    }

    #[test]
    fn test_commands_before_load_are_rejected() {
        let (mut s, _rx) = session(false);
        assert_eq!(
            kind(s.route(b"tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840")),
            "nodocloaded"
        );
        assert_eq!(kind(s.route(b"status")), "nodocloaded");
        assert_eq!(s.route(b""), Route::Ignore);
    }

    #[test]
    fn test_second_load_rejected() {
        let (mut s, _rx) = session(false);
        assert!(matches!(s.route(b"load url=x"), Route::Forward(_)));
        assert_eq!(s.state(), SessionState::AwaitingLoad);
        assert_eq!(kind(s.route(b"load url=x")), "alreadyloaded");
        s.mark_loaded();
        assert_eq!(kind(s.route(b"load url=x")), "alreadyloaded");
    }

    #[test]
    fn test_bad_load_closes() {
        let (mut s, _rx) = session(false);
        assert_eq!(
            s.route(b"load part=2"),
            Route::Reject {
                cmd: "load".into(),
                kind: "syntax",
                close: true
            }
        );
    }

    #[test]
    fn test_unknown_command() {
        let (mut s, _rx) = loaded(false);
        assert_eq!(
            s.route(b"dance"),
            Route::Reject {
                cmd: "dance".into(),
                kind: "unknown",
                close: false
            }
        );
    }

    #[test]
    fn test_read_only_gating() {
        let (mut s, _rx) = loaded(true);
        assert_eq!(kind(s.route(b"key type=input char=97 key=0")), "readonly");
        assert_eq!(kind(s.route(b"takeedit")), "readonly");
        assert_eq!(kind(s.route(b"uno .uno:Bold")), "readonly");
        assert!(matches!(s.route(b"uno .uno:ExecuteSearch {}"), Route::Forward(_)));
        assert!(matches!(s.route(b"downloadas name=a.pdf"), Route::Forward(_)));
        assert!(matches!(s.route(b"useractive"), Route::Forward(_)));
        assert!(matches!(
            s.route(b"tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840"),
            Route::Forward(ClientCommand::Tile(_))
        ));
    }

    #[test]
    fn test_mutating_needs_edit_lock() {
        let (mut s, mut rx) = loaded(false);
        assert_eq!(kind(s.route(b"key type=input char=97 key=0")), "editlock");
        assert!(matches!(s.route(b"takeedit"), Route::Forward(ClientCommand::TakeEdit)));

        s.set_edit_lock(true);
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text("editlock: 1".into()));
        assert!(matches!(s.route(b"key type=input char=97 key=0"), Route::Forward(_)));

        s.set_edit_lock(false);
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text("editlock: 0".into()));
        assert_eq!(kind(s.route(b"key type=input char=97 key=0")), "editlock");
    }

    #[test]
    fn test_forced_read_only_notifies() {
        let (mut s, mut rx) = loaded(false);
        s.set_read_only();
        assert!(s.is_read_only());
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Text("perm: readonly".into()));
    }

    #[test]
    fn test_closed_session_drops_frames() {
        let (mut s, mut rx) = loaded(false);
        s.close();
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Close);
        assert!(!s.send_text("late"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deliver_skips_dropped_receiver() {
        let (s, rx) = loaded(false);
        let id = s.id();
        let mut sessions = IndexMap::new();
        sessions.insert(id, s);
        assert!(sessions.deliver(&id, vec![1]));
        drop(rx);
        assert!(!sessions.deliver(&id, vec![2]));
        assert!(!sessions.deliver(&Uuid::new_v4(), vec![3]));
    }
}
