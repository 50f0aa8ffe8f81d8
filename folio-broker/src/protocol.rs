//! Line-oriented client protocol.
//!
//! Every client frame starts with one text line of space-separated tokens,
//! the first of which names the command. Arguments are `key=value` pairs:
//! ```text
//! ┌──────────┬──────────────────────────────────────┬─────────────────┐
//! │ command  │ key=value key=value …                │ \n + binary     │
//! │ (token)  │                                      │ (optional)      │
//! └──────────┴──────────────────────────────────────┴─────────────────┘
//! ```
//!
//! Replies use the same shape; errors are always
//! `error: cmd=<command> kind=<kind>`.

use thiserror::Error;

use crate::tile::{TileBatch, TileDesc, TileParseError};

/// Version string exchanged in the `folioclient` / `folioserver` handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Split a line into whitespace-separated tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Value of the first `key=value` token whose key matches exactly.
pub fn get_token<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .find_map(|token| token.strip_prefix(key)?.strip_prefix('='))
}

/// The first line of a frame, without the trailing newline.
///
/// Returns an empty string when the line is not valid UTF-8.
pub fn first_line(data: &[u8]) -> &str {
    let end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    std::str::from_utf8(&data[..end]).unwrap_or("")
}

/// Everything after the first newline (empty if there is none).
pub fn payload(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == b'\n') {
        Some(pos) => &data[pos + 1..],
        None => &[],
    }
}

/// Build a `header\npayload` frame.
pub fn binary_frame(header: &str, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + 1 + data.len());
    frame.extend_from_slice(header.as_bytes());
    frame.push(b'\n');
    frame.extend_from_slice(data);
    frame
}

/// Format the standard error reply.
pub fn error_message(cmd: &str, kind: &str) -> String {
    format!("error: cmd={cmd} kind={kind}")
}

/// Protocol errors raised while parsing a client frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("bad syntax in `{cmd}`: {reason}")]
    Syntax { cmd: String, reason: String },
}

impl ProtocolError {
    fn syntax(cmd: &str, reason: impl Into<String>) -> Self {
        Self::Syntax {
            cmd: cmd.to_string(),
            reason: reason.into(),
        }
    }
}

/// How a command interacts with the document, which decides who may send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Protocol handshake, answered without the broker
    Handshake,
    /// Document load request
    Load,
    /// Never changes the document; allowed for read-only sessions
    ReadSafe,
    /// Edit-lock arbitration
    Lock,
    /// Changes the document; needs write permission and the edit lock
    Mutating,
}

/// Parsed `load` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub url: String,
    pub part: Option<i32>,
    pub password: Option<String>,
    /// Free-form options; everything after `options=` up to the end of line
    pub options: Option<String>,
}

impl LoadRequest {
    fn parse(line: &str) -> Result<Self, ProtocolError> {
        // `options=` may contain spaces (it is usually JSON), so it swallows
        // the rest of the line.
        let (head, options) = match line.find(" options=") {
            Some(pos) => (&line[..pos], Some(line[pos + " options=".len()..].to_string())),
            None => (line, None),
        };
        let tokens = tokenize(head);
        if tokens.iter().skip(1).any(|t| !t.contains('=')) {
            return Err(ProtocolError::syntax("load", "arguments must be key=value"));
        }
        let url = get_token(&tokens, "url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ProtocolError::syntax("load", "missing url"))?;
        let part = match get_token(&tokens, "part") {
            Some(v) => Some(
                v.parse::<i32>()
                    .ok()
                    .filter(|p| *p >= 0)
                    .ok_or_else(|| ProtocolError::syntax("load", format!("bad part `{v}`")))?,
            ),
            None => None,
        };
        Ok(Self {
            url: url.to_string(),
            part,
            password: get_token(&tokens, "password").map(str::to_string),
            options,
        })
    }

    /// The `load` line sent to the rendering engine for this request.
    pub fn engine_command(&self, local_url: &str, jail: &str) -> String {
        let mut line = format!("load url={local_url} jail={jail}");
        if let Some(part) = self.part {
            line.push_str(&format!(" part={part}"));
        }
        if let Some(password) = &self.password {
            line.push_str(&format!(" password={password}"));
        }
        if let Some(options) = &self.options {
            line.push_str(&format!(" options={options}"));
        }
        line
    }
}

/// Arguments of a client `save` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRequest {
    pub dont_terminate_edit: bool,
    pub dont_save_if_unmodified: bool,
}

impl SaveRequest {
    fn parse(tokens: &[&str]) -> Self {
        let flag = |key| get_token(tokens, key).is_some_and(|v| v == "1" || v == "true");
        Self {
            dont_terminate_edit: flag("dontTerminateEdit"),
            dont_save_if_unmodified: flag("dontSaveIfUnmodified"),
        }
    }
}

/// Commands accepted from clients, forwarded as-is when they carry no
/// broker-side meaning.
const READ_SAFE_FORWARDS: &[&str] = &[
    "downloadas",
    "partpagerectangles",
    "clientvisiblearea",
    "clientzoom",
    "setclientpart",
    "gettextselection",
];

const MUTATING_FORWARDS: &[&str] = &[
    "key",
    "mouse",
    "uno",
    "textinput",
    "selecttext",
    "selectgraphic",
    "resetselection",
    "paste",
    "insertfile",
];

/// Searching is the one `uno` command a viewer may run.
const READ_SAFE_UNO: &[&str] = &[".uno:ExecuteSearch"];

/// A parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Handshake { version: String },
    Load(LoadRequest),
    Tile(TileDesc),
    TileCombine(TileBatch),
    CancelTiles,
    Status,
    CommandValues { command: String },
    RenderFont { font: String, character: Option<String> },
    TakeEdit,
    Save(SaveRequest),
    UserActive,
    UserInactive,
    /// Passed through to the engine unchanged
    Forward { name: String, class: CommandClass },
}

impl ClientCommand {
    /// Parse the first line of a client frame.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let line = first_line(data);
        let tokens = tokenize(line);
        let Some(&name) = tokens.first() else {
            return Err(ProtocolError::Empty);
        };
        let tile_err = |e: TileParseError| ProtocolError::syntax(name, e.to_string());

        let command = match name {
            "folioclient" => Self::Handshake {
                version: tokens.get(1).copied().unwrap_or(PROTOCOL_VERSION).to_string(),
            },
            "load" => Self::Load(LoadRequest::parse(line)?),
            "tile" => Self::Tile(TileDesc::parse(line).map_err(tile_err)?),
            "tilecombine" => Self::TileCombine(TileBatch::parse(line).map_err(tile_err)?),
            "canceltiles" => Self::CancelTiles,
            "status" => Self::Status,
            "commandvalues" => Self::CommandValues {
                command: get_token(&tokens, "command")
                    .ok_or_else(|| ProtocolError::syntax(name, "missing command"))?
                    .to_string(),
            },
            "renderfont" => Self::RenderFont {
                font: get_token(&tokens, "font")
                    .ok_or_else(|| ProtocolError::syntax(name, "missing font"))?
                    .to_string(),
                character: get_token(&tokens, "char").map(str::to_string),
            },
            "takeedit" => Self::TakeEdit,
            "save" => Self::Save(SaveRequest::parse(&tokens)),
            "useractive" => Self::UserActive,
            "userinactive" => Self::UserInactive,
            "uno" => {
                let target = tokens
                    .get(1)
                    .ok_or_else(|| ProtocolError::syntax(name, "missing uno command"))?;
                let class = if READ_SAFE_UNO.contains(target) {
                    CommandClass::ReadSafe
                } else {
                    CommandClass::Mutating
                };
                Self::Forward {
                    name: name.to_string(),
                    class,
                }
            }
            _ if READ_SAFE_FORWARDS.contains(&name) => Self::Forward {
                name: name.to_string(),
                class: CommandClass::ReadSafe,
            },
            _ if MUTATING_FORWARDS.contains(&name) => Self::Forward {
                name: name.to_string(),
                class: CommandClass::Mutating,
            },
            _ => return Err(ProtocolError::UnknownCommand(name.to_string())),
        };
        Ok(command)
    }

    /// The command word as the client sent it.
    pub fn name(&self) -> &str {
        match self {
            Self::Handshake { .. } => "folioclient",
            Self::Load(_) => "load",
            Self::Tile(_) => "tile",
            Self::TileCombine(_) => "tilecombine",
            Self::CancelTiles => "canceltiles",
            Self::Status => "status",
            Self::CommandValues { .. } => "commandvalues",
            Self::RenderFont { .. } => "renderfont",
            Self::TakeEdit => "takeedit",
            Self::Save(_) => "save",
            Self::UserActive => "useractive",
            Self::UserInactive => "userinactive",
            Self::Forward { name, .. } => name,
        }
    }

    pub fn class(&self) -> CommandClass {
        match self {
            Self::Handshake { .. } => CommandClass::Handshake,
            Self::Load(_) => CommandClass::Load,
            Self::TakeEdit => CommandClass::Lock,
            Self::Save(_) => CommandClass::Mutating,
            Self::Forward { class, .. } => *class,
            Self::Tile(_)
            | Self::TileCombine(_)
            | Self::CancelTiles
            | Self::Status
            | Self::CommandValues { .. }
            | Self::RenderFont { .. }
            | Self::UserActive
            | Self::UserInactive => CommandClass::ReadSafe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_token_exact_key() {
        let tokens = tokenize("tile part=1 width=256 tilewidth=3840");
        assert_eq!(get_token(&tokens, "width"), Some("256"));
        assert_eq!(get_token(&tokens, "tilewidth"), Some("3840"));
        assert_eq!(get_token(&tokens, "height"), None);
    }

    #[test]
    fn test_first_line_and_payload() {
        let frame = binary_frame("tile: part=0", &[1, 2, 3]);
        assert_eq!(first_line(&frame), "tile: part=0");
        assert_eq!(payload(&frame), &[1, 2, 3]);
        assert_eq!(payload(b"status"), b"");
        assert_eq!(first_line(b"status"), "status");
    }

    #[test]
    fn test_error_message_format() {
        assert_eq!(error_message("tile", "syntax"), "error: cmd=tile kind=syntax");
    }

    #[test]
    fn test_parse_load_with_options() {
        let cmd = ClientCommand::parse(
            b"load url=file:///tmp/a.odt part=2 options={\"a\": 1, \"b\": 2}",
        )
        .unwrap();
        match cmd {
            ClientCommand::Load(req) => {
                assert_eq!(req.url, "file:///tmp/a.odt");
                assert_eq!(req.part, Some(2));
                assert_eq!(req.options.as_deref(), Some("{\"a\": 1, \"b\": 2}"));
                assert_eq!(
                    req.engine_command("file:///jail/a.odt", "file:///tmp/a.odt"),
                    "load url=file:///jail/a.odt jail=file:///tmp/a.odt part=2 options={\"a\": 1, \"b\": 2}"
                );
            }
            other => panic!("expected load, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_load_requires_url() {
        let err = ClientCommand::parse(b"load part=1").unwrap_err();
        assert!(matches!(err, ProtocolError::Syntax { ref cmd, .. } if cmd == "load"));
        assert!(ClientCommand::parse(b"load url=x garbage").is_err());
        assert!(ClientCommand::parse(b"load url=x part=-3").is_err());
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        assert_eq!(
            ClientCommand::parse(b"frobnicate now"),
            Err(ProtocolError::UnknownCommand("frobnicate".into()))
        );
        assert_eq!(ClientCommand::parse(b"   "), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_command_classes() {
        let class = |line: &str| ClientCommand::parse(line.as_bytes()).unwrap().class();
        assert_eq!(class("folioclient 1.0"), CommandClass::Handshake);
        assert_eq!(class("status"), CommandClass::ReadSafe);
        assert_eq!(class("downloadas name=x.pdf format=pdf"), CommandClass::ReadSafe);
        assert_eq!(class("useractive"), CommandClass::ReadSafe);
        assert_eq!(class("uno .uno:ExecuteSearch {}"), CommandClass::ReadSafe);
        assert_eq!(class("uno .uno:Bold"), CommandClass::Mutating);
        assert_eq!(class("key type=input char=97 key=0"), CommandClass::Mutating);
        assert_eq!(class("takeedit"), CommandClass::Lock);
        assert_eq!(class("save dontTerminateEdit=1"), CommandClass::Mutating);
    }

    #[test]
    fn test_parse_save_flags() {
        match ClientCommand::parse(b"save dontTerminateEdit=1 dontSaveIfUnmodified=0").unwrap() {
            ClientCommand::Save(req) => {
                assert!(req.dont_terminate_edit);
                assert!(!req.dont_save_if_unmodified);
            }
            other => panic!("expected save, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_cache_backed_queries() {
        assert_eq!(
            ClientCommand::parse(b"commandvalues command=.uno:CharFontName").unwrap(),
            ClientCommand::CommandValues {
                command: ".uno:CharFontName".into()
            }
        );
        assert_eq!(
            ClientCommand::parse(b"renderfont font=Liberation char=A").unwrap(),
            ClientCommand::RenderFont {
                font: "Liberation".into(),
                character: Some("A".into())
            }
        );
        assert!(ClientCommand::parse(b"renderfont char=A").is_err());
    }

    #[test]
    fn test_tile_syntax_error_names_command() {
        let err = ClientCommand::parse(b"tile part=0 width=256").unwrap_err();
        assert!(matches!(err, ProtocolError::Syntax { ref cmd, .. } if cmd == "tile"));
    }
}
