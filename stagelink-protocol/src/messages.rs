//! Message types for the control and notify channels

use bytes::Bytes;

/// Command and reply tokens as they appear on the wire
pub mod tokens {
    /// Control: announce the notify channel address
    pub const INIT_NOTIFY_SOCKET: &str = "initNotifySocket";
    /// Control: ask for the full scene; Notify (reply-capable role): full document push
    pub const GET_STAGE: &str = "getStage";
    /// Control: ask the host to push one layer (followed by a space and the path)
    pub const GET_LAYER: &str = "getLayer";
    /// Control: liveness probe, the host answers with the same token
    pub const PING: &str = "ping";
    /// Control: ask the host to drop the notify connection
    pub const DISCONNECT: &str = "disconnect";

    /// Notify: full layer content
    pub const LAYER: &str = "layer";
    /// Notify: version bump without content, timestamp 0 removes the layer
    pub const LAYER_EDIT: &str = "layerEdit";
    /// Notify: unconditional layer removal
    pub const LAYER_REMOVE: &str = "layerRemove";

    /// Positive acknowledgement
    pub const OK: &str = "ok";
    /// Negative acknowledgement
    pub const FAIL: &str = "fail";
}

/// One logical message: an ordered, non-empty sequence of byte frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    frames: Vec<Bytes>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a message from frames
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Build a message whose frames are all text
    pub fn from_strs(frames: &[&str]) -> Self {
        Self {
            frames: frames
                .iter()
                .map(|f| Bytes::copy_from_slice(f.as_bytes()))
                .collect(),
        }
    }

    /// Append a frame
    pub fn push(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    /// Builder-style variant of [`Multipart::push`]
    pub fn with(mut self, frame: impl Into<Bytes>) -> Self {
        self.push(frame);
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Total payload size across all frames
    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }

    /// The first frame decoded as text, if present and valid UTF-8
    pub fn command(&self) -> Option<&str> {
        self.frames
            .first()
            .and_then(|f| std::str::from_utf8(f).ok())
    }
}

impl From<&str> for Multipart {
    fn from(single: &str) -> Self {
        Self::from_strs(&[single])
    }
}

/// Error decoding a notify message into a [`NotifyCommand`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("command name is not valid UTF-8")]
    InvalidCommandName,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command}: expected {expected} argument frames, got {actual}")]
    FrameCount {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{command}: invalid timestamp {value:?}")]
    InvalidTimestamp { command: &'static str, value: String },

    #[error("{command}: {field} is not valid UTF-8")]
    InvalidUtf8 {
        command: &'static str,
        field: &'static str,
    },
}

impl DecodeError {
    /// The recognized command this error belongs to, if any
    pub fn command(&self) -> Option<&'static str> {
        match self {
            DecodeError::FrameCount { command, .. }
            | DecodeError::InvalidTimestamp { command, .. }
            | DecodeError::InvalidUtf8 { command, .. } => Some(*command),
            _ => None,
        }
    }
}

/// A command pushed by the host on the notify channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyCommand {
    /// Full layer content
    Layer {
        path: String,
        timestamp: u64,
        payload: Bytes,
    },
    /// Version bump; timestamp 0 is a tombstone
    LayerEdit { path: String, timestamp: u64 },
    /// Unconditional removal
    LayerRemove { path: String },
    /// Full document push, only acknowledged in the reply-capable role
    GetStage { timestamp: u64, payload: Bytes },
}

impl NotifyCommand {
    /// Decode a notify message, validating the frame count for its command
    pub fn decode(message: &Multipart) -> Result<Self, DecodeError> {
        let (name, args) = message.frames().split_first().ok_or(DecodeError::Empty)?;
        let name = std::str::from_utf8(name).map_err(|_| DecodeError::InvalidCommandName)?;

        match name {
            tokens::LAYER => {
                expect_args(tokens::LAYER, args, 3)?;
                Ok(NotifyCommand::Layer {
                    path: utf8_arg(tokens::LAYER, "path", &args[0])?,
                    timestamp: timestamp_arg(tokens::LAYER, &args[1])?,
                    payload: args[2].clone(),
                })
            }
            tokens::LAYER_EDIT => {
                expect_args(tokens::LAYER_EDIT, args, 2)?;
                Ok(NotifyCommand::LayerEdit {
                    path: utf8_arg(tokens::LAYER_EDIT, "path", &args[0])?,
                    timestamp: timestamp_arg(tokens::LAYER_EDIT, &args[1])?,
                })
            }
            tokens::LAYER_REMOVE => {
                expect_args(tokens::LAYER_REMOVE, args, 1)?;
                Ok(NotifyCommand::LayerRemove {
                    path: utf8_arg(tokens::LAYER_REMOVE, "path", &args[0])?,
                })
            }
            tokens::GET_STAGE => {
                expect_args(tokens::GET_STAGE, args, 2)?;
                Ok(NotifyCommand::GetStage {
                    timestamp: timestamp_arg(tokens::GET_STAGE, &args[0])?,
                    payload: args[1].clone(),
                })
            }
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }

    /// Wire name of this command
    pub fn name(&self) -> &'static str {
        match self {
            NotifyCommand::Layer { .. } => tokens::LAYER,
            NotifyCommand::LayerEdit { .. } => tokens::LAYER_EDIT,
            NotifyCommand::LayerRemove { .. } => tokens::LAYER_REMOVE,
            NotifyCommand::GetStage { .. } => tokens::GET_STAGE,
        }
    }

    /// Encode into frames (used by hosts and test harnesses)
    pub fn encode(&self) -> Multipart {
        let message = Multipart::from(self.name());
        match self {
            NotifyCommand::Layer {
                path,
                timestamp,
                payload,
            } => message
                .with(path.clone())
                .with(timestamp.to_string())
                .with(payload.clone()),
            NotifyCommand::LayerEdit { path, timestamp } => {
                message.with(path.clone()).with(timestamp.to_string())
            }
            NotifyCommand::LayerRemove { path } => message.with(path.clone()),
            NotifyCommand::GetStage { timestamp, payload } => {
                message.with(timestamp.to_string()).with(payload.clone())
            }
        }
    }
}

fn expect_args(command: &'static str, args: &[Bytes], expected: usize) -> Result<(), DecodeError> {
    if args.len() != expected {
        return Err(DecodeError::FrameCount {
            command,
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn utf8_arg(command: &'static str, field: &'static str, frame: &Bytes) -> Result<String, DecodeError> {
    std::str::from_utf8(frame)
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidUtf8 { command, field })
}

/// Timestamps travel as decimal ASCII
fn timestamp_arg(command: &'static str, frame: &Bytes) -> Result<u64, DecodeError> {
    let text = std::str::from_utf8(frame).map_err(|_| DecodeError::InvalidUtf8 {
        command,
        field: "timestamp",
    })?;
    let invalid = || DecodeError::InvalidTimestamp {
        command,
        value: text.to_string(),
    };
    // `u64::from_str` alone would also take a leading `+`
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    text.parse::<u64>().map_err(|_| invalid())
}

/// A request sent by the client on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Announce where the host should push notify messages
    InitNotifySocket { address: String },
    /// Ask for the whole scene
    GetStage,
    /// Ask for one layer to be pushed again
    GetLayer { path: String },
    /// Liveness probe
    Ping,
    /// Ask the host to drop the notify connection
    Disconnect,
    /// Application command forwarded verbatim
    Command { name: String, payload: Option<Bytes> },
}

impl ControlRequest {
    pub fn to_multipart(&self) -> Multipart {
        match self {
            ControlRequest::InitNotifySocket { address } => {
                Multipart::from_strs(&[tokens::INIT_NOTIFY_SOCKET, address])
            }
            ControlRequest::GetStage => Multipart::from(tokens::GET_STAGE),
            // The path rides in the command frame itself
            ControlRequest::GetLayer { path } => {
                Multipart::from(format!("{} {}", tokens::GET_LAYER, path).as_str())
            }
            ControlRequest::Ping => Multipart::from(tokens::PING),
            ControlRequest::Disconnect => Multipart::from(tokens::DISCONNECT),
            ControlRequest::Command { name, payload } => {
                let message = Multipart::from(name.as_str());
                match payload {
                    Some(payload) => message.with(payload.clone()),
                    None => message,
                }
            }
        }
    }
}

/// Host acknowledgement on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Fail,
    /// Anything else, typically an error description or a payload token
    Other(String),
}

impl Reply {
    /// Interpret the first frame of a reply
    pub fn parse(message: &Multipart) -> Self {
        match message.frames().first() {
            Some(frame) => match String::from_utf8_lossy(frame).as_ref() {
                tokens::OK => Reply::Ok,
                tokens::FAIL => Reply::Fail,
                other => Reply::Other(other.to_string()),
            },
            None => Reply::Other(String::new()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ok => f.write_str(tokens::OK),
            Reply::Fail => f.write_str(tokens::FAIL),
            Reply::Other(text) => f.write_str(text),
        }
    }
}
