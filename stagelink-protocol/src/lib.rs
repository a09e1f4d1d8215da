//! stagelink-protocol: wire definitions shared by the stagelink client and host
//!
//! Both channels exchange multi-frame messages. The first frame names the
//! command, the remaining frames carry its arguments. This crate defines the
//! command vocabulary, the typed forms of the notify-channel commands, and the
//! length-prefixed codec that carries the frames over a byte stream.

pub mod codec;
pub mod endpoint;
pub mod messages;

// Re-export main types at crate root
pub use codec::{CodecError, MultipartCodec};
pub use endpoint::{Endpoint, EndpointError};
pub use messages::{tokens, ControlRequest, DecodeError, Multipart, NotifyCommand, Reply};
