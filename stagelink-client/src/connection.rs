//! Host connections
//!
//! The control channel is a strict request/reply exchange with retry and
//! reconnection; the notify channel is a local endpoint the host pushes
//! commands to.

mod control;
mod notify;

pub use control::{Connector, ControlChannel, HostConnector, LayerFetcher, RequestPolicy, StreamTrait};
pub use notify::{ChannelRole, Inbound, NotifyListener, Responder};
