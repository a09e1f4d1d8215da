//! stagelink-client: keeps a local, composed mirror of a scene authored by a
//! remote host
//!
//! The host pushes layer updates over a notify channel the client listens on;
//! the client asks for content over a request/reply control channel. Every
//! cached layer is written below an output directory and referenced from one
//! composed document.

pub mod cache;
pub mod cli;
pub mod composer;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod session;

pub use cache::{Layer, LayerCache, Upsert};
pub use composer::{DocumentComposer, LayerStore, Rebuild, StageObserver};
pub use connection::{ChannelRole, ControlChannel, HostConnector, NotifyListener, RequestPolicy};
pub use dispatch::{Dispatcher, Outcome};
pub use session::{Session, SessionSettings, StepReport};
