//! stagelink-utils: shared error type, logging setup and path helpers

pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Result, StagelinkError};
pub use logging::{init_logging_with_config, LogConfig, LogOutput};
pub use paths::{config_dir, config_file, ensure_dir, log_dir, state_dir};
