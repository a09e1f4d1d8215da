//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

use crate::connection::ChannelRole;

/// Keep a local composed copy of a remotely authored scene
#[derive(Parser, Debug)]
#[command(name = "stagelink")]
#[command(about = "Mirror a remotely authored scene into a local composed document")]
#[command(version)]
pub struct Cli {
    /// Host control address (tcp://host:port or unix://path)
    ///
    /// A bare host:port is read as TCP.
    /// Example: tcp://127.0.0.1:5555 or unix:///tmp/host.sock
    #[arg(long, env = "STAGELINK_CONTROL")]
    pub control: String,

    /// Directory receiving layer files and the composed document
    #[arg(long, env = "STAGELINK_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Configuration file (default: $XDG_CONFIG_HOME/stagelink/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How the host uses the notify channel
    #[arg(long, value_enum)]
    pub role: Option<ChannelRole>,

    /// Ping the host and exit
    #[arg(long)]
    pub check: bool,

    /// Send an application command to the host and exit
    #[arg(long, value_name = "NAME", conflicts_with = "check")]
    pub send: Option<String>,

    /// Payload frame for --send
    #[arg(long, requires = "send")]
    pub payload: Option<String>,

    /// Also write logs under the state directory
    #[arg(long)]
    pub log_file: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
