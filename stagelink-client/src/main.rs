//! stagelink: mirror a remotely authored scene into a local composed document

use std::path::Path;

use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stagelink_client::cli::Cli;
use stagelink_client::config;
use stagelink_client::{ControlChannel, HostConnector, Session};
use stagelink_utils::{init_logging_with_config, LogConfig, Result, StagelinkError};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::development()
    } else if cli.log_file {
        LogConfig::daemon()
    } else {
        LogConfig::client()
    };
    if let Err(e) = init_logging_with_config(log_config) {
        eprintln!("stagelink: {}", e);
        std::process::exit(2);
    }

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "stagelink failed");
            eprintln!("stagelink: {}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<()> {
    let file = config::load(cli.config.as_deref())?;
    let settings = config::resolve(&cli, file)?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    if cli.check {
        let connector = HostConnector::new(settings.control.clone());
        let mut control = ControlChannel::connect(connector, settings.policy, cancel).await;
        let elapsed = control.ping().await?;
        println!("{} answered in {} ms", settings.control, elapsed.as_millis());
        return Ok(());
    }

    if let Some(name) = cli.send.as_deref() {
        let connector = HostConnector::new(settings.control.clone());
        let mut control = ControlChannel::connect(connector, settings.policy, cancel).await;
        let payload = cli.payload.map(Bytes::from);
        if !control.send_command(name, payload).await? {
            return Err(StagelinkError::protocol(format!("host did not accept {}", name)));
        }
        println!("{} accepted {}", settings.control, name);
        return Ok(());
    }

    info!(
        control = %settings.control,
        output = %settings.output_dir.display(),
        role = ?settings.role,
        "Starting stagelink"
    );

    let mut session = Session::connect(settings, cancel).await?;
    session.set_observer(|document: &Path, layers: usize| {
        info!(document = %document.display(), layers, "Stage updated");
    });
    session.run().await;
    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            cancel.cancel();
        }
    });
}
