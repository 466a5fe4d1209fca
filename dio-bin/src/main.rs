use clap::Parser;
use dio_common::Logger;
use dio_core::DeviceOrchestrator;
use dio_driver::ModbusTcpConnector;
use dio_error::{DioError, DioResult};
use dio_models::{constants::DEFAULT_CONFIG_FILE_NAME, Settings};
use std::{env::current_dir, path::PathBuf, sync::Arc};
use tracing::info;

/// DIO panel - discrete-I/O button panel controller
///
/// Polls the configured Modbus TCP I/O modules, turns input edges into
/// button gestures and drives the paired outputs.
#[derive(Parser)]
#[command(name = "dio-panel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DIO panel", long_about = None)]
struct Cli {
    /// Sets a custom config file with full path
    ///
    /// If not specified, the panel will look for 'panel.toml'
    /// in the current working directory.
    #[arg(short, long, env = "DIO_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> DioResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => {
            let dir = current_dir()
                .map_err(|e| DioError::from(format!("Failed to get current directory: {e}")))?;
            dir.join(DEFAULT_CONFIG_FILE_NAME)
        }
    };
    let settings = Settings::new(&config_path.to_string_lossy())?;

    let level = Logger::parse_level(cli.log_level.as_deref().unwrap_or(&settings.logging.level))?;
    let mut logger = Logger::new(Some(level))
        .with_output(&settings.logging.dir, &settings.logging.file_prefix);
    logger.initialize()?;
    info!(config = %config_path.display(), devices = settings.devices.len(), "Starting DIO panel");

    let orchestrator = DeviceOrchestrator::new(&settings, Arc::new(ModbusTcpConnector))?;
    if let Err(e) = orchestrator.start().await {
        orchestrator.stop().await;
        return Err(e);
    }

    wait_for_shutdown().await?;
    orchestrator.stop().await;
    info!("DIO panel stopped");
    Ok(())
}

async fn wait_for_shutdown() -> DioResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM signal"),
            _ = sigint.recv() => info!("Received SIGINT signal"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received ctrl-c signal");
    }
    Ok(())
}
