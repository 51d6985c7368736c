use botview::{
    install_metrics_exporter, setup_logging, validate_config, Cli, CliRunner, Commands,
    MetricsCollector,
};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose, args.log_format).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    info!("Starting botview v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Validate { config } = &args.command {
        return validate_config(config).await;
    }

    let config = args.load_config().await?;

    let metrics = install_metrics_exporter()?;
    let cli_runner = CliRunner::new(config, metrics).await?;

    let collector = matches!(args.command, Commands::Serve { .. })
        .then(|| MetricsCollector::new().start_collection());

    let result = tokio::select! {
        result = cli_runner.run(args.command) => result,
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    if let Some(collector) = collector {
        collector.abort();
    }
    cli_runner.service.shutdown().await;

    if let Err(e) = &result {
        error!(error = %e, "Application error");
    }

    info!("botview stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
