use clap::Parser;
use ctxdb::config::Command;
use ctxdb::{Application, Config, commands, telemetry};
use serde::Serialize;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    let args = ctxdb::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let command = args.command.unwrap_or(Command::Serve);
    if command == Command::Migrate {
        let result = commands::migrate(&config).await;
        telemetry::shutdown_telemetry();
        return result;
    }

    let app = Application::new(config).await?;
    if command == Command::Serve {
        return app.serve(shutdown_signal()).await;
    }

    let service = app.service().clone();
    let result: anyhow::Result<()> = async {
        match command {
            Command::ListContexts { pool_id } => print_json(&commands::list_contexts(&service, pool_id).await?),
            Command::SchemaContexts { context } => print_json(&commands::schema_contexts(&service, context).await?),
            Command::Check { context } => print_json(&commands::check(&service, context).await?),
            Command::InitCounter { context } => Ok(commands::init_counter(&service, context).await?),
            Command::Serve | Command::Migrate => Ok(()),
        }
    }
    .await;

    service.stop().await;
    telemetry::shutdown_telemetry();
    result
}
