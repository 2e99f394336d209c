mod research;

use anyhow::Context;
use clap::{Parser, Subcommand};
use storm_llm::ProviderKind;
use storm_server::ServerConfig;
use storm_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

use crate::research::ResearchArgs;

#[derive(Debug, Parser)]
#[command(name = "storm", version, about = "Interactive multi-analyst research server")]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "STORM_HOST")]
    host: Option<String>,

    #[arg(long, env = "STORM_PORT")]
    port: Option<u16>,

    /// Fallback level when `RUST_LOG` is unset.
    #[arg(long, env = "STORM_LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long, env = "STORM_JSON_LOGS", global = true)]
    json_logs: bool,

    /// Provider for requests that do not name one (openai, azure_openai, anthropic, scripted).
    #[arg(long, env = "STORM_DEFAULT_PROVIDER", global = true)]
    default_provider: Option<ProviderKind>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the WebSocket + HTTP server (the default).
    Serve,
    /// Research a topic without an operator and write the report to a file.
    Research(ResearchArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..TelemetryConfig::default()
    });
    tracing::debug!(filter = telemetry.directives(), "logging initialised");

    let mut config = ServerConfig::default().apply_env_overrides();
    if let Some(provider) = cli.default_provider {
        config.default_provider = provider;
    }

    match cli.command {
        Some(Command::Research(args)) => {
            let (result, path) = research::run(args, config.default_provider).await?;
            println!(
                "Wrote {} ({} analysts, {} interviews)",
                path.display(),
                result.analysts.len(),
                result.interview_count
            );
            Ok(())
        }
        Some(Command::Serve) | None => {
            if let Some(host) = cli.host {
                config.host = host;
            }
            if let Some(port) = cli.port {
                config.port = port;
            }
            serve(config).await
        }
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let handle = storm_server::start(config)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(port = handle.port, "STORM server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
