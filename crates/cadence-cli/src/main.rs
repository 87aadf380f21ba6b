//! Cadence CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;

use commands::{Commands, LogFormat};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Cadence continuous build orchestrator", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Commands::Serve { config } => handlers::serve(&config).await?,
        Commands::Agent { config } => handlers::agent(config.as_deref()).await?,
        Commands::Validate { config } => handlers::validate(&config)?,
        Commands::Status { state_dir } => handlers::status(state_dir).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_with_json_logs() {
        let cli = Cli::try_parse_from(["cadence", "--log-format", "json", "serve", "-c", "ci.yaml"])
            .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        match cli.command {
            Commands::Serve { config } => assert_eq!(config, std::path::PathBuf::from("ci.yaml")),
            _ => panic!("expected serve"),
        }
    }
}
