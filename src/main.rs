use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use httpe::config::{Config, Overrides};
use httpe::{rules, server, telemetry};

#[derive(Parser, Debug)]
#[command(name = "httpe", version, about = "Rule driven HTTP action server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Server configuration file (TOML)
    #[arg(short, long, global = true, env = "HTTPE_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on, e.g. 0.0.0.0:3000
    #[arg(short, long, global = true, env = "HTTPE_ADDRESS")]
    address: Option<String>,
    /// Rules file (YAML)
    #[arg(short, long, global = true, env = "HTTPE_RULES_FILE")]
    rules_file: Option<PathBuf>,
    #[arg(long, global = true, env = "HTTPE_LOG_LEVEL")]
    log_level: Option<String>,
    #[arg(long, global = true, env = "HTTPE_LOG_FILE")]
    log_file: Option<PathBuf>,
    /// Directory for post action results
    #[arg(long, global = true, env = "HTTPE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server (default)
    Serve,
    /// Validate the configuration and the rules file, then exit
    Validate,
    /// Print the rules file as JSON
    DumpRules,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply(Overrides {
        address: cli.address,
        rules_file: cli.rules_file,
        log_level: cli.log_level,
        log_file: cli.log_file,
        data_dir: cli.data_dir,
    });

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::DumpRules => {
            println!("{}", rules::dump_json(&config.server.rules_file)?);
            Ok(())
        }
        Commands::Validate => {
            config.validate()?;
            let loaded = rules::load(&config.server.rules_file)?;
            println!("{} rules valid", loaded.len());
            Ok(())
        }
        Commands::Serve => {
            telemetry::init(&config.server.log_level, config.log_file())?;
            config.validate()?;
            let loaded = match rules::load(&config.server.rules_file) {
                Ok(loaded) => loaded,
                Err(e) => {
                    error!("{:#}", e);
                    return Err(e);
                }
            };
            info!("loaded {} rules from {}", loaded.len(), config.server.rules_file.display());
            server::serve(config, loaded).await
        }
    }
}
