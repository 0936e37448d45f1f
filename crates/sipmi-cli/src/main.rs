//! sipmi CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sipmi_cli::cli::{Cli, Command, ConfigAction};
use sipmi_cli::commands::{self, build_client};
use sipmi_cli::config::CliConfig;
use sipmi_cli::error::{CliError, CliResult};
use sipmi_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tracing = if cli.debug || config.debug {
        TracingConfig::cli_debug()
    } else if matches!(cli.command, Command::Event(_)) {
        TracingConfig::listener()
    } else {
        TracingConfig::default()
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.is_silent() {
                eprintln!("error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(CliConfig::default_path)
}

fn load_config(cli: &Cli) -> CliResult<CliConfig> {
    match cli.config {
        Some(ref path) => CliConfig::load_from(path),
        None => CliConfig::load(),
    }
    .map_err(CliError::Config)
}

async fn run(cli: Cli, mut config: CliConfig) -> CliResult<()> {
    config.mi.apply(&cli.connection);

    match cli.command {
        Command::Mi(ref args) => commands::mi::run(build_client(&config.mi)?, args).await,
        Command::Event(ref args) => {
            commands::event::run(build_client(&config.mi)?, config.event.clone(), args).await
        }
        Command::Check => commands::check::run(build_client(&config.mi)?).await,
        Command::Complete { ref target } => commands::complete::run(&config.mi, target).await,
        Command::Config { ref action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, &config_path(&cli)),
            ConfigAction::Path => commands::config::path(&config_path(&cli)),
        },
    }
}
