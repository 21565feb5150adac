use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use sonic_upgraded::config;

#[derive(Parser, Debug)]
#[command(version, about = "SONiC firmware upgrade service")]
struct Args {
    /// Path to the service configuration file.
    #[clap(global = true, short, long)]
    config: Option<String>,
    #[clap(global = true, short, long)]
    verbose: bool,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Check the configuration file and exit.
    Validate,
    /// Start the upgrade service.
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:?}");
            return ExitCode::FAILURE;
        }
    };

    match args.subcmd {
        SubCommand::Validate => {
            println!("Configuration OK");
            ExitCode::SUCCESS
        }
        SubCommand::Run => match sonic_upgraded::serve(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:?}");
                ExitCode::FAILURE
            }
        },
    }
}
