// src/main.rs — handoff entry point

use clap::Parser;

use handoff::cli::{client, doctor, serve, Cli, Commands};
use handoff::infra::config::Config;
use handoff::infra::logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    logger::init_logging(logger::level_for(default_level, cli.verbose));

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };

    match cli.command {
        Commands::Serve { bind, port } => serve::run_serve(config, bind, port).await,
        Commands::Doctor => doctor::run_doctor(&config).await,
        Commands::Create {
            source_paths,
            destination_path,
            server,
        } => client::run_create(&config, source_paths, destination_path, server).await,
        Commands::Status { id, server } => client::run_status(&config, &id, server).await,
    }
}
