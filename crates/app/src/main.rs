// CLI modules
mod cli;
mod logging;
mod state;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Del, Get, Ls, Put, Tree, Version, Watch};

command_enum! {
    (Tree, Tree),
    (Ls, Ls),
    (Get, Get),
    (Put, Put),
    (Del, Del),
    (Watch, Watch),
    (Version, Version),
}

async fn run(args: Args) -> anyhow::Result<OpOutput> {
    let state = state::AppState::load(args.config_path).context("failed to load config")?;

    let log_level = args
        .log_level
        .unwrap_or_else(|| state.config.log_level.clone());
    let _guard = logging::init_logging(&log_level);

    let ctx = cli::op::OpContext::new(args.backend, args.dsn, state);
    Ok(args.command.execute(&ctx).await?)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(args).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
