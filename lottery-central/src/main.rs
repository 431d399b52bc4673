use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use lottery_central::{
    agency,
    central::Central,
    cli::{Cli, Command, ServerArgs},
    server::{self, Server},
    settlement::WinningNumber,
    store::BetStore,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Agency(args) => agency::run(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    args.validate()?;

    let store = match &args.bets_file {
        Some(path) => BetStore::open_file(path)
            .with_context(|| format!("failed to open bets file {}", path.display()))?,
        None => BetStore::in_memory(),
    };
    let central = Arc::new(Central::new(
        store,
        args.agencies,
        WinningNumber(args.winning_number),
    ));

    let listener = server::bind_listener(args.listen, args.backlog)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = Server::new(listener, central, args.max_connections);
    let addr = server.local_addr()?;
    info!(
        agencies = args.agencies,
        max_connections = args.max_connections,
        winning_number = args.winning_number,
        "central configured"
    );
    info!("central listening on {}", addr);
    if let Err(err) = server.run_until_terminated().await {
        warn!("central exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
