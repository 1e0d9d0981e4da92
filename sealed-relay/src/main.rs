use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use sealed_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn serve(args: ServerArgs) -> Result<()> {
    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
    let relay = Relay::new(listener, args.relay_config());

    // Tests read the bound port from the end of this line.
    info!("relay listening on {}", relay.local_addr()?);

    relay.run_until_ctrl_c().await.inspect_err(|err| {
        warn!(host = %args.host, port = args.port, "relay exited with error: {err:?}");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Server(args) => serve(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
