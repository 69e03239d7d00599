//! Binary entry point for the migration proxy.
//!
//! Startup stays intentionally thin: parse configuration, install logging,
//! and hand off to [`passage_proxy::run`].

use std::io::IsTerminal;
use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use passage_proxy::{run, ProxyConfig};

/// Transparent CQL proxy that mirrors live writes during a cluster migration.
#[derive(Parser, Debug)]
#[command(name = "passage-proxy")]
struct Args {
    /// Client-facing data port.
    #[arg(long, env = "PASSAGE_LISTEN_CLIENT", default_value = "0.0.0.0:9042")]
    listen_client: SocketAddr,

    /// Port the migration service sends control updates to.
    #[arg(long, env = "PASSAGE_LISTEN_CONTROL", default_value = "0.0.0.0:9044")]
    listen_control: SocketAddr,

    /// Origin cluster address clients believe they are talking to.
    #[arg(long, env = "PASSAGE_ORIGIN")]
    origin: SocketAddr,

    /// Target cluster address receiving mirrored writes.
    #[arg(long, env = "PASSAGE_TARGET")]
    target: SocketAddr,

    /// Treat the migration as already finished and proxy straight to the
    /// target.
    #[arg(
        long,
        env = "migration_complete",
        value_parser = clap::builder::BoolishValueParser::new(),
        default_value = "false",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    migration_complete: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    run(ProxyConfig {
        listen_client: args.listen_client,
        listen_control: args.listen_control,
        origin: args.origin,
        target: args.target,
        migration_complete: args.migration_complete,
    })
    .await
}
