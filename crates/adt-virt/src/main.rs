use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use adt_virt::{NullServer, find_free_port};

#[derive(Parser, Debug)]
#[command(name = "adt-virt", version, about = "Reference virt-servers for adt-run")]
struct Cli {
    /// Log protocol traffic (env: ADT_LOG takes precedence)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the protocol on stdin/stdout, running tests on this host
    Null,

    /// Print a free local TCP port
    FreePort {
        /// First port to try; the next 49 are tried after it
        #[arg(long, default_value_t = 10022)]
        start: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    match cli.command {
        Command::Null => {
            let stdin = BufReader::new(tokio::io::stdin());
            NullServer::new()
                .serve(stdin, tokio::io::stdout())
                .await
                .context("null virt-server failed")?;
        }
        Command::FreePort { start } => match find_free_port(start) {
            Some(port) => println!("{port}"),
            None => bail!("no free port in [{start}, {})", start.saturating_add(50)),
        },
    }
    Ok(())
}

/// Logs go to stderr; stdout carries protocol replies.
fn setup_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("ADT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
