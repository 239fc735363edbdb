mod opts;
mod plan;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use adt_testbed::{Driver, Testbed};
use anyhow::{Context, Result};
use clap::Parser;
use clap::error::ErrorKind;
use tracing::error;
use tracing_subscriber::EnvFilter;

use opts::{TestOpts, TestbedOpts};

/// Bad arguments, unreadable config or plan, or an internal failure.
const EXIT_USAGE: u8 = 20;

#[derive(Parser, Debug)]
#[command(
    name = "adt-run",
    version,
    about = "Run package tests on a testbed driven by a virt-server",
    after_help = "The virt-server command follows `--`, e.g. `adt-run --plan plan.json -- adt-virt null`."
)]
struct Cli {
    /// JSON test plan: a list of packages with their source trees and tests
    #[arg(long)]
    plan: PathBuf,

    #[command(flatten)]
    testbed: TestbedOpts,

    #[command(flatten)]
    tests: TestOpts,

    /// Debug logging (env: ADT_LOG takes precedence)
    #[arg(short, long)]
    debug: bool,

    /// Virt-server command and its arguments
    #[arg(last = true, value_name = "VIRT-SERVER")]
    virt_server: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };
    setup_logging(cli.debug);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = cli.testbed.load_config(&cli.virt_server)?;
    let packages = plan::load(&cli.plan)?;
    let run_opts = cli.tests.run_options(config.shell_fail)?;
    if let Some(dir) = &config.output_dir {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let testbed = Testbed::new(config).context("prepare testbed")?;
    let summary = Driver::new(testbed, run_opts).run(&packages).await;
    print!("{}", summary.summary_text());
    if let Some(reason) = &summary.fatal {
        error!("testbed failure: {reason}");
    }
    u8::try_from(summary.exit_code()).context("exit code out of range")
}

/// Logs go to stderr; stdout carries the summary.
fn setup_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("ADT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
