mod capabilities;
mod checks;
mod config;
mod context;
mod environment;
mod error;
mod hardener;
mod identity;
mod launch;
mod mount;
mod process;
mod report;
mod sandbox;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, error::ErrorKind};
use config::{Config, DebugOptions};
use context::HostContext;
use error::{LaunchError, SETUP_FAILURE};
use sandbox::Sandbox;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BURROW_LOG";

fn main() -> ExitCode {
    let config = Config::parse();
    init_tracing(&config.debug);

    let code = match run(config) {
        Ok(code) => code,
        Err(error) => {
            match error.downcast_ref::<LaunchError>() {
                Some(launch) => eprintln!("burrow: {}: {}", launch.phase(), launch.diagnostic()),
                None => eprintln!("burrow: {error:#}"),
            }
            SETUP_FAILURE
        }
    };

    ExitCode::from((code & 0xff) as u8)
}

fn run(config: Config) -> Result<i32> {
    let quiet = config.debug.quiet;

    let spec = match config.into_launch_spec() {
        Ok(spec) => spec,
        Err(error) => Config::command()
            .error(ErrorKind::ValueValidation, format!("{error:#}"))
            .exit(),
    };

    let host = HostContext::capture().context("Failed to capture host context")?;
    host.ensure_supported()?;
    tracing::info!(
        level = ?host.privilege_level(),
        ruid = %host.ruid(),
        euid = %host.euid(),
        egid = %host.egid(),
        "host context"
    );

    let sandbox = Sandbox::new(&spec, host, quiet);
    Ok(sandbox.run()?)
}

fn init_tracing(debug: &DebugOptions) {
    let default_level = if debug.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
