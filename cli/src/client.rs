//! Client personality: resolve the command, relativize the working
//! directory, and hand off to the core session.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use podlink_core::client::run_remote_command;
use podlink_core::paths::relativize;

use crate::load_configuration;

/// Executes a podlink client command.
#[derive(Debug, Parser)]
#[clap(version, disable_version_flag = true)]
pub struct ClientCli {
    /// The configuration file loaded by podlink. Defaults to
    /// $PODLINK_CONFIG, then podlink.conf.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Prints the version and exits.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// The command to run remotely.
    pub command: String,

    /// Arguments forwarded to the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub async fn run(cli: ClientCli) -> Result<i32> {
    run_command(cli.config, &cli.command, &cli.args).await
}

/// Entry point for stub executables: no option parsing, every argument is
/// forwarded.
pub async fn run_stub(command: &str, args: &[String]) -> Result<i32> {
    run_command(None, command, args).await
}

async fn run_command(config: Option<PathBuf>, name: &str, args: &[String]) -> Result<i32> {
    let configuration = load_configuration(config)?;

    let command = configuration
        .commands()
        .get(name)
        .with_context(|| format!("failed to find command \"{name}\" in configuration"))?;

    let current_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let working_directory = relativize(
        &configuration.base_directory().to_string_lossy(),
        &current_dir.to_string_lossy(),
    )?;

    tracing::debug!("starting command {name}");
    let exit_code = run_remote_command(&working_directory, command, args).await?;
    Ok(exit_code)
}
