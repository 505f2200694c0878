//! The `podlink` binary.
//!
//! One executable, three personalities, selected by the name it was
//! invoked under:
//!
//! - `podlinkd` runs the worker daemon,
//! - `podlink` runs a client session for an explicitly named command,
//! - any other name is a stub: a symlink named after a configured command,
//!   which runs the client session for that command with all arguments
//!   forwarded verbatim.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use podlink_core::config::Configuration;
use tracing_subscriber::EnvFilter;

mod client;
mod server;

const SERVER_NAME: &str = "podlinkd";
const CONFIG_ENV: &str = "PODLINK_CONFIG";
const NAME_ENV: &str = "PODLINK_NAME";
const DEFAULT_CONFIG_FILE: &str = "podlink.conf";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let invoked = args
        .first()
        .map(|arg0| base_command_name(arg0))
        .unwrap_or_default();

    let exit_code = if invoked == SERVER_NAME {
        let cli = server::ServerCli::parse();
        server::run(cli).await?;
        0
    } else if invoked == env!("CARGO_BIN_NAME") {
        let cli = client::ClientCli::parse();
        client::run(cli).await?
    } else {
        // Stub executable: argv[0] names the command, everything else is
        // forwarded untouched.
        client::run_stub(&invoked, &args[1..]).await?
    };

    std::process::exit(exit_code);
}

/// The basename of the invoked executable, without a Windows `.exe`
/// suffix.
fn base_command_name(arg0: &str) -> String {
    let name = Path::new(arg0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".exe").unwrap_or(&name).to_string()
}

/// Resolves and loads the configuration: `--config`, then
/// `$PODLINK_CONFIG`, then `podlink.conf` next to the caller.
fn load_configuration(explicit: Option<PathBuf>) -> Result<Configuration> {
    let path = explicit
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    tracing::debug!("loading configuration from {path:?}");
    Configuration::load_file(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        // Fall back to `default_level` if RUST_LOG is unset or invalid.
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn base_command_name_strips_directories_and_exe() {
        assert_eq!(base_command_name("/usr/local/bin/podlinkd"), "podlinkd");
        assert_eq!(base_command_name("fmt"), "fmt");
        assert_eq!(base_command_name("fmt.exe"), "fmt");
    }
}
