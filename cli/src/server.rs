//! Server personality: stub generation, PID file, signal wiring, and the
//! listener loop.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use podlink_core::server::ServerOptions;
use podlink_core::server::run_server;
use podlink_core::stubs::StubOptions;
use podlink_core::stubs::create_stubs;
use podlink_core::stubs::remove_stubs;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::NAME_ENV;
use crate::load_configuration;

/// Marker the daemonized re-exec sets so the child does not fork again.
const DAEMONIZED_ENV: &str = "PODLINK_DAEMONIZED";

/// Starts the podlink server.
#[derive(Debug, Parser)]
#[clap(name = "podlinkd", version, disable_version_flag = true)]
pub struct ServerCli {
    /// Daemonize the server by sending it to the background.
    #[arg(short, long)]
    pub background: bool,

    /// Prints the version and exits.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// The configuration file loaded by podlinkd. Defaults to
    /// $PODLINK_CONFIG, then podlink.conf.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable generating client executables so only local executables can
    /// be run.
    #[arg(short, long)]
    pub disable_client_executables: bool,

    /// The directory used to create the client executables.
    #[arg(short, long, default_value = "")]
    pub executable_directory: PathBuf,

    /// Generate client executables for local executables.
    #[arg(short = 'l', long)]
    pub generate_local_executables: bool,

    /// The name used to identify the server. Defaults to $PODLINK_NAME or
    /// the hostname.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Overwrite client executables rather than fail with an error.
    #[arg(short, long)]
    pub overwrite_client_executables: bool,

    /// The file to store the PID of the server. An empty path disables it.
    #[arg(short, long, default_value = "/var/run/podlinkd.pid")]
    pub pidfile: PathBuf,

    /// Wait for in-flight sessions to finish on shutdown instead of
    /// detaching them.
    #[arg(long)]
    pub wait_on_clients: bool,
}

pub async fn run(cli: ServerCli) -> Result<()> {
    if cli.background && std::env::var_os(DAEMONIZED_ENV).is_none() {
        return daemonize();
    }

    let name = match cli.name.clone() {
        Some(name) => name,
        None => match std::env::var(NAME_ENV) {
            Ok(name) if !name.is_empty() => name,
            _ => hostname().context("hostname could not be determined, --name must be specified")?,
        },
    };

    let configuration = load_configuration(cli.config.clone())?;

    let stub_options = StubOptions {
        directory: cli.executable_directory.clone(),
        generate_local: cli.generate_local_executables,
        overwrite: cli.overwrite_client_executables,
        disabled: cli.disable_client_executables,
    };
    let stubs = create_stubs(&configuration, &name, &stub_options)?;

    if let Err(err) = write_pid_file(&cli.pidfile) {
        warn!("failed to write pidfile {:?}: {err}", cli.pidfile);
    }

    let options = ServerOptions {
        wait_on_clients: cli.wait_on_clients,
    };
    // SIGHUP only stops a foreground server; a daemonized one ignores it.
    let shutdown = shutdown_signal(!cli.background)?;

    info!("server {name} starting");
    let result = run_server(&configuration, &name, options, shutdown).await;

    info!("shutting down the server");
    remove_pid_file(&cli.pidfile);
    remove_stubs(&stubs);

    result.map_err(Into::into)
}

/// Re-executes this binary detached from the terminal; the parent returns
/// immediately so the shell gets its prompt back.
fn daemonize() -> Result<()> {
    let exe = std::env::current_exe().context("failed to resolve the server executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    debug!("starting daemon");
    let mut command = std::process::Command::new(exe);
    command
        .args(args)
        .env(DAEMONIZED_ENV, "1")
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().context("failed to start the daemon")?;

    Ok(())
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .and_then(|contents| contents.lines().next().map(str::to_string))
        .filter(|name| !name.is_empty())
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn remove_pid_file(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    if std::fs::remove_file(path).is_err() {
        warn!("failed to remove pidfile {path:?}");
    }
}

#[cfg(unix)]
fn shutdown_signal(handle_hangup: bool) -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::Signal;
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    let mut hangup = if handle_hangup {
        Some(signal(SignalKind::hangup()).context("failed to install SIGHUP")?)
    } else {
        None
    };

    async fn recv_hangup(hangup: &mut Option<Signal>) {
        match hangup {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => debug!("handling SIGTERM"),
            _ = interrupt.recv() => debug!("handling SIGINT"),
            _ = recv_hangup(&mut hangup) => debug!("handling SIGHUP"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal(_handle_hangup: bool) -> Result<impl Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        debug!("handling interrupt");
    })
}
