//! The worker daemon's listener loop.
//!
//! One host section of the configuration maps to one loopback listener;
//! every accepted connection becomes an independent session task. The loop
//! runs until the supplied shutdown future resolves, then either waits for
//! in-flight sessions or detaches them.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CommandMap;
use crate::config::Configuration;
use crate::error::Result;
use crate::net;
use crate::session::serve_connection;

/// Behavior switches for [`run_server`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Wait for in-flight sessions to finish on shutdown instead of
    /// detaching them.
    pub wait_on_clients: bool,
}

/// Serves the commands configured for `hostname` until `shutdown`
/// resolves. A host with no commands idles without a listener so the
/// process can still be managed uniformly.
pub async fn run_server(
    configuration: &Configuration,
    hostname: &str,
    options: ServerOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let Some(host) = configuration
        .commands_for_host(hostname)
        .and_then(|commands| commands.values().next())
        .map(|command| command.host.clone())
    else {
        warn!("no server commands found in configuration, sleeping");
        shutdown.await;
        return Ok(());
    };

    // All commands of one host share one port.
    let commands: Arc<CommandMap> = Arc::new(
        configuration
            .commands_for_host(hostname)
            .cloned()
            .unwrap_or_default(),
    );
    let listener = net::listen(host.port).await?;
    let base_directory = Arc::new(configuration.base_directory().to_path_buf());
    let max_connections = host.options.max_connections;

    info!(
        "serving {} command(s) for host {} on port {}",
        commands.len(),
        hostname,
        listener.local_addr()?.port()
    );

    let mut sessions = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("failed to accept connection: {err}");
                        continue;
                    }
                };

                if !addr.ip().is_loopback() {
                    warn!("rejected non-loopback connection from {addr}");
                    continue;
                }
                if let Some(max) = max_connections
                    && sessions.len() >= max
                {
                    // Dropping the socket without an exit code reads as
                    // abnormal termination on the client.
                    warn!("connection limit of {max} reached, dropping connection");
                    continue;
                }
                if let Err(err) = stream.set_nodelay(true) {
                    debug!("failed to disable Nagle on accepted connection: {err}");
                }

                debug!("accepted connection from {addr}");
                let base_directory = base_directory.clone();
                let commands = commands.clone();
                sessions.spawn(async move {
                    match serve_connection(stream, &base_directory, &commands).await {
                        Ok(outcome) => debug!("session finished: {outcome:?}"),
                        Err(err) => warn!("session failed: {err}"),
                    }
                });
            }

            // Reap finished session tasks so the connection count stays
            // accurate.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    if options.wait_on_clients {
        info!("waiting on {} in-flight session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
    } else {
        sessions.detach_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn configuration(source: &str) -> Configuration {
        Configuration::load_with_env(source, "/tmp", &HashMap::new()).expect("load")
    }

    #[tokio::test]
    async fn a_host_without_commands_idles_until_shutdown() {
        let configuration = configuration("[worker:0]\ncmd\n");
        let shutdown = tokio::time::sleep(Duration::from_millis(50));

        run_server(&configuration, "elsewhere", ServerOptions::default(), shutdown)
            .await
            .expect("run");
    }

    #[tokio::test]
    async fn the_listener_stops_on_shutdown() {
        let configuration = configuration("[worker:0]\ncmd\n");
        let shutdown = tokio::time::sleep(Duration::from_millis(50));

        run_server(&configuration, "worker", ServerOptions::default(), shutdown)
            .await
            .expect("run");
    }

    #[tokio::test]
    async fn waiting_on_clients_is_a_clean_noop_without_sessions() {
        let configuration = configuration("[worker:0]\ncmd\n");
        let options = ServerOptions {
            wait_on_clients: true,
        };
        let shutdown = tokio::time::sleep(Duration::from_millis(50));

        run_server(&configuration, "worker", options, shutdown)
            .await
            .expect("run");
    }
}
