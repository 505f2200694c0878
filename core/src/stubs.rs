//! Stub-executable management.
//!
//! Commands hosted elsewhere get a symlink named after them, pointing at
//! this binary. Invoking the symlink runs the client session for that
//! command, so remote tools drop into `PATH` like local ones.

use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::warn;

use crate::config::Configuration;
use crate::error::RelayErr;
use crate::error::Result;

/// Controls which stubs are generated and how conflicts are handled.
#[derive(Debug, Clone, Default)]
pub struct StubOptions {
    /// Directory the stubs are created in.
    pub directory: PathBuf,
    /// Also generate stubs for commands hosted by this server.
    pub generate_local: bool,
    /// Replace existing entries instead of failing.
    pub overwrite: bool,
    /// Generate nothing (local executables only).
    pub disabled: bool,
}

/// Creates the client stubs for `server_name` and returns the created
/// paths, for removal at shutdown.
pub fn create_stubs(
    configuration: &Configuration,
    server_name: &str,
    options: &StubOptions,
) -> Result<Vec<PathBuf>> {
    let target = std::env::current_exe()?;
    let mut created = Vec::new();

    for command in configuration.commands().values() {
        let path = options.directory.join(&command.name);

        if options.disabled || options.overwrite {
            remove_entry(&path);
        }
        if options.disabled {
            continue;
        }
        if !options.generate_local && server_name == command.host.hostname {
            continue;
        }

        if let Err(source) = symlink(&target, &path) {
            return Err(RelayErr::StubCreation {
                command: command.name.clone(),
                source,
            });
        }

        debug!("created stub {path:?} -> {target:?}");
        created.push(path);
    }

    Ok(created)
}

/// Removes stubs created by [`create_stubs`].
pub fn remove_stubs(paths: &[PathBuf]) {
    for path in paths {
        if std::fs::remove_file(path).is_err() {
            warn!("failed to remove client stub {path:?}");
        }
    }
}

fn remove_entry(path: &Path) {
    if path.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(unix)]
fn symlink(target: &Path, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn symlink(target: &Path, path: &Path) -> std::io::Result<()> {
    std::fs::hard_link(target, path)
}
