//! Server side of a relay session: the per-connection supervisor.
//!
//! Each accepted connection reads the prelude, resolves the requested
//! command, launches the child with piped standard streams, and then
//! multiplexes child stdout/stderr, buffered stdin, the socket, and child
//! exit in a single `tokio::select!` loop. The session ends by delivering
//! exactly one exit code — or none at all when the child was signaled, the
//! peer asked for termination, or the protocol was violated.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use bytes::Buf;
use bytes::BytesMut;
use podlink_protocol::DATA_CHUNK_SIZE;
use podlink_protocol::FrameChannel;
use podlink_protocol::FrameKind;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tracing::debug;
use tracing::warn;

use crate::config::Command;
use crate::config::CommandMap;
use crate::env;
use crate::error::RelayErr;
use crate::error::Result;

/// How a session concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The child exited normally and the code was delivered to the client.
    Exited(i32),
    /// The child was terminated by a signal; no exit code was sent.
    Signaled,
    /// The client requested termination (or the socket closed) and the
    /// child was sent a terminate signal.
    Terminated,
}

/// Serves one accepted connection to completion.
pub async fn serve_connection<S>(
    stream: S,
    base_directory: &Path,
    commands: &CommandMap,
) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_env = env::process_env();
    let mut channel = FrameChannel::new(stream);

    let prelude = read_prelude(&mut channel, base_directory, &host_env).await?;
    let command = commands
        .get(&prelude.command_name)
        .ok_or_else(|| RelayErr::CommandNotFound(prelude.command_name.clone()))?;

    let mut child = launch(command, &prelude, &host_env)?;

    match stream_child(&mut channel, &mut child).await {
        Ok(StreamEnd::Exited(status)) => match status.code() {
            Some(code) => {
                debug!("sending exit code {code} to client");
                channel
                    .send_frame(FrameKind::ExitCode, &code.to_le_bytes())
                    .await?;
                Ok(SessionOutcome::Exited(code))
            }
            None => {
                debug!("child terminated by signal, closing without an exit code");
                Ok(SessionOutcome::Signaled)
            }
        },
        Ok(StreamEnd::Terminated) => {
            terminate_child(&mut child);
            Ok(SessionOutcome::Terminated)
        }
        Err(err) => {
            terminate_child(&mut child);
            Err(err)
        }
    }
}

/// Everything the client establishes before `StartCommand`.
struct Prelude {
    process_directory: PathBuf,
    received_env: HashMap<String, String>,
    args: Vec<String>,
    command_name: String,
}

async fn read_prelude<S>(
    channel: &mut FrameChannel<S>,
    base_directory: &Path,
    host_env: &HashMap<String, String>,
) -> Result<Prelude>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut prelude = Prelude {
        process_directory: base_directory.to_path_buf(),
        received_env: HashMap::new(),
        args: Vec::new(),
        command_name: String::new(),
    };

    loop {
        let Some(frame) = channel.read_frame().await? else {
            return Err(RelayErr::ClosedDuringPrelude);
        };
        let text = || String::from_utf8_lossy(&frame.payload).into_owned();

        match frame.kind {
            FrameKind::WorkingDirectory => {
                prelude.process_directory = base_directory.join(text());
                debug!(
                    "client working directory \"{}\", process directory {:?}",
                    text(),
                    prelude.process_directory
                );
            }
            FrameKind::EnvironmentVariable => {
                let entry = text();
                debug!("received environment variable \"{entry}\"");
                match entry.split_once('=') {
                    Some((name, value)) => {
                        prelude
                            .received_env
                            .insert(name.to_string(), value.to_string());
                    }
                    // A bare name binds the server's own current value.
                    None => {
                        if let Some(value) = host_env.get(&entry) {
                            prelude.received_env.insert(entry, value.clone());
                        }
                    }
                }
            }
            FrameKind::CommandArgument => {
                prelude.args.push(text());
            }
            FrameKind::StartCommand => {
                prelude.command_name = text();
                debug!("received start command \"{}\"", prelude.command_name);
                return Ok(prelude);
            }
            kind => return Err(RelayErr::UnexpectedPreludeFrame { kind }),
        }
    }
}

fn launch(command: &Command, prelude: &Prelude, host_env: &HashMap<String, String>) -> Result<Child> {
    let environment = env::resolve_environment(&command.env, &prelude.received_env, host_env);

    let mut argv = command.executable.clone();
    argv.extend(prelude.args.iter().cloned());

    debug!(
        "starting {argv:?} in {:?} with environment {environment:?}",
        prelude.process_directory
    );

    // First, try the working directory, then try the search path. The
    // fallback is unconditional: a same-named file that cannot be executed
    // must not shadow a usable executable elsewhere.
    let local = prelude.process_directory.join(&argv[0]);
    match spawn(&local, &argv, &environment, &prelude.process_directory) {
        Ok(child) => Ok(child),
        Err(err) => {
            debug!("failed to start {local:?} ({err}), trying the search path");
            spawn(
                Path::new(&argv[0]),
                &argv,
                &environment,
                &prelude.process_directory,
            )
            .map_err(|source| RelayErr::Spawn {
                command: argv[0].clone(),
                source,
            })
        }
    }
}

fn spawn(
    program: &Path,
    argv: &[String],
    environment: &[(String, String)],
    directory: &Path,
) -> io::Result<Child> {
    let mut builder = tokio::process::Command::new(program);
    #[cfg(unix)]
    builder.arg0(&argv[0]);
    builder
        .args(&argv[1..])
        .env_clear()
        .envs(environment.iter().cloned())
        .current_dir(directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

enum StreamEnd {
    Exited(ExitStatus),
    Terminated,
}

async fn stream_child<S>(channel: &mut FrameChannel<S>, child: &mut Child) -> Result<StreamEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut child_stdin = child.stdin.take();
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout pipe was unexpectedly not available"))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr pipe was unexpectedly not available"))?;

    let mut stdout_buf = vec![0u8; DATA_CHUNK_SIZE];
    let mut stderr_buf = vec![0u8; DATA_CHUNK_SIZE];
    let mut stdout_open = true;
    let mut stderr_open = true;

    // Stdin arriving from the client is queued here and pushed into the
    // child as the pipe accepts it, so a child that never reads cannot
    // deadlock the session.
    let mut stdin_queue = BytesMut::new();
    let mut stdin_eof = false;

    let mut exit_status: Option<ExitStatus> = None;

    while stdout_open || stderr_open || exit_status.is_none() {
        tokio::select! {
            status = child.wait(), if exit_status.is_none() => {
                let status = status?;
                debug!("child exited ({status}), draining stdout and stderr");
                if !stdin_queue.is_empty() {
                    debug!("discarding {} bytes of undelivered stdin", stdin_queue.len());
                    stdin_queue.clear();
                }
                child_stdin = None;
                exit_status = Some(status);
            }

            read = child_stdout.read(&mut stdout_buf), if stdout_open => {
                let read = read?;
                channel.send_frame(FrameKind::StdoutData, &stdout_buf[..read]).await?;
                if read == 0 {
                    debug!("child closed stdout");
                    stdout_open = false;
                }
            }

            read = child_stderr.read(&mut stderr_buf), if stderr_open => {
                let read = read?;
                channel.send_frame(FrameKind::StderrData, &stderr_buf[..read]).await?;
                if read == 0 {
                    debug!("child closed stderr");
                    stderr_open = false;
                }
            }

            written = write_pending(&mut child_stdin, &stdin_queue),
                if child_stdin.is_some() && !stdin_queue.is_empty() =>
            {
                match written {
                    Ok(written) => stdin_queue.advance(written),
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                        // The child stopped reading; acknowledge the loss so
                        // the client stops pumping.
                        warn!("child closed stdin, dropping {} buffered bytes", stdin_queue.len());
                        stdin_queue.clear();
                        child_stdin = None;
                        channel.send_frame(FrameKind::StdinData, &[]).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            frame = channel.read_frame() => {
                let Some(frame) = frame? else {
                    warn!("connection closed unexpectedly");
                    return Err(RelayErr::PeerDisconnected);
                };
                match frame.kind {
                    FrameKind::StdinData if frame.payload.is_empty() => {
                        stdin_eof = true;
                    }
                    FrameKind::StdinData => {
                        if stdin_eof || child_stdin.is_none() {
                            debug!("ignoring {} stdin bytes after close", frame.payload.len());
                        } else {
                            stdin_queue.extend_from_slice(&frame.payload);
                        }
                    }
                    FrameKind::TerminateCommand => {
                        debug!("received terminate command, halting the child");
                        return Ok(StreamEnd::Terminated);
                    }
                    kind => return Err(RelayErr::UnexpectedSessionFrame { kind }),
                }
            }
        }

        // Half-close the child's stdin once everything buffered went out.
        if stdin_eof && stdin_queue.is_empty() && child_stdin.is_some() {
            debug!("closing child stdin");
            child_stdin = None;
        }
    }

    let status =
        exit_status.ok_or_else(|| io::Error::other("missing child exit status"))?;
    Ok(StreamEnd::Exited(status))
}

/// Writes as much of the queue as the pipe accepts right now. Pending on a
/// missing pipe; the caller guards against that.
async fn write_pending(stdin: &mut Option<ChildStdin>, queue: &BytesMut) -> io::Result<usize> {
    match stdin {
        Some(pipe) => pipe.write(queue).await,
        None => std::future::pending().await,
    }
}

/// Asks the child to terminate. The session does not wait for it; the
/// runtime reaps the process in the background.
fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal dispatch to a child this session spawned.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}
