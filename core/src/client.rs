//! Client side of a relay session.
//!
//! The stub connects to the command's worker, sends the prelude (working
//! directory, caller arguments, environment variables, then the start
//! frame), and multiplexes local stdin against remote stdout/stderr until
//! the exit code arrives.

use std::collections::HashMap;

use podlink_protocol::DATA_CHUNK_SIZE;
use podlink_protocol::Frame;
use podlink_protocol::FrameChannel;
use podlink_protocol::FrameKind;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Command;
use crate::config::DirectiveKind;
use crate::env;
use crate::error::RelayErr;
use crate::error::Result;
use crate::net;

/// Runs `command` remotely, wiring this process's standard streams across
/// the relay, and returns the remote exit code.
pub async fn run_remote_command(
    working_directory: &str,
    command: &Command,
    args: &[String],
) -> Result<i32> {
    let stream = net::connect_with_backoff(command.host.port, command.connect_timeout_ms()).await?;

    run_session(
        stream,
        working_directory,
        command,
        args,
        &env::process_env(),
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
}

/// Session body, parameterized over the local standard streams so it can
/// be exercised against in-memory pipes.
#[allow(clippy::too_many_arguments)]
pub async fn run_session<S, I, O, E>(
    stream: S,
    working_directory: &str,
    command: &Command,
    args: &[String],
    caller_env: &HashMap<String, String>,
    mut stdin: I,
    mut stdout: O,
    mut stderr: E,
) -> Result<i32>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut channel = FrameChannel::new(stream);

    // Prelude: queued without flushing, the start frame pushes it all out
    // in one segment.
    debug!("sending working directory \"{working_directory}\"");
    channel
        .queue_frame(FrameKind::WorkingDirectory, working_directory.as_bytes())
        .await?;

    for arg in args {
        channel
            .queue_frame(FrameKind::CommandArgument, arg.as_bytes())
            .await?;
    }

    // Required and optional variables travel with the session when the
    // caller has them set; inherited ones are the server's business.
    for directive in &command.env {
        if directive.kind == DirectiveKind::Inherited {
            continue;
        }
        if let Some(value) = caller_env.get(&directive.name) {
            let entry = format!("{}={value}", directive.name);
            channel
                .queue_frame(FrameKind::EnvironmentVariable, entry.as_bytes())
                .await?;
        }
    }

    debug!("starting command \"{}\"", command.name);
    channel
        .send_frame(FrameKind::StartCommand, command.name.as_bytes())
        .await?;

    // Multiplex local stdin against remote stdout/stderr and the exit code.
    let mut stdin_buf = vec![0u8; DATA_CHUNK_SIZE - 1];
    let mut stdin_open = true;
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            read = stdin.read(&mut stdin_buf), if stdin_open => {
                let read = read?;
                if read == 0 {
                    debug!("stdin reached end of file");
                    stdin_open = false;
                }
                channel
                    .send_frame(FrameKind::StdinData, &stdin_buf[..read])
                    .await
                    .map_err(disconnect_is_abnormal)?;
            }

            frame = channel.read_frame() => {
                let Some(frame) = frame.map_err(disconnect_is_abnormal)? else {
                    return Err(RelayErr::ClosedWithoutExitCode);
                };

                match frame.kind {
                    FrameKind::StdinData => {
                        // The child stopped consuming stdin; stop pumping.
                        if stdin_open {
                            debug!("server closed stdin");
                            stdin_open = false;
                        }
                    }
                    FrameKind::StdoutData => {
                        forward_output(&mut stdout, &mut stdout_open, "stdout", &frame).await?;
                    }
                    FrameKind::StderrData => {
                        forward_output(&mut stderr, &mut stderr_open, "stderr", &frame).await?;
                    }
                    FrameKind::ExitCode => {
                        stdout.flush().await?;
                        stderr.flush().await?;
                        let code = frame.as_exit_code()?;
                        debug!("received exit code {code}");
                        return Ok(code);
                    }
                    kind => return Err(RelayErr::UnexpectedSessionFrame { kind }),
                }
            }
        }
    }
}

/// A connection torn down without an exit code is abnormal termination,
/// whether it surfaces as a clean close, a reset, or a broken pipe.
fn disconnect_is_abnormal(err: podlink_protocol::ProtocolError) -> RelayErr {
    use podlink_protocol::ProtocolError;
    match err {
        ProtocolError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            RelayErr::ClosedWithoutExitCode
        }
        ProtocolError::TruncatedFrame(_) => RelayErr::ClosedWithoutExitCode,
        other => RelayErr::Wire(other),
    }
}

/// Writes one stdout/stderr frame to the local stream; an empty payload
/// closes it. Data after a close is a protocol violation.
async fn forward_output<W>(
    writer: &mut W,
    open: &mut bool,
    name: &'static str,
    frame: &Frame,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.is_empty() {
        if *open {
            debug!("server closed {name}");
            writer.flush().await?;
            *open = false;
        }
        return Ok(());
    }

    if !*open {
        return Err(RelayErr::StreamAlreadyClosed { stream: name });
    }

    writer.write_all(&frame.payload).await?;
    Ok(())
}
