//! End-to-end relay sessions over a real loopback socket with real child
//! processes.

#![cfg(unix)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use podlink_core::RelayErr;
use podlink_core::client::run_session;
use podlink_core::config::Command;
use podlink_core::config::CommandMap;
use podlink_core::config::DirectiveKind;
use podlink_core::config::EnvDirective;
use podlink_core::config::Host;
use podlink_core::config::HostOptions;
use podlink_core::net;
use podlink_core::session::SessionOutcome;
use podlink_core::session::serve_connection;
use podlink_protocol::FrameChannel;
use podlink_protocol::FrameKind;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn test_command(name: &str, executable: &[&str], env: Vec<EnvDirective>) -> Command {
    Command {
        name: name.to_string(),
        host: Arc::new(Host {
            hostname: "test".to_string(),
            port: 0,
            options: HostOptions::default(),
        }),
        executable: executable.iter().map(|s| s.to_string()).collect(),
        env,
    }
}

fn directive(kind: DirectiveKind, name: &str, default: &str) -> EnvDirective {
    EnvDirective {
        kind,
        name: name.to_string(),
        default: default.to_string(),
    }
}

fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Drives one full session: a server accepting a single connection and a
/// client running `name` with the given stdin. Returns both ends' results
/// and what the client wrote to its stdout/stderr.
async fn run_relay(
    base: &Path,
    command: &Command,
    working_directory: &str,
    args: &[&str],
    caller_env: &HashMap<String, String>,
    stdin: &[u8],
) -> (
    podlink_core::Result<SessionOutcome>,
    podlink_core::Result<i32>,
    Vec<u8>,
    Vec<u8>,
) {
    let mut commands: CommandMap = HashMap::new();
    commands.insert(command.name.clone(), command.clone());

    let listener = net::listen(0).await.expect("listen");
    let port = listener.local_addr().expect("local addr").port();

    let server = async {
        let (stream, _) = listener.accept().await.expect("accept");
        serve_connection(stream, base, &commands).await
    };

    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let client = async {
        let stream = net::connect_with_backoff(port, 5000).await?;
        run_session(
            stream,
            working_directory,
            command,
            &args,
            caller_env,
            stdin,
            &mut stdout,
            &mut stderr,
        )
        .await
    };

    let (server_result, client_result) = tokio::join!(server, client);
    (server_result, client_result, stdout, stderr)
}

#[tokio::test]
async fn echo_round_trips_stdout_and_exit_code() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("echo", &["/bin/echo"], vec![]);

    let (server, client, stdout, stderr) = run_relay(
        base.path(),
        &command,
        "",
        &["hello"],
        &HashMap::new(),
        b"",
    )
    .await;

    assert!(matches!(server, Ok(SessionOutcome::Exited(0))));
    assert_eq!(client.expect("client"), 0);
    assert_eq!(stdout, b"hello\n");
    assert!(stderr.is_empty());
}

#[tokio::test]
async fn required_variable_travels_with_the_session() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command(
        "show",
        &["/bin/sh", "-c", "printf '%s' \"$NAME\""],
        vec![directive(DirectiveKind::Required, "NAME", "")],
    );

    let (_, client, stdout, _) = run_relay(
        base.path(),
        &command,
        "",
        &[],
        &env_of(&[("NAME", "hi")]),
        b"",
    )
    .await;

    assert_eq!(client.expect("client"), 0);
    assert_eq!(stdout, b"hi");
}

#[tokio::test]
async fn optional_variable_falls_back_to_its_default() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command(
        "show",
        &["/bin/sh", "-c", "printf '%s' \"$NAME\""],
        vec![directive(DirectiveKind::Optional, "NAME", "fallback")],
    );

    let (_, client, stdout, _) =
        run_relay(base.path(), &command, "", &[], &HashMap::new(), b"").await;

    assert_eq!(client.expect("client"), 0);
    assert_eq!(stdout, b"fallback");
}

#[tokio::test]
async fn inherited_variable_ignores_the_caller() {
    let base = TempDir::new().expect("tempdir");
    // BASE establishes the value on the server; NAME inherits an
    // expansion of it, and the caller's own NAME must be ignored.
    let command = test_command(
        "show",
        &["/bin/sh", "-c", "printf '%s' \"$NAME\""],
        vec![
            directive(DirectiveKind::Required, "BASE", "orig"),
            directive(DirectiveKind::Inherited, "NAME", "prefix:${BASE}"),
        ],
    );

    let (_, client, stdout, _) = run_relay(
        base.path(),
        &command,
        "",
        &[],
        &env_of(&[("NAME", "ignored")]),
        b"",
    )
    .await;

    assert_eq!(client.expect("client"), 0);
    assert_eq!(stdout, b"prefix:orig");
}

#[tokio::test]
async fn streams_a_mebibyte_byte_for_byte() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("cat", &["/bin/cat"], vec![]);

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let (server, client, stdout, stderr) = run_relay(
        base.path(),
        &command,
        "",
        &[],
        &HashMap::new(),
        &payload,
    )
    .await;

    assert!(matches!(server, Ok(SessionOutcome::Exited(0))));
    assert_eq!(client.expect("client"), 0);
    assert_eq!(stdout.len(), payload.len());
    assert!(stdout == payload, "relayed stream differs from the input");
    assert!(stderr.is_empty());
}

#[tokio::test]
async fn stdin_eof_propagates_and_the_exit_code_comes_back() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command(
        "eof",
        &["/bin/sh", "-c", "cat >/dev/null; printf 'eof-ok'; exit 7"],
        vec![],
    );

    let (server, client, stdout, _) =
        run_relay(base.path(), &command, "", &[], &HashMap::new(), b"").await;

    assert!(matches!(server, Ok(SessionOutcome::Exited(7))));
    assert_eq!(client.expect("client"), 7);
    assert_eq!(stdout, b"eof-ok");
}

#[tokio::test]
async fn stderr_is_kept_separate_from_stdout() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command(
        "split",
        &["/bin/sh", "-c", "printf 'out'; printf 'err' >&2; exit 1"],
        vec![],
    );

    let (server, client, stdout, stderr) =
        run_relay(base.path(), &command, "", &[], &HashMap::new(), b"").await;

    assert!(matches!(server, Ok(SessionOutcome::Exited(1))));
    assert_eq!(client.expect("client"), 1);
    assert_eq!(stdout, b"out");
    assert_eq!(stderr, b"err");
}

#[tokio::test]
async fn the_child_runs_in_the_relativized_working_directory() {
    let base = TempDir::new().expect("tempdir");
    std::fs::create_dir(base.path().join("sub")).expect("mkdir");
    let command = test_command("pwd", &["/bin/pwd"], vec![]);

    let (_, client, stdout, _) = run_relay(
        base.path(),
        &command,
        "sub",
        &[],
        &HashMap::new(),
        b"",
    )
    .await;

    assert_eq!(client.expect("client"), 0);
    let reported = String::from_utf8(stdout).expect("utf8");
    let expected = std::fs::canonicalize(base.path().join("sub")).expect("canonicalize");
    assert_eq!(
        std::fs::canonicalize(reported.trim_end()).expect("canonicalize"),
        expected
    );
}

#[tokio::test]
async fn executables_in_the_working_directory_win_over_the_search_path() {
    use std::os::unix::fs::PermissionsExt;

    let base = TempDir::new().expect("tempdir");
    let tool = base.path().join("tool");
    std::fs::write(&tool, "#!/bin/sh\nprintf 'local tool'\n").expect("write");
    let mut permissions = std::fs::metadata(&tool).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&tool, permissions).expect("chmod");

    let command = test_command("tool", &["tool"], vec![]);

    let (_, client, stdout, _) =
        run_relay(base.path(), &command, "", &[], &HashMap::new(), b"").await;

    assert_eq!(client.expect("client"), 0);
    assert_eq!(stdout, b"local tool");
}

#[tokio::test]
async fn a_non_executable_local_file_falls_back_to_the_search_path() {
    let base = TempDir::new().expect("tempdir");
    // A stray data file with the command's name must not shadow the real
    // executable on the search path.
    std::fs::write(base.path().join("true"), b"not a program").expect("write");

    let command = test_command("true", &["true"], vec![]);

    let (server, client, _, _) =
        run_relay(base.path(), &command, "", &[], &HashMap::new(), b"").await;

    assert!(matches!(server, Ok(SessionOutcome::Exited(0))));
    assert_eq!(client.expect("client"), 0);
}

#[tokio::test]
async fn unknown_command_aborts_the_session_without_an_exit_code() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("missing", &["/bin/true"], vec![]);

    // The server's command table is empty, so the start frame cannot be
    // resolved.
    let listener = net::listen(0).await.expect("listen");
    let port = listener.local_addr().expect("local addr").port();
    let commands: CommandMap = HashMap::new();
    let base_path = base.path().to_path_buf();

    let server = async {
        let (stream, _) = listener.accept().await.expect("accept");
        serve_connection(stream, &base_path, &commands).await
    };
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let client = async {
        let stream = net::connect_with_backoff(port, 5000).await?;
        run_session(
            stream,
            "",
            &command,
            &[],
            &HashMap::new(),
            &b""[..],
            &mut stdout,
            &mut stderr,
        )
        .await
    };

    let (server_result, client_result) = tokio::join!(server, client);
    assert!(matches!(server_result, Err(RelayErr::CommandNotFound(_))));
    assert!(matches!(
        client_result,
        Err(RelayErr::ClosedWithoutExitCode)
    ));
}

#[tokio::test]
async fn spawn_failure_aborts_the_session_without_an_exit_code() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("broken", &["/nonexistent/program"], vec![]);

    let (server, client, _, _) =
        run_relay(base.path(), &command, "", &[], &HashMap::new(), b"").await;

    assert!(matches!(server, Err(RelayErr::Spawn { .. })));
    assert!(matches!(client, Err(RelayErr::ClosedWithoutExitCode)));
}

#[tokio::test]
async fn signal_terminated_child_yields_no_exit_code() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("selfkill", &["/bin/sh", "-c", "kill -TERM $$"], vec![]);

    let (server, client, _, _) = run_relay(
        base.path(),
        &command,
        "",
        &[],
        &HashMap::new(),
        b"",
    )
    .await;

    assert!(matches!(server, Ok(SessionOutcome::Signaled)));
    assert!(matches!(client, Err(RelayErr::ClosedWithoutExitCode)));
}

/// Accepts one connection and serves it against a single-command table.
async fn serve_one(
    listener: tokio::net::TcpListener,
    base: std::path::PathBuf,
    command: Command,
) -> podlink_core::Result<SessionOutcome> {
    let mut commands: CommandMap = HashMap::new();
    commands.insert(command.name.clone(), command);
    let (stream, _) = listener.accept().await.expect("accept");
    serve_connection(stream, &base, &commands).await
}

#[tokio::test]
async fn stdio_frames_before_the_start_command_are_rejected() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("cat", &["/bin/cat"], vec![]);

    let listener = net::listen(0).await.expect("listen");
    let port = listener.local_addr().expect("local addr").port();
    let server = serve_one(listener, base.path().to_path_buf(), command);

    let client = async {
        let stream = net::connect_with_backoff(port, 5000).await.expect("connect");
        let mut channel = FrameChannel::new(stream);
        channel
            .send_frame(FrameKind::StdinData, b"too early")
            .await
            .expect("send");
        // The server drops the connection without ever starting a child.
        while let Ok(Some(_)) = channel.read_frame().await {}
    };

    let (server_result, ()) = tokio::join!(server, client);
    assert!(matches!(
        server_result,
        Err(RelayErr::UnexpectedPreludeFrame {
            kind: FrameKind::StdinData
        })
    ));
}

#[tokio::test]
async fn stdin_data_after_the_eof_marker_is_discarded() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command("cat", &["/bin/cat"], vec![]);

    let listener = net::listen(0).await.expect("listen");
    let port = listener.local_addr().expect("local addr").port();
    let server = serve_one(listener, base.path().to_path_buf(), command);

    let client = async {
        let stream = net::connect_with_backoff(port, 5000).await.expect("connect");
        let mut channel = FrameChannel::new(stream);
        channel
            .queue_frame(FrameKind::WorkingDirectory, b"")
            .await
            .expect("queue");
        channel
            .send_frame(FrameKind::StartCommand, b"cat")
            .await
            .expect("send");

        channel
            .send_frame(FrameKind::StdinData, b"abc")
            .await
            .expect("send");
        channel
            .send_frame(FrameKind::StdinData, b"")
            .await
            .expect("send eof");
        channel
            .send_frame(FrameKind::StdinData, b"def")
            .await
            .expect("send after eof");

        let mut stdout = Vec::new();
        loop {
            let frame = channel
                .read_frame()
                .await
                .expect("read")
                .expect("server closed early");
            match frame.kind {
                FrameKind::StdoutData => stdout.extend_from_slice(&frame.payload),
                FrameKind::StderrData => {}
                FrameKind::ExitCode => {
                    return (stdout, frame.as_exit_code().expect("exit code"));
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    };

    let (server_result, (stdout, exit_code)) = tokio::join!(server, client);
    assert!(matches!(server_result, Ok(SessionOutcome::Exited(0))));
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, b"abc");
}

#[tokio::test]
async fn caller_sent_value_for_an_inherited_variable_is_ignored_on_the_wire() {
    let base = TempDir::new().expect("tempdir");
    let command = test_command(
        "show",
        &["/bin/sh", "-c", "printf '%s' \"$NAME\""],
        vec![
            directive(DirectiveKind::Required, "BASE", "orig"),
            directive(DirectiveKind::Inherited, "NAME", "prefix:${BASE}"),
        ],
    );

    let listener = net::listen(0).await.expect("listen");
    let port = listener.local_addr().expect("local addr").port();
    let server = serve_one(listener, base.path().to_path_buf(), command);

    let client = async {
        let stream = net::connect_with_backoff(port, 5000).await.expect("connect");
        let mut channel = FrameChannel::new(stream);
        channel
            .queue_frame(FrameKind::WorkingDirectory, b"")
            .await
            .expect("queue");
        channel
            .queue_frame(FrameKind::EnvironmentVariable, b"NAME=ignored")
            .await
            .expect("queue");
        channel
            .send_frame(FrameKind::StartCommand, b"show")
            .await
            .expect("send");
        channel
            .send_frame(FrameKind::StdinData, b"")
            .await
            .expect("send eof");

        let mut stdout = Vec::new();
        loop {
            let frame = channel
                .read_frame()
                .await
                .expect("read")
                .expect("server closed early");
            match frame.kind {
                FrameKind::StdoutData => stdout.extend_from_slice(&frame.payload),
                FrameKind::StderrData | FrameKind::StdinData => {}
                FrameKind::ExitCode => return stdout,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    };

    let (server_result, stdout) = tokio::join!(server, client);
    assert!(matches!(server_result, Ok(SessionOutcome::Exited(0))));
    assert_eq!(stdout, b"prefix:orig");
}
