//! Configuration model and loader.
//!
//! The configuration format is line oriented. Client settings come first as
//! `key = value` pairs, followed by `[hostname:port]` sections, each
//! listing the commands that host serves:
//!
//! ```text
//! baseDirectory = ${WORKSPACE:-.}
//!
//! [builder:2020] --timeout 8000
//! compile CC=gcc ?CFLAGS=-O2 /opt/tools/compile
//! fmt
//! ```
//!
//! A command line is `name [directives...] [executable args...]`. Tokens
//! containing `=` before the first executable token are environment
//! directives: a `=NAME` key is inherited from the server, `?NAME` is
//! optional, and a bare `NAME` is required. Values may be unquoted,
//! single-quoted (deferring `${...}` expansion to session time), or
//! double-quoted with the usual escapes.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::env;
use crate::env::substitute;
use crate::error::RelayErr;
use crate::error::Result;
use crate::paths::absolute_path;

/// Port assigned to the first host section that does not bind one
/// explicitly; later sections count up from the last assignment.
pub const DEFAULT_STARTING_PORT: u16 = 1120;

/// Deadline for the client connect-with-backoff phase when the host section
/// does not override it. Negative means retry forever.
pub const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 30_000;

/// How an environment directive obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// Sent by the caller when set; falls back to the default.
    Required,
    /// Sent by the caller when set; falls back to the default, then to the
    /// server's own environment.
    Optional,
    /// Resolved on the server from its own environment or the default; any
    /// caller-sent value is ignored.
    Inherited,
}

/// One environment-variable rule attached to a command. An empty `default`
/// means the directive carries none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvDirective {
    pub kind: DirectiveKind,
    pub name: String,
    pub default: String,
}

/// Options accepted after a host section tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOptions {
    /// `--timeout <ms>`: connect deadline for clients of this host.
    pub connect_timeout_ms: Option<i64>,
    /// `--max-connections <n>`: concurrent session cap on the server.
    pub max_connections: Option<usize>,
}

/// One `[hostname:port]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub hostname: String,
    pub port: u16,
    pub options: HostOptions,
}

/// A configured command: where it runs, what it executes, and which
/// environment variables cross the relay.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub host: Arc<Host>,
    /// Argv prefix prepended before caller-supplied arguments; never empty.
    pub executable: Vec<String>,
    /// Ordered directives; order matters because defaults may reference
    /// variables established by earlier directives.
    pub env: Vec<EnvDirective>,
}

impl Command {
    pub fn connect_timeout_ms(&self) -> i64 {
        self.host
            .options
            .connect_timeout_ms
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS)
    }
}

pub type CommandMap = HashMap<String, Command>;

/// The loaded configuration. Read-only after load; lives for the daemon
/// lifetime.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    base_directory: PathBuf,
    host_commands: HashMap<String, CommandMap>,
    commands: CommandMap,
}

impl Configuration {
    /// Loads the configuration from a file, resolving relative paths
    /// against the file's parent directory.
    pub fn load_file(path: &Path) -> Result<Configuration> {
        let source =
            std::fs::read_to_string(path).map_err(|source| RelayErr::ConfigUnreadable {
                path: path.display().to_string(),
                source,
            })?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        Self::load(&source, &parent.to_string_lossy())
    }

    /// Loads the configuration from a string.
    pub fn load(source: &str, working_path: &str) -> Result<Configuration> {
        Self::load_with_env(source, working_path, &env::process_env())
    }

    /// Loads the configuration with an explicit environment for parse-time
    /// `${...}` substitution.
    pub fn load_with_env(
        source: &str,
        working_path: &str,
        env: &HashMap<String, String>,
    ) -> Result<Configuration> {
        let absolute_working_path = absolute_path(working_path);
        let mut parser = Parser {
            src: source.as_bytes(),
            pos: 0,
            env,
        };
        let mut configuration = Configuration {
            base_directory: absolute_working_path.clone(),
            ..Default::default()
        };

        // Client settings.
        loop {
            parser.skip_whitespace();
            match parser.peek() {
                None | Some(b'[') => break,
                Some(b'#') => parser.skip_comment(),
                Some(_) => {
                    let (key, value) = parser.parse_key_value()?;
                    parser.ensure_rest_of_line_empty()?;

                    match key.as_str() {
                        "baseDirectory" => {
                            let value = value.unwrap_or_default();
                            configuration.base_directory = if Path::new(&value).is_absolute() {
                                PathBuf::from(value)
                            } else {
                                absolute_path(
                                    &absolute_working_path.join(&value).to_string_lossy(),
                                )
                            };
                        }
                        _ => return Err(RelayErr::UnknownConfigKey(key)),
                    }
                }
            }
        }

        // Host sections and their commands.
        let mut current_host: Option<Arc<Host>> = None;
        let mut next_port = DEFAULT_STARTING_PORT;

        loop {
            parser.skip_whitespace();
            match parser.peek() {
                None => break,
                Some(b'#') => parser.skip_comment(),
                Some(b'[') => {
                    parser.pos += 1;
                    parser.skip_blank();
                    let tag = parser.parse_host_tag()?;
                    let option_values = parser.parse_arguments()?;
                    parser.ensure_rest_of_line_empty()?;

                    let (hostname, port) = match tag.split_once(':') {
                        Some((hostname, port)) => (hostname.to_string(), Some(parse_port(port)?)),
                        None => (tag, None),
                    };

                    if let Some(port) = port {
                        next_port = port;
                    }
                    let host = Arc::new(Host {
                        hostname,
                        port: next_port,
                        options: parse_host_options(&option_values)?,
                    });
                    next_port = next_port.wrapping_add(1);

                    debug!(
                        "parsed host section [{}:{}]",
                        host.hostname, host.port
                    );
                    current_host = Some(host);
                }
                Some(_) => {
                    let start = parser.pos;
                    let values = parser.parse_arguments()?;
                    parser.ensure_rest_of_line_empty()?;

                    let Some(host) = current_host.clone() else {
                        return Err(RelayErr::ConfigSyntax {
                            expected: "host section before the first command",
                            found: rest_of_line(source, start),
                        });
                    };

                    let command = build_command(host, values);
                    configuration
                        .host_commands
                        .entry(command.host.hostname.clone())
                        .or_default()
                        .insert(command.name.clone(), command.clone());
                    configuration.commands.insert(command.name.clone(), command);
                }
            }
        }

        Ok(configuration)
    }

    /// The directory all relative working directories are based on.
    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// All commands, across every host. Later definitions shadow earlier
    /// ones with the same name.
    pub fn commands(&self) -> &CommandMap {
        &self.commands
    }

    /// The commands served by the named host, if any.
    pub fn commands_for_host(&self, hostname: &str) -> Option<&CommandMap> {
        self.host_commands.get(hostname)
    }
}

/// Splits a command line's tokens into the command definition. Tokens with
/// an `=` past the first character are directives until the first
/// executable token; an absent executable defaults to the command name.
fn build_command(host: Arc<Host>, values: Vec<String>) -> Command {
    let mut values = values.into_iter();
    let name = values.next().unwrap_or_default();
    let mut executable = Vec::new();
    let mut env = Vec::new();

    for value in values {
        match value.char_indices().skip(1).find(|(_, c)| *c == '=') {
            Some((equals, _)) if executable.is_empty() => {
                let (key, default) = (&value[..equals], &value[equals + 1..]);
                let (kind, name) = if let Some(rest) = key.strip_prefix('=') {
                    (DirectiveKind::Inherited, rest)
                } else if let Some(rest) = key.strip_prefix('?') {
                    (DirectiveKind::Optional, rest)
                } else {
                    (DirectiveKind::Required, key)
                };
                env.push(EnvDirective {
                    kind,
                    name: name.to_string(),
                    default: default.to_string(),
                });
            }
            _ => executable.push(value),
        }
    }

    if executable.is_empty() {
        executable.push(name.clone());
    }

    Command {
        name,
        host,
        executable,
        env,
    }
}

fn parse_port(port: &str) -> Result<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RelayErr::InvalidPort(port.to_string()));
    }
    port.parse::<u16>()
        .map_err(|_| RelayErr::InvalidPort(port.to_string()))
}

fn parse_host_options(values: &[String]) -> Result<HostOptions> {
    let ignore_invalid = values.iter().any(|v| v == "--ignore-invalid-arguments");
    let mut options = HostOptions::default();
    let mut iter = values.iter();

    while let Some(value) = iter.next() {
        match value.as_str() {
            "--ignore-invalid-arguments" => {}
            "--timeout" => {
                options.connect_timeout_ms = Some(parse_option_value(value, iter.next())?);
            }
            "--max-connections" => {
                options.max_connections = Some(parse_option_value(value, iter.next())?);
            }
            other => {
                if ignore_invalid {
                    warn!("ignoring unrecognized host option {other}");
                } else {
                    return Err(RelayErr::UnknownHostOption(other.to_string()));
                }
            }
        }
    }

    Ok(options)
}

fn parse_option_value<T: std::str::FromStr>(option: &str, value: Option<&String>) -> Result<T> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| RelayErr::ConfigSyntax {
            expected: "a number after the host option",
            found: option.to_string(),
        })
}

/// The remainder of the line starting at `offset`, for error context.
fn rest_of_line(source: &str, offset: usize) -> String {
    source
        .get(offset..)
        .unwrap_or_default()
        .split(['\r', '\n'])
        .next()
        .unwrap_or_default()
        .to_string()
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    env: &'a HashMap<String, String>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn rest_of_line(&self, from: usize) -> String {
        let src = String::from_utf8_lossy(self.src);
        rest_of_line(&src, from)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Skips space and tab only.
    fn skip_blank(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_comment(&mut self) {
        while !matches!(self.peek(), None | Some(b'\n')) {
            self.pos += 1;
        }
    }

    fn ensure_rest_of_line_empty(&mut self) -> Result<()> {
        self.skip_blank();
        if self.peek() == Some(b'#') {
            self.skip_comment();
            return Ok(());
        }

        while let Some(byte) = self.peek() {
            if byte == b'\n' {
                break;
            }
            if !byte.is_ascii_whitespace() {
                return Err(RelayErr::ConfigSyntax {
                    expected: "end of line",
                    found: self.rest_of_line(self.pos),
                });
            }
            self.pos += 1;
        }

        Ok(())
    }

    /// Parses one string token. Stops at whitespace, `#`, or `terminator`.
    /// Unquoted and double-quoted content is `${...}`-substituted now;
    /// single-quoted content is kept verbatim for session-time expansion.
    fn parse_string(&mut self, terminator: Option<u8>) -> Result<String> {
        let start = self.pos;
        let mut value: Vec<u8> = Vec::new();
        // Start of the run that still needs parse-time substitution.
        let mut substitute_from = 0;

        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() || byte == b'#' || Some(byte) == terminator {
                break;
            }

            match byte {
                b'\'' => {
                    self.substitute_run(&mut value, substitute_from);
                    self.pos += 1;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(RelayErr::UnterminatedQuote(self.rest_of_line(start)));
                            }
                            Some(b'\'') => {
                                self.pos += 1;
                                if self.peek() == Some(b'\'') {
                                    value.push(b'\'');
                                    self.pos += 1;
                                } else {
                                    break;
                                }
                            }
                            Some(other) => {
                                value.push(other);
                                self.pos += 1;
                            }
                        }
                    }
                    substitute_from = value.len();
                }
                b'"' => {
                    self.pos += 1;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(RelayErr::UnterminatedQuote(self.rest_of_line(start)));
                            }
                            Some(b'"') => {
                                self.pos += 1;
                                if self.peek() == Some(b'"') {
                                    value.push(b'"');
                                    self.pos += 1;
                                } else {
                                    break;
                                }
                            }
                            Some(b'\\') => {
                                self.pos += 1;
                                self.parse_escape(&mut value)?;
                            }
                            Some(other) => {
                                value.push(other);
                                self.pos += 1;
                            }
                        }
                    }
                }
                other => {
                    value.push(other);
                    self.pos += 1;
                }
            }
        }

        self.substitute_run(&mut value, substitute_from);
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    /// Substitutes `${...}` references in `value[from..]` in place.
    fn substitute_run(&self, value: &mut Vec<u8>, from: usize) {
        if from >= value.len() {
            return;
        }
        let run = String::from_utf8_lossy(&value[from..]).into_owned();
        let substituted = substitute(&run, &HashMap::new(), self.env);
        value.truncate(from);
        value.extend_from_slice(substituted.as_bytes());
    }

    fn parse_escape(&mut self, value: &mut Vec<u8>) -> Result<()> {
        let Some(escape) = self.peek() else {
            return Err(RelayErr::UnknownEscape(' '));
        };
        self.pos += 1;

        let byte = match escape {
            b'"' => b'"',
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'b' => 0x08,
            b't' => b'\t',
            b'n' => b'\n',
            b'f' => 0x0C,
            b'r' => b'\r',
            b'0' => 0,
            b'x' => {
                let high = self.parse_hex_digit()?;
                let low = self.parse_hex_digit()?;
                (high << 4) | low
            }
            other => return Err(RelayErr::UnknownEscape(char::from(other))),
        };

        value.push(byte);
        Ok(())
    }

    fn parse_hex_digit(&mut self) -> Result<u8> {
        let Some(byte) = self.peek() else {
            return Err(RelayErr::InvalidHexDigit(' '));
        };
        self.pos += 1;

        match byte {
            b'0'..=b'9' => Ok(byte - b'0'),
            b'a'..=b'f' => Ok(byte - b'a' + 10),
            b'A'..=b'F' => Ok(byte - b'A' + 10),
            other => Err(RelayErr::InvalidHexDigit(char::from(other))),
        }
    }

    /// Parses `key [= value]`.
    fn parse_key_value(&mut self) -> Result<(String, Option<String>)> {
        let key = self.parse_string(Some(b'='))?;

        let mut found_equals = false;
        while matches!(self.peek(), Some(b' ' | b'\t'))
            || (!found_equals && self.peek() == Some(b'='))
        {
            if self.peek() == Some(b'=') {
                found_equals = true;
            }
            self.pos += 1;
        }

        if !found_equals {
            return Ok((key, None));
        }

        Ok((key, Some(self.parse_string(None)?)))
    }

    /// Parses the `hostname[:port]` tag of a host section, consuming the
    /// closing `]`.
    fn parse_host_tag(&mut self) -> Result<String> {
        let tag = self.parse_string(Some(b']'))?;
        self.skip_blank();

        if tag.is_empty() {
            return Err(RelayErr::ConfigSyntax {
                expected: "hostname",
                found: self.rest_of_line(self.pos),
            });
        }
        if self.peek() != Some(b']') {
            return Err(RelayErr::ConfigSyntax {
                expected: "host section close tag (])",
                found: self.rest_of_line(self.pos),
            });
        }

        self.pos += 1;
        self.skip_blank();
        Ok(tag)
    }

    /// Parses whitespace-delimited tokens until a comment or end of line.
    fn parse_arguments(&mut self) -> Result<Vec<String>> {
        let mut values = Vec::new();

        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() || byte == b'#' {
                break;
            }
            values.push(self.parse_string(None)?);
            self.skip_blank();
        }

        Ok(values)
    }
}
