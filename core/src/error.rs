use podlink_protocol::FrameKind;
use podlink_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayErr>;

#[derive(Debug, Error)]
pub enum RelayErr {
    // Configuration.
    #[error("unrecognized configuration key \"{0}\"")]
    UnknownConfigKey(String),
    #[error("unterminated quoted string in configuration: {0}")]
    UnterminatedQuote(String),
    #[error("unrecognized escape sequence (\\{0}) in configuration")]
    UnknownEscape(char),
    #[error("invalid hex character in configuration: {0}")]
    InvalidHexDigit(char),
    #[error("invalid port number \"{0}\"")]
    InvalidPort(String),
    #[error("unrecognized host option \"{0}\"")]
    UnknownHostOption(String),
    #[error("expecting {expected}, but found \"{found}\"")]
    ConfigSyntax {
        expected: &'static str,
        found: String,
    },
    #[error("configuration could not be loaded from {path}")]
    ConfigUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command \"{0}\" is not present in the configuration")]
    CommandNotFound(String),

    // Paths.
    #[error("cannot relativize unrelated paths \"{base}\" and \"{path}\"")]
    UnrelatedPaths { base: String, path: String },

    // Connection establishment.
    #[error("failed to connect to port {port} within {timeout_ms}ms")]
    ConnectTimeout { port: u16, timeout_ms: i64 },

    // Session protocol.
    #[error("unexpected {kind:?} frame during the prelude")]
    UnexpectedPreludeFrame { kind: FrameKind },
    #[error("unexpected {kind:?} frame after the command started")]
    UnexpectedSessionFrame { kind: FrameKind },
    #[error("connection closed before the command started")]
    ClosedDuringPrelude,
    #[error("connection closed before an exit code was delivered")]
    ClosedWithoutExitCode,
    #[error("connection closed while the command was running")]
    PeerDisconnected,
    #[error("received {stream} data from the server, but the stream is already closed")]
    StreamAlreadyClosed { stream: &'static str },

    // Child process.
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Stub executables.
    #[error("failed to create client stub for command {command}: {source}")]
    StubCreation {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Wire(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
