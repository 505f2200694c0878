use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;

/// Size of the fixed frame header: one type byte plus a little-endian u32
/// payload length.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single frame payload. Stdio frames are produced in
/// chunks of at most [`DATA_CHUNK_SIZE`]; the limit only guards against a
/// corrupt or hostile peer driving an unbounded allocation.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Stdio data is relayed in chunks of at most this many bytes.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// Frame kinds. The numeric values are the on-the-wire type codes and are
/// stable; they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client → server, prelude. Payload is the UTF-8 relative working
    /// directory.
    WorkingDirectory = 0,
    /// Client → server, prelude. Payload is `NAME` or `NAME=VALUE`.
    EnvironmentVariable = 1,
    /// Client → server, prelude. Payload is one UTF-8 argument.
    CommandArgument = 2,
    /// Client → server. Terminates the prelude; payload is the command
    /// name. Exactly one per session.
    StartCommand = 3,
    /// Client → server streaming; an empty payload means the caller closed
    /// its stdin. Server → client it is always empty and means "your stdin
    /// is no longer wanted".
    StdinData = 4,
    /// Server → client. An empty payload means the child closed stdout.
    StdoutData = 5,
    /// Server → client. An empty payload means the child closed stderr.
    StderrData = 6,
    /// Client → server. Payload is four zero bytes.
    TerminateCommand = 7,
    /// Server → client, terminal. Payload is the 32-bit little-endian
    /// child exit code; at most one per session.
    ExitCode = 8,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(FrameKind::WorkingDirectory),
            1 => Ok(FrameKind::EnvironmentVariable),
            2 => Ok(FrameKind::CommandArgument),
            3 => Ok(FrameKind::StartCommand),
            4 => Ok(FrameKind::StdinData),
            5 => Ok(FrameKind::StdoutData),
            6 => Ok(FrameKind::StderrData),
            7 => Ok(FrameKind::TerminateCommand),
            8 => Ok(FrameKind::ExitCode),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Builds the terminal exit-code frame.
    pub fn exit_code(code: i32) -> Self {
        Self::new(FrameKind::ExitCode, code.to_le_bytes().to_vec())
    }

    /// Builds the terminate-command frame (four zero bytes, by convention).
    pub fn terminate() -> Self {
        Self::new(FrameKind::TerminateCommand, vec![0u8; 4])
    }

    /// Interprets the payload as a little-endian exit code.
    pub fn as_exit_code(&self) -> Result<i32, ProtocolError> {
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| ProtocolError::MalformedExitCode {
                len: self.payload.len(),
            })?;
        Ok(i32::from_le_bytes(bytes))
    }
}

/// Errors raised by the frame codec and channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame type {0}")]
    UnknownFrameKind(u8),
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    OversizedPayload { len: u32, max: u32 },
    #[error("exit code payload must be 4 bytes, got {len}")]
    MalformedExitCode { len: usize },
    #[error("connection closed mid-frame with {0} bytes pending")]
    TruncatedFrame(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Appends the encoded frame to `buf`.
pub(crate) fn encode_frame(buf: &mut BytesMut, kind: FrameKind, payload: &[u8]) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Removes and returns the next complete frame from `buf`, or `None` if the
/// buffer does not yet hold one. Decoding is a pure function of the byte
/// stream; partial input is left untouched.
pub(crate) fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(len) = peek_payload_len(buf)? else {
        return Ok(None);
    };

    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let kind = FrameKind::try_from(buf[0])?;
    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len).freeze();
    Ok(Some(Frame { kind, payload }))
}

/// Checks whether `buf` holds at least one complete frame.
pub(crate) fn holds_frame(buf: &BytesMut) -> bool {
    match peek_payload_len(buf) {
        Ok(Some(len)) => buf.len() >= HEADER_LEN + len,
        // An oversized length still wakes the reader so the error surfaces.
        Err(_) => true,
        Ok(None) => false,
    }
}

fn peek_payload_len(buf: &BytesMut) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::OversizedPayload {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    Ok(Some(len as usize))
}
