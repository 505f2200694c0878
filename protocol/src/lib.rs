//! Wire protocol for the podlink shell relay.
//!
//! A session is carried over a single TCP connection as a stream of typed,
//! length-prefixed frames. The frame layout is fixed:
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬─────────────────────┐
//! │  kind (u8)   │  length (u32, little-    │  payload            │
//! │              │  endian)                 │  (`length` bytes)   │
//! └──────────────┴──────────────────────────┴─────────────────────┘
//! ```
//!
//! Prelude frames (working directory, environment variables, arguments)
//! flow client → server and are terminated by a single `StartCommand`;
//! stdio frames flow in both directions afterwards, and the server closes
//! the session with at most one `ExitCode`.

mod channel;
mod frame;

pub use channel::FrameChannel;
pub use frame::DATA_CHUNK_SIZE;
pub use frame::Frame;
pub use frame::FrameKind;
pub use frame::HEADER_LEN;
pub use frame::MAX_PAYLOAD_LEN;
pub use frame::ProtocolError;
