use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::frame::Frame;
use crate::frame::FrameKind;
use crate::frame::HEADER_LEN;
use crate::frame::ProtocolError;
use crate::frame::decode_frame;
use crate::frame::encode_frame;
use crate::frame::holds_frame;

/// Starting size for both the send coalescing buffer and the receive ring.
/// Loopback MTUs are comfortably larger than this, so a full prelude
/// usually leaves in one segment.
const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// A frame-oriented wrapper around a byte stream.
///
/// Sends are coalesced: queued frames accumulate until an explicit
/// [`flush`](FrameChannel::flush), until a frame would not fit the current
/// coalescing window, or until [`send_frame`](FrameChannel::send_frame) is
/// used. The prelude writes one frame per argument and per environment
/// variable, so without coalescing the loopback path would pay a syscall
/// per entry.
///
/// Receives are buffered: [`read_frame`](FrameChannel::read_frame) refills
/// from the stream only when the buffer does not already hold a complete
/// frame, and is cancel-safe — all partial state lives in the channel, not
/// in the future.
pub struct FrameChannel<S> {
    stream: S,
    send_buf: BytesMut,
    /// Coalescing window; grows to the largest single frame queued so far.
    send_window: usize,
    recv_buf: BytesMut,
}

impl<S> FrameChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            send_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            send_window: INITIAL_BUFFER_SIZE,
            recv_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Appends a frame to the send buffer, flushing first if the frame
    /// would overflow the coalescing window.
    pub async fn queue_frame(
        &mut self,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let frame_len = HEADER_LEN + payload.len();

        if self.send_buf.len() + frame_len > self.send_window {
            self.flush().await?;
            if frame_len > self.send_window {
                self.send_window = frame_len;
            }
        }

        encode_frame(&mut self.send_buf, kind, payload);
        Ok(())
    }

    /// Queues a frame and flushes everything pending.
    pub async fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<(), ProtocolError> {
        self.queue_frame(kind, payload).await?;
        self.flush().await
    }

    /// Writes all pending bytes to the stream.
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        if self.send_buf.is_empty() {
            return Ok(());
        }

        trace!("flushing {} bytes", self.send_buf.len());
        self.stream.write_all(&self.send_buf).await?;
        self.send_buf.clear();
        Ok(())
    }

    /// Returns the next frame, refilling from the stream as needed.
    ///
    /// `Ok(None)` means the peer closed the connection on a frame boundary;
    /// closing mid-frame is a [`ProtocolError::TruncatedFrame`].
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = decode_frame(&mut self.recv_buf)? {
                trace!(kind = ?frame.kind, len = frame.payload.len(), "received frame");
                return Ok(Some(frame));
            }

            let read = self.stream.read_buf(&mut self.recv_buf).await?;
            if read == 0 {
                if self.recv_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::TruncatedFrame(self.recv_buf.len()));
            }
        }
    }

    /// Checks whether at least one complete frame is already buffered, so a
    /// caller can drain without risking a blocking refill.
    pub fn has_buffered_frame(&self) -> bool {
        holds_frame(&self.recv_buf)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_round_trip_across_a_stream() {
        let (near, far) = duplex(64 * 1024);
        let mut sender = FrameChannel::new(near);
        let mut receiver = FrameChannel::new(far);

        sender
            .queue_frame(FrameKind::WorkingDirectory, b"sub/dir")
            .await
            .expect("queue");
        sender
            .queue_frame(FrameKind::CommandArgument, b"--verbose")
            .await
            .expect("queue");
        sender
            .send_frame(FrameKind::StartCommand, b"build")
            .await
            .expect("send");

        let first = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(first.kind, FrameKind::WorkingDirectory);
        assert_eq!(&first.payload[..], b"sub/dir");

        // Both remaining frames arrived in the same flush.
        assert!(receiver.has_buffered_frame());

        let second = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(second.kind, FrameKind::CommandArgument);
        let third = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(third.kind, FrameKind::StartCommand);
        assert_eq!(&third.payload[..], b"build");
        assert!(!receiver.has_buffered_frame());
    }

    #[tokio::test]
    async fn queued_frames_are_not_visible_before_flush() {
        let (near, far) = duplex(64 * 1024);
        let mut sender = FrameChannel::new(near);
        let mut receiver = FrameChannel::new(far);

        sender
            .queue_frame(FrameKind::CommandArgument, b"pending")
            .await
            .expect("queue");
        assert!(!receiver.has_buffered_frame());

        sender.flush().await.expect("flush");
        let frame = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(&frame.payload[..], b"pending");
    }

    #[tokio::test]
    async fn oversized_queue_flushes_and_grows_the_window() {
        let (near, far) = duplex(1024 * 1024);
        let mut sender = FrameChannel::new(near);
        let mut receiver = FrameChannel::new(far);

        let small = vec![b'a'; 16];
        let large = vec![b'b'; INITIAL_BUFFER_SIZE * 4];

        sender
            .queue_frame(FrameKind::StdoutData, &small)
            .await
            .expect("queue");
        // Queuing a frame bigger than the window forces out what was
        // pending, so the receiver sees the small frame first.
        sender
            .queue_frame(FrameKind::StdoutData, &large)
            .await
            .expect("queue");

        let first = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(first.payload.len(), small.len());

        sender.flush().await.expect("flush");
        let second = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(second.payload.len(), large.len());
    }

    #[tokio::test]
    async fn clean_close_on_frame_boundary_yields_none() {
        let (near, far) = duplex(1024);
        let mut sender = FrameChannel::new(near);
        let mut receiver = FrameChannel::new(far);

        sender
            .send_frame(FrameKind::ExitCode, &7i32.to_le_bytes())
            .await
            .expect("send");
        drop(sender);

        let frame = receiver.read_frame().await.expect("read").expect("frame");
        assert_eq!(frame.as_exit_code().expect("exit code"), 7);
        assert!(receiver.read_frame().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn close_mid_frame_is_an_error() {
        let (mut near, far) = duplex(1024);
        let mut receiver = FrameChannel::new(far);

        // A header promising 100 bytes, followed by silence.
        near.write_all(&[4, 100, 0, 0, 0, b'x']).await.expect("write");
        drop(near);

        assert!(matches!(
            receiver.read_frame().await,
            Err(ProtocolError::TruncatedFrame(_))
        ));
    }
}
