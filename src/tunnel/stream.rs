//! Multiplexed stream implementation

use super::{Closing, Frame, TunnelError};
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// A logical byte stream inside a session
///
/// Reads yield the relay's data in order; EOF means the relay closed the
/// stream or the session went away. Shutting down the write side sends a
/// closing frame.
pub struct Stream {
    id: u32,
    io: DuplexStream,
}

impl Stream {
    pub(crate) fn new(id: u32, io: DuplexStream) -> Self {
        Self { id, io }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// How far ahead of the next expected frame a stream accepts frames
pub(crate) const REORDER_WINDOW: u64 = 1024;

/// Puts a stream's inbound frames back in sequence order
///
/// Frames of one stream can arrive out of order when they ride different
/// connections. At most [`REORDER_WINDOW`] frames are held; a frame beyond
/// the window resets the stream.
#[derive(Debug, Default)]
pub(crate) struct FrameSorter {
    next_seq: u64,
    pending: BTreeMap<u64, Frame>,
    closed: bool,
}

impl FrameSorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one frame, returning every frame now deliverable in order
    ///
    /// Nothing is delivered after the closing frame or a window overflow.
    pub fn push(&mut self, frame: Frame) -> Result<Vec<Frame>, TunnelError> {
        if self.closed || frame.seq < self.next_seq {
            return Ok(Vec::new());
        }
        if frame.seq - self.next_seq >= REORDER_WINDOW {
            self.closed = true;
            self.pending.clear();
            return Err(TunnelError::InvalidFrame(format!(
                "seq {} outside reorder window starting at {}",
                frame.seq, self.next_seq
            )));
        }
        self.pending.insert(frame.seq, frame);

        let mut ready = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            let closing = frame.closing != Closing::Nothing;
            ready.push(frame);
            if closing {
                self.closed = true;
                self.pending.clear();
                break;
            }
        }
        Ok(ready)
    }

    /// Frames held back waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(seq: u64, payload: &'static [u8]) -> Frame {
        Frame::data(1, seq, Bytes::from_static(payload))
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut sorter = FrameSorter::new();
        assert_eq!(sorter.push(data(0, b"a")).unwrap().len(), 1);
        assert_eq!(sorter.push(data(1, b"b")).unwrap().len(), 1);
        assert_eq!(sorter.pending(), 0);
    }

    #[test]
    fn test_reorders_gap() {
        let mut sorter = FrameSorter::new();
        assert!(sorter.push(data(2, b"c")).unwrap().is_empty());
        assert!(sorter.push(data(1, b"b")).unwrap().is_empty());
        assert_eq!(sorter.pending(), 2);

        let ready = sorter.push(data(0, b"a")).unwrap();
        let payloads: Vec<_> = ready.iter().map(|f| &f.payload[..]).collect();
        assert_eq!(payloads, vec![&b"a"[..], b"b", b"c"]);
    }

    #[test]
    fn test_duplicates_and_after_close_dropped() {
        let mut sorter = FrameSorter::new();
        sorter.push(data(0, b"a")).unwrap();
        assert!(sorter.push(data(0, b"a")).unwrap().is_empty());

        sorter.push(data(3, b"late")).unwrap();
        let ready = sorter.push(Frame::close_stream(1, 1)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].closing, Closing::Stream);
        assert_eq!(sorter.pending(), 0);

        assert!(sorter.push(data(2, b"x")).unwrap().is_empty());
    }

    #[test]
    fn test_gap_cannot_hold_unbounded_frames() {
        let mut sorter = FrameSorter::new();

        // seq 0 never arrives
        for seq in 1..REORDER_WINDOW {
            assert!(sorter.push(data(seq, b"x")).unwrap().is_empty());
        }
        assert_eq!(sorter.pending() as u64, REORDER_WINDOW - 1);

        assert!(matches!(
            sorter.push(data(REORDER_WINDOW, b"x")),
            Err(TunnelError::InvalidFrame(_))
        ));
        assert_eq!(sorter.pending(), 0);

        // The stream is reset; even the missing frame is not delivered
        assert!(sorter.push(data(0, b"a")).unwrap().is_empty());
        assert!(sorter.push(data(200_000, b"x")).unwrap().is_empty());
        assert_eq!(sorter.pending(), 0);
    }

    #[test]
    fn test_window_slides_with_delivery() {
        let mut sorter = FrameSorter::new();
        for seq in 0..3 * REORDER_WINDOW {
            assert_eq!(sorter.push(data(seq, b"x")).unwrap().len(), 1);
        }
        assert!(sorter
            .push(data(4 * REORDER_WINDOW - 1, b"x"))
            .unwrap()
            .is_empty());
    }
}
