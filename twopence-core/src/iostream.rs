//! `IoStream`: a local I/O source/sink that can be a raw file descriptor or
//! an in-memory buffer, with several streams concatenated end to end.
//!
//! The transaction channel layer attaches local sinks/sources from whatever
//! the caller handed it — a file, a pipe, stdin/stdout, or a canned buffer —
//! without caring which. `IoStream` is the common surface: `read`, `write`,
//! `get_fd` (for the fast fd-backed path that can be posted straight into a
//! poll set) and `is_eof`.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
#[cfg(unix)]
use std::os::unix::io::RawFd;

/// One segment of a concatenated stream.
enum Segment {
    /// A raw fd, read/written directly by the OS.
    #[cfg(unix)]
    Fd(RawFd),
    /// An in-memory buffer, consumed front-to-back.
    Buffer(Bytes),
    /// A channel fed incrementally by a caller that is still deciding what
    /// to send (chat's `keepopen_stdin`): unlike `Buffer`, EOF is not
    /// implied by exhaustion — it only arrives once the sender half is
    /// dropped, which is exactly how a chat session's input channel is
    /// closed.
    Live(flume::Receiver<Bytes>),
}

/// A stream formed by concatenating zero or more segments. Reading drains
/// each segment in order; writing always goes to a buffer segment appended
/// at construction time (`IoStream::sink`), since fd segments are for
/// reading canned input, not capturing output.
pub struct IoStream {
    segments: VecDeque<Segment>,
    eof: bool,
}

impl IoStream {
    /// An empty stream, already at EOF.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            segments: VecDeque::new(),
            eof: true,
        }
    }

    /// A stream that reads from a single fd until the fd reports EOF.
    #[cfg(unix)]
    #[must_use]
    pub fn from_fd(fd: RawFd) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::Fd(fd));
        Self {
            segments,
            eof: false,
        }
    }

    /// A stream backed by an in-memory buffer.
    #[must_use]
    pub fn from_buffer(data: Bytes) -> Self {
        let eof = data.is_empty();
        let mut segments = VecDeque::new();
        segments.push_back(Segment::Buffer(data));
        Self { segments, eof }
    }

    /// A stream fed incrementally from `rx`, reaching EOF only once the
    /// paired sender is dropped (chat's live stdin).
    #[must_use]
    pub fn from_channel(rx: flume::Receiver<Bytes>) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::Live(rx));
        Self {
            segments,
            eof: false,
        }
    }

    /// Append another stream's segments after this one's.
    pub fn concat(&mut self, mut other: IoStream) {
        self.eof = self.eof && other.eof;
        self.segments.append(&mut other.segments);
    }

    /// The fd backing the current (head) segment, if this stream is
    /// single-segment and fd-backed. Used by the transaction layer to decide
    /// whether a source can be posted into the transport's poll set directly
    /// rather than driven by an explicit forwarding loop.
    #[cfg(unix)]
    #[must_use]
    pub fn get_fd(&self) -> Option<RawFd> {
        if self.segments.len() != 1 {
            return None;
        }
        match self.segments.front() {
            Some(Segment::Fd(fd)) => Some(*fd),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read up to `max` bytes from the head segment. Buffer segments are
    /// drained directly; fd segments require the caller to perform the
    /// actual syscall and report back via [`IoStream::fd_read_result`] since
    /// this type has no knowledge of the I/O runtime.
    pub fn read_buffered(&mut self, max: usize) -> Option<Bytes> {
        loop {
            let is_empty_buffer = matches!(self.segments.front(), Some(Segment::Buffer(d)) if d.is_empty());
            if is_empty_buffer {
                self.segments.pop_front();
                continue;
            }

            #[cfg(unix)]
            if matches!(self.segments.front(), Some(Segment::Fd(_))) {
                return None;
            }

            if let Some(Segment::Buffer(data)) = self.segments.front_mut() {
                let take = max.min(data.len());
                let chunk = data.split_to(take);
                let exhausted = data.is_empty();
                if exhausted {
                    self.segments.pop_front();
                }
                if self.segments.is_empty() {
                    self.eof = true;
                }
                return Some(chunk);
            }

            if matches!(self.segments.front(), Some(Segment::Live(_))) {
                // Borrow `rx` only long enough to poll it; any follow-up
                // mutation of `self.segments` (re-queueing a remainder,
                // popping on disconnect) happens after this borrow ends.
                let outcome = if let Some(Segment::Live(rx)) = self.segments.front_mut() {
                    rx.try_recv()
                } else {
                    unreachable!("front() just confirmed a Live segment")
                };
                return match outcome {
                    Ok(mut chunk) if chunk.len() > max => {
                        // Split so callers that cap read size (e.g. a
                        // channel's `pull_outgoing(MAX_PACKET)`) never see
                        // more than they asked for; the remainder is
                        // re-queued ahead of the channel as a one-shot
                        // buffer segment.
                        let rest = chunk.split_off(max);
                        self.segments.push_front(Segment::Buffer(rest));
                        Some(chunk)
                    }
                    Ok(chunk) => Some(chunk),
                    Err(flume::TryRecvError::Empty) => None,
                    Err(flume::TryRecvError::Disconnected) => {
                        self.segments.pop_front();
                        if self.segments.is_empty() {
                            self.eof = true;
                        }
                        continue;
                    }
                };
            }

            self.eof = true;
            return None;
        }
    }

    /// Record the result of an out-of-band fd read: `Some(data)` appends a
    /// synthetic buffer segment representing what was read; `None` reports
    /// EOF on the current fd segment and advances past it.
    pub fn fd_read_result(&mut self, data: Option<&[u8]>) {
        match data {
            Some(bytes) if !bytes.is_empty() => {
                self.segments
                    .push_front(Segment::Buffer(Bytes::copy_from_slice(bytes)));
            }
            _ => {
                self.segments.pop_front();
                if self.segments.is_empty() {
                    self.eof = true;
                }
            }
        }
    }
}

/// A plain in-memory sink that accumulates written bytes — used for
/// `inject_file`-into-buffer and test assertions on captured stdout/stderr.
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: BytesMut,
}

impl BufferSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume and return the first `n` bytes, leaving the rest buffered.
    /// Used by chat's `expect`/`gets`, which only ever consume a prefix of
    /// what has accumulated so far.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_stream_drains_and_hits_eof() {
        let mut s = IoStream::from_buffer(Bytes::from_static(b"hello world"));
        assert!(!s.is_eof());
        let chunk = s.read_buffered(5).unwrap();
        assert_eq!(chunk.as_ref(), b"hello");
        let rest = s.read_buffered(100).unwrap();
        assert_eq!(rest.as_ref(), b" world");
        assert!(s.read_buffered(10).is_none());
        assert!(s.is_eof());
    }

    #[test]
    fn concat_joins_two_streams() {
        let mut a = IoStream::from_buffer(Bytes::from_static(b"AB"));
        let b = IoStream::from_buffer(Bytes::from_static(b"CD"));
        a.concat(b);
        let mut out = Vec::new();
        while let Some(chunk) = a.read_buffered(1) {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"ABCD");
    }

    #[test]
    fn buffer_sink_accumulates() {
        let mut sink = BufferSink::new();
        sink.write(b"foo").unwrap();
        sink.write(b"bar").unwrap();
        assert_eq!(sink.as_slice(), b"foobar");
    }

    #[test]
    fn buffer_sink_consume_leaves_remainder() {
        let mut sink = BufferSink::new();
        sink.write(b"hello world").unwrap();
        assert_eq!(sink.consume(5).as_ref(), b"hello");
        assert_eq!(sink.as_slice(), b" world");
    }

    #[test]
    fn live_stream_waits_then_yields_then_eofs_on_disconnect() {
        let (tx, rx) = flume::unbounded();
        let mut s = IoStream::from_channel(rx);
        assert!(s.read_buffered(10).is_none());
        assert!(!s.is_eof());

        tx.send(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(s.read_buffered(10).unwrap().as_ref(), b"hi");

        drop(tx);
        assert!(s.read_buffered(10).is_none());
        assert!(s.is_eof());
    }

    #[test]
    fn live_stream_splits_oversized_chunk() {
        let (tx, rx) = flume::unbounded();
        tx.send(Bytes::from_static(b"abcdef")).unwrap();
        let mut s = IoStream::from_channel(rx);
        assert_eq!(s.read_buffered(3).unwrap().as_ref(), b"abc");
        assert_eq!(s.read_buffered(3).unwrap().as_ref(), b"def");
    }
}
