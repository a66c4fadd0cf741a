//! A transaction channel: one named byte stream multiplexed inside a
//! transaction (stdin, stdout, stderr, a file being injected or extracted).
//!
//! Each channel pairs an optional local *source* (data the transaction feeds
//! to the peer — e.g. stdin content) with an optional local *sink* (data the
//! peer sends that the transaction accumulates locally — e.g. captured
//! stdout). A channel with no source is peer-to-local only; one with no sink
//! is local-to-peer only. Channel 0 is conventionally named `"all"` and
//! carries undifferentiated chat input/output; numbered channels are named
//! `"chan<id>"`.

use bytes::Bytes;
use twopence_core::iostream::{BufferSink, IoStream};

/// A channel's id-to-name convention: channel 0 is the catch-all chat
/// channel, every other id gets a `"chan<id>"` label.
#[must_use]
pub fn channel_name(id: u16) -> String {
    if id == 0 {
        "all".to_string()
    } else {
        format!("chan{id}")
    }
}

/// One multiplexed byte stream inside a transaction.
pub struct TransactionChannel {
    id: u16,
    name: String,
    source: Option<IoStream>,
    sink: Option<BufferSink>,
    /// When set, every write to the sink is treated as immediately
    /// significant (e.g. echoed to a live terminal) rather than something
    /// that can be batched up and read back later in one pull.
    sync: bool,
    read_eof_sent: bool,
    write_eof_seen: bool,
}

impl TransactionChannel {
    #[must_use]
    pub fn new(id: u16) -> Self {
        Self {
            name: channel_name(id),
            id,
            source: None,
            sink: None,
            sync: false,
            read_eof_sent: false,
            write_eof_seen: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn with_source(mut self, source: IoStream) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_sink(mut self) -> Self {
        self.sink = Some(BufferSink::new());
        self
    }

    #[must_use]
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Whether this channel has outbound (local → peer) data still to send.
    #[must_use]
    pub fn is_plugged(&self) -> bool {
        self.source.is_some()
    }

    /// Whether this channel accumulates inbound (peer → local) data.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Pull up to `max` bytes of outbound data. Returns `None` once the
    /// source is exhausted.
    pub fn pull_outgoing(&mut self, max: usize) -> Option<Bytes> {
        self.source.as_mut().and_then(|s| s.read_buffered(max))
    }

    /// Whether the local source has reached EOF (nothing left to send, ever).
    #[must_use]
    pub fn source_at_eof(&self) -> bool {
        self.source.as_ref().map_or(true, IoStream::is_eof)
    }

    /// Record that a `CHAN_EOF` has been sent for this channel's outbound
    /// side. Returns `true` the first time (callers use this to fire a
    /// one-shot "read finished" notification exactly once).
    pub fn mark_read_eof_sent(&mut self) -> bool {
        if self.read_eof_sent {
            false
        } else {
            self.read_eof_sent = true;
            true
        }
    }

    /// Append inbound (peer → local) data to this channel's sink, if any.
    pub fn push_incoming(&mut self, data: &[u8]) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.write(data);
        }
    }

    /// Record that the peer has signalled EOF on this channel's inbound
    /// side. Returns `true` the first time.
    pub fn mark_write_eof_seen(&mut self) -> bool {
        if self.write_eof_seen {
            false
        } else {
            self.write_eof_seen = true;
            true
        }
    }

    #[must_use]
    pub fn write_eof_seen(&self) -> bool {
        self.write_eof_seen
    }

    /// Consume the sink's accumulated bytes, leaving it empty.
    pub fn take_sink_bytes(&mut self) -> Option<Bytes> {
        self.sink.take().map(|sink| {
            let bytes = sink.into_bytes();
            self.sink = Some(BufferSink::new());
            bytes
        })
    }

    /// A read-only view of what the sink has accumulated so far, without
    /// consuming it — used by chat's `expect`/`gets` scan loop, which needs
    /// to look for a string in still-growing output before deciding how
    /// much of it to consume.
    #[must_use]
    pub fn peek_sink(&self) -> Option<&[u8]> {
        self.sink.as_ref().map(BufferSink::as_slice)
    }

    /// Consume and return the first `n` bytes of the sink's accumulated
    /// data, leaving the rest in place.
    pub fn consume_sink(&mut self, n: usize) -> Option<Bytes> {
        self.sink.as_mut().map(|sink| sink.consume(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_naming_convention() {
        assert_eq!(channel_name(0), "all");
        assert_eq!(channel_name(3), "chan3");
    }

    #[test]
    fn source_drains_and_reports_eof() {
        let mut chan = TransactionChannel::new(1)
            .with_source(IoStream::from_buffer(Bytes::from_static(b"hello")));
        assert!(chan.is_plugged());
        assert!(!chan.source_at_eof());
        let chunk = chan.pull_outgoing(16).unwrap();
        assert_eq!(chunk.as_ref(), b"hello");
        assert!(chan.pull_outgoing(16).is_none());
        assert!(chan.source_at_eof());
    }

    #[test]
    fn read_eof_fires_once() {
        let mut chan = TransactionChannel::new(2);
        assert!(chan.mark_read_eof_sent());
        assert!(!chan.mark_read_eof_sent());
    }

    #[test]
    fn sink_accumulates_incoming() {
        let mut chan = TransactionChannel::new(1).with_sink();
        chan.push_incoming(b"out");
        chan.push_incoming(b"put");
        assert_eq!(chan.take_sink_bytes().unwrap().as_ref(), b"output");
        assert_eq!(chan.take_sink_bytes().unwrap().as_ref(), b"");
    }
}
