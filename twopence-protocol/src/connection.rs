//! The connection/event loop (§4.7): owns the transport socket and the
//! transaction arena, and drives every live transaction's I/O each
//! iteration. Grounded on `transaction.c`'s intrusive transaction list
//! (insert/unlink/find), reimplemented as an index-based arena per design
//! note (9), and on `monocoque-core/src/router.rs`'s `RouterHub::run` for
//! the single-`select!`-loop shape.

use std::collections::HashMap;
use std::io;
use std::time::Instant;

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use hashbrown::HashMap as FastMap;

use twopence_core::config::ConnectionOptions;
use twopence_core::error::{Result, TwopenceError};
use twopence_core::socket::AsyncEndpoint;
use twopence_core::timeout::bounded_by_deadline;

use crate::codec::{FrameDecoder, PacketType, XID_NONE};
use crate::transaction::{Outcome, Status, Transaction};

/// What a transaction left behind once it was reaped from the live arena,
/// for the façade to pick up.
#[derive(Debug)]
pub struct Completion {
    pub outcome: Outcome,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Every sink channel's captured bytes, keyed by channel id — e.g. a
    /// file extract's payload on `CHAN_STDOUT`, or a run's captured
    /// stdout/stderr. Populated at reap time since the transaction (and
    /// its channels) no longer exist once it leaves the live arena.
    pub channel_data: Vec<(u16, Bytes)>,
}

/// Drives one transport connection's worth of transactions.
///
/// `S` is the underlying duplex byte stream (a Unix socket, TCP socket, or
/// the in-process duplex pipe the `local` plugin uses).
pub struct Connection<S> {
    endpoint: AsyncEndpoint<S>,
    decoder: FrameDecoder,
    transactions: HashMap<u16, Transaction>,
    completions: FastMap<u16, Completion>,
    next_id: u16,
    options: ConnectionOptions,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(stream: S, options: ConnectionOptions) -> Self {
        Self {
            endpoint: AsyncEndpoint::new(stream, options.read_buf_size),
            decoder: FrameDecoder::new(),
            transactions: HashMap::new(),
            completions: FastMap::new(),
            next_id: XID_NONE,
            options,
        }
    }

    /// Allocate the next free transaction id, skipping the reserved `0`
    /// (§4.4 "Transaction id 0 is reserved for connection-level control").
    pub fn alloc_id(&mut self) -> u16 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != XID_NONE && !self.transactions.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Register a newly built transaction and queue its initial request
    /// frame (`COMMAND`/`INJECT`/`EXTRACT`/...) for transmission.
    pub fn begin(&mut self, transaction: Transaction, initial_frame: Bytes) {
        self.transactions.insert(transaction.id(), transaction);
        self.endpoint.queue_write(initial_frame);
    }

    pub fn transaction_mut(&mut self, id: u16) -> Option<&mut Transaction> {
        self.transactions.get_mut(&id)
    }

    #[must_use]
    pub fn is_live(&self, id: u16) -> bool {
        self.transactions.contains_key(&id)
    }

    /// Take a reaped transaction's outcome, if it has reaped already.
    pub fn take_completion(&mut self, id: u16) -> Option<Completion> {
        self.completions.remove(&id)
    }

    /// §4.7's "cooperative cancellation": mark every live transaction done
    /// with a fixed `{major, minor}` pair and wake the loop on the next
    /// iteration (the wake itself is implicit — the caller simply calls
    /// `run_once` again).
    pub fn cancel_all(&mut self, major: u32, minor: u32) {
        for t in self.transactions.values_mut() {
            for frame in t.fail2(major, minor) {
                self.endpoint.queue_write(frame);
            }
        }
    }

    pub fn queue_raw(&mut self, frame: Bytes) {
        self.endpoint.queue_write(frame);
    }

    /// The nearest of every live transaction's deadline/chat-deadline, used
    /// by callers that want to bound how long they wait between
    /// `run_once` calls (the non-blocking event loop here has no real
    /// poll-with-timeout primitive of its own — `compio`'s reactor handles
    /// that underneath `AsyncEndpoint::doio`).
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transactions
            .values()
            .filter(|t| !t.is_done())
            .filter_map(Transaction::deadline)
            .min()
    }

    /// One iteration of the five-step loop (§4.7).
    pub async fn run_once(&mut self) -> Result<()> {
        let now = Instant::now();

        // Step 1: timeouts.
        let mut outgoing = Vec::new();
        for t in self.transactions.values_mut() {
            if let Some(pkt) = t.check_timeout(now) {
                outgoing.push(pkt);
            }
        }

        // Step 2/4 (backpressure): sources are only drained while the
        // transport's xmit queue is below the watermark; sinks need no
        // polling of their own since they only change state via incoming
        // frames. Stream-backed sources (§4.6 "forwards") are exactly what
        // `Transaction::doio` already drives synchronously, so there's no
        // separate "poll vs. direct service" split to make here.
        if self.endpoint.xmit_queue_allowed(self.options.xmit_watermark) {
            for t in self.transactions.values_mut() {
                outgoing.extend(t.doio(self.options.write_buf_size));
            }
        }
        for frame in outgoing {
            self.endpoint.queue_write(frame);
        }

        // Step 3: drive the transport socket (flush xmit queue, fill recv
        // buffer). `compio`'s io_uring-backed reactor stands in for the
        // original's `poll()` call. Bounded by the soonest live deadline so
        // a quiet transport can't block the loop past it: when that bound
        // fires here, the deadline itself is handled by step 1 on the next
        // `run_once` call, not by this one.
        let deadline = self.next_deadline();
        match bounded_by_deadline(deadline, self.endpoint.doio()).await {
            Ok(_) => {}
            // The bound elapsed with no transport activity; step 1 on the
            // next call reaps whichever transaction's deadline this was.
            // Steps 4/5 below still run so anything already demuxed or
            // already marked done by step 1 this round gets handled now.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(map_io_error(e)),
        }
        if self.endpoint.is_dead() {
            return Err(TwopenceError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport socket is dead",
            )));
        }

        // Step 4: demux whatever frames are now fully buffered.
        loop {
            let decoded = self.decoder.decode(self.endpoint.recv_buffer_mut());
            match decoded {
                Ok(Some(frame)) => self.demux(frame),
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.endpoint.recv_buffer_mut().compact();

        // Step 5: reap transactions that are fully resolved (§8's reap
        // condition — "no queued bytes on any owned sink" reduces to
        // `done` here since sinks are plain accumulation buffers with no
        // async drain delay of their own).
        let done_ids: Vec<u16> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.is_done())
            .map(|(id, _)| *id)
            .collect();
        for id in done_ids {
            if let Some(mut t) = self.transactions.remove(&id) {
                let outcome = t.outcome().unwrap_or(Outcome::Status(Status::default()));
                let channel_data = t.take_all_sink_bytes();
                self.completions.insert(
                    id,
                    Completion {
                        outcome,
                        bytes_sent: t.bytes_sent(),
                        bytes_received: t.bytes_received(),
                        channel_data,
                    },
                );
            }
        }

        Ok(())
    }

    fn demux(&mut self, frame: crate::codec::Frame) {
        if frame.xid == XID_NONE {
            if matches!(frame.packet_type, PacketType::Quit) {
                self.endpoint.mark_dead();
            }
            return;
        }
        let Some(t) = self.transactions.get_mut(&frame.xid) else {
            tracing::debug!(xid = frame.xid, "dropping packet for unknown transaction");
            return;
        };
        if let Some(reply) = t.recv_packet(frame) {
            self.endpoint.queue_write(reply);
        }
    }

    /// Run `run_once` until either `id` is no longer live (reaped) or the
    /// transport dies, then return its completion.
    pub async fn drive_until_done(&mut self, id: u16) -> Result<Completion> {
        loop {
            if let Some(c) = self.take_completion(id) {
                return Ok(c);
            }
            if !self.is_live(id) {
                return Err(TwopenceError::InvalidTransaction(id));
            }
            self.run_once().await?;
        }
    }

    /// Disconnect: close the transport (a dropped pipe terminates all
    /// in-flight transactions per spec's Non-goals — no reconnection).
    pub fn disconnect(&mut self) {
        self.endpoint.mark_dead();
    }
}

fn map_io_error(e: io::Error) -> TwopenceError {
    if e.kind() == io::ErrorKind::TimedOut {
        TwopenceError::CommandTimeout
    } else {
        TwopenceError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::transaction::TransactionKind;

    #[derive(Default)]
    struct NullStream;

    impl compio::io::AsyncRead for NullStream {
        async fn read<B: compio::buf::IoBufMut>(&mut self, buf: B) -> compio::BufResult<usize, B> {
            compio::BufResult(Ok(0), buf)
        }
    }

    impl compio::io::AsyncWrite for NullStream {
        async fn write<B: compio::buf::IoBuf>(&mut self, buf: B) -> compio::BufResult<usize, B> {
            let n = compio::buf::IoBuf::buf_len(&buf);
            compio::BufResult(Ok(n), buf)
        }
        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[compio::test]
    async fn alloc_id_skips_reserved_zero() {
        let conn = Connection::new(NullStream, ConnectionOptions::default());
        let mut conn = conn;
        let id = conn.alloc_id();
        assert_ne!(id, XID_NONE);
    }

    /// A stream whose reads never resolve, standing in for a quiet transport
    /// with nothing to deliver — exercises that `run_once` doesn't hang past
    /// a transaction's deadline even when the transport itself is silent.
    #[derive(Default)]
    struct StallingStream;

    impl compio::io::AsyncRead for StallingStream {
        async fn read<B: compio::buf::IoBufMut>(&mut self, buf: B) -> compio::BufResult<usize, B> {
            std::future::pending::<()>().await;
            compio::BufResult(Ok(0), buf)
        }
    }

    impl compio::io::AsyncWrite for StallingStream {
        async fn write<B: compio::buf::IoBuf>(&mut self, buf: B) -> compio::BufResult<usize, B> {
            let n = compio::buf::IoBuf::buf_len(&buf);
            compio::BufResult(Ok(n), buf)
        }
        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[compio::test]
    async fn run_once_does_not_block_past_a_transactions_deadline_on_a_silent_transport() {
        let mut conn = Connection::new(StallingStream, ConnectionOptions::default());
        let id = conn.alloc_id();
        let mut t = Transaction::new(id, TransactionKind::RunCommand);
        t.set_timeout(std::time::Duration::from_millis(5));
        let frame = codec::build_command(id, "sleep 10");
        conn.begin(t, frame);

        // First call may or may not observe the deadline yet; loop a bounded
        // number of times the way `drive_until_done` would.
        let mut completion = None;
        for _ in 0..50 {
            if conn.run_once().await.is_err() {
                break;
            }
            if let Some(c) = conn.take_completion(id) {
                completion = Some(c);
                break;
            }
        }
        let completion = completion.expect("deadline must reap the transaction eventually");
        assert_eq!(completion.outcome, Outcome::TimedOut);
    }

    #[compio::test]
    async fn timeout_reaps_with_timed_out_outcome() {
        let mut conn = Connection::new(NullStream, ConnectionOptions::default());
        let id = conn.alloc_id();
        let mut t = Transaction::new(id, TransactionKind::RunCommand);
        t.set_timeout(std::time::Duration::from_millis(1));
        let frame = codec::build_command(id, "sleep 10");
        conn.begin(t, frame);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let completion = conn.drive_until_done(id).await.unwrap();
        assert_eq!(completion.outcome, Outcome::TimedOut);
    }
}
