//! A transaction: one correlation context linking a request to its
//! in-flight channels, grounded on `transaction.c`'s `twopence_transaction_t`.
//!
//! The same type is used on whichever side of a connection is driving the
//! work for a given transaction id: the controller side sends the initial
//! request packet and waits for `MAJOR`/`MINOR`; a responder side (the
//! `local` plugin's in-process peer, in this crate's scope) sends
//! `MAJOR`/`MINOR` once its local work concludes. `recv_packet`'s dispatch
//! is identical either way — only which packet types are "expected" differs,
//! and that's exactly what the latch/`fail` discipline below encodes.

use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};

use crate::channel::TransactionChannel;
use crate::codec::{self, Frame, PacketType};

/// Channel id conventions (§3 GLOSSARY / §6).
pub const CHAN_STDIN: u16 = 0;
pub const CHAN_STDOUT: u16 = 1;
pub const CHAN_STDERR: u16 = 2;
/// Sentinel meaning "every channel", used by cancellation bookkeeping.
pub const CHAN_ALL: u16 = 0xFFFF;

/// What kind of request this transaction is carrying out. Replaces the
/// original's function-pointer `recv`/`send` pair with a tagged variant
/// (design note 9) — there is no behavioral difference in `recv_packet`
/// dispatch between kinds, but the façade uses this to interpret a
/// finished transaction's channels and to decide default timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    RunCommand,
    InjectFile,
    ExtractFile,
    Chat,
}

/// The two status codes a transaction terminates with. `major` is the
/// outer outcome (e.g. transport-level success/failure of running the
/// request at all); `minor` is typically the remote process's exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub major: u32,
    pub minor: u32,
}

/// How a transaction stopped, for callers that care about the difference
/// between a clean status and an abnormal end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Status(Status),
    TimedOut,
    Canceled,
}

/// A sink the façade can attach to print `print_dots`-style progress: one
/// `.` per channel-data event on the transaction, one trailing newline when
/// its I/O concludes (§7, SPEC_FULL's "per-channel trace-dots lifecycle").
/// Purely cosmetic — independent of the transaction's error handling.
pub trait TraceSink: Send {
    fn dot(&mut self);
    fn finished(&mut self);
}

pub struct Transaction {
    id: u16,
    kind: TransactionKind,
    channels: Vec<TransactionChannel>,
    deadline: Option<Instant>,
    chat_deadline: Option<Duration>,
    major: Option<u32>,
    minor: Option<u32>,
    done: bool,
    outcome: Option<Outcome>,
    bytes_sent: u64,
    bytes_received: u64,
    trace: Option<Box<dyn TraceSink>>,
    /// The remote child's pid, announced once via `PID` on chat transactions
    /// only (§4.8 `chat_begin`). `None` until the announcement arrives.
    chat_pid: Option<u32>,
}

impl Transaction {
    #[must_use]
    pub fn new(id: u16, kind: TransactionKind) -> Self {
        Self {
            id,
            kind,
            channels: Vec::new(),
            deadline: None,
            chat_deadline: None,
            major: None,
            minor: None,
            done: false,
            outcome: None,
            bytes_sent: 0,
            bytes_received: 0,
            trace: None,
            chat_pid: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `set_timeout`: a zero duration means "no deadline" (§8 boundary
    /// behavior), matching the original's `trans->client.deadline` left
    /// unset when the caller passed a zero timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
    }

    /// Impose a secondary, usually shorter, deadline on top of the
    /// transaction's own — used by interactive chat's per-`expect` wait.
    pub fn set_chat_deadline(&mut self, timeout: Duration) {
        self.chat_deadline = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
    }

    #[must_use]
    pub fn chat_deadline(&self) -> Option<Duration> {
        self.chat_deadline
    }

    /// The remote child's pid, once the responder has announced it via
    /// `PID`. `chat_begin` (§4.8) blocks until this is set.
    #[must_use]
    pub fn chat_pid(&self) -> Option<u32> {
        self.chat_pid
    }

    /// Responder side: announce the chat child's pid. Unlike
    /// `send_major`/`send_minor` this carries no latch — a chat transaction
    /// sends it exactly once, before any channel traffic, and it never
    /// recurs.
    pub fn send_pid(&mut self, pid: u32) -> Bytes {
        self.chat_pid = Some(pid);
        codec::build_pid(self.id, pid)
    }

    pub fn set_trace(&mut self, trace: Box<dyn TraceSink>) {
        self.trace = Some(trace);
    }

    pub fn add_channel(&mut self, channel: TransactionChannel) {
        self.channels.push(channel);
    }

    pub fn channel_mut(&mut self, id: u16) -> Option<&mut TransactionChannel> {
        self.channels.iter_mut().find(|c| c.id() == id)
    }

    #[must_use]
    pub fn channel(&self, id: u16) -> Option<&TransactionChannel> {
        self.channels.iter().find(|c| c.id() == id)
    }

    /// `twopence_transaction_num_channels` (SPEC_FULL addition 3): the
    /// invariant `num_channels(t) = |local_sink| + |local_source|` holds
    /// trivially here since every channel slot carries at most one of each
    /// and we never alias a channel id across two slots.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.channels
            .iter()
            .map(|c| usize::from(c.is_plugged()) + usize::from(c.has_sink()))
            .sum()
    }

    /// Drain every channel's accumulated sink bytes, for the connection to
    /// hand off in a [`crate::connection::Completion`] once this
    /// transaction is reaped — after removal from the live arena there is
    /// no other way for a caller to retrieve what a sink channel captured
    /// (e.g. a file extract's payload, or a run's captured stdout/stderr).
    pub fn take_all_sink_bytes(&mut self) -> Vec<(u16, Bytes)> {
        self.channels
            .iter_mut()
            .filter_map(|c| c.take_sink_bytes().map(|b| (c.id(), b)))
            .filter(|(_, b)| !b.is_empty())
            .collect()
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// `send_major`: the latch asserts MAJOR has not already gone out.
    ///
    /// # Panics
    /// Panics if MAJOR was already sent for this transaction — a
    /// programming error, matching the original's assertion.
    pub fn send_major(&mut self, code: u32) -> Bytes {
        assert!(
            self.major.is_none(),
            "MAJOR already sent for transaction {}",
            self.id
        );
        self.major = Some(code);
        codec::build_major(self.id, code)
    }

    /// `send_minor`: the latch asserts MAJOR precedes MINOR and MINOR has
    /// not already gone out. Sending MINOR concludes the transaction.
    ///
    /// # Panics
    /// Panics if MAJOR hasn't been sent yet, or MINOR already has.
    pub fn send_minor(&mut self, code: u32) -> Bytes {
        assert!(
            self.major.is_some(),
            "MINOR sent before MAJOR for transaction {}",
            self.id
        );
        assert!(
            self.minor.is_none(),
            "MINOR already sent for transaction {}",
            self.id
        );
        self.minor = Some(code);
        self.finish_with_status();
        codec::build_minor(self.id, code)
    }

    /// `fail`: send whichever of MAJOR/MINOR hasn't gone out yet.
    ///
    /// # Panics
    /// Panics if both have already been sent — per the original, calling
    /// `fail` at that point is a programming error, not a recoverable one.
    pub fn fail(&mut self, code: u32) -> Bytes {
        if self.major.is_none() {
            self.send_major(code)
        } else if self.minor.is_none() {
            self.send_minor(code)
        } else {
            panic!(
                "Transaction::fail called on {} after both MAJOR and MINOR were sent",
                self.id
            );
        }
    }

    /// `fail2` (SPEC_FULL addition 4): set both major and minor in one
    /// call without the one-shot latch assertions `fail` uses — the
    /// façade's `cancel_transactions` needs to force a fixed status pair
    /// onto every live transaction in one step regardless of what (if
    /// anything) has already been sent.
    pub fn fail2(&mut self, major: u32, minor: u32) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(2);
        if self.major.is_none() {
            self.major = Some(major);
            out.push(codec::build_major(self.id, major));
        }
        if self.minor.is_none() {
            self.minor = Some(minor);
            out.push(codec::build_minor(self.id, minor));
        }
        self.done = true;
        self.outcome = Some(Outcome::Canceled);
        out
    }

    fn finish_with_status(&mut self) {
        self.done = true;
        if let (Some(major), Some(minor)) = (self.major, self.minor) {
            self.outcome = Some(Outcome::Status(Status { major, minor }));
        }
        if let Some(trace) = &mut self.trace {
            trace.finished();
        }
    }

    /// §4.7 step 1: compare against the wall clock, emitting a `TIMEOUT`
    /// frame and ending the transaction (with no `MAJOR`/`MINOR`) if its
    /// deadline has passed.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Bytes> {
        if self.done {
            return None;
        }
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.done = true;
                self.outcome = Some(Outcome::TimedOut);
                return Some(codec::build_timeout(self.id));
            }
        }
        None
    }

    /// §4.6 `doio`: pull ready bytes from every source channel, frame them
    /// as `CHAN_DATA`, and fire the one-shot "read finished" notification
    /// (a `CHAN_EOF` frame) once a source is exhausted. This transaction's
    /// sinks need no polling of their own; they only change state via
    /// `recv_packet`, so `doio` only ever produces outgoing frames.
    pub fn doio(&mut self, max_chunk: usize) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        let mut out = Vec::new();
        for chan in &mut self.channels {
            if !chan.is_plugged() {
                continue;
            }
            while let Some(chunk) = chan.pull_outgoing(max_chunk) {
                self.bytes_sent += chunk.len() as u64;
                out.push(codec::build_chan_data(self.id, chan.id(), &chunk));
                if let Some(trace) = &mut self.trace {
                    trace.dot();
                }
            }
            if chan.source_at_eof() && chan.mark_read_eof_sent() {
                out.push(codec::build_chan_eof(self.id, chan.id()));
            }
        }
        out
    }

    /// §4.6 `recv_packet`.
    pub fn recv_packet(&mut self, frame: Frame) -> Option<Bytes> {
        if self.done {
            return None;
        }
        match frame.packet_type {
            PacketType::ChanData => self.recv_chan_data(frame.payload),
            PacketType::ChanEof => self.recv_chan_eof(frame.payload),
            _ => self.recv_status(frame),
        }
    }

    fn recv_chan_data(&mut self, payload: Bytes) -> Option<Bytes> {
        let Some((chan_id, data)) = codec::split_channel_id(payload) else {
            return Some(self.fail(PROTOCOL_ERROR_CODE));
        };
        let Some(chan) = self.channel_mut(chan_id) else {
            tracing::debug!(xid = self.id, chan_id, "CHAN_DATA for unknown channel, dropping");
            return None;
        };
        self.bytes_received += data.len() as u64;
        chan.push_incoming(&data);
        if let Some(trace) = &mut self.trace {
            trace.dot();
        }
        None
    }

    fn recv_chan_eof(&mut self, payload: Bytes) -> Option<Bytes> {
        let Some((chan_id, _)) = codec::split_channel_id(payload) else {
            return None;
        };
        let Some(chan) = self.channel_mut(chan_id) else {
            tracing::debug!(xid = self.id, chan_id, "CHAN_EOF for unknown channel, dropping");
            return None;
        };
        chan.mark_write_eof_seen();
        None
    }

    /// Anything other than `CHAN_DATA`/`CHAN_EOF` lands here: the final
    /// `MAJOR`/`MINOR`/`TIMEOUT` a controller-role transaction is waiting
    /// on. Anything else is a protocol violation.
    fn recv_status(&mut self, frame: Frame) -> Option<Bytes> {
        match frame.packet_type {
            PacketType::Major => {
                let code = read_u32(&frame.payload);
                self.major = Some(code);
                None
            }
            PacketType::Minor => {
                let code = read_u32(&frame.payload);
                self.minor = Some(code);
                self.finish_with_status();
                None
            }
            PacketType::Timeout => {
                self.done = true;
                self.outcome = Some(Outcome::TimedOut);
                None
            }
            PacketType::Pid => {
                self.chat_pid = Some(read_u32(&frame.payload));
                None
            }
            _ => Some(self.fail(PROTOCOL_ERROR_CODE)),
        }
    }
}

/// Status code used when `fail` is invoked because of a protocol violation
/// (an unparseable `CHAN_DATA`/`CHAN_EOF`, or an unexpected packet type)
/// rather than the remote work's own outcome. Matches
/// `twopence_core::error::TwopenceError::Protocol`'s stable code, negated
/// and cast to the unsigned wire representation `MAJOR`/`MINOR` carry.
const PROTOCOL_ERROR_CODE: u32 = twopence_core::error::TwopenceError::Protocol(String::new())
    .code()
    .unsigned_abs();

fn read_u32(payload: &Bytes) -> u32 {
    let mut p = payload.clone();
    if p.len() < 4 {
        return 0;
    }
    p.get_u32()
}

#[cfg(test)]
mod tests {
    use super::*;
    use twopence_core::iostream::IoStream;

    #[test]
    fn major_then_minor_latch_order() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.send_major(0);
        t.send_minor(0);
        assert!(t.is_done());
        assert_eq!(t.outcome(), Some(Outcome::Status(Status { major: 0, minor: 0 })));
    }

    #[test]
    #[should_panic(expected = "MINOR sent before MAJOR")]
    fn minor_before_major_panics() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.send_minor(0);
    }

    #[test]
    #[should_panic(expected = "already sent")]
    fn double_major_panics() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.send_major(0);
        t.send_major(1);
    }

    #[test]
    fn fail_sends_whichever_latch_is_open() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.fail(7);
        assert!(!t.is_done());
        t.fail(8);
        assert!(t.is_done());
        assert_eq!(t.outcome(), Some(Outcome::Status(Status { major: 7, minor: 8 })));
    }

    #[test]
    fn fail2_forces_both_without_latch_checks() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.send_major(0);
        let frames = t.fail2(99, 1);
        // major already sent, so fail2 only emits MINOR
        assert_eq!(frames.len(), 1);
        assert!(t.is_done());
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.set_timeout(Duration::ZERO);
        assert!(t.deadline().is_none());
        assert!(t.check_timeout(Instant::now() + Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn timeout_fires_once_deadline_passes() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.set_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let pkt = t.check_timeout(Instant::now());
        assert!(pkt.is_some());
        assert!(t.is_done());
        assert_eq!(t.outcome(), Some(Outcome::TimedOut));
    }

    #[test]
    fn doio_emits_data_then_single_eof() {
        let mut t = Transaction::new(5, TransactionKind::RunCommand);
        t.add_channel(
            TransactionChannel::new(CHAN_STDIN)
                .with_source(IoStream::from_buffer(Bytes::from_static(b"hi"))),
        );
        let frames = t.doio(1024);
        // one CHAN_DATA + one CHAN_EOF
        assert_eq!(frames.len(), 2);
        let again = t.doio(1024);
        assert!(again.is_empty(), "read_eof must fire only once");
    }

    #[test]
    fn empty_source_emits_only_eof_no_data() {
        let mut t = Transaction::new(5, TransactionKind::RunCommand);
        t.add_channel(TransactionChannel::new(CHAN_STDIN).with_source(IoStream::empty()));
        let frames = t.doio(1024);
        assert_eq!(frames.len(), 1, "empty stream at attach: CHAN_EOF, no CHAN_DATA");
    }

    #[test]
    fn recv_packet_after_done_is_dropped() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.send_major(0);
        t.send_minor(0);
        let frame = Frame {
            packet_type: PacketType::ChanData,
            xid: 1,
            payload: Bytes::new(),
        };
        assert!(t.recv_packet(frame).is_none());
    }

    #[test]
    fn pid_announcement_does_not_conclude_the_transaction() {
        let mut t = Transaction::new(9, TransactionKind::Chat);
        let frame = Frame {
            packet_type: PacketType::Pid,
            xid: 9,
            payload: Bytes::copy_from_slice(&4242u32.to_be_bytes()),
        };
        assert!(t.recv_packet(frame).is_none());
        assert_eq!(t.chat_pid(), Some(4242));
        assert!(!t.is_done());
    }

    #[test]
    fn send_pid_is_observable_without_a_latch() {
        let mut t = Transaction::new(9, TransactionKind::Chat);
        let frame = t.send_pid(77);
        assert_eq!(t.chat_pid(), Some(77));
        // MAJOR can still follow later, unlike send_major/send_minor's order.
        assert!(!t.is_done());
        drop(frame);
    }

    #[test]
    fn recv_chan_data_routes_to_sink_and_counts_bytes() {
        let mut t = Transaction::new(1, TransactionKind::RunCommand);
        t.add_channel(TransactionChannel::new(CHAN_STDOUT).with_sink());
        let payload = codec::build_chan_data(1, CHAN_STDOUT, b"hello");
        let mut buf = twopence_core::buffer::ByteBuffer::new(64);
        buf.append(&payload);
        let mut decoder = crate::codec::FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        t.recv_packet(frame);
        assert_eq!(t.bytes_received(), 5);
        assert_eq!(
            t.channel_mut(CHAN_STDOUT).unwrap().take_sink_bytes().unwrap().as_ref(),
            b"hello"
        );
    }
}
