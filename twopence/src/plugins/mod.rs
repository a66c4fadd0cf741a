//! The built-in transport plugin registry (§6, design note "Plugin
//! registry"): an enum-and-table structure, grounded on
//! `monocoque-core/src/socket_type.rs`'s small closed enum for socket
//! kinds. A plugin is a capability set plus a constructor; unlike
//! `SocketType`, most of ours have no real local implementation — their
//! backend (virtio device, SSH subsystem, serial line, chroot helper) is
//! an external collaborator per spec.md §1, so those are registered with
//! a stub that reports every operation unsupported.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use compio::BufResult;

use twopence_core::error::{Result, TwopenceError};
use twopence_core::iostream::IoStream;
use twopence_protocol::transaction::CHAN_STDIN;
use twopence_protocol::{Command, Completion, Connection, FileTransfer, Outcome, Status, Transaction, TransactionChannel, TransactionKind};

pub mod local;
pub mod tcp;

/// The plugin named by the first component of a target spec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginId {
    Virtio,
    Ssh,
    Serial,
    Tcp,
    Chroot,
    Local,
}

impl PluginId {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "virtio" => Ok(Self::Virtio),
            "ssh" => Ok(Self::Ssh),
            "serial" => Ok(Self::Serial),
            "tcp" => Ok(Self::Tcp),
            "chroot" => Ok(Self::Chroot),
            "local" => Ok(Self::Local),
            other => Err(TwopenceError::UnknownPlugin(other.to_string())),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::Ssh => "ssh",
            Self::Serial => "serial",
            Self::Tcp => "tcp",
            Self::Chroot => "chroot",
            Self::Local => "local",
        }
    }

    /// Whether this plugin has a real local implementation in this crate,
    /// as opposed to a stub that reports every capability unsupported.
    #[must_use]
    fn is_implemented(self) -> bool {
        matches!(self, Self::Local | Self::Tcp)
    }
}

/// Either side of the duplex byte-pipe a connected plugin drives: an
/// in-process pair for `local`, or a real TCP socket for `tcp`. Grounded
/// on `ddprof-exporter/src/connector.rs`'s `ConnStream` enum — one type
/// that dispatches to whichever concrete transport is in play, so
/// `Connection<TransportStream>` doesn't need to be generic over the
/// plugin that created it.
pub enum TransportStream {
    InProcess(local::InProcessDuplex),
    Tcp(compio::net::TcpStream),
}

impl AsyncRead for TransportStream {
    async fn read<B: compio::buf::IoBufMut>(&mut self, buf: B) -> BufResult<usize, B> {
        match self {
            Self::InProcess(s) => s.read(buf).await,
            Self::Tcp(s) => s.read(buf).await,
        }
    }
}

impl AsyncWrite for TransportStream {
    async fn write<B: compio::buf::IoBuf>(&mut self, buf: B) -> BufResult<usize, B> {
        match self {
            Self::InProcess(s) => s.write(buf).await,
            Self::Tcp(s) => s.write(buf).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::InProcess(s) => s.flush().await,
            Self::Tcp(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::InProcess(s) => s.shutdown().await,
            Self::Tcp(s) => s.shutdown().await,
        }
    }
}

/// A connected target's plugin-specific backend: either a live connection
/// driving the transaction-multiplexing engine, or a stub that answers
/// every operation with `unsupported_function` because its real transport
/// is an external collaborator this crate does not implement.
pub enum PluginHandle {
    Active {
        id: PluginId,
        connection: Connection<TransportStream>,
        /// Live chat sessions' stdin senders, keyed by transaction id.
        /// Dropping an entry (on `chat_close_stdin`) closes that session's
        /// stdin — the paired [`IoStream::from_channel`] source then
        /// reports EOF the next time it's drained.
        chat_stdin: HashMap<u16, flume::Sender<Bytes>>,
    },
    Stub(PluginId),
}

impl PluginHandle {
    pub async fn connect(id: PluginId, spec: &str) -> Result<Self> {
        if !id.is_implemented() {
            return Ok(Self::Stub(id));
        }
        let connection = match id {
            PluginId::Local => local::connect(spec).await?,
            PluginId::Tcp => tcp::connect(spec).await?,
            _ => unreachable!("is_implemented guards this"),
        };
        Ok(Self::Active {
            id,
            connection,
            chat_stdin: HashMap::new(),
        })
    }

    fn require_active(&mut self, capability: &str) -> Result<&mut Connection<TransportStream>> {
        match self {
            Self::Active { connection, .. } => Ok(connection),
            Self::Stub(id) => Err(TwopenceError::UnsupportedFunction(format!(
                "{} plugin does not implement {capability}",
                id.name()
            ))),
        }
    }

    pub async fn run_test(&mut self, command: Command, timeout: Duration) -> Result<Status> {
        let conn = self.require_active("run_test")?;
        let id = conn.alloc_id();
        let mut t = twopence_protocol::Transaction::new(id, twopence_protocol::TransactionKind::RunCommand);
        t.set_timeout(timeout);
        t.add_channel(
            twopence_protocol::TransactionChannel::new(twopence_protocol::transaction::CHAN_STDOUT)
                .with_sink(),
        );
        t.add_channel(
            twopence_protocol::TransactionChannel::new(twopence_protocol::transaction::CHAN_STDERR)
                .with_sink(),
        );
        let frame = command.encode(id);
        conn.begin(t, frame);
        completion_to_status(conn.drive_until_done(id).await?)
    }

    pub async fn inject_file(&mut self, xfer: FileTransfer, timeout: Duration) -> Result<Status> {
        let conn = self.require_active("inject_file")?;
        let id = conn.alloc_id();
        let mut t = twopence_protocol::Transaction::new(id, twopence_protocol::TransactionKind::InjectFile);
        t.set_timeout(timeout);
        let data = compio::fs::read(&xfer.local_path)
            .await
            .map_err(TwopenceError::LocalFile)?;
        let size = data.len() as u64;
        t.add_channel(
            twopence_protocol::TransactionChannel::new(twopence_protocol::transaction::CHAN_STDIN)
                .with_source(twopence_core::iostream::IoStream::from_buffer(Bytes::from(data))),
        );
        let frame = xfer.with_size(size).encode(id);
        conn.begin(t, frame);
        completion_to_status(conn.drive_until_done(id).await?)
    }

    pub async fn extract_file(&mut self, xfer: FileTransfer, timeout: Duration) -> Result<Status> {
        let conn = self.require_active("extract_file")?;
        let id = conn.alloc_id();
        let mut t = twopence_protocol::Transaction::new(id, twopence_protocol::TransactionKind::ExtractFile);
        t.set_timeout(timeout);
        t.add_channel(
            twopence_protocol::TransactionChannel::new(twopence_protocol::transaction::CHAN_STDOUT)
                .with_sink(),
        );
        let frame = xfer.encode(id);
        conn.begin(t, frame);
        let completion = conn.drive_until_done(id).await?;
        let payload = completion
            .channel_data
            .iter()
            .find(|(chan_id, _)| *chan_id == twopence_protocol::transaction::CHAN_STDOUT)
            .map(|(_, bytes)| bytes.clone());
        let status = completion_to_status(completion)?;
        if let Some(payload) = payload {
            compio::fs::write(&xfer.local_path, payload)
                .await
                .map_err(TwopenceError::LocalFile)?;
        }
        Ok(status)
    }

    /// §4.8 `chat_begin`: start an interactive command and return its
    /// transaction id plus the remote child's pid, once the responder's
    /// `PID` announcement arrives — a chat transaction never sends
    /// `MAJOR`/`MINOR` until the session ends, so `PID` is the only signal
    /// that the child is up and ready for `chat_write`/`chat_expect`.
    pub async fn chat_begin(&mut self, mut command: Command, timeout: Duration) -> Result<(u16, u32)> {
        command.chat = true;
        let (stdin_tx, stdin_rx) = flume::unbounded();
        let id = {
            let conn = self.require_active("chat_begin")?;
            let id = conn.alloc_id();
            let mut t = Transaction::new(id, TransactionKind::Chat);
            t.set_timeout(timeout);
            t.add_channel(
                TransactionChannel::new(CHAN_STDIN)
                    .with_source(IoStream::from_channel(stdin_rx))
                    .with_sink(),
            );
            let frame = command.encode(id);
            conn.begin(t, frame);
            id
        };
        if let Self::Active { chat_stdin, .. } = self {
            chat_stdin.insert(id, stdin_tx);
        }
        loop {
            let conn = self.require_active("chat_begin")?;
            let Some(t) = conn.transaction_mut(id) else {
                return Err(TwopenceError::InvalidTransaction(id));
            };
            if let Some(pid) = t.chat_pid() {
                return Ok((id, pid));
            }
            conn.run_once().await?;
        }
    }

    /// §4.8 `chat_write`/`chat_puts`: send more bytes into a live chat
    /// session's stdin. The bytes are queued locally and picked up the
    /// next time the connection's event loop drains this channel's source.
    pub fn chat_write(&mut self, xid: u16, data: Bytes) -> Result<()> {
        match self {
            Self::Active { chat_stdin, .. } => chat_stdin
                .get(&xid)
                .ok_or_else(|| TwopenceError::InvalidTransaction(xid))?
                .send(data)
                .map_err(|_| TwopenceError::ForwardInput("chat stdin channel closed".into())),
            Self::Stub(id) => Err(TwopenceError::UnsupportedFunction(format!(
                "{} plugin does not implement chat_write",
                id.name()
            ))),
        }
    }

    /// Close a chat session's stdin (dropping the sender signals EOF to the
    /// session's live source), without waiting for the session to end.
    pub fn chat_close_stdin(&mut self, xid: u16) {
        if let Self::Active { chat_stdin, .. } = self {
            chat_stdin.remove(&xid);
        }
    }

    /// §4.8 `chat_expect`: wait until any of `patterns` appears in the
    /// session's accumulated output, or `timeout` elapses. When more than
    /// one pattern has already arrived, the earliest occurrence wins; a
    /// tie at the same offset is broken in favor of the longer pattern
    /// (matching `twopence_chat_expect`'s match-longest-at-earliest-offset
    /// rule), and the matched text plus everything before it is consumed.
    pub async fn chat_expect(&mut self, xid: u16, patterns: &[String], timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = {
                let conn = self.require_active("chat_expect")?;
                let t = conn
                    .transaction_mut(xid)
                    .ok_or(TwopenceError::InvalidTransaction(xid))?;
                let chan = t
                    .channel(CHAN_STDIN)
                    .ok_or_else(|| TwopenceError::internal("chat channel missing"))?;
                chan.peek_sink().and_then(|buf| earliest_match(buf, patterns))
            };
            if let Some((offset, matched)) = found {
                let conn = self.require_active("chat_expect")?;
                let t = conn.transaction_mut(xid).expect("checked live above");
                let chan = t.channel_mut(CHAN_STDIN).expect("checked present above");
                chan.consume_sink(offset + matched.len());
                return Ok(matched);
            }
            if Instant::now() >= deadline {
                return Err(TwopenceError::CommandTimeout);
            }
            let conn = self.require_active("chat_expect")?;
            conn.run_once().await?;
        }
    }

    /// §4.8 `chat_gets`: fgets-like read of the next line (through and
    /// including its newline) from the session's accumulated output, with
    /// `"\r\n"` collapsed to `"\n"`.
    pub async fn chat_gets(&mut self, xid: u16, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let line_len = {
                let conn = self.require_active("chat_gets")?;
                let t = conn
                    .transaction_mut(xid)
                    .ok_or(TwopenceError::InvalidTransaction(xid))?;
                let chan = t
                    .channel(CHAN_STDIN)
                    .ok_or_else(|| TwopenceError::internal("chat channel missing"))?;
                chan.peek_sink()
                    .and_then(|buf| buf.iter().position(|&b| b == b'\n'))
                    .map(|pos| pos + 1)
            };
            if let Some(len) = line_len {
                let conn = self.require_active("chat_gets")?;
                let t = conn.transaction_mut(xid).expect("checked live above");
                let chan = t.channel_mut(CHAN_STDIN).expect("checked present above");
                let raw = chan.consume_sink(len).unwrap_or_default();
                return Ok(collapse_crlf(&raw));
            }
            if Instant::now() >= deadline {
                return Err(TwopenceError::CommandTimeout);
            }
            let conn = self.require_active("chat_gets")?;
            conn.run_once().await?;
        }
    }

    /// §4.8: close a chat session's stdin and wait for it to end, the way
    /// `run_test` waits for a one-shot command's completion.
    pub async fn chat_wait(&mut self, xid: u16) -> Result<Status> {
        self.chat_close_stdin(xid);
        let conn = self.require_active("chat_wait")?;
        completion_to_status(conn.drive_until_done(xid).await?)
    }

    pub async fn interrupt_command(&mut self) -> Result<()> {
        let conn = self.require_active("interrupt_command")?;
        conn.queue_raw(twopence_protocol::codec::build_interrupt(
            twopence_protocol::codec::XID_NONE,
        ));
        Ok(())
    }

    pub async fn cancel_transactions(&mut self) {
        if let Self::Active { connection, .. } = self {
            connection.cancel_all(
                twopence_core::error::TwopenceError::CommandCanceled.code().unsigned_abs(),
                0,
            );
        }
    }

    pub async fn disconnect(&mut self) {
        if let Self::Active { connection, .. } = self {
            connection.queue_raw(twopence_protocol::codec::build_quit());
            connection.disconnect();
        }
    }
}

fn completion_to_status(completion: Completion) -> Result<Status> {
    match completion.outcome {
        Outcome::Status(status) => Ok(status),
        Outcome::TimedOut => Err(TwopenceError::CommandTimeout),
        Outcome::Canceled => Err(TwopenceError::CommandCanceled),
    }
}

/// Find the pattern in `patterns` that occurs earliest in `buf`. A tie at
/// the same offset is broken in favor of the longer pattern, matching
/// `twopence_chat_expect`'s behavior when one candidate is a prefix of
/// another (e.g. expecting both `"login:"` and `"login: "`).
fn earliest_match(buf: &[u8], patterns: &[String]) -> Option<(usize, String)> {
    patterns
        .iter()
        .filter_map(|pat| {
            if pat.is_empty() {
                // An empty candidate matches immediately at position 0 with
                // zero length consumed (§8 boundary behavior).
                return Some((0, pat.clone()));
            }
            buf.windows(pat.len())
                .position(|w| w == pat.as_bytes())
                .map(|pos| (pos, pat.clone()))
        })
        .min_by(|(pos_a, a), (pos_b, b)| pos_a.cmp(pos_b).then(b.len().cmp(&a.len())))
}

/// Collapse `"\r\n"` to `"\n"` the way `twopence_chat_gets` hands lines back
/// to callers that expect Unix line endings regardless of what the remote
/// pty or shell emitted.
fn collapse_crlf(data: &[u8]) -> String {
    String::from_utf8_lossy(data).replace("\r\n", "\n")
}

#[cfg(test)]
mod chat_helper_tests {
    use super::*;

    #[test]
    fn earliest_match_prefers_earlier_offset() {
        let buf = b"xxlogin:yy";
        let patterns = vec!["login:".to_string(), "yy".to_string()];
        let (offset, matched) = earliest_match(buf, &patterns).unwrap();
        assert_eq!(offset, 2);
        assert_eq!(matched, "login:");
    }

    #[test]
    fn earliest_match_breaks_ties_with_longer_pattern() {
        let buf = b"login: ";
        let patterns = vec!["login:".to_string(), "login: ".to_string()];
        let (offset, matched) = earliest_match(buf, &patterns).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(matched, "login: ");
    }

    #[test]
    fn collapse_crlf_normalizes_windows_line_endings() {
        assert_eq!(collapse_crlf(b"one\r\ntwo\r\n"), "one\ntwo\n");
    }

    #[test]
    fn empty_candidate_matches_immediately_at_position_zero() {
        let buf = b"anything at all";
        let patterns = vec!["nope".to_string(), String::new()];
        let (offset, matched) = earliest_match(buf, &patterns).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(matched, "");
    }
}
