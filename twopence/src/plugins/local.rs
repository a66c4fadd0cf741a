//! The `local` plugin: an in-process duplex pipe plus a responder task that
//! stands in for the external system-under-test spec.md §1 otherwise
//! delegates to a real virtio/SSH/serial backend. Grounded on
//! `monocoque-core/src/inproc.rs`'s flume-backed sender/receiver pair for
//! the channel plumbing, simplified from that module's named global
//! registry (`DashMap<String, InprocSender>`) to one paired duplex per
//! connect, since `local` always spawns its own responder rather than
//! rendezvousing with an arbitrary named peer.
//!
//! The responder is a small hand-rolled protocol loop, not a
//! [`twopence_protocol::Connection`]/[`twopence_protocol::Transaction`]
//! pair — those model the controller side of a transaction (the side that
//! originates a request and waits for `MAJOR`/`MINOR`), whereas the
//! responder is the side that answers one. It exists purely so the
//! `local` plugin is runnable without an external collaborator.
//!
//! Running commands never blocks the frame loop: each `COMMAND` spawns an
//! OS thread that owns the child process and forwards its output over a
//! `flume` channel, and the responder polls every in-flight process's
//! output each tick instead of awaiting one command to completion before
//! reading the next frame — this is what lets a chat transaction's stdin
//! (`CHAN_DATA` on channel 0) interleave with its own growing output.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use compio::buf::{IoBuf, IoBufMut, SetBufInit};
use compio::io::{AsyncRead, AsyncWrite};
use compio::BufResult;

use twopence_core::config::{ConnectionOptions, DEFAULT_READ_BUF_SIZE};
use twopence_core::error::{Result, TwopenceError};
use twopence_core::socket::AsyncEndpoint;
use twopence_protocol::codec::{self, PacketType};
use twopence_protocol::transaction::{CHAN_STDERR, CHAN_STDIN, CHAN_STDOUT};
use twopence_protocol::{Command, Connection, FileTransfer};

use crate::plugins::TransportStream;

/// Tick the responder's output-draining/`doio` loop at this cadence when
/// nothing from the controller is arriving — bounds how long a chat
/// session's output can sit unsent in its producer thread's channel.
const RESPONDER_TICK: Duration = Duration::from_millis(20);

/// One half of an in-process duplex byte pipe: an outgoing `flume` channel
/// paired with the peer's, plus a small local buffer for partial reads
/// (a caller's read buffer rarely lines up exactly with a sent chunk).
pub struct InProcessDuplex {
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    pending: BytesMut,
}

impl InProcessDuplex {
    fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = flume::unbounded();
        let (tx_b, rx_b) = flume::unbounded();
        (
            Self {
                tx: tx_a,
                rx: rx_b,
                pending: BytesMut::new(),
            },
            Self {
                tx: tx_b,
                rx: rx_a,
                pending: BytesMut::new(),
            },
        )
    }
}

impl AsyncRead for InProcessDuplex {
    async fn read<B: IoBufMut>(&mut self, mut buf: B) -> BufResult<usize, B> {
        if self.pending.is_empty() {
            match self.rx.recv_async().await {
                Ok(chunk) => self.pending = BytesMut::from(&chunk[..]),
                Err(_) => return BufResult(Ok(0), buf), // peer dropped: EOF
            }
        }
        let take = buf.buf_capacity().min(self.pending.len());
        let chunk = self.pending.split_to(take);
        // SAFETY: `chunk` holds exactly `take` initialized bytes, and
        // `buf`'s capacity was checked above to be at least `take`.
        unsafe {
            std::ptr::copy_nonoverlapping(chunk.as_ptr(), buf.as_buf_mut_ptr(), take);
            buf.set_buf_init(take);
        }
        BufResult(Ok(take), buf)
    }
}

impl AsyncWrite for InProcessDuplex {
    async fn write<B: IoBuf>(&mut self, buf: B) -> BufResult<usize, B> {
        let len = buf.buf_len();
        // SAFETY: `buf` guarantees `len` initialized bytes at `as_buf_ptr()`.
        let bytes = Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(buf.as_buf_ptr(), len) });
        match self.tx.send_async(bytes).await {
            Ok(()) => BufResult(Ok(len), buf),
            Err(_) => BufResult(
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "local responder is gone")),
                buf,
            ),
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Connect to a freshly spawned in-process responder. `spec` is currently
/// unused — the `local` plugin has no address of its own to parse, unlike
/// `tcp`'s host:port — but is kept as a parameter for symmetry with the
/// other plugin constructors and in case a future responder policy (e.g.
/// a chroot jail for the responder's child processes) is threaded through
/// via the target spec string.
pub async fn connect(_spec: &str) -> Result<Connection<TransportStream>> {
    let (controller_side, responder_side) = InProcessDuplex::pair();
    // compio's Task is cancel-on-drop; detach so the responder keeps
    // running for the lifetime of the connection instead of being
    // cancelled at its first await.
    compio::runtime::spawn(responder_loop(responder_side)).detach();
    Ok(Connection::new(
        TransportStream::InProcess(controller_side),
        ConnectionOptions::default(),
    ))
}

struct PendingInject {
    remote_path: PathBuf,
    mode: u32,
    data: BytesMut,
}

/// A `COMMAND` that is running in its own OS thread. `stdin_tx` is only
/// `Some` for a chat command — dropping it (on `CHAN_EOF` from the
/// controller) closes the child's stdin.
struct PendingProcess {
    chat: bool,
    stdin_tx: Option<flume::Sender<Bytes>>,
    chunk_rx: flume::Receiver<(u16, Bytes)>,
    done_rx: flume::Receiver<i32>,
    child: Arc<Mutex<std::process::Child>>,
}

/// The responder's event loop: read frames, dispatch, write replies.
/// Unlike [`Connection::run_once`], there is no transaction arena — each
/// inbound request is answered directly, and a file inject's follow-on
/// `CHAN_DATA`/`CHAN_EOF` frames are correlated to their `INJECT` purely
/// by transaction id in `pending_injects`. Running commands are tracked in
/// `pending_processes` and polled every tick so a slow/interactive command
/// never blocks demuxing frames for anything else.
async fn responder_loop(stream: InProcessDuplex) {
    let mut endpoint = AsyncEndpoint::new(stream, DEFAULT_READ_BUF_SIZE);
    let mut decoder = codec::FrameDecoder::new();
    let mut pending_injects: HashMap<u16, PendingInject> = HashMap::new();
    let mut pending_processes: HashMap<u16, PendingProcess> = HashMap::new();

    loop {
        match compio::time::timeout(RESPONDER_TICK, endpoint.doio()).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return,
            Err(_elapsed) => {} // tick fired with no transport activity
        }
        if endpoint.is_dead() {
            return;
        }
        loop {
            match decoder.decode(endpoint.recv_buffer_mut()) {
                Ok(Some(frame)) => {
                    if matches!(frame.packet_type, PacketType::Quit) {
                        endpoint.mark_dead();
                        return;
                    }
                    handle_frame(&mut endpoint, &mut pending_injects, &mut pending_processes, frame);
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        endpoint.recv_buffer_mut().compact();

        drain_pending_processes(&mut endpoint, &mut pending_processes);
        let _ = endpoint.doio().await;
    }
}

fn handle_frame(
    endpoint: &mut AsyncEndpoint<InProcessDuplex>,
    pending_injects: &mut HashMap<u16, PendingInject>,
    pending_processes: &mut HashMap<u16, PendingProcess>,
    frame: codec::Frame,
) {
    match frame.packet_type {
        PacketType::Command => run_command(endpoint, pending_processes, frame.xid, frame.payload),
        PacketType::Inject => match FileTransfer::decode_header(frame.payload) {
            Ok((remote_path, mode, _size)) => {
                pending_injects.insert(
                    frame.xid,
                    PendingInject {
                        remote_path: PathBuf::from(remote_path),
                        mode,
                        data: BytesMut::new(),
                    },
                );
            }
            Err(_) => fail_transaction(endpoint, frame.xid),
        },
        PacketType::ChanData => {
            if let Some((chan_id, data)) = codec::split_channel_id(frame.payload) {
                if let Some(inflight) = pending_injects.get_mut(&frame.xid) {
                    inflight.data.extend_from_slice(&data);
                } else if let Some(proc) = pending_processes.get(&frame.xid) {
                    if chan_id == CHAN_STDIN {
                        if let Some(stdin_tx) = &proc.stdin_tx {
                            let _ = stdin_tx.send(data);
                        }
                    }
                }
            }
        }
        PacketType::ChanEof => {
            if let Some(inflight) = pending_injects.remove(&frame.xid) {
                finish_inject(endpoint, frame.xid, inflight);
            } else if let Some(proc) = pending_processes.get_mut(&frame.xid) {
                // Controller closed stdin: dropping the sender closes the
                // child's stdin pipe once the forwarder thread drains it.
                proc.stdin_tx = None;
            }
        }
        PacketType::Extract => run_extract(endpoint, frame.xid, frame.payload),
        PacketType::Interrupt => {
            // INTERRUPT carries no xid of its own (§4.4 — it's a
            // connection-level control frame), so it applies to every
            // process this responder currently has running.
            for proc in pending_processes.values() {
                if let Ok(mut child) = proc.child.lock() {
                    let _ = child.kill();
                }
            }
        }
        PacketType::Hello | PacketType::Major | PacketType::Minor | PacketType::Timeout | PacketType::Pid => {}
        PacketType::Quit => {}
    }
}

fn fail_transaction(endpoint: &mut AsyncEndpoint<InProcessDuplex>, xid: u16) {
    endpoint.queue_write(codec::build_major(xid, 1));
    endpoint.queue_write(codec::build_minor(xid, 0));
}

fn finish_inject(endpoint: &mut AsyncEndpoint<InProcessDuplex>, xid: u16, inflight: PendingInject) {
    let result = std::fs::write(&inflight.remote_path, &inflight.data);
    #[cfg(unix)]
    if result.is_ok() {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&inflight.remote_path, std::fs::Permissions::from_mode(inflight.mode));
    }
    match result {
        Ok(()) => {
            endpoint.queue_write(codec::build_major(xid, 0));
            endpoint.queue_write(codec::build_minor(xid, 0));
        }
        Err(_) => fail_transaction(endpoint, xid),
    }
}

fn run_extract(endpoint: &mut AsyncEndpoint<InProcessDuplex>, xid: u16, payload: Bytes) {
    let remote_path = match FileTransfer::decode_header(payload) {
        Ok((remote_path, _mode, _size)) => remote_path,
        Err(_) => {
            fail_transaction(endpoint, xid);
            return;
        }
    };
    match std::fs::read(&remote_path) {
        Ok(data) => {
            for chunk in data.chunks(twopence_core::config::MAX_PACKET / 2) {
                endpoint.queue_write(codec::build_chan_data(xid, CHAN_STDOUT, chunk));
            }
            endpoint.queue_write(codec::build_chan_eof(xid, CHAN_STDOUT));
            endpoint.queue_write(codec::build_major(xid, 0));
            endpoint.queue_write(codec::build_minor(xid, 0));
        }
        Err(_) => fail_transaction(endpoint, xid),
    }
}

/// Spawn a command in a background OS thread and register it in
/// `pending_processes`; the output it produces is drained by
/// `drain_pending_processes` on every subsequent tick rather than awaited
/// here, so this returns as soon as the child is spawned.
fn run_command(
    endpoint: &mut AsyncEndpoint<InProcessDuplex>,
    pending_processes: &mut HashMap<u16, PendingProcess>,
    xid: u16,
    payload: Bytes,
) {
    let command = match Command::decode(payload) {
        Ok(c) => c,
        Err(_) => {
            fail_transaction(endpoint, xid);
            return;
        }
    };

    let (chunk_tx, chunk_rx) = flume::unbounded::<(u16, Bytes)>();
    let (done_tx, done_rx) = flume::bounded::<i32>(1);
    let (child_tx, child_rx) = flume::bounded::<Arc<Mutex<std::process::Child>>>(1);
    let chat = command.chat;
    let (stdin_tx, stdin_rx) = if chat {
        let (tx, rx) = flume::unbounded::<Bytes>();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let command_line = command.command_line.clone();
    let env_pairs: Vec<(String, String)> = command
        .environment
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    std::thread::spawn(move || {
        run_child(&command_line, &env_pairs, chat, stdin_rx, &chunk_tx, &done_tx, &child_tx);
    });

    let Ok(child) = child_rx.recv_timeout(Duration::from_secs(5)) else {
        fail_transaction(endpoint, xid);
        return;
    };
    let pid = child.lock().map(|c| c.id()).unwrap_or(0);
    if chat {
        endpoint.queue_write(codec::build_pid(xid, pid));
    }
    pending_processes.insert(
        xid,
        PendingProcess {
            chat,
            stdin_tx,
            chunk_rx,
            done_rx,
            child,
        },
    );
}

/// Drain every running process's output chunks and, once its `done_rx`
/// reports an exit code, its final `CHAN_EOF`/`MAJOR`/`MINOR` sequence.
fn drain_pending_processes(
    endpoint: &mut AsyncEndpoint<InProcessDuplex>,
    pending_processes: &mut HashMap<u16, PendingProcess>,
) {
    let mut finished = Vec::new();
    for (xid, proc) in pending_processes.iter_mut() {
        while let Ok((chan_id, chunk)) = proc.chunk_rx.try_recv() {
            endpoint.queue_write(codec::build_chan_data(*xid, chan_id, &chunk));
        }
        if let Ok(code) = proc.done_rx.try_recv() {
            if proc.chat {
                endpoint.queue_write(codec::build_chan_eof(*xid, CHAN_STDIN));
            } else {
                endpoint.queue_write(codec::build_chan_eof(*xid, CHAN_STDOUT));
                endpoint.queue_write(codec::build_chan_eof(*xid, CHAN_STDERR));
            }
            endpoint.queue_write(codec::build_major(*xid, 0));
            endpoint.queue_write(codec::build_minor(*xid, code as u32));
            finished.push(*xid);
        }
    }
    for xid in finished {
        pending_processes.remove(&xid);
    }
}

/// Runs on its own OS thread: spawns the child, hands the caller its
/// `Arc<Mutex<Child>>` (for `interrupt`/pid lookup), then bridges its
/// stdout/stderr — and, for a chat command, its stdin — to/from `flume`
/// channels until it exits.
#[allow(clippy::too_many_arguments)]
fn run_child(
    command_line: &str,
    env: &[(String, String)],
    chat: bool,
    stdin_rx: Option<flume::Receiver<Bytes>>,
    chunk_tx: &flume::Sender<(u16, Bytes)>,
    done_tx: &flume::Sender<i32>,
    child_tx: &flume::Sender<Arc<Mutex<std::process::Child>>>,
) {
    use std::io::{Read, Write};
    use std::process::{Command as StdCommand, Stdio};

    let mut cmd = StdCommand::new("/bin/sh");
    cmd.arg("-c").arg(command_line);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if chat { Stdio::piped() } else { Stdio::null() });

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(_) => {
            let _ = done_tx.send(-1);
            return;
        }
    };

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let child = Arc::new(Mutex::new(child));
    if child_tx.send(Arc::clone(&child)).is_err() {
        return;
    }

    // A chat command's output is tagged as channel 0 (the "all" channel),
    // merged with its stdin on the same channel id, matching `twopence.c`'s
    // chat sessions where stdout+stderr land in one capture buffer;
    // a plain run keeps them tagged separately.
    let out_tag = if chat { CHAN_STDIN } else { CHAN_STDOUT };
    let err_tag = if chat { CHAN_STDIN } else { CHAN_STDERR };

    let stdin_handle = stdin.map(|mut pipe| {
        let rx = stdin_rx.expect("chat command always supplies a stdin receiver");
        std::thread::spawn(move || {
            while let Ok(chunk) = rx.recv() {
                if pipe.write_all(&chunk).is_err() {
                    return;
                }
            }
        })
    });
    let out_handle = stdout.map(|mut pipe| {
        let tx = chunk_tx.clone();
        std::thread::spawn(move || forward_pipe(&mut pipe, out_tag, &tx))
    });
    let err_handle = stderr.map(|mut pipe| {
        let tx = chunk_tx.clone();
        std::thread::spawn(move || forward_pipe(&mut pipe, err_tag, &tx))
    });
    if let Some(h) = out_handle {
        let _ = h.join();
    }
    if let Some(h) = err_handle {
        let _ = h.join();
    }
    let code = child
        .lock()
        .ok()
        .and_then(|mut c| c.wait().ok())
        .and_then(|s| s.code())
        .unwrap_or(-1);
    // The stdin forwarder only ends once its receiver disconnects (the
    // responder dropped `stdin_tx` on CHAN_EOF) or a write fails (the
    // child's stdin was already closed by it exiting) — joining it after
    // `wait()` guarantees the latter case unblocks the thread.
    if let Some(h) = stdin_handle {
        let _ = h.join();
    }
    let _ = done_tx.send(code);

    fn forward_pipe(pipe: &mut impl Read, chan_id: u16, tx: &flume::Sender<(u16, Bytes)>) {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if tx.send((chan_id, Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn duplex_round_trips_a_chunk_smaller_than_the_read_buffer() {
        let (mut a, mut b) = InProcessDuplex::pair();
        let BufResult(written, _) = a.write(Bytes::from_static(b"hello")).await;
        assert_eq!(written.unwrap(), 5);
        let BufResult(read, buf) = b.read(BytesMut::zeroed(64)).await;
        let n = read.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[compio::test]
    async fn duplex_reports_eof_once_peer_is_dropped() {
        let (a, mut b) = InProcessDuplex::pair();
        drop(a);
        let BufResult(read, _) = b.read(BytesMut::zeroed(64)).await;
        assert_eq!(read.unwrap(), 0);
    }

    #[compio::test]
    async fn local_plugin_runs_an_echo_command() {
        let mut conn = connect("").await.unwrap();
        let id = conn.alloc_id();
        let mut t = twopence_protocol::Transaction::new(id, twopence_protocol::TransactionKind::RunCommand);
        t.add_channel(twopence_protocol::TransactionChannel::new(CHAN_STDOUT).with_sink());
        t.add_channel(twopence_protocol::TransactionChannel::new(CHAN_STDERR).with_sink());
        let cmd = Command::new("echo hi");
        let frame = cmd.encode(id);
        conn.begin(t, frame);
        let completion = conn.drive_until_done(id).await.unwrap();
        let stdout: Vec<u8> = completion
            .channel_data
            .iter()
            .find(|(id, _)| *id == CHAN_STDOUT)
            .map(|(_, b)| b.to_vec())
            .unwrap_or_default();
        assert_eq!(stdout, b"hi\n");
    }

    #[compio::test]
    async fn local_plugin_runs_a_chat_session_with_live_stdin() {
        let mut conn = connect("").await.unwrap();
        let id = conn.alloc_id();
        let mut t = twopence_protocol::Transaction::new(id, twopence_protocol::TransactionKind::Chat);
        let (stdin_tx, stdin_rx) = flume::unbounded();
        t.add_channel(
            twopence_protocol::TransactionChannel::new(CHAN_STDIN)
                .with_source(twopence_core::iostream::IoStream::from_channel(stdin_rx))
                .with_sink(),
        );
        let cmd = Command::new("cat").chatty();
        let frame = cmd.encode(id);
        conn.begin(t, frame);

        stdin_tx.send(Bytes::from_static(b"ping\n")).unwrap();
        drop(stdin_tx);

        let completion = conn.drive_until_done(id).await.unwrap();
        let merged: Vec<u8> = completion
            .channel_data
            .iter()
            .find(|(chan_id, _)| *chan_id == CHAN_STDIN)
            .map(|(_, b)| b.to_vec())
            .unwrap_or_default();
        assert_eq!(merged, b"ping\n");
    }
}
