//! The wire frame codec: an 8-byte fixed header followed by a payload.
//!
//! ```text
//!  0      2   3   4       6       8
//!  +------+---+---+-------+-------+
//!  | magic| ty|pad| length|  xid  |
//!  +------+---+---+-------+-------+
//! ```
//!
//! `magic` identifies the protocol and its version in one field so a peer
//! speaking an incompatible version is rejected at the first frame rather
//! than deep in dispatch. `xid` is the transaction id the packet belongs to;
//! id 0 is reserved (never allocated to a live transaction) so a stray or
//! malformed packet addressed to it can be dropped without being mistaken
//! for a real transaction's traffic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use twopence_core::buffer::ByteBuffer;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Current protocol magic + version, big-endian encoded as the first two
/// header bytes.
pub const MAGIC: u16 = 0x7051; // "pQ" — arbitrary but stable

/// Transaction id reserved for packets with no owning transaction.
pub const XID_NONE: u16 = 0;

/// Errors the codec can report. Framing-level only; dispatch-level failures
/// belong to `twopence_core::error::TwopenceError`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad magic/version in frame header")]
    BadMagic,
    #[error("frame payload exceeds MAX_PACKET")]
    TooLarge,
    #[error("frame length field is smaller than the header size")]
    Truncated,
    #[error("unknown packet type byte")]
    UnknownType(u8),
}

impl From<ProtocolError> for twopence_core::error::TwopenceError {
    fn from(e: ProtocolError) -> Self {
        twopence_core::error::TwopenceError::protocol(e.to_string())
    }
}

/// Every packet type the protocol exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// First packet on a fresh connection, exchanged before any transaction.
    Hello = 0,
    /// Client → server: run a command.
    Command = 1,
    /// Either direction: payload for a channel (stdin/stdout/stderr, a file
    /// being injected or extracted, ...).
    ChanData = 2,
    /// Either direction: a channel reached end of file.
    ChanEof = 3,
    /// Server → client: the transaction's major status (exit code class).
    Major = 4,
    /// Server → client: the transaction's minor status (signal/detail).
    Minor = 5,
    /// Server → client: the transaction's deadline elapsed.
    Timeout = 6,
    /// Client → server: interrupt a running command.
    Interrupt = 7,
    /// Client → server: begin injecting a file.
    Inject = 8,
    /// Client → server: begin extracting a file.
    Extract = 9,
    /// Either direction: cleanly end the connection.
    Quit = 10,
    /// Server → client, chat transactions only: the remote child's pid,
    /// sent once right after `MAJOR`'s ordinary meaning would otherwise be
    /// expected — a chat transaction never sends `MAJOR`/`MINOR` until the
    /// session ends, so the pid needs its own announcement (§4.8
    /// `chat_begin`'s "pid of remote child" output).
    Pid = 11,
}

impl PacketType {
    #[must_use]
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Hello),
            1 => Some(Self::Command),
            2 => Some(Self::ChanData),
            3 => Some(Self::ChanEof),
            4 => Some(Self::Major),
            5 => Some(Self::Minor),
            6 => Some(Self::Timeout),
            7 => Some(Self::Interrupt),
            8 => Some(Self::Inject),
            9 => Some(Self::Extract),
            10 => Some(Self::Quit),
            11 => Some(Self::Pid),
            _ => None,
        }
    }
}

/// A decoded frame: its type, owning transaction id, and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub packet_type: PacketType,
    pub xid: u16,
    pub payload: Bytes,
}

/// Encode a header + payload into a freshly allocated frame.
#[must_use]
pub fn build_frame(packet_type: PacketType, xid: u16, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    write_header(&mut out, packet_type, xid, payload.len());
    out.extend_from_slice(payload);
    out.freeze()
}

/// Encode a CHAN_DATA frame directly into `buf`, which must already have
/// `payload.len()` unread bytes at its head and `HEADER_SIZE` bytes of
/// head-room reserved ahead of them (see [`ByteBuffer::reserve_head`]).
/// No payload copy occurs — only the header is written, into the reserved
/// head-room, exactly mirroring the original's "reserve header room, read
/// into tailroom, prepend header only after a successful read" sequence.
pub fn push_chan_data_header(buf: &mut ByteBuffer, xid: u16, channel_id: u16) -> bool {
    let payload_len = buf.count();
    let mut header = [0u8; HEADER_SIZE + 2];
    write_header_bytes(&mut header[..HEADER_SIZE], PacketType::ChanData, xid, payload_len + 2);
    header[HEADER_SIZE..].copy_from_slice(&channel_id.to_be_bytes());
    buf.push_header(&header)
}

fn write_header(out: &mut BytesMut, packet_type: PacketType, xid: u16, payload_len: usize) {
    let mut header = [0u8; HEADER_SIZE];
    write_header_bytes(&mut header, packet_type, xid, payload_len);
    out.extend_from_slice(&header);
}

fn write_header_bytes(out: &mut [u8], packet_type: PacketType, xid: u16, payload_len: usize) {
    let mut w = &mut out[..HEADER_SIZE];
    w.put_u16(MAGIC);
    w.put_u8(packet_type as u8);
    w.put_u8(0); // padding
    w.put_u16((HEADER_SIZE + payload_len) as u16);
    w.put_u16(xid);
}

/// Build a CHAN_DATA packet (channel id prefixed onto the payload), used
/// when the payload isn't already sitting in a head-roomed `ByteBuffer`.
#[must_use]
pub fn build_chan_data(xid: u16, channel_id: u16, data: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + data.len());
    payload.put_u16(channel_id);
    payload.extend_from_slice(data);
    build_frame(PacketType::ChanData, xid, &payload)
}

#[must_use]
pub fn build_chan_eof(xid: u16, channel_id: u16) -> Bytes {
    let mut payload = BytesMut::with_capacity(2);
    payload.put_u16(channel_id);
    build_frame(PacketType::ChanEof, xid, &payload)
}

#[must_use]
pub fn build_major(xid: u16, code: u32) -> Bytes {
    build_frame(PacketType::Major, xid, &code.to_be_bytes())
}

#[must_use]
pub fn build_minor(xid: u16, code: u32) -> Bytes {
    build_frame(PacketType::Minor, xid, &code.to_be_bytes())
}

#[must_use]
pub fn build_timeout(xid: u16) -> Bytes {
    build_frame(PacketType::Timeout, xid, &[])
}

#[must_use]
pub fn build_command(xid: u16, command_line: &str) -> Bytes {
    build_frame(PacketType::Command, xid, command_line.as_bytes())
}

#[must_use]
pub fn build_interrupt(xid: u16) -> Bytes {
    build_frame(PacketType::Interrupt, xid, &[])
}

#[must_use]
pub fn build_quit() -> Bytes {
    build_frame(PacketType::Quit, XID_NONE, &[])
}

#[must_use]
pub fn build_pid(xid: u16, pid: u32) -> Bytes {
    build_frame(PacketType::Pid, xid, &pid.to_be_bytes())
}

/// Split the channel id prefix off a `CHAN_DATA`/`CHAN_EOF` payload.
pub fn split_channel_id(mut payload: Bytes) -> Option<(u16, Bytes)> {
    if payload.len() < 2 {
        return None;
    }
    let id = payload.get_u16();
    Some((id, payload))
}

/// Stateful incremental frame decoder.
///
/// Fast path: the whole frame (header + payload) is already buffered →
/// zero-copy slice out. Slow path: the header declares more payload than is
/// currently buffered → wait for the next `decode` call with more data.
#[derive(Default)]
pub struct FrameDecoder {
    pending_header: Option<(PacketType, u16, usize)>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to decode one frame from `src`. Returns `Ok(None)` if more
    /// bytes are needed.
    pub fn decode(&mut self, src: &mut ByteBuffer) -> Result<Option<Frame>, ProtocolError> {
        let (packet_type, xid, payload_len) = match self.pending_header {
            Some(h) => h,
            None => {
                if src.count() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = &src.head()[..HEADER_SIZE];
                let mut r = header;
                let magic = r.get_u16();
                if magic != MAGIC {
                    return Err(ProtocolError::BadMagic);
                }
                let ty_byte = r.get_u8();
                let _pad = r.get_u8();
                let len = r.get_u16() as usize;
                let xid = r.get_u16();
                let packet_type =
                    PacketType::from_u8(ty_byte).ok_or(ProtocolError::UnknownType(ty_byte))?;
                if len < HEADER_SIZE {
                    return Err(ProtocolError::Truncated);
                }
                if len > twopence_core::config::MAX_PACKET {
                    return Err(ProtocolError::TooLarge);
                }
                let payload_len = len - HEADER_SIZE;
                self.pending_header = Some((packet_type, xid, payload_len));
                (packet_type, xid, payload_len)
            }
        };

        if src.count() < HEADER_SIZE + payload_len {
            return Ok(None);
        }

        src.advance_head(HEADER_SIZE);
        let payload = src
            .pull(payload_len)
            .expect("count check above guarantees the payload is present");
        self.pending_header = None;
        Ok(Some(Frame {
            packet_type,
            xid,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_decode_command() {
        let frame_bytes = build_command(42, "echo hello");
        let mut buf = ByteBuffer::new(64);
        buf.append(&frame_bytes);

        let mut decoder = FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.xid, 42);
        assert!(matches!(frame.packet_type, PacketType::Command));
        assert_eq!(frame.payload.as_ref(), b"echo hello");
    }

    #[test]
    fn decode_waits_for_more_bytes() {
        let frame_bytes = build_chan_data(1, 3, b"partial-data-that-is-long-enough");
        let mut buf = ByteBuffer::new(64);
        buf.append(&frame_bytes[..HEADER_SIZE + 2]); // header + channel id, no payload bytes

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.append(&frame_bytes[HEADER_SIZE + 2..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        let (chan_id, payload) = split_channel_id(frame.payload).unwrap();
        assert_eq!(chan_id, 3);
        assert_eq!(payload.as_ref(), b"partial-data-that-is-long-enough");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = ByteBuffer::new(64);
        buf.append(&[0xFF, 0xFF, 1, 0, 0, 0, 0, 1]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::BadMagic));
    }

    #[test]
    fn chan_data_header_prepend_is_zero_copy_for_the_payload() {
        let mut buf = ByteBuffer::new(64);
        buf.reserve_head(HEADER_SIZE + 2);
        buf.append(b"payload-bytes");

        assert!(push_chan_data_header(&mut buf, 9, 5));

        let mut decoder = FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.xid, 9);
        let (chan_id, payload) = split_channel_id(frame.payload).unwrap();
        assert_eq!(chan_id, 5);
        assert_eq!(payload.as_ref(), b"payload-bytes");
    }

    #[test]
    fn length_field_is_total_frame_size_including_header() {
        let frame_bytes = build_command(7, "echo hi");
        let len_field = u16::from_be_bytes([frame_bytes[4], frame_bytes[5]]);
        assert_eq!(len_field as usize, HEADER_SIZE + "echo hi".len());
    }

    #[test]
    fn rejects_length_field_shorter_than_header() {
        let mut buf = ByteBuffer::new(64);
        let mut header = [0u8; HEADER_SIZE];
        write_header_bytes(&mut header, PacketType::Command, 1, 0);
        header[4..6].copy_from_slice(&3u16.to_be_bytes());
        buf.append(&header);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::Truncated));
    }
}
