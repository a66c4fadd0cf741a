//! Descriptor for a file transfer transaction (inject or extract).

use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use twopence_core::error::TwopenceError;

use crate::codec::{self, PacketType};

/// Direction of a file transfer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local file pushed to the target.
    Inject,
    /// Remote file pulled from the target.
    Extract,
}

/// A file transfer's endpoints and permissions.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Permission bits applied to the file once fully written, Unix `mode_t`
    /// semantics (e.g. `0o644`). `None` defers to the target's default file
    /// mode, resolved by [`crate::Target::inject_file`] before the transfer
    /// is encoded onto the wire.
    pub mode: Option<u32>,
    /// Total size in bytes, when known up front (always known for inject,
    /// reported by the target for extract once the transfer begins).
    pub size: Option<u64>,
}

impl FileTransfer {
    /// Build an inject descriptor with an explicit mode. Use [`Self::with_mode`]
    /// to override later, or leave the mode unset (`mode: None` is only
    /// reachable by constructing the struct directly) to defer to the
    /// target's default.
    #[must_use]
    pub fn inject(local_path: impl Into<PathBuf>, remote_path: impl Into<String>, mode: u32) -> Self {
        Self {
            direction: TransferDirection::Inject,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            mode: Some(mode),
            size: None,
        }
    }

    /// Build an inject descriptor that defers its file mode to the target's
    /// default (§4.8: `remote.mode=0644` unless overridden).
    #[must_use]
    pub fn inject_default_mode(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Inject,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            mode: None,
            size: None,
        }
    }

    #[must_use]
    pub fn extract(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Extract,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            mode: None,
            size: None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Build the initial `INJECT`/`EXTRACT` frame (§4.5): remote path, file
    /// mode, and size when known up front, ahead of the `CHAN_DATA` stream
    /// that carries the file's bytes. The local path never goes over the
    /// wire — it only matters to this side.
    #[must_use]
    pub fn encode(&self, xid: u16) -> Bytes {
        let packet_type = match self.direction {
            TransferDirection::Inject => PacketType::Inject,
            TransferDirection::Extract => PacketType::Extract,
        };
        let mut payload = BytesMut::new();
        payload.put_u32(self.mode.unwrap_or(twopence_core::config::TargetDefaults::default().file_mode));
        match self.size {
            Some(size) => {
                payload.put_u8(1);
                payload.put_u64(size);
            }
            None => payload.put_u8(0),
        }
        payload.put_u16(self.remote_path.len() as u16);
        payload.extend_from_slice(self.remote_path.as_bytes());
        codec::build_frame(packet_type, xid, &payload)
    }

    /// Parse an `INJECT`/`EXTRACT` frame's payload back into `(remote_path,
    /// mode, size)`. Used by the side receiving the request, which has no
    /// local path of its own to populate.
    pub fn decode_header(mut payload: Bytes) -> Result<(String, u32, Option<u64>), TwopenceError> {
        if payload.len() < 5 {
            return Err(TwopenceError::protocol("truncated file transfer header"));
        }
        let mode = payload.get_u32();
        let has_size = payload.get_u8() != 0;
        let size = if has_size {
            if payload.len() < 8 {
                return Err(TwopenceError::protocol("truncated file transfer size"));
            }
            Some(payload.get_u64())
        } else {
            None
        };
        if payload.len() < 2 {
            return Err(TwopenceError::protocol("truncated file transfer path length"));
        }
        let len = payload.get_u16() as usize;
        if payload.len() < len {
            return Err(TwopenceError::protocol("truncated file transfer path"));
        }
        let remote_path = String::from_utf8(payload.split_to(len).to_vec())
            .map_err(|_| TwopenceError::protocol("remote path is not valid UTF-8"))?;
        Ok((remote_path, mode, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_defaults() {
        let xfer = FileTransfer::inject("/tmp/local", "/tmp/remote", 0o600);
        assert_eq!(xfer.direction, TransferDirection::Inject);
        assert_eq!(xfer.mode, Some(0o600));
        assert!(xfer.size.is_none());
    }

    #[test]
    fn inject_default_mode_defers_to_target() {
        let xfer = FileTransfer::inject_default_mode("/tmp/local", "/tmp/remote");
        assert_eq!(xfer.mode, None);
        let frame_bytes = xfer.encode(1);
        let mut buf = twopence_core::buffer::ByteBuffer::new(256);
        buf.append(&frame_bytes);
        let mut decoder = codec::FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        let (_remote_path, mode, _size) = FileTransfer::decode_header(frame.payload).unwrap();
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn extract_with_size() {
        let xfer = FileTransfer::extract("/tmp/remote", "/tmp/local").with_size(128);
        assert_eq!(xfer.direction, TransferDirection::Extract);
        assert_eq!(xfer.size, Some(128));
    }

    #[test]
    fn inject_header_round_trip() {
        let xfer = FileTransfer::inject("/tmp/local", "/etc/motd", 0o640).with_size(42);
        let frame_bytes = xfer.encode(7);
        let mut buf = twopence_core::buffer::ByteBuffer::new(256);
        buf.append(&frame_bytes);
        let mut decoder = codec::FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.xid, 7);
        assert!(matches!(frame.packet_type, PacketType::Inject));

        let (remote_path, mode, size) = FileTransfer::decode_header(frame.payload).unwrap();
        assert_eq!(remote_path, "/etc/motd");
        assert_eq!(mode, 0o640);
        assert_eq!(size, Some(42));
    }

    #[test]
    fn extract_header_with_no_size_known_yet() {
        let xfer = FileTransfer::extract("/etc/hosts", "/tmp/local");
        let frame_bytes = xfer.encode(9);
        let mut buf = twopence_core::buffer::ByteBuffer::new(256);
        buf.append(&frame_bytes);
        let mut decoder = codec::FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame.packet_type, PacketType::Extract));

        let (remote_path, _mode, size) = FileTransfer::decode_header(frame.payload).unwrap();
        assert_eq!(remote_path, "/etc/hosts");
        assert_eq!(size, None);
    }
}
