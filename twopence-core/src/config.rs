//! Tunable constants and per-connection option sets.

use std::time::Duration;

/// Maximum size of a single wire frame (header + payload), matching the
/// original library's `TWOPENCE_PROTO_MAX_PACKET`.
pub const MAX_PACKET: usize = 16384;

/// Default recv-buffer capacity posted per channel.
pub const DEFAULT_READ_BUF_SIZE: usize = MAX_PACKET;

/// Default write-buffer capacity used to stage outgoing frames.
pub const DEFAULT_WRITE_BUF_SIZE: usize = MAX_PACKET;

/// Soft byte watermark on a connection's transmit queue above which sources
/// stop being polled for more data (backpressure).
pub const DEFAULT_XMIT_WATERMARK: usize = 4 * MAX_PACKET;

/// Per-connection tunables, generalizing the original library's handful of
/// ad hoc globals (handshake timeout, buffer sizes, watermark) into one
/// struct threaded through `Connection::new`.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Time allowed to establish the underlying transport connection.
    pub connect_timeout: Duration,
    /// Per-channel recv-buffer size.
    pub read_buf_size: usize,
    /// Per-channel write-buffer size.
    pub write_buf_size: usize,
    /// Soft xmit-queue watermark used by backpressure checks.
    pub xmit_watermark: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            write_buf_size: DEFAULT_WRITE_BUF_SIZE,
            xmit_watermark: DEFAULT_XMIT_WATERMARK,
        }
    }
}

impl ConnectionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buf_size = read;
        self.write_buf_size = write;
        self
    }

    #[must_use]
    pub fn with_xmit_watermark(mut self, watermark: usize) -> Self {
        self.xmit_watermark = watermark;
        self
    }
}

/// Defaults applied by the target façade when a command doesn't specify
/// them explicitly — user to run as, command timeout, and the mode bits
/// used when injecting a file.
#[derive(Debug, Clone)]
pub struct TargetDefaults {
    pub user: String,
    pub timeout: Duration,
    pub file_mode: u32,
}

impl Default for TargetDefaults {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            timeout: Duration::from_secs(60),
            file_mode: 0o644,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_options_builder() {
        let opts = ConnectionOptions::new()
            .with_buffer_sizes(1024, 2048)
            .with_xmit_watermark(8192);
        assert_eq!(opts.read_buf_size, 1024);
        assert_eq!(opts.write_buf_size, 2048);
        assert_eq!(opts.xmit_watermark, 8192);
    }

    #[test]
    fn target_defaults() {
        let d = TargetDefaults::default();
        assert_eq!(d.user, "root");
        assert_eq!(d.file_mode, 0o644);
    }
}
