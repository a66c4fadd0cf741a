//! Byte-based backpressure: a soft watermark on a connection's pending
//! transmit-queue size.
//!
//! The original library gates whether *source* channels get polled for more
//! data on whether the transport socket's outgoing queue is below a
//! watermark (`twopence_sock_xmit_queue_allowed`) — sinks are always
//! serviced, since not draining them would stall the peer, but sources can
//! simply wait a poll iteration. This is a plain threshold check rather than
//! an async-acquire primitive: nothing here needs to block, the event loop
//! just skips posting sources for one iteration when the queue is full.

/// Returns `true` if a connection whose transmit queue currently holds
/// `queued_bytes` is still allowed to accept more data from source channels,
/// given `watermark` as the soft limit.
#[inline]
#[must_use]
pub const fn xmit_queue_allowed(queued_bytes: usize, watermark: usize) -> bool {
    queued_bytes < watermark
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_below_watermark() {
        assert!(xmit_queue_allowed(100, 1000));
    }

    #[test]
    fn blocks_at_or_above_watermark() {
        assert!(!xmit_queue_allowed(1000, 1000));
        assert!(!xmit_queue_allowed(1500, 1000));
    }
}
