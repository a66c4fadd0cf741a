//! Bounding an I/O future by a transaction's deadline, so the connection's
//! event loop (`Connection::run_once`, §4.7 step 3) never blocks past the
//! soonest live transaction's timeout even when the transport itself has
//! nothing to report — `compio`'s reactor has no poll-with-timeout of its
//! own, so this wraps whatever future it's given in `compio::time::timeout`.

use compio::time::timeout;
use std::io;
use std::time::Instant;

/// Run `fut` to completion, or fail with `ErrorKind::TimedOut` once
/// `deadline` passes. `deadline = None` means wait indefinitely — used when
/// no live transaction currently has a timeout set.
pub async fn bounded_by_deadline<F, T>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    let Some(deadline) = deadline else {
        return fut.await;
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    match timeout(remaining, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "deadline elapsed while waiting for transport I/O",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[compio::test]
    async fn no_deadline_runs_to_completion() {
        let result = bounded_by_deadline(None, async { Ok::<_, io::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[compio::test]
    async fn future_deadline_still_completes() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let result = bounded_by_deadline(Some(deadline), async { Ok::<_, io::Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[compio::test]
    async fn past_deadline_times_out_a_pending_future() {
        let deadline = Instant::now() - Duration::from_millis(1);
        let result: io::Result<()> =
            bounded_by_deadline(Some(deadline), std::future::pending()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}
