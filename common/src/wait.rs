use anyhow::{Result, bail};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_CAP: Duration = Duration::from_secs(10);

/// Poll `probe` until it reports ready, the deadline passes, or the token
/// is cancelled. Sleeps with full-jitter backoff between attempts.
pub async fn wait_until_ready<F, Fut>(
    cancel: &CancellationToken,
    deadline: Duration,
    what: &str,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let base = Duration::from_millis(250);
    let started = tokio::time::Instant::now();
    let mut attempt = 0usize;

    loop {
        if probe().await {
            return Ok(());
        }
        if started.elapsed() >= deadline {
            bail!("timed out after {:?} waiting for {}", deadline, what);
        }
        let delay = backoff_full_jitter(base, DEFAULT_CAP, attempt);
        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled while waiting for {}", what),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Use millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}
