use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{Instant, sleep, timeout};

/// Bounds for one polling loop: exponential backoff from `interval` up to
/// `max_interval`, stopping after `max_attempts` checks or `timeout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub timeout: Duration,
}

/// Result of a single check.
#[derive(Debug)]
pub enum Attempt<T> {
    /// Terminal state reached; stop polling.
    Done(T),
    /// Not there yet; keep the observed value in case we run out of time.
    Retry(T),
}

#[derive(Debug)]
pub enum PollError<T, E> {
    Exhausted {
        last: Option<T>,
        attempts: u32,
        elapsed: Duration,
    },
    Failed(E),
}

/// Repeats `check` until it reports a terminal state, fails, or the policy runs
/// out. A check that hangs is cut off at the deadline.
pub async fn poll_until<T, E, F, Fut>(
    target: &str,
    policy: &PollPolicy,
    mut check: F,
) -> Result<T, PollError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let started = Instant::now();
    // None when the timeout lies beyond what the clock can represent.
    let deadline = started.checked_add(policy.timeout);
    let time_left = || match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => Duration::MAX,
    };
    let mut delay = policy.interval;
    let mut attempt = 0;
    let mut last = None;

    loop {
        attempt += 1;
        debug!("[poll] attempt {} for {}", attempt, target);

        let observed = match timeout(time_left(), check()).await {
            Ok(observed) => observed,
            Err(_) => {
                warn!(
                    "[poll] {} check still running at the deadline ({}ms, attempt {})",
                    target,
                    started.elapsed().as_millis(),
                    attempt
                );
                return Err(PollError::Exhausted {
                    last,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }
        };

        match observed {
            Ok(Attempt::Done(value)) => {
                debug!(
                    "[poll] {} finished after {}ms (attempt {})",
                    target,
                    started.elapsed().as_millis(),
                    attempt
                );
                return Ok(value);
            }
            Ok(Attempt::Retry(value)) => {
                last = Some(value);
                let remaining = time_left();
                if attempt >= policy.max_attempts || remaining.is_zero() {
                    warn!(
                        "[poll] giving up on {} after {}ms (attempt {})",
                        target,
                        started.elapsed().as_millis(),
                        attempt
                    );
                    return Err(PollError::Exhausted {
                        last,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }

                let wait = delay.min(remaining);
                debug!(
                    "[poll] {} not finished, waiting {}ms ({}ms remaining)",
                    target,
                    wait.as_millis(),
                    remaining.as_millis()
                );
                sleep(wait).await;
                delay = delay.saturating_mul(2).min(policy.max_interval);
            }
            Err(e) => {
                debug!("[poll] {} check failed on attempt {}", target, attempt);
                return Err(PollError::Failed(e));
            }
        }
    }
}
