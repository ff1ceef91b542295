//! Bounded polling over an injected clock.
//!
//! A probe runs immediately, then after every `interval` until it reports
//! ready or the `timeout` budget is spent. The last sleep is shortened so
//! the final probe lands exactly on the deadline: with a 15s interval and a
//! 300s timeout a never-ready probe runs at t=0,15,…,300 (21 attempts).

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use fleet_core::{Clock, PollBudget};

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
}

/// A probe that reported ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled<T> {
    pub value: T,
    pub attempts: u32,
    pub waited: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError<E> {
    #[error("not ready after {attempts} attempts ({waited:?})")]
    TimedOut { attempts: u32, waited: Duration },

    #[error("probe failed: {0}")]
    Probe(E),
}

pub async fn poll_until<T, E, F, Fut>(
    clock: &dyn Clock,
    budget: PollBudget,
    mut probe: F,
) -> Result<Polled<T>, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let start = clock.now();
    let deadline = chrono::Duration::from_std(budget.timeout)
        .ok()
        .and_then(|t| start.checked_add_signed(t))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Probe::Ready(value) = probe().await.map_err(PollError::Probe)? {
            return Ok(Polled {
                value,
                attempts,
                waited: elapsed(start, clock.now()),
            });
        }

        let now = clock.now();
        if now >= deadline {
            let waited = elapsed(start, now);
            debug!(attempts, ?waited, "poll budget exhausted");
            return Err(PollError::TimedOut { attempts, waited });
        }

        let remaining = elapsed(now, deadline);
        clock.sleep(budget.interval.min(remaining)).await;
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ManualClock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc::now()))
    }

    #[tokio::test]
    async fn ready_on_first_probe_does_not_sleep() {
        let clock = clock();
        let polled = poll_until(clock.as_ref(), PollBudget::default(), || async {
            Ok::<_, ()>(Probe::Ready("up"))
        })
        .await
        .unwrap();

        assert_eq!(polled.value, "up");
        assert_eq!(polled.attempts, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn ready_after_some_intervals() {
        let clock = clock();
        let calls = AtomicU32::new(0);
        let polled = poll_until(clock.as_ref(), PollBudget::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ()>(if n == 3 { Probe::Ready(n) } else { Probe::Pending }) }
        })
        .await
        .unwrap();

        assert_eq!(polled.attempts, 4);
        assert_eq!(polled.waited, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn default_budget_times_out_after_21_probes() {
        let clock = clock();
        let start = clock.now();
        let probe_times = std::sync::Mutex::new(Vec::new());

        let err = poll_until(clock.as_ref(), PollBudget::default(), || {
            probe_times.lock().unwrap().push(clock.now() - start);
            async { Ok::<Probe<()>, ()>(Probe::Pending) }
        })
        .await
        .unwrap_err();

        assert_eq!(
            err,
            PollError::TimedOut {
                attempts: 21,
                waited: Duration::from_secs(300)
            }
        );
        let times = probe_times.into_inner().unwrap();
        assert_eq!(times.first(), Some(&chrono::Duration::zero()));
        assert_eq!(times.last(), Some(&chrono::Duration::seconds(300)));
        assert_eq!(clock.total_slept(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn last_sleep_is_clamped_to_deadline() {
        let clock = clock();
        let budget = PollBudget {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(50),
        };
        let err = poll_until(clock.as_ref(), budget, || async {
            Ok::<Probe<()>, ()>(Probe::Pending)
        })
        .await
        .unwrap_err();

        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(20),
                Duration::from_secs(20),
                Duration::from_secs(10)
            ]
        );
        assert!(matches!(err, PollError::TimedOut { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn probe_error_stops_polling() {
        let clock = clock();
        let err = poll_until(clock.as_ref(), PollBudget::default(), || async {
            Err::<Probe<()>, _>("provider down")
        })
        .await
        .unwrap_err();

        assert_eq!(err, PollError::Probe("provider down"));
        assert!(clock.sleeps().is_empty());
    }
}
