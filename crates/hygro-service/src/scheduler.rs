//! Periodic background sweeps.
//!
//! Each sweep runs on its own tokio interval until its cancellation token
//! fires. The storage work itself is blocking I/O, so every tick hands the
//! sweep to [`tokio::task::spawn_blocking`].
//!
//! ```ignore
//! let cancel = CancellationToken::new();
//! let handle = spawn_periodic(Arc::new(retention), DAILY, cancel.clone());
//!
//! // Later, to stop the sweep:
//! cancel.cancel();
//! handle.await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use hygro_store::{CompactionSweeper, RetentionSweeper};

/// Cadence of the retention and compaction sweeps.
pub const DAILY: Duration = Duration::from_secs(24 * 60 * 60);

/// A unit of background maintenance that can be run on demand.
pub trait Sweep: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one pass as of `now`, returning a short summary for the log.
    fn sweep(&self, now: OffsetDateTime) -> hygro_store::Result<String>;
}

impl Sweep for RetentionSweeper {
    fn name(&self) -> &'static str {
        "retention"
    }

    fn sweep(&self, now: OffsetDateTime) -> hygro_store::Result<String> {
        let outcome = self.run_once(now)?;
        Ok(format!("{} removed", outcome.removed))
    }
}

impl Sweep for CompactionSweeper {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn sweep(&self, now: OffsetDateTime) -> hygro_store::Result<String> {
        let outcome = self.run_once(now)?;
        Ok(format!(
            "{} segments in {} partitions compressed",
            outcome.segments, outcome.partitions
        ))
    }
}

/// Run `sweep` every `period` until `cancel_token` is cancelled.
///
/// The first pass runs immediately. A failed pass is logged and retried on
/// the next tick. Cancellation is checked before every tick; a pass that is
/// already running when the token fires is allowed to finish.
pub fn spawn_periodic(
    sweep: Arc<dyn Sweep>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Scheduling {} sweep every {:?}", sweep.name(), period);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    info!("{} sweep cancelled, shutting down", sweep.name());
                    break;
                }
                _ = ticker.tick() => {
                    let task = Arc::clone(&sweep);
                    let result =
                        tokio::task::spawn_blocking(move || task.sweep(OffsetDateTime::now_utc()))
                            .await;
                    match result {
                        Ok(Ok(summary)) => debug!("{} sweep finished: {}", sweep.name(), summary),
                        Ok(Err(e)) => error!("{} sweep failed: {}", sweep.name(), e),
                        Err(e) => error!("{} sweep panicked: {}", sweep.name(), e),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    impl Sweep for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn sweep(&self, _now: OffsetDateTime) -> hygro_store::Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(hygro_store::Error::Closed)
            } else {
                Ok(String::new())
            }
        }
    }

    async fn wait_for_runs(sweep: &Counting, runs: usize) {
        for _ in 0..200 {
            if sweep.runs.load(Ordering::SeqCst) >= runs {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sweep did not reach {runs} runs");
    }

    #[tokio::test]
    async fn test_runs_until_cancelled() {
        let sweep = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(sweep.clone(), Duration::from_millis(20), cancel.clone());

        wait_for_runs(&sweep, 3).await;
        cancel.cancel();
        handle.await.unwrap();

        let after_cancel = sweep.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_failures_are_retried() {
        let sweep = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(sweep.clone(), Duration::from_millis(10), cancel.clone());

        wait_for_runs(&sweep, 2).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_runs() {
        let sweep = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        spawn_periodic(sweep.clone(), DAILY, cancel).await.unwrap();
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 0);
    }
}
