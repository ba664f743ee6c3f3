//! Background idle-eviction task.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MAX_DURATION_SECS;

/// Longest period the sweeper will wait between passes.
const MAX_PERIOD: Duration = Duration::from_secs(MAX_DURATION_SECS);

/// Something the sweeper can periodically reclaim memory from.
pub(crate) trait Sweep: Send + Sync + 'static {
    /// Run one eviction pass, returning the number of evicted entries.
    fn sweep(&self) -> usize;
}

/// Owned handle to a running sweeper task.
///
/// The task only holds a weak reference to its target, so it also exits once
/// the target is dropped.
pub(crate) struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn a sweeper on `runtime` that sweeps `target` every `period`.
    ///
    /// The first pass runs one full period after spawning. Periods longer
    /// than 30 years are clamped.
    pub(crate) fn spawn<S: Sweep>(runtime: &Handle, target: Weak<S>, period: Duration) -> Self {
        let (shutdown, stop) = watch::channel(false);
        let period = period.min(MAX_PERIOD);
        let now = Instant::now();
        let first = now.checked_add(period).unwrap_or(now);
        let task = runtime.spawn(run(target, first, period, stop));
        debug!(period_secs = period.as_secs_f64(), "Sweeper started");
        Self { shutdown, task }
    }

    /// Whether the task has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop and wait for it to exit.
    pub(crate) async fn stop(self) {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

async fn run<S: Sweep>(
    target: Weak<S>,
    first: Instant,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    debug!("Sweep target dropped, sweeper exiting");
                    break;
                };
                let evicted = target.sweep();
                if evicted > 0 {
                    debug!(evicted, "Sweep pass evicted idle entries");
                }
            }
            _ = stop.changed() => {
                info!("Sweeper stopped");
                break;
            }
        }
    }
}
