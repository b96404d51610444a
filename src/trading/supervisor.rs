//! Worker supervisor.
//!
//! Spawns one task per (container × broker) worker and watches for
//! abnormal exits. Workers absorb recoverable broker failures
//! themselves; an exit with an error here means the worker hit a fatal
//! condition (e.g. the reconcile-before-trade gate).

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::worker::{TradingWorker, WorkerError};
use crate::signal::TradeSignal;

/// Backoff policy for retry delays.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Initial delay before the first retry.
    pub initial_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Exponential multiplier per attempt.
    pub backoff_multiplier: f64,
    /// Random jitter as a fraction of the delay (0.1 = ±10%), so a
    /// fleet of workers does not retry in lockstep.
    pub jitter_fraction: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RestartPolicy {
    /// Jittered exponential delay for the given attempt number.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter_range = capped * self.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Spawns and monitors trading workers.
pub struct WorkerSupervisor {
    workers: JoinSet<(String, Result<(), WorkerError>)>,
    /// Maximum startup stagger so workers do not hit a venue in lockstep.
    startup_stagger: Duration,
}

impl WorkerSupervisor {
    #[must_use]
    pub fn new(startup_stagger: Duration) -> Self {
        Self {
            workers: JoinSet::new(),
            startup_stagger,
        }
    }

    /// Spawn a worker under a name used in monitoring logs, wired to its
    /// signal channel.
    pub fn spawn_worker(
        &mut self,
        name: impl Into<String>,
        worker: TradingWorker,
        signals: mpsc::Receiver<TradeSignal>,
    ) {
        let name = name.into();
        let stagger_ms = if self.startup_stagger.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..self.startup_stagger.as_millis() as u64)
        };
        info!(worker = %name, stagger_ms = stagger_ms, "Spawning trading worker");
        self.workers.spawn(async move {
            tokio::time::sleep(Duration::from_millis(stagger_ms)).await;
            let result = worker.run(signals).await;
            (name, result)
        });
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to finish, logging abnormal exits. Returns
    /// the number of workers that exited with an error or panic.
    pub async fn run_to_completion(&mut self) -> usize {
        let mut failures = 0;
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    info!(worker = %name, "Worker exited cleanly");
                }
                Ok((name, Err(e))) => {
                    failures += 1;
                    error!(worker = %name, error = %e, "Worker exited with error");
                }
                Err(join_err) => {
                    failures += 1;
                    if join_err.is_panic() {
                        error!(error = %join_err, "Worker panicked");
                    } else {
                        warn!(error = %join_err, "Worker cancelled");
                    }
                }
            }
        }
        failures
    }

    /// Abort all workers (shutdown).
    pub fn shutdown(&mut self) {
        self.workers.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RestartPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
        // Capped.
        assert_eq!(policy.calculate_delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RestartPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
        };
        for _ in 0..100 {
            let d = policy.calculate_delay(0).as_millis() as u64;
            assert!((900..=1100).contains(&d), "delay {d} outside jitter band");
        }
    }
}
