//! Polls a node until the expected workload versions report a final state.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use grid_clients::NodeClient;
use grid_common::{ContractId, ResultState, Workload};

use crate::config::DeployerConfig;
use crate::error::ConvergenceError;
use crate::util::{bounded, CallError};

/// Exponential poll interval, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            multiplier: multiplier.max(1.0),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

/// Tracks the best number of ready workloads seen and when it last grew.
#[derive(Debug, Clone)]
pub struct Progress {
    best_ok: usize,
    last_improved: Instant,
    window: Duration,
}

impl Progress {
    pub fn new(now: Instant, window: Duration) -> Self {
        Self {
            best_ok: 0,
            last_improved: now,
            window,
        }
    }

    /// Record a poll. Returns true once `window` passed without improvement.
    pub fn observe(&mut self, ok: usize, now: Instant) -> bool {
        if ok > self.best_ok {
            self.best_ok = ok;
            self.last_improved = now;
            return false;
        }
        now.saturating_duration_since(self.last_improved) >= self.window
    }

    pub fn best_ok(&self) -> usize {
        self.best_ok
    }
}

/// Count the expected workloads reporting `Ok`. A failure state on any of them
/// ends the wait. Workloads at other versions are ignored.
pub fn classify(
    workloads: &[Workload],
    expected: &BTreeMap<String, u32>,
) -> Result<usize, ConvergenceError> {
    let mut ok = 0;
    for w in workloads {
        if expected.get(&w.name) != Some(&w.version) {
            continue;
        }
        match w.result.state {
            ResultState::Ok => ok += 1,
            state if state.is_failure() => {
                return Err(ConvergenceError::WorkloadFailed {
                    name: w.name.clone(),
                    version: w.version,
                    state,
                    message: w.result.message.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(ok)
}

pub async fn wait_for_convergence(
    cancel: &CancellationToken,
    node: &dyn NodeClient,
    deployment_id: ContractId,
    expected: &BTreeMap<String, u32>,
    config: &DeployerConfig,
) -> Result<(), ConvergenceError> {
    if expected.is_empty() {
        return Ok(());
    }

    let start = Instant::now();
    let deadline = config.poll_max_elapsed();
    let mut backoff = Backoff::new(
        config.poll_initial_interval(),
        config.poll_multiplier,
        config.poll_max_interval(),
    );
    let mut progress = Progress::new(start, config.stall_timeout());

    loop {
        let ok = match bounded(
            cancel,
            config.node_call_timeout(),
            node.deployment_changes(deployment_id),
        )
        .await
        {
            Ok(workloads) => {
                let ok = classify(&workloads, expected)?;
                debug!(deployment_id, ok, expected = expected.len(), "polled deployment");
                if ok == expected.len() {
                    return Ok(());
                }
                ok
            }
            Err(CallError::Cancelled) => return Err(ConvergenceError::Cancelled),
            Err(e) => {
                warn!(deployment_id, error = %e, "polling deployment failed, retrying");
                progress.best_ok()
            }
        };

        let now = Instant::now();
        if progress.observe(ok, now) {
            return Err(ConvergenceError::Stalled {
                window: config.stall_timeout(),
                ok: progress.best_ok(),
                expected: expected.len(),
            });
        }
        let elapsed = now.duration_since(start);
        if elapsed >= deadline {
            return Err(ConvergenceError::DeadlineExceeded {
                elapsed,
                ok: progress.best_ok(),
                expected: expected.len(),
            });
        }

        let delay = backoff.next_delay().min(deadline - elapsed);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConvergenceError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_common::{DiskData, WorkloadData, WorkloadResult};

    fn workload(name: &str, version: u32, state: ResultState) -> Workload {
        let mut w = Workload::new(name, WorkloadData::Disk(DiskData { size: 1 }));
        w.version = version;
        w.result = WorkloadResult {
            state,
            message: "node said so".to_string(),
            data: None,
        };
        w
    }

    #[test]
    fn backoff_grows_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(3), 1.25, Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(3));
        assert_eq!(b.next_delay(), Duration::from_millis(3750));
        assert_eq!(b.next_delay(), Duration::from_micros(4_687_500));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn progress_resets_on_improvement() {
        let t0 = Instant::now();
        let window = Duration::from_secs(60);
        let mut p = Progress::new(t0, window);

        assert!(!p.observe(0, t0 + Duration::from_secs(30)));
        assert!(!p.observe(1, t0 + Duration::from_secs(59)));
        assert!(!p.observe(1, t0 + Duration::from_secs(100)));
        assert!(!p.observe(0, t0 + Duration::from_secs(110)));
        assert!(p.observe(1, t0 + Duration::from_secs(119)));
        assert_eq!(p.best_ok(), 1);
    }

    #[test]
    fn classify_matches_versions() {
        let expected = BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 0)]);
        let workloads = vec![
            workload("a", 1, ResultState::Ok),
            workload("b", 0, ResultState::Unset),
            workload("c", 1, ResultState::Error),
        ];
        assert_eq!(classify(&workloads, &expected).unwrap(), 1);

        // an old version reporting ok does not count
        let stale = vec![workload("a", 0, ResultState::Ok)];
        assert_eq!(classify(&stale, &expected).unwrap(), 0);
    }

    #[test]
    fn classify_fails_on_error_state() {
        let expected = BTreeMap::from([("a".to_string(), 2)]);
        let err = classify(&[workload("a", 2, ResultState::Deleted)], &expected).unwrap_err();
        match err {
            ConvergenceError::WorkloadFailed { name, state, message, .. } => {
                assert_eq!(name, "a");
                assert_eq!(state, ResultState::Deleted);
                assert_eq!(message, "node said so");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
