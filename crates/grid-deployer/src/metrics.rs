use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a deployer, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Calls to `deploy` (and `cancel`).
    pub reconcile_total: AtomicU64,
    /// Calls that returned an error.
    pub reconcile_errors: AtomicU64,
    pub creates_total: AtomicU64,
    pub updates_total: AtomicU64,
    /// Updates found identical to the deployed state.
    pub updates_skipped_total: AtomicU64,
    pub deletes_total: AtomicU64,
    pub reverts_total: AtomicU64,
    pub revert_failures_total: AtomicU64,
    pub convergence_failures_total: AtomicU64,
    pub validation_failures_total: AtomicU64,
    pub soft_failures_total: AtomicU64,
}

impl SharedMetrics {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 11] = [
            ("reconcile_total", "Reconciliations started.", &self.reconcile_total),
            ("reconcile_errors", "Reconciliations that failed.", &self.reconcile_errors),
            ("creates_total", "Deployments created.", &self.creates_total),
            ("updates_total", "Deployments updated.", &self.updates_total),
            ("updates_skipped_total", "Updates skipped because nothing changed.", &self.updates_skipped_total),
            ("deletes_total", "Deployments deleted.", &self.deletes_total),
            ("reverts_total", "Revert passes started.", &self.reverts_total),
            ("revert_failures_total", "Revert passes that failed.", &self.revert_failures_total),
            ("convergence_failures_total", "Deployments that did not converge.", &self.convergence_failures_total),
            ("validation_failures_total", "Batches rejected by capacity validation.", &self.validation_failures_total),
            ("soft_failures_total", "Non-fatal failures reported as warnings.", &self.soft_failures_total),
        ];

        let mut body = String::new();
        for (name, help, value) in counters {
            let _ = write!(
                body,
                "# HELP grid_deployer_{name} {help}\n\
                 # TYPE grid_deployer_{name} counter\n\
                 grid_deployer_{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters() {
        let metrics = SharedMetrics::default();
        SharedMetrics::inc(&metrics.creates_total);
        SharedMetrics::inc(&metrics.creates_total);

        let body = metrics.render_prometheus();
        assert!(body.contains("# TYPE grid_deployer_creates_total counter\n"));
        assert!(body.contains("grid_deployer_creates_total 2\n"));
        assert!(body.contains("grid_deployer_deletes_total 0\n"));
    }
}
