use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::{reconfigure::ExecStatus, Error};

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub reload_tasks: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "kubeblocks_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "kubeblocks_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["controller", "instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!("kubeblocks_operator_reconciliations_total", "reconciliations"),
            &["controller"],
        )
        .unwrap();
        let reload_tasks = IntCounterVec::new(
            opts!(
                "kubeblocks_operator_reload_tasks_total",
                "executed reload tasks by type and outcome"
            ),
            &["reload_type", "status"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            reload_tasks,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.reload_tasks.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, instance: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, instance, e.metric_label().as_ref()])
            .inc()
    }

    pub fn reload_task(&self, reload_type: &str, status: ExecStatus) {
        self.reload_tasks
            .with_label_values(&[reload_type, status.as_str()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.with_label_values(&[controller]).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            controller: controller.to_string(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.controller.as_str()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_count() {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();

        {
            let _timer = metrics.count_and_measure("configmap");
        }
        metrics.reload_task("restart", ExecStatus::Retry);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"kubeblocks_operator_reconciliations_total".to_string()));
        assert!(names.contains(&"kubeblocks_operator_reload_tasks_total".to_string()));
        assert_eq!(
            metrics
                .reconciliations
                .with_label_values(&["configmap"])
                .get(),
            1
        );
    }
}
