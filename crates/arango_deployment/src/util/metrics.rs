use crate::api::v1alpha::ArangoDeployment;
use crate::util::deployment_status::DeploymentPhase;
use crate::util::errors::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub phase_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )?;
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )?;
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations")?;
        let phase_transitions = IntCounterVec::new(
            opts!(
                "deployment_phase_transitions_total",
                "ArangoDeployment phase changes by target phase",
            ),
            &["phase"],
        )?;
        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            phase_transitions,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.phase_transitions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, deployment: &ArangoDeployment, e: &Error) {
        let labels = [deployment.name_any(), e.metric_label()];
        debug!(?labels, "Counting reconcile failure");
        self.failures
            .with_label_values(&[labels[0].as_str(), labels[1].as_str()])
            .inc()
    }

    pub fn phase_transition(&self, phase: DeploymentPhase) {
        self.phase_transitions
            .with_label_values(&[phase.to_string().as_str()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_deployment;
    use crate::util::errors::StdError;

    #[test]
    fn counts_failures_and_transitions() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap().register(&registry).unwrap();

        metrics.reconcile_failure(
            &new_deployment("db", "ns"),
            &Error::StdError(StdError::HttpError("refused".to_string())),
        );
        metrics.phase_transition(DeploymentPhase::Running);
        metrics.phase_transition(DeploymentPhase::Running);
        drop(metrics.count_and_measure("deployment"));

        assert_eq!(metrics.failures.with_label_values(&["db", "httperror"]).get(), 1);
        assert_eq!(metrics.phase_transitions.with_label_values(&["Running"]).get(), 2);
        assert_eq!(metrics.reconciliations.get(), 1);
        let names: Vec<String> = registry.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"deployment_phase_transitions_total".to_string()));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = Registry::new();
        Metrics::new().unwrap().register(&registry).unwrap();
        assert!(Metrics::new().unwrap().register(&registry).is_err());
    }
}
