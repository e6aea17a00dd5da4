//! Controller-side Prometheus metrics.

use gpuops_core::Action;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct ControllerMetrics {
    registry: Registry,

    reports_total: IntCounter,
    reports_duplicate_total: IntCounter,
    usage_records_total: IntCounter,
    actions_total: IntCounterVec,
    outbox_pending: IntGauge,
    last_report_unix: IntGauge,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        const REGISTER: &str = "metric names are static and unique";
        let registry = Registry::new();

        let reports_total =
            IntCounter::new("gpuops_controller_reports_total", "Admitted metric reports")
                .expect(REGISTER);
        let reports_duplicate_total = IntCounter::new(
            "gpuops_controller_reports_duplicate_total",
            "Reports rejected by the idempotency gate",
        )
        .expect(REGISTER);
        let usage_records_total = IntCounter::new(
            "gpuops_controller_usage_records_total",
            "Usage records inserted",
        )
        .expect(REGISTER);
        let actions_total = IntCounterVec::new(
            Opts::new("gpuops_controller_actions_total", "Actions returned to agents"),
            &["kind"],
        )
        .expect(REGISTER);
        let outbox_pending = IntGauge::new(
            "gpuops_controller_outbox_pending",
            "Operator actions awaiting node contact",
        )
        .expect(REGISTER);
        let last_report_unix = IntGauge::new(
            "gpuops_controller_last_report_unix",
            "Unix time of the last admitted report",
        )
        .expect(REGISTER);

        registry.register(Box::new(reports_total.clone())).expect(REGISTER);
        registry.register(Box::new(reports_duplicate_total.clone())).expect(REGISTER);
        registry.register(Box::new(usage_records_total.clone())).expect(REGISTER);
        registry.register(Box::new(actions_total.clone())).expect(REGISTER);
        registry.register(Box::new(outbox_pending.clone())).expect(REGISTER);
        registry.register(Box::new(last_report_unix.clone())).expect(REGISTER);

        Self {
            registry,
            reports_total,
            reports_duplicate_total,
            usage_records_total,
            actions_total,
            outbox_pending,
            last_report_unix,
        }
    }

    /// Record one processed report and the actions it produced.
    pub fn observe_report(
        &self,
        received_at_unix: i64,
        duplicate: bool,
        usage_records: i64,
        actions: &[Action],
    ) {
        if duplicate {
            self.reports_duplicate_total.inc();
            return;
        }
        self.reports_total.inc();
        self.usage_records_total.inc_by(usage_records.max(0) as u64);
        self.last_report_unix.set(received_at_unix);
        for action in actions {
            self.actions_total.with_label_values(&[action.kind()]).inc();
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self, outbox_pending: usize) -> String {
        self.outbox_pending.set(outbox_pending as i64);
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_reports_count_separately() {
        let metrics = ControllerMetrics::new();
        metrics.observe_report(100, false, 3, &[]);
        metrics.observe_report(100, true, 0, &[]);

        let text = metrics.render(2);
        assert!(text.contains("gpuops_controller_reports_total 1"));
        assert!(text.contains("gpuops_controller_reports_duplicate_total 1"));
        assert!(text.contains("gpuops_controller_usage_records_total 3"));
        assert!(text.contains("gpuops_controller_outbox_pending 2"));
    }

    #[test]
    fn actions_are_labelled_by_kind() {
        let metrics = ControllerMetrics::new();
        let actions = vec![
            Action::Notify { username: "a".into(), message: "m".into() },
            Action::KillProcess { username: "a".into(), pids: vec![1], reason: "r".into() },
        ];
        metrics.observe_report(100, false, 0, &actions);
        let text = metrics.render(0);
        assert!(text.contains(r#"kind="notify""#));
        assert!(text.contains(r#"kind="kill_process""#));
    }
}
