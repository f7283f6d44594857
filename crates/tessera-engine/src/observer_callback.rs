//! Observer that reports run progress through the log.
//!
//! Every notified period is logged with its population and recorded
//! failures; state transitions are logged together with a JSON run status
//! snapshot, the same document a dashboard would poll.

use tessera_core::Model;
use tessera_core::PeriodReport;
use tessera_core::operator::ModelObserver;
use tessera_types::RunState;
use tracing::{debug, info, warn};

/// Logs period reports and state changes.
#[derive(Debug, Default)]
pub struct LogObserver {
    periods_seen: u64,
    last_status: Option<String>,
}

impl LogObserver {
    /// Create an observer with no history.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelObserver for LogObserver {
    fn on_state_change(&mut self, from: RunState, to: RunState, period: u64) {
        info!(%from, %to, period, periods_seen = self.periods_seen, "run state changed");
        if let Some(status) = &self.last_status {
            debug!(status = %status, "last reported status");
        }
    }

    fn on_period(&mut self, report: &PeriodReport, model: &Model) {
        self.periods_seen = self.periods_seen.saturating_add(1);
        info!(
            period = report.period,
            population = report.population,
            shocks = ?report.shocks_fired,
            milestones = ?report.milestones,
            "period complete"
        );
        for failure in &report.failures {
            warn!(period = failure.period, source = %failure.source, message = %failure.message, "callback failed");
        }
        match serde_json::to_string(&model.status()) {
            Ok(status) => self.last_status = Some(status),
            Err(e) => warn!(error = %e, "failed to serialize run status"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tessera_core::agents::PrimitiveSpec;

    use super::*;

    #[test]
    fn periods_are_counted_and_status_kept() {
        let mut model = Model::with_seed("observer", 5);
        model
            .add_primitive("agent", PrimitiveSpec::with_count(2))
            .unwrap();
        let mut observer = LogObserver::new();
        model.setup().unwrap();
        let report = PeriodReport {
            period: 0,
            shocks_fired: Vec::new(),
            milestones: Vec::new(),
            failures: Vec::new(),
            population: 2,
        };
        observer.on_period(&report, &model);
        assert_eq!(observer.periods_seen, 1);
        let status = observer.last_status.unwrap();
        assert!(status.contains("\"agent\":2"));
    }
}
