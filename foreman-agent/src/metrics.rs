//! Collection of the telemetry agents report to the master.

use chrono::Utc;
use sysinfo::Disks;
use sysinfo::System;

use crate::proto::MetricsUpdate;
use crate::proto::SystemMetrics;

/// Samples host utilization for periodic reporting.
///
/// CPU usage is measured between consecutive collections, so the first
/// sample after construction reads low; callers report on an interval,
/// which smooths this out.
pub struct MetricsCollector {
    /// The sampled system state.
    system: System,
    /// The sampled disk list.
    disks: Disks,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Creates a new collector.
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Samples the host and builds a metrics update for the agent.
    pub fn collect(&mut self, agent_id: &str) -> MetricsUpdate {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_usage = f64::from(self.system.global_cpu_usage());

        let memory_usage = match self.system.total_memory() {
            0 => 0.0,
            total => self.system.used_memory() as f64 / total as f64 * 100.0,
        };

        // The most utilized disk is the one an operator cares about.
        let disk_usage = self
            .disks
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let total = disk.total_space() as f64;
                (total - disk.available_space() as f64) / total * 100.0
            })
            .fold(0.0, f64::max);

        MetricsUpdate {
            agent_id: agent_id.to_owned(),
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            system: Some(SystemMetrics {
                cpu_usage,
                memory_usage,
                disk_usage,
            }),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_metrics_are_percentages() {
        let mut collector = MetricsCollector::new();
        let update = collector.collect("agent-1");

        assert_eq!(update.agent_id, "agent-1");
        assert!(update.timestamp > 0);

        let system = update.system.expect("should carry system metrics");
        assert!((0.0..=100.0).contains(&system.memory_usage));
        assert!((0.0..=100.0).contains(&system.disk_usage));
        assert!(system.cpu_usage >= 0.0);
    }
}
