//! Coordination runtime configuration.

use std::time::Duration;

/// Knobs for the cluster coordinator and per-job barrier coordinators.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time after an offer before an unacked peer is forcibly evicted.
    ///
    /// `Duration::ZERO` means "evict immediately after offer" and exists
    /// for deterministic tests.
    pub revoke_delay: Duration,

    /// Upper bound on the park between barrier-loop ticks.
    pub coordinator_max_sleep: Duration,

    /// Periodic barrier cadence.
    pub coordinator_barrier_period: Duration,

    /// Heartbeat cadence on barrier publications.
    pub heartbeat: Duration,

    /// Namespace under which checkpoint coordinates are stored.
    pub tenancy_id: String,

    /// Capacity of each coordinator input channel.
    pub channel_capacity: usize,

    /// Capacity of each broadcast fan-out; lagging subscribers drop events.
    pub broadcast_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            revoke_delay: Duration::from_secs(2),
            coordinator_max_sleep: Duration::from_millis(50),
            coordinator_barrier_period: Duration::from_millis(500),
            heartbeat: Duration::from_millis(250),
            tenancy_id: "default".to_owned(),
            channel_capacity: 1024,
            broadcast_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.revoke_delay, Duration::from_secs(2));
        assert!(config.coordinator_max_sleep < config.coordinator_barrier_period);
        assert_eq!(config.tenancy_id, "default");
    }
}
