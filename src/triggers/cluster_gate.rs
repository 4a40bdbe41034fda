//! Cluster-wide health gate evaluated before each sampling pass

use crate::collectors::{ClusterHealthSource, NodeHealth};
use crate::config::{ClusterConfig, ThresholdConfig};
use crate::error::ObserverError;
use crate::events::HealthState;
use log::{debug, info, warn};

/// Decides whether an observation cycle should proceed given cluster node health
///
/// The gate computes the share of nodes in `Error` as a whole percentage. The error
/// threshold is checked first; reaching a threshold counts. A threshold of zero is
/// disabled. Clusters with `min_nodes` nodes or fewer are never gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterGate {
    pub warn_pct: u32,
    pub error_pct: u32,
    pub min_nodes: usize,
}

impl ClusterGate {
    pub fn new(warn_pct: u32, error_pct: u32, min_nodes: usize) -> Self {
        Self {
            warn_pct,
            error_pct,
            min_nodes,
        }
    }

    pub fn from_config(thresholds: &ThresholdConfig, cluster: &ClusterConfig) -> Self {
        Self::new(
            thresholds.unhealthy_nodes_warn_pct,
            thresholds.unhealthy_nodes_error_pct,
            cluster.min_nodes_for_gate,
        )
    }

    /// Percentage of nodes in `Error`, truncated to a whole number
    pub fn error_percentage(nodes: &[NodeHealth]) -> u32 {
        if nodes.is_empty() {
            return 0;
        }
        let errors = nodes
            .iter()
            .filter(|n| n.health == HealthState::Error)
            .count();
        (errors * 100 / nodes.len()) as u32
    }

    /// Classify a node health snapshot
    pub fn classify(&self, nodes: &[NodeHealth]) -> HealthState {
        if nodes.len() <= self.min_nodes {
            return HealthState::Ok;
        }

        let pct = Self::error_percentage(nodes);
        if self.error_pct > 0 && pct >= self.error_pct {
            HealthState::Error
        } else if self.warn_pct > 0 && pct >= self.warn_pct {
            HealthState::Warning
        } else {
            HealthState::Ok
        }
    }

    /// Query the cluster-health source and classify the result
    ///
    /// Timeouts and transient faults yield `Unknown`. Any other query failure is
    /// fatal for the cycle.
    pub async fn check(&self, source: &dyn ClusterHealthSource) -> Result<HealthState, ObserverError> {
        let nodes = match source.node_health().await {
            Ok(nodes) => nodes,
            Err(e) => {
                let err = ObserverError::from(e);
                if err.is_transient() {
                    info!("Handled cluster health query failure: {}", err);
                    return Ok(HealthState::Unknown);
                }
                warn!("Unhandled failure querying cluster health: {}", err);
                return Err(err);
            }
        };

        if nodes.len() <= self.min_nodes {
            debug!(
                "Cluster gate skipped: {} nodes (gate applies above {})",
                nodes.len(),
                self.min_nodes
            );
            return Ok(HealthState::Ok);
        }

        let state = self.classify(&nodes);
        debug!(
            "Cluster gate: {}% of {} nodes in error -> {}",
            Self::error_percentage(&nodes),
            nodes.len(),
            state
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::cluster_health::StaticClusterHealth;
    use crate::error::ClusterQueryError;

    fn nodes(total: usize, errors: usize) -> Vec<NodeHealth> {
        (0..total)
            .map(|i| NodeHealth {
                name: format!("node-{}", i),
                health: if i < errors {
                    HealthState::Error
                } else {
                    HealthState::Ok
                },
            })
            .collect()
    }

    #[test]
    fn test_twenty_percent_is_warning_not_error() {
        let gate = ClusterGate::new(10, 25, 3);
        assert_eq!(ClusterGate::error_percentage(&nodes(10, 2)), 20);
        assert_eq!(gate.classify(&nodes(10, 2)), HealthState::Warning);
    }

    #[test]
    fn test_boundary_equal_to_error_threshold_is_error() {
        let gate = ClusterGate::new(25, 25, 3);
        assert_eq!(gate.classify(&nodes(4, 1)), HealthState::Error);
    }

    #[test]
    fn test_below_warning_is_ok() {
        let gate = ClusterGate::new(30, 50, 3);
        assert_eq!(gate.classify(&nodes(10, 2)), HealthState::Ok);
    }

    #[test]
    fn test_small_cluster_never_gated() {
        let gate = ClusterGate::new(10, 25, 3);
        assert_eq!(gate.classify(&nodes(3, 3)), HealthState::Ok);
    }

    #[test]
    fn test_zero_thresholds_disabled() {
        let gate = ClusterGate::new(0, 0, 3);
        assert_eq!(gate.classify(&nodes(10, 10)), HealthState::Ok);
    }

    #[test]
    fn test_warning_and_unknown_nodes_do_not_count() {
        let mut snapshot = nodes(10, 0);
        snapshot[0].health = HealthState::Warning;
        snapshot[1].health = HealthState::Unknown;
        assert_eq!(ClusterGate::error_percentage(&snapshot), 0);
    }

    #[tokio::test]
    async fn test_check_timeout_is_unknown() {
        let gate = ClusterGate::new(10, 25, 3);
        let source = StaticClusterHealth::failing(ClusterQueryError::Timeout);
        assert_eq!(gate.check(&source).await.unwrap(), HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_check_transient_fault_is_unknown() {
        let gate = ClusterGate::new(10, 25, 3);
        let source =
            StaticClusterHealth::failing(ClusterQueryError::Transient("not primary".to_string()));
        assert_eq!(gate.check(&source).await.unwrap(), HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_check_unexpected_fault_is_fatal() {
        let gate = ClusterGate::new(10, 25, 3);
        let source = StaticClusterHealth::failing(ClusterQueryError::Other("bad payload".to_string()));
        assert!(matches!(
            gate.check(&source).await,
            Err(ObserverError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_check_classifies_snapshot() {
        let gate = ClusterGate::new(10, 25, 3);
        let source = StaticClusterHealth::new(nodes(10, 3));
        assert_eq!(gate.check(&source).await.unwrap(), HealthState::Error);
    }
}
