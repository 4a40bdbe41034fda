/// Cluster health gate and threshold evaluation
pub mod cluster_gate;
pub mod thresholds;

pub use cluster_gate::ClusterGate;
pub use thresholds::{ThresholdEvaluator, ThresholdPolicy, TtlPolicy, Verdict};
