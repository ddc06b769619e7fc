//! Plan fingerprinting: BLAKE3 of the canonical JSON of a stage plan. A
//! checkpoint is only trusted for resume when its stored fingerprint equals
//! the fresh plan's.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stages::StagePlan;

/// Content hash of a stage plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanFingerprint(pub String);

impl PlanFingerprint {
    /// Canonical serialization: `ParamSet` is a `BTreeMap`, so key order is
    /// stable and the JSON, and therefore the hash, is deterministic.
    pub fn of(plan: &StagePlan) -> Self {
        let canonical = serde_json::to_vec(plan).unwrap_or_default();
        Self(blake3::hash(&canonical).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CorrelatedGroup, ParameterRange, ParameterSchema};
    use crate::stages::{build_stages, StageOptions};

    fn schema() -> ParameterSchema {
        ParameterSchema::new(vec![
            ParameterRange::new("ema_short", 5.0, 15.0, 5.0),
            ParameterRange::new("ema_long", 20.0, 40.0, 10.0),
            ParameterRange::new("stop_loss", 0.01, 0.03, 0.01),
        ])
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = build_stages(&schema(), &StageOptions::default()).unwrap();
        let b = build_stages(&schema(), &StageOptions::default()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_range() {
        let a = build_stages(&schema(), &StageOptions::default()).unwrap();
        let mut changed = schema();
        changed.parameters[2].max = 0.05;
        let b = build_stages(&changed, &StageOptions::default()).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_grouping_and_order() {
        let base = build_stages(&schema(), &StageOptions::default()).unwrap();
        let grouped = build_stages(
            &schema().with_group(CorrelatedGroup::new(["ema_short", "ema_long"])),
            &StageOptions::default(),
        )
        .unwrap();
        let reordered = build_stages(
            &schema(),
            &StageOptions::default().with_order(["stop_loss"]),
        )
        .unwrap();
        assert_ne!(base.fingerprint(), grouped.fingerprint());
        assert_ne!(base.fingerprint(), reordered.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_defaults() {
        let a = build_stages(&schema(), &StageOptions::default()).unwrap();
        let mut changed = schema();
        changed.parameters[0].default = Some(10.0);
        let b = build_stages(&changed, &StageOptions::default()).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
