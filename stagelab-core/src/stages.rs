//! Stage generator — turns a parameter schema into an ordered stage plan.
//!
//! - Each correlated group becomes one stage whose grid is the cartesian
//!   product of its members' grids (last member varies fastest).
//! - Every ungrouped parameter becomes its own single-parameter stage.
//! - Stage order follows the caller order, else the schema order, else
//!   declaration order. Later stages receive earlier winners as fixed inputs.
//! - A restricted mode (e.g. risk-only) rejects out-of-set parameters before
//!   any work starts.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::ParamSet;
use crate::fingerprint::PlanFingerprint;
use crate::schema::{ParameterSchema, SchemaError, MAX_STAGE_CANDIDATES};

/// Parameter names eligible in risk-only mode.
pub const RISK_PARAMETERS: [&str; 2] = ["stop_loss", "stop_gain"];

/// Caller options for plan construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOptions {
    /// Caller-specified stage order (overrides the schema's declared order).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
    /// If set, only these parameter names may appear in the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<BTreeSet<String>>,
}

impl StageOptions {
    /// Options for runs whose indicator parameters were fixed upstream.
    pub fn risk_only() -> Self {
        Self {
            order: None,
            allowed: Some(RISK_PARAMETERS.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn with_order<S: Into<String>>(mut self, order: impl IntoIterator<Item = S>) -> Self {
        self.order = Some(order.into_iter().map(Into::into).collect());
        self
    }
}

/// Whether a stage tests one parameter or a correlated group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Single,
    Group,
}

/// One unit of sequential search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub index: usize,
    pub name: String,
    pub kind: StageKind,
    /// Parameters under test, in grid order.
    pub parameters: Vec<String>,
    /// Joint grid of the parameters under test.
    pub grid: Vec<ParamSet>,
}

impl Stage {
    /// Number of candidates tested in this stage.
    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    pub fn tests(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p == name)
    }

    /// Candidate `test_index`: `base` (defaults plus locks) overlaid with the
    /// under-test values of that grid point.
    pub fn candidate(&self, test_index: usize, base: &ParamSet) -> Option<ParamSet> {
        let point = self.grid.get(test_index)?;
        let mut params = base.clone();
        params.extend(point.iter().map(|(k, v)| (k.clone(), *v)));
        Some(params)
    }

    /// All candidates of the stage, in test order.
    pub fn candidates(&self, base: &ParamSet) -> Vec<ParamSet> {
        (0..self.len())
            .filter_map(|i| self.candidate(i, base))
            .collect()
    }

    /// Extract this stage's under-test values from a full assignment.
    pub fn under_test(&self, params: &ParamSet) -> ParamSet {
        self.parameters
            .iter()
            .filter_map(|p| params.get(p).map(|v| (p.clone(), *v)))
            .collect()
    }
}

/// Ordered stages plus the schema defaults used for not-yet-searched parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    stages: Vec<Stage>,
    defaults: ParamSet,
}

impl StagePlan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn get(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn defaults(&self) -> &ParamSet {
        &self.defaults
    }

    /// Candidates across all stages.
    pub fn total_tests(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    /// Candidates in stages strictly before `stage_index`.
    pub fn tests_before(&self, stage_index: usize) -> usize {
        self.stages.iter().take(stage_index).map(Stage::len).sum()
    }

    /// Names searched by stages strictly before `stage_index`: the only keys
    /// a lock may hold when that stage runs.
    pub fn parameters_before(&self, stage_index: usize) -> BTreeSet<String> {
        self.stages
            .iter()
            .take(stage_index)
            .flat_map(|s| s.parameters.iter().cloned())
            .collect()
    }

    /// Content hash of the plan. Any schema change that alters a stage, its
    /// grid or the defaults changes the fingerprint.
    pub fn fingerprint(&self) -> PlanFingerprint {
        PlanFingerprint::of(self)
    }
}

/// Build the ordered stage plan for `schema`.
pub fn build_stages(
    schema: &ParameterSchema,
    options: &StageOptions,
) -> Result<StagePlan, SchemaError> {
    schema.validate()?;

    if let Some(allowed) = &options.allowed {
        let offending: Vec<String> = schema
            .names()
            .filter(|name| !allowed.contains(*name))
            .map(str::to_string)
            .collect();
        if !offending.is_empty() {
            return Err(SchemaError::DisallowedParameters {
                offending,
                allowed: allowed.iter().cloned().collect(),
            });
        }
    }

    let mut sequence: Vec<&str> = Vec::new();
    if let Some(order) = options.order.as_ref().or(schema.order.as_ref()) {
        for name in order {
            if schema.get(name).is_none() {
                return Err(SchemaError::UnknownInOrder { name: name.clone() });
            }
            sequence.push(name.as_str());
        }
    }
    sequence.extend(schema.names());

    let group_of: HashMap<&str, usize> = schema
        .groups
        .iter()
        .enumerate()
        .flat_map(|(gi, g)| g.parameters.iter().map(move |p| (p.as_str(), gi)))
        .collect();

    let mut stages = Vec::new();
    let mut emitted_groups = HashSet::new();
    let mut emitted = HashSet::new();

    for name in sequence {
        if let Some(&gi) = group_of.get(name) {
            if !emitted_groups.insert(gi) {
                continue;
            }
            let group = &schema.groups[gi];
            let stage = group_stage(schema, stages.len(), &group.display_name(), &group.parameters)?;
            stages.push(stage);
            emitted.extend(group.parameters.iter().map(String::as_str));
        } else if emitted.insert(name) {
            let stage = group_stage(schema, stages.len(), name, &[name.to_string()])?;
            stages.push(stage);
        }
    }

    Ok(StagePlan {
        stages,
        defaults: schema.defaults(),
    })
}

fn group_stage(
    schema: &ParameterSchema,
    index: usize,
    name: &str,
    members: &[String],
) -> Result<Stage, SchemaError> {
    let ranges: Vec<_> = members.iter().filter_map(|m| schema.get(m)).collect();

    let size = ranges
        .iter()
        .fold(1u128, |acc, range| acc.saturating_mul(range.grid_size()));
    if size > MAX_STAGE_CANDIDATES as u128 {
        return Err(SchemaError::GridTooLarge {
            stage: name.to_string(),
            size,
        });
    }

    let axes: Vec<Vec<f64>> = ranges.iter().map(|range| range.values()).collect();

    let grid = axes
        .into_iter()
        .multi_cartesian_product()
        .map(|point| members.iter().cloned().zip(point).collect::<ParamSet>())
        .collect();

    Ok(Stage {
        index,
        name: name.to_string(),
        kind: if members.len() > 1 {
            StageKind::Group
        } else {
            StageKind::Single
        },
        parameters: members.to_vec(),
        grid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CorrelatedGroup, ParameterRange};

    fn schema() -> ParameterSchema {
        ParameterSchema::new(vec![
            ParameterRange::new("ema_short", 5.0, 15.0, 5.0),
            ParameterRange::new("ema_long", 20.0, 50.0, 10.0),
            ParameterRange::new("rsi", 10.0, 20.0, 5.0),
            ParameterRange::new("stop_loss", 0.01, 0.03, 0.01),
        ])
    }

    #[test]
    fn ungrouped_parameters_become_single_stages_in_declaration_order() {
        let plan = build_stages(&schema(), &StageOptions::default()).unwrap();
        let names: Vec<_> = plan.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["ema_short", "ema_long", "rsi", "stop_loss"]);
        assert!(plan.stages().iter().all(|s| s.kind == StageKind::Single));
        assert_eq!(plan.total_tests(), 3 + 4 + 3 + 3);
    }

    #[test]
    fn correlated_group_is_one_joint_stage() {
        let schema = schema().with_group(CorrelatedGroup::new(["ema_short", "ema_long"]));
        let plan = build_stages(&schema, &StageOptions::default()).unwrap();
        assert_eq!(plan.len(), 3);
        let first = &plan.stages()[0];
        assert_eq!(first.kind, StageKind::Group);
        assert_eq!(first.name, "ema_short+ema_long");
        assert_eq!(first.len(), 12);
        // Last member varies fastest.
        assert_eq!(first.grid[0]["ema_long"], 20.0);
        assert_eq!(first.grid[1]["ema_long"], 30.0);
        assert_eq!(first.grid[4]["ema_short"], 10.0);
    }

    #[test]
    fn caller_order_overrides_declaration() {
        let schema = schema().with_group(CorrelatedGroup::new(["ema_short", "ema_long"]));
        let options = StageOptions::default().with_order(["stop_loss", "ema_long"]);
        let plan = build_stages(&schema, &options).unwrap();
        let names: Vec<_> = plan.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["stop_loss", "ema_short+ema_long", "rsi"]);
        assert_eq!(plan.stages()[1].index, 1);
    }

    #[test]
    fn schema_order_used_when_caller_silent() {
        let mut schema = schema();
        schema.order = Some(vec!["rsi".into()]);
        let plan = build_stages(&schema, &StageOptions::default()).unwrap();
        assert_eq!(plan.stages()[0].name, "rsi");

        let caller = StageOptions::default().with_order(["stop_loss"]);
        let plan = build_stages(&schema, &caller).unwrap();
        assert_eq!(plan.stages()[0].name, "stop_loss");
    }

    #[test]
    fn unknown_name_in_order_rejected() {
        let options = StageOptions::default().with_order(["nope"]);
        assert_eq!(
            build_stages(&schema(), &options),
            Err(SchemaError::UnknownInOrder { name: "nope".into() })
        );
    }

    #[test]
    fn risk_only_rejects_indicator_parameters() {
        let schema = ParameterSchema::new(vec![
            ParameterRange::new("ema_short", 5.0, 15.0, 5.0),
            ParameterRange::new("stop_loss", 0.01, 0.03, 0.01),
        ]);
        let err = build_stages(&schema, &StageOptions::risk_only()).unwrap_err();
        assert_eq!(
            err,
            SchemaError::DisallowedParameters {
                offending: vec!["ema_short".into()],
                allowed: vec!["stop_gain".into(), "stop_loss".into()],
            }
        );
        let message = err.to_string();
        assert!(message.contains("ema_short"));
        assert!(message.contains("stop_gain") && message.contains("stop_loss"));
    }

    #[test]
    fn risk_only_accepts_risk_parameters() {
        let schema = ParameterSchema::new(vec![
            ParameterRange::new("stop_loss", 0.01, 0.03, 0.01),
            ParameterRange::new("stop_gain", 0.02, 0.06, 0.02),
        ]);
        let plan = build_stages(&schema, &StageOptions::risk_only()).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn candidates_overlay_base() {
        let plan = build_stages(&schema(), &StageOptions::default()).unwrap();
        let stage = &plan.stages()[1];
        let mut base = plan.defaults().clone();
        base.insert("ema_short".into(), 15.0);
        let candidates = stage.candidates(&base);
        assert_eq!(candidates.len(), 4);
        for (i, c) in candidates.iter().enumerate() {
            assert_eq!(c["ema_short"], 15.0);
            assert_eq!(c["ema_long"], 20.0 + 10.0 * i as f64);
            assert_eq!(c.len(), 4);
        }
        assert_eq!(stage.under_test(&candidates[2]).len(), 1);
    }

    #[test]
    fn parameters_before_excludes_current_stage() {
        let schema = schema().with_group(CorrelatedGroup::new(["ema_short", "ema_long"]));
        let plan = build_stages(&schema, &StageOptions::default()).unwrap();
        assert!(plan.parameters_before(0).is_empty());
        let before_two = plan.parameters_before(2);
        assert!(before_two.contains("ema_short") && before_two.contains("rsi"));
        assert!(!before_two.contains("stop_loss"));
        assert_eq!(plan.tests_before(2), 12 + 3);
    }

    #[test]
    fn oversized_grid_rejected() {
        let schema = ParameterSchema::new(vec![
            ParameterRange::new("a", 0.0, 2000.0, 1.0),
            ParameterRange::new("b", 0.0, 2000.0, 1.0),
        ])
        .with_group(CorrelatedGroup::new(["a", "b"]));
        assert!(matches!(
            build_stages(&schema, &StageOptions::default()),
            Err(SchemaError::GridTooLarge { .. })
        ));
    }

    #[test]
    fn wide_single_range_returns_grid_too_large() {
        let overflowing = ParameterSchema::new(vec![ParameterRange::new("a", 0.0, 1e300, 1e-300)]);
        assert!(matches!(
            build_stages(&overflowing, &StageOptions::default()),
            Err(SchemaError::GridTooLarge { ref stage, size }) if stage == "a" && size == u128::MAX
        ));

        let huge = ParameterSchema::new(vec![ParameterRange::new("a", 0.0, 5e9, 1.0)]);
        assert_eq!(
            build_stages(&huge, &StageOptions::default()),
            Err(SchemaError::GridTooLarge {
                stage: "a".into(),
                size: 5_000_000_001,
            })
        );
    }
}
