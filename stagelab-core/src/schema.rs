//! Parameter schema — the declarative search space of one strategy template.
//!
//! A schema lists tunable scalars (`ParameterRange`) in declaration order and
//! the groups of parameters that interact and must be searched jointly
//! (`CorrelatedGroup`). The stage generator turns it into a stage plan.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::ParamSet;

/// Tolerance when counting grid steps, so `max` is kept when it lies on the grid
/// despite binary floating-point representation (e.g. 0.1..=0.3 step 0.1).
const GRID_EPSILON: f64 = 1e-9;

/// A last grid point above `max` by more than this share of the range
/// magnitude is dropped.
const OVERSHOOT_TOLERANCE: f64 = 1e-12;

/// Grid values are snapped to this many decimal places.
const SNAP_SCALE: f64 = 1e12;

/// Upper bound on the candidates of one stage (guards cartesian blow-ups).
pub const MAX_STAGE_CANDIDATES: usize = 1_000_000;

/// Schema and configuration errors. All are raised before any candidate is tested.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("schema defines no parameters")]
    EmptySchema,

    #[error("parameter '{name}': {reason}")]
    InvalidRange { name: String, reason: String },

    #[error("parameter '{0}' is declared more than once")]
    DuplicateParameter(String),

    #[error("correlated group {group} is empty")]
    EmptyGroup { group: usize },

    #[error("correlated group {group} references unknown parameter '{name}'")]
    UnknownGroupMember { group: usize, name: String },

    #[error("parameter '{name}' appears in more than one correlated group")]
    OverlappingGroups { name: String },

    #[error("stage order references unknown parameter '{name}'")]
    UnknownInOrder { name: String },

    #[error("parameters {offending:?} are not allowed in this mode; allowed parameters: {allowed:?}")]
    DisallowedParameters {
        offending: Vec<String>,
        allowed: Vec<String>,
    },

    #[error("stage '{stage}' would test {size} candidates (limit {MAX_STAGE_CANDIDATES})")]
    GridTooLarge { stage: String, size: u128 },
}

/// Search domain of one tunable scalar: `{min, min+step, ..., <= max}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Value used before the parameter's own stage has run. Defaults to `min`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
}

impl ParameterRange {
    pub fn new(name: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            step,
            default: None,
        }
    }

    pub fn with_default(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }

    pub fn default_value(&self) -> f64 {
        self.default.unwrap_or(self.min)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidRange {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.step.is_finite()) {
            return Err(invalid("min, max and step must be finite"));
        }
        if self.step <= 0.0 {
            return Err(invalid("step must be positive"));
        }
        if self.min > self.max {
            return Err(invalid("min must not exceed max"));
        }
        if let Some(default) = self.default {
            if !default.is_finite() || default < self.min || default > self.max {
                return Err(invalid("default must lie within [min, max]"));
            }
        }
        let size = self.grid_size();
        if size > MAX_STAGE_CANDIDATES as u128 {
            return Err(SchemaError::GridTooLarge {
                stage: self.name.clone(),
                size,
            });
        }
        Ok(())
    }

    /// Index of the last grid point, as a float so wide ranges cannot overflow.
    fn last_step(&self) -> f64 {
        let steps = ((self.max - self.min) / self.step + GRID_EPSILON).floor();
        let tolerance = OVERSHOOT_TOLERANCE * self.max.abs().max(self.min.abs()).max(self.step);
        if steps >= 1.0 && self.min + steps * self.step > self.max + tolerance {
            steps - 1.0
        } else {
            steps
        }
    }

    /// Number of grid points, saturating for ranges no stage could hold.
    pub fn grid_size(&self) -> u128 {
        (self.last_step() as u128).saturating_add(1)
    }

    /// Number of grid points: `floor((max - min) / step) + 1`.
    pub fn count(&self) -> usize {
        usize::try_from(self.grid_size()).unwrap_or(usize::MAX)
    }

    /// Grid values, generated from an integer step count (no cumulative drift).
    ///
    /// Only call on a validated range; `validate` bounds the grid size.
    pub fn values(&self) -> Vec<f64> {
        (0..self.count())
            .map(|i| snap(self.min + i as f64 * self.step))
            .collect()
    }
}

fn snap(value: f64) -> f64 {
    (value * SNAP_SCALE).round() / SNAP_SCALE
}

/// Parameters that interact and are searched as one joint grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedGroup {
    /// Optional display name; defaults to the members joined with `+`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub parameters: Vec<String>,
}

impl CorrelatedGroup {
    pub fn new<S: Into<String>>(parameters: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: None,
            parameters: parameters.into_iter().map(Into::into).collect(),
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.parameters.join("+"))
    }
}

/// Full search space for one strategy template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Ranges in declaration order.
    pub parameters: Vec<ParameterRange>,
    #[serde(default)]
    pub groups: Vec<CorrelatedGroup>,
    /// Schema-declared stage order; a caller-specified order takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
}

impl ParameterSchema {
    pub fn new(parameters: Vec<ParameterRange>) -> Self {
        Self {
            parameters,
            groups: Vec::new(),
            order: None,
        }
    }

    pub fn with_group(mut self, group: CorrelatedGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterRange> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    /// Default assignment of every parameter.
    pub fn defaults(&self) -> ParamSet {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.default_value()))
            .collect()
    }

    /// Structural validation: ranges, duplicate names, group membership.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.parameters.is_empty() {
            return Err(SchemaError::EmptySchema);
        }

        let mut seen = HashSet::new();
        for range in &self.parameters {
            range.validate()?;
            if !seen.insert(range.name.as_str()) {
                return Err(SchemaError::DuplicateParameter(range.name.clone()));
            }
        }

        let mut grouped = HashSet::new();
        for (group_index, group) in self.groups.iter().enumerate() {
            if group.parameters.is_empty() {
                return Err(SchemaError::EmptyGroup { group: group_index });
            }
            for name in &group.parameters {
                if !seen.contains(name.as_str()) {
                    return Err(SchemaError::UnknownGroupMember {
                        group: group_index,
                        name: name.clone(),
                    });
                }
                if !grouped.insert(name.as_str()) {
                    return Err(SchemaError::OverlappingGroups { name: name.clone() });
                }
            }
            let size = self.group_size(group);
            if size > MAX_STAGE_CANDIDATES as u128 {
                return Err(SchemaError::GridTooLarge {
                    stage: group.display_name(),
                    size,
                });
            }
        }

        Ok(())
    }

    /// Joint grid size of a group, saturating.
    pub fn group_size(&self, group: &CorrelatedGroup) -> u128 {
        group
            .parameters
            .iter()
            .filter_map(|name| self.get(name))
            .fold(1u128, |acc, range| acc.saturating_mul(range.grid_size()))
    }
}
