//! Job configuration loaded from TOML.
//!
//! A job file names the strategy, the parameter schema, the selection rule and
//! where candles come from. Everything a run needs to be reproduced lives here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use stagelab_core::{
    Direction, JobId, ParamSet, ParameterSchema, SchemaError, SimulationConfig, StageOptions,
};

use crate::fitness::{FitnessMetric, SelectionRule};

/// Configuration errors: I/O, parse or validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
}

/// Optimizer settings. `metric` has no default: every job states what it maximizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub metric: FitnessMetric,
    #[serde(default)]
    pub fee: f64,
    #[serde(default)]
    pub direction: Direction,
    /// A stage fails once its candidate failures exceed this share of the stage size.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default)]
    pub min_trades: usize,
    /// Parameter feeding the simulator's stop-loss fraction.
    #[serde(default = "default_stop_loss_param")]
    pub stop_loss_param: String,
    /// Parameter feeding the simulator's take-profit fraction.
    #[serde(default = "default_stop_gain_param")]
    pub stop_gain_param: String,
}

fn default_max_error_rate() -> f64 {
    0.5
}

fn default_stop_loss_param() -> String {
    "stop_loss".into()
}

fn default_stop_gain_param() -> String {
    "stop_gain".into()
}

impl OptimizerConfig {
    pub fn new(metric: FitnessMetric) -> Self {
        Self {
            metric,
            fee: 0.0,
            direction: Direction::Long,
            max_error_rate: default_max_error_rate(),
            min_trades: 0,
            stop_loss_param: default_stop_loss_param(),
            stop_gain_param: default_stop_gain_param(),
        }
    }

    /// BLAKE3 over the settings that decide how candidates score and rank.
    /// `max_error_rate` is left out so it can be raised before resuming a failed job.
    pub fn fingerprint(&self) -> String {
        let scoring = serde_json::json!({
            "metric": self.metric,
            "fee": self.fee,
            "direction": self.direction,
            "min_trades": self.min_trades,
            "stop_loss_param": self.stop_loss_param,
            "stop_gain_param": self.stop_gain_param,
        });
        blake3::hash(scoring.to_string().as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn selection(&self) -> SelectionRule {
        SelectionRule::new(self.metric, self.min_trades)
    }

    /// Simulator settings for one candidate. Missing risk parameters disable that exit.
    pub fn simulation_config(&self, params: &ParamSet) -> SimulationConfig {
        SimulationConfig {
            stop_loss_fraction: params.get(&self.stop_loss_param).copied().unwrap_or(0.0),
            take_profit_fraction: params.get(&self.stop_gain_param).copied().unwrap_or(0.0),
            fee: self.fee,
            direction: self.direction,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fee.is_finite() || !(0.0..1.0).contains(&self.fee) {
            return Err(ConfigError::Invalid(format!(
                "fee must be within [0, 1), got {}",
                self.fee
            )));
        }
        if !self.max_error_rate.is_finite() || !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(ConfigError::Invalid(format!(
                "max_error_rate must be within [0, 1], got {}",
                self.max_error_rate
            )));
        }
        Ok(())
    }
}

/// Where candles come from. `{target}` in a path is replaced by the target symbol.
///
/// Without `fine_csv` the fine series is synthetic; without `coarse_csv` the coarse
/// series is resampled from the fine one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    #[serde(default)]
    pub fine_csv: Option<PathBuf>,
    #[serde(default)]
    pub coarse_csv: Option<PathBuf>,
    #[serde(default = "default_fine_minutes")]
    pub fine_minutes: i64,
    #[serde(default = "default_coarse_minutes")]
    pub coarse_minutes: i64,
    #[serde(default = "default_synthetic_days")]
    pub synthetic_days: usize,
}

fn default_fine_minutes() -> i64 {
    15
}

fn default_coarse_minutes() -> i64 {
    1440
}

fn default_synthetic_days() -> usize {
    250
}

impl Default for DataSpec {
    fn default() -> Self {
        Self {
            fine_csv: None,
            coarse_csv: None,
            fine_minutes: default_fine_minutes(),
            coarse_minutes: default_coarse_minutes(),
            synthetic_days: default_synthetic_days(),
        }
    }
}

impl DataSpec {
    pub fn fine_path(&self, target: &str) -> Option<PathBuf> {
        self.fine_csv.as_deref().map(|p| expand_target(p, target))
    }

    pub fn coarse_path(&self, target: &str) -> Option<PathBuf> {
        self.coarse_csv.as_deref().map(|p| expand_target(p, target))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fine_minutes <= 0 || self.coarse_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "candle intervals must be positive".into(),
            ));
        }
        if self.coarse_minutes % self.fine_minutes != 0 {
            return Err(ConfigError::Invalid(format!(
                "coarse interval {}m is not a multiple of fine interval {}m",
                self.coarse_minutes, self.fine_minutes
            )));
        }
        Ok(())
    }
}

fn expand_target(path: &Path, target: &str) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace("{target}", target))
}

/// One optimization job as described in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    pub strategy: String,
    /// Free-form period label, part of the result-sink identity.
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub risk_only: bool,
    #[serde(default)]
    pub order: Option<Vec<String>>,
    /// Batch targets (symbols). Empty for a single-target job.
    #[serde(default)]
    pub targets: Vec<String>,
    pub optimizer: OptimizerConfig,
    pub schema: ParameterSchema,
    #[serde(default)]
    pub data: DataSpec,
}

impl JobSpec {
    /// Parse and validate a job from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let spec: Self = toml::from_str(content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load a job file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_id.as_str().is_empty() {
            return Err(ConfigError::Invalid("job_id must not be empty".into()));
        }
        self.optimizer.validate()?;
        self.data.validate()?;
        self.schema.validate()?;
        Ok(())
    }

    /// Stage-generation options implied by this job.
    pub fn stage_options(&self) -> StageOptions {
        let options = if self.risk_only {
            StageOptions::risk_only()
        } else {
            StageOptions::default()
        };
        match &self.order {
            Some(order) => options.with_order(order.iter().cloned()),
            None => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_scoring_settings_only() {
        let base = OptimizerConfig::new(FitnessMetric::Sharpe);
        assert_eq!(base.fingerprint(), base.clone().fingerprint());

        let metric = OptimizerConfig::new(FitnessMetric::TotalReturn);
        let fee = OptimizerConfig {
            fee: 0.001,
            ..base.clone()
        };
        let min_trades = OptimizerConfig {
            min_trades: 5,
            ..base.clone()
        };
        for changed in [&metric, &fee, &min_trades] {
            assert_ne!(base.fingerprint(), changed.fingerprint());
        }

        let tolerant = OptimizerConfig {
            max_error_rate: 0.9,
            ..base.clone()
        };
        assert_eq!(base.fingerprint(), tolerant.fingerprint());
    }

    const JOB: &str = r#"
job_id = "ema-btc"
strategy = "ma_cross"
period = "2024"
order = ["stop_loss"]

[optimizer]
metric = "sharpe"
fee = 0.001

[[schema.parameters]]
name = "ema_short"
min = 5
max = 20
step = 5
default = 10

[[schema.parameters]]
name = "ema_long"
min = 30
max = 60
step = 10

[[schema.parameters]]
name = "stop_loss"
min = 0.01
max = 0.05
step = 0.01

[[schema.groups]]
parameters = ["ema_short", "ema_long"]
"#;

    #[test]
    fn parses_full_job() {
        let spec = JobSpec::from_toml_str(JOB).unwrap();
        assert_eq!(spec.job_id.as_str(), "ema-btc");
        assert_eq!(spec.optimizer.metric, FitnessMetric::Sharpe);
        assert_eq!(spec.optimizer.max_error_rate, 0.5);
        assert_eq!(spec.optimizer.stop_loss_param, "stop_loss");
        assert_eq!(spec.schema.parameters.len(), 3);
        assert_eq!(spec.schema.groups.len(), 1);
        assert_eq!(spec.data, DataSpec::default());
        assert_eq!(
            spec.stage_options().order,
            Some(vec!["stop_loss".to_string()])
        );
    }

    #[test]
    fn metric_is_required() {
        let without_metric = JOB.replace("metric = \"sharpe\"\n", "");
        assert!(matches!(
            JobSpec::from_toml_str(&without_metric),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn fee_out_of_range_rejected() {
        let bad = JOB.replace("fee = 0.001", "fee = 1.5");
        assert!(matches!(
            JobSpec::from_toml_str(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn schema_errors_surface() {
        let bad = JOB.replace("step = 10", "step = 0");
        assert!(matches!(
            JobSpec::from_toml_str(&bad),
            Err(ConfigError::Schema(SchemaError::InvalidRange { .. }))
        ));
    }

    #[test]
    fn simulation_config_reads_risk_params() {
        let cfg = OptimizerConfig::new(FitnessMetric::TotalReturn);
        let mut params = ParamSet::new();
        params.insert("stop_loss".into(), 0.02);
        let sim = cfg.simulation_config(&params);
        assert_eq!(sim.stop_loss_fraction, 0.02);
        assert_eq!(sim.take_profit_fraction, 0.0);
    }

    #[test]
    fn target_placeholder_expands() {
        let data = DataSpec {
            fine_csv: Some(PathBuf::from("data/{target}_15m.csv")),
            ..DataSpec::default()
        };
        assert_eq!(
            data.fine_path("BTC"),
            Some(PathBuf::from("data/BTC_15m.csv"))
        );
        assert_eq!(data.coarse_path("BTC"), None);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = JobSpec::load(Path::new("/nonexistent/job.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
