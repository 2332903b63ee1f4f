//! Analysis configuration.
//!
//! The JSON layout (two top-level keys, `config_first` and `config_group`)
//! and the field names are kept exactly as consumed by earlier analyses, so
//! existing config files stay valid.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::contrast::TaskId;
use crate::error::ConfigError;

/// Fixed seed for permutation testing when no config file overrides it.
const RANDOM_STATE: u64 = 69;

/// Nuisance regressors used when no config file is supplied: the six motion
/// parameters, six aCompCor components, the cosine drift basis and
/// framewise displacement.
const DEFAULT_CONFOUNDS: &[&str] = &[
    "trans_x",
    "trans_y",
    "trans_z",
    "rot_x",
    "rot_y",
    "rot_z",
    "a_comp_cor_00",
    "a_comp_cor_01",
    "a_comp_cor_02",
    "a_comp_cor_03",
    "a_comp_cor_04",
    "a_comp_cor_05",
    "cosine00",
    "cosine01",
    "cosine02",
    "cosine03",
    "cosine04",
    "cosine05",
    "cosine06",
    "cosine07",
    "cosine08",
    "framewise_displacement",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub config_first: FirstLevelConfig,
    pub config_group: GroupLevelConfig,
}

/// Per-run model options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstLevelConfig {
    /// High-pass filter cutoff in seconds.
    #[serde(rename = "thigh_pass")]
    pub high_pass: f64,
    /// Smoothing kernel width (FWHM, mm).
    pub fwhm: f64,
    /// Number of leading volumes to drop.
    pub start_ix: usize,
    /// Expand the six motion regressors into the 24-parameter set.
    #[serde(rename = "twenty_four")]
    pub motion_24: bool,
    /// Confound columns to carry into the design.
    pub confounds: Vec<String>,
}

/// Group statistics options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupLevelConfig {
    pub flame_mode: FlameMode,
    pub randomise: bool,
    pub n_perms: u32,
    pub seed: u64,
}

/// FLAME mixed-effects run mode, matching `flameo --runmode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlameMode {
    Fe,
    Ols,
    Flame1,
    Flame12,
}

impl FlameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlameMode::Fe => "fe",
            FlameMode::Ols => "ols",
            FlameMode::Flame1 => "flame1",
            FlameMode::Flame12 => "flame12",
        }
    }
}

impl AnalysisConfig {
    /// The default configuration for a task, based on previously run
    /// analyses. Only the high-pass cutoff differs between tasks.
    pub fn defaults(task: TaskId) -> Self {
        let high_pass = match task {
            TaskId::Emoreap => 128.0,
            TaskId::Stroop | TaskId::Msit => 187.0,
        };

        Self {
            config_first: FirstLevelConfig {
                high_pass,
                fwhm: 6.0,
                start_ix: 0,
                motion_24: false,
                confounds: DEFAULT_CONFOUNDS.iter().map(|c| c.to_string()).collect(),
            },
            config_group: GroupLevelConfig {
                flame_mode: FlameMode::Flame1,
                randomise: true,
                n_perms: 10_000,
                seed: RANDOM_STATE,
            },
        }
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Load from `path` when given, fall back to the task defaults otherwise.
    pub fn resolve(path: Option<&Utf8Path>, task: TaskId) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::defaults(task)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_differ_by_task() {
        let emoreap = AnalysisConfig::defaults(TaskId::Emoreap);
        let msit = AnalysisConfig::defaults(TaskId::Msit);

        assert_eq!(emoreap.config_first.high_pass, 128.0);
        assert_eq!(msit.config_first.high_pass, 187.0);
        assert_eq!(msit.config_first.confounds.len(), 22);
        assert_eq!(msit.config_group.seed, RANDOM_STATE);
        assert_eq!(msit.config_group.flame_mode, FlameMode::Flame1);
    }

    #[test]
    fn original_field_names_parse() {
        let json = r#"{
            "config_first": {
                "thigh_pass": 100.0,
                "fwhm": 5.0,
                "start_ix": 4,
                "twenty_four": true,
                "confounds": ["trans_x", "rot_z"]
            },
            "config_group": {
                "flame_mode": "ols",
                "randomise": false,
                "n_perms": 500,
                "seed": 1
            }
        }"#;

        let config: AnalysisConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.config_first.high_pass, 100.0);
        assert_eq!(config.config_first.start_ix, 4);
        assert!(config.config_first.motion_24);
        assert_eq!(config.config_group.flame_mode, FlameMode::Ols);
        assert!(!config.config_group.randomise);
    }

    #[test]
    fn roundtrip_preserves_field_names() {
        let config = AnalysisConfig::defaults(TaskId::Stroop);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"thigh_pass\""));
        assert!(json.contains("\"twenty_four\""));

        let back: AnalysisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.config_first.high_pass, config.config_first.high_pass);
    }

    #[test]
    fn resolve_prefers_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        let mut config = AnalysisConfig::defaults(TaskId::Msit);
        config.config_first.fwhm = 8.0;
        write!(file, "{}", serde_json::to_string(&config).unwrap()).unwrap();

        let path = Utf8Path::from_path(&path).unwrap();
        let loaded = AnalysisConfig::resolve(Some(path), TaskId::Msit).unwrap();
        assert_eq!(loaded.config_first.fwhm, 8.0);

        let fallback = AnalysisConfig::resolve(None, TaskId::Msit).unwrap();
        assert_eq!(fallback.config_first.fwhm, 6.0);
    }
}
