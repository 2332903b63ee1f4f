//! Task identifiers and their statically enumerated contrasts.

use serde::Serialize;

/// The supported task paradigms.
///
/// This is a closed set: an unknown task id fails at argument parsing
/// instead of falling through to an empty contrast list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum TaskId {
    Stroop,
    Msit,
    Emoreap,
}

impl TaskId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskId::Stroop => "stroop",
            TaskId::Msit => "msit",
            TaskId::Emoreap => "emoreap",
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A weighted combination of conditions tested for significance.
///
/// Shared by reference across all runs of a task; the weight vector always
/// has the same length as the condition list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contrast {
    pub name: String,
    pub stat: Stat,
    pub conditions: Vec<String>,
    pub weights: Vec<f64>,
}

/// Statistic requested for a contrast. Only T contrasts are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stat {
    T,
}

impl Contrast {
    fn t(name: &str, conditions: &[&str], weights: &[f64]) -> Self {
        debug_assert_eq!(conditions.len(), weights.len());
        Self {
            name: name.to_string(),
            stat: Stat::T,
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
            weights: weights.to_vec(),
        }
    }
}

/// The contrast table for a task.
pub fn contrasts(task: TaskId) -> Vec<Contrast> {
    match task {
        // Stroop and MSIT share the congruent/incongruent design.
        TaskId::Stroop | TaskId::Msit => vec![
            Contrast::t("Congruent", &["Congruent"], &[1.0]),
            Contrast::t("Incongruent", &["Incongruent"], &[1.0]),
            Contrast::t(
                "Congruent > Incongruent",
                &["Congruent", "Incongruent"],
                &[1.0, -1.0],
            ),
        ],
        TaskId::Emoreap => vec![
            Contrast::t("LookNeg", &["LookNeg"], &[1.0]),
            Contrast::t("LookNeut", &["LookNeut"], &[1.0]),
            Contrast::t("RegNeg", &["RegNeg"], &[1.0]),
            Contrast::t("LookNeg > LookNeut", &["LookNeg", "LookNeut"], &[1.0, -1.0]),
            Contrast::t("RegNeg > LookNeg", &["RegNeg", "LookNeg"], &[1.0, -1.0]),
            Contrast::t("RegNeg > LookNeut", &["RegNeg", "LookNeut"], &[1.0, -1.0]),
        ],
    }
}
