//! Per-run subject information: the condition specification extracted from
//! the events table and the nuisance regressors selected from the confounds
//! table, both aligned to the volumes that survive the initial trim.

use camino::Utf8Path;
use serde::Serialize;

use crate::error::{ModelError, TableError};
use crate::table::Table;

/// The six rigid-body motion parameters, in fMRIPrep column naming.
pub const MOTION_COLUMNS: [&str; 6] = [
    "trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z",
];

/// One experimental condition with its trial timing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub name: String,
    pub onsets: Vec<f64>,
    pub durations: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

/// Everything the model specification needs for one run.
///
/// Invariants: `regressor_names` and `regressors` are parallel, and every
/// regressor sequence has the same length (the number of retained
/// timepoints). Constructed once by [`build_subject_info`] and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectInfo {
    pub conditions: Vec<Condition>,
    pub regressor_names: Vec<String>,
    pub regressors: Vec<Vec<f64>>,
    /// Rows of the confounds table where a missing cell was zero-filled.
    pub filled_rows: usize,
}

impl SubjectInfo {
    pub fn n_timepoints(&self) -> usize {
        self.regressors.first().map_or(0, Vec::len)
    }
}

/// Build the [`SubjectInfo`] for one run.
///
/// Trials are partitioned into conditions by the `trial_type` column, with
/// unit amplitude. The requested confound columns are selected from the
/// confounds table; a requested column that does not exist is a hard error.
/// Missing cells are replaced with zero and the affected row count is
/// reported. With `motion_24` the six motion regressors are expanded to the
/// 24-parameter set (squares, one-timepoint lags, squared lags). Finally
/// the first `start_ix` timepoints are dropped from every regressor, but
/// not from the condition onsets, matching the volume trim applied to the
/// functional series upstream.
pub fn build_subject_info(
    events_file: &Utf8Path,
    confounds_file: &Utf8Path,
    confounds: &[String],
    start_ix: usize,
    motion_24: bool,
) -> Result<SubjectInfo, ModelError> {
    let conditions = read_conditions(events_file)?;

    let table = Table::from_path(confounds_file)?;
    if table.is_empty() {
        return Err(TableError::Empty(confounds_file.to_path_buf()).into());
    }
    for name in confounds {
        if !table.has_column(name) {
            return Err(ModelError::MissingConfound(name.clone()));
        }
    }
    if start_ix > table.len() {
        return Err(ModelError::TrimExceedsRows {
            start_ix,
            rows: table.len(),
        });
    }

    let mut names: Vec<String> = confounds.to_vec();
    let mut columns: Vec<Vec<f64>> = confounds
        .iter()
        .map(|name| table.numeric_column(name))
        .collect::<Result<_, _>>()?;

    // Zero-fill missing cells, counting affected rows once each.
    let filled_rows = (0..table.len())
        .filter(|&row| columns.iter().any(|column| column[row].is_nan()))
        .count();
    if filled_rows > 0 {
        tracing::warn!(
            "{filled_rows} rows of {confounds_file} have missing values, filling with 0"
        );
        for column in &mut columns {
            for cell in column.iter_mut() {
                if cell.is_nan() {
                    *cell = 0.0;
                }
            }
        }
    }

    if motion_24 {
        let selected = names.clone();
        expand_motion(&selected, &mut names, &mut columns)?;
    }

    for column in &mut columns {
        column.drain(..start_ix);
    }

    Ok(SubjectInfo {
        conditions,
        regressor_names: names,
        regressors: columns,
        filled_rows,
    })
}

fn read_conditions(events_file: &Utf8Path) -> Result<Vec<Condition>, ModelError> {
    let table = Table::from_path(events_file)?;

    let onsets = table.numeric_column("onset")?;
    let durations = table.numeric_column("duration")?;
    let labels = table.column("trial_type")?;

    // Condition order is the sorted set of labels, so the EV numbering is
    // stable across runs regardless of trial order.
    let mut names: Vec<&str> = labels.clone();
    names.sort_unstable();
    names.dedup();

    let conditions: Vec<Condition> = names
        .into_iter()
        .map(|name| {
            let trials: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|(_, label)| **label == name)
                .map(|(ix, _)| ix)
                .collect();

            Condition {
                name: name.to_string(),
                onsets: trials.iter().map(|&ix| onsets[ix]).collect(),
                durations: trials.iter().map(|&ix| durations[ix]).collect(),
                amplitudes: vec![1.0; trials.len()],
            }
        })
        .collect();

    if conditions.is_empty() {
        return Err(ModelError::NoTrials);
    }

    Ok(conditions)
}

/// Quadruple the six motion regressors: squared values, one-timepoint lags
/// with the first lagged value defined as zero, and squared lags. Appended
/// after the requested confounds in that order.
fn expand_motion(
    selected: &[String],
    names: &mut Vec<String>,
    columns: &mut Vec<Vec<f64>>,
) -> Result<(), ModelError> {
    let motion: Vec<&Vec<f64>> = MOTION_COLUMNS
        .iter()
        .map(|name| {
            selected
                .iter()
                .position(|c| c == name)
                .map(|ix| &columns[ix])
                .ok_or_else(|| ModelError::MissingConfound(name.to_string()))
        })
        .collect::<Result<_, _>>()?;

    let squared: Vec<Vec<f64>> = motion
        .iter()
        .map(|column| column.iter().map(|v| v * v).collect())
        .collect();

    let lagged: Vec<Vec<f64>> = motion
        .iter()
        .map(|column| {
            if column.is_empty() {
                return Vec::new();
            }
            let mut lag = vec![0.0];
            lag.extend(column.iter().take(column.len() - 1));
            lag
        })
        .collect();

    let lagged_squared: Vec<Vec<f64>> = lagged
        .iter()
        .map(|column| column.iter().map(|v| v * v).collect())
        .collect();

    for (suffix, block) in [("_sq", squared), ("_dt", lagged), ("_sq_dt", lagged_squared)] {
        for (name, column) in MOTION_COLUMNS.iter().zip(block) {
            names.push(format!("{name}{suffix}"));
            columns.push(column);
        }
    }

    Ok(())
}
