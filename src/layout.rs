//! Queries over the BIDS raw and derivatives trees: which subjects and
//! sessions exist, where a run's four input files live, and what the
//! scanner's repetition time was.

use camino::{Utf8Path, Utf8PathBuf};

use crate::contrast::TaskId;
use crate::error::LayoutError;
use crate::first_level::RunInputs;

/// The pair of dataset roots every query runs against.
#[derive(Debug, Clone)]
pub struct Layout {
    bids: Utf8PathBuf,
    derivatives: Utf8PathBuf,
}

impl Layout {
    pub fn new(bids: impl AsRef<Utf8Path>, derivatives: impl AsRef<Utf8Path>) -> Self {
        Self {
            bids: bids.as_ref().to_path_buf(),
            derivatives: derivatives.as_ref().to_path_buf(),
        }
    }

    /// Subject labels present in both trees, sorted. A non-empty `filter`
    /// (labels with or without the `sub-` prefix) narrows the result.
    pub fn subjects(&self, filter: &[String]) -> Result<Vec<String>, LayoutError> {
        let raw = entity_dirs(&self.bids, "sub-")?;
        let preprocessed = entity_dirs(&self.derivatives, "sub-")?;

        let mut subjects: Vec<String> = raw
            .into_iter()
            .filter(|label| preprocessed.contains(label))
            .collect();

        if !filter.is_empty() {
            let wanted: Vec<&str> = filter
                .iter()
                .map(|label| label.strip_prefix("sub-").unwrap_or(label))
                .collect();
            subjects.retain(|label| wanted.contains(&label.as_str()));
        }

        Ok(subjects)
    }

    /// Session labels for one subject, present in both trees. Datasets
    /// without a session level yield a single `None` so callers can treat
    /// both shapes uniformly.
    pub fn sessions(&self, subject: &str) -> Result<Vec<Option<String>>, LayoutError> {
        let raw = entity_dirs(&self.bids.join(format!("sub-{subject}")), "ses-")?;
        let preprocessed =
            entity_dirs(&self.derivatives.join(format!("sub-{subject}")), "ses-")?;

        let sessions: Vec<Option<String>> = raw
            .into_iter()
            .filter(|label| preprocessed.contains(label))
            .map(Some)
            .collect();

        if sessions.is_empty() {
            Ok(vec![None])
        } else {
            Ok(sessions)
        }
    }

    /// The repetition time in seconds, read from the first bold sidecar
    /// found for the task anywhere in the raw tree.
    pub fn repetition_time(&self, task: TaskId) -> Result<f64, LayoutError> {
        let pattern = format!("{}/**/*task-{task}*_bold.json", self.bids);
        let sidecar = first_match(&pattern)?
            .ok_or_else(|| LayoutError::NoSidecar(task.to_string()))?;

        let text = std::fs::read_to_string(&sidecar)
            .map_err(|e| LayoutError::ReadDir(sidecar.clone(), e))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LayoutError::Sidecar(sidecar.clone(), e))?;

        value
            .get("RepetitionTime")
            .and_then(serde_json::Value::as_f64)
            .ok_or(LayoutError::NoRepetitionTime(sidecar))
    }

    /// Resolve the four input files for one run. Any missing file is a
    /// [`LayoutError::NotFound`] naming what was looked for; the caller
    /// decides whether that skips the unit or aborts.
    pub fn run_inputs(
        &self,
        subject: &str,
        session: Option<&str>,
        task: TaskId,
    ) -> Result<RunInputs, LayoutError> {
        let raw_func = func_dir(&self.bids, subject, session);
        let prep_func = func_dir(&self.derivatives, subject, session);

        Ok(RunInputs {
            bold: self.require(
                &format!("{prep_func}/*task-{task}*desc-preproc_bold.nii.gz"),
                "preprocessed bold",
                subject,
                task,
            )?,
            mask: self.require(
                &format!("{prep_func}/*task-{task}*desc-brain_mask.nii.gz"),
                "brain mask",
                subject,
                task,
            )?,
            events: self.require(
                &format!("{raw_func}/*task-{task}*_events.tsv"),
                "events",
                subject,
                task,
            )?,
            confounds: self.require(
                &format!("{prep_func}/*task-{task}*desc-confounds*.tsv"),
                "confounds",
                subject,
                task,
            )?,
        })
    }

    fn require(
        &self,
        pattern: &str,
        what: &'static str,
        subject: &str,
        task: TaskId,
    ) -> Result<Utf8PathBuf, LayoutError> {
        first_match(pattern)?.ok_or_else(|| LayoutError::NotFound {
            what,
            subject: subject.to_string(),
            task: task.to_string(),
        })
    }
}

/// Discover first-level cope images for one contrast through the output
/// convention, paired with their varcope siblings. Returns sorted parallel
/// lists; a cope whose varcope sibling is missing is dropped with a
/// warning so the two lists always match.
pub fn group_copes(
    first_level_base: &Utf8Path,
    task: TaskId,
    session: Option<&str>,
    cope_ix: usize,
) -> Result<(Vec<Utf8PathBuf>, Vec<Utf8PathBuf>), LayoutError> {
    let session_segment = session.map(|s| format!("ses-{s}/")).unwrap_or_default();
    let pattern = format!(
        "{first_level_base}/task-{task}/sub-*/{session_segment}copes/cope{cope_ix}.nii.gz"
    );

    let mut copes = Vec::new();
    let mut varcopes = Vec::new();
    for cope in all_matches(&pattern)? {
        let varcope = Utf8PathBuf::from(
            cope.as_str()
                .replace("/copes/", "/varcopes/")
                .replace(&format!("cope{cope_ix}.nii.gz"), &format!("varcope{cope_ix}.nii.gz")),
        );
        if varcope.exists() {
            copes.push(cope);
            varcopes.push(varcope);
        } else {
            tracing::warn!("No varcope sibling for {cope}, dropping it from the group");
        }
    }

    Ok((copes, varcopes))
}

fn func_dir(root: &Utf8Path, subject: &str, session: Option<&str>) -> Utf8PathBuf {
    let mut dir = root.join(format!("sub-{subject}"));
    if let Some(session) = session {
        dir.push(format!("ses-{session}"));
    }
    dir.push("func");
    dir
}

/// Directory names under `root` with the given prefix, prefix stripped,
/// sorted. A missing root is treated as having no entries.
fn entity_dirs(root: &Utf8Path, prefix: &str) -> Result<Vec<String>, LayoutError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let entries =
        std::fs::read_dir(root).map_err(|e| LayoutError::ReadDir(root.to_path_buf(), e))?;

    let mut labels = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LayoutError::ReadDir(root.to_path_buf(), e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(label) = name.to_string_lossy().strip_prefix(prefix) {
            labels.push(label.to_string());
        }
    }

    labels.sort_unstable();
    Ok(labels)
}

fn first_match(pattern: &str) -> Result<Option<Utf8PathBuf>, LayoutError> {
    Ok(all_matches(pattern)?.into_iter().next())
}

fn all_matches(pattern: &str) -> Result<Vec<Utf8PathBuf>, LayoutError> {
    let mut matches = Vec::new();
    for entry in glob::glob(pattern)? {
        // Non-UTF8 paths cannot be ours; the whole tree is named by us or
        // by BIDS conventions.
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry?) {
            matches.push(path);
        }
    }
    matches.sort_unstable();
    Ok(matches)
}
