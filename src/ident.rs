//! Deterministic naming for analysis units.
//!
//! Every discovered (task, subject, session, run) tuple maps to exactly one
//! workflow name and one output directory. Both functions are pure; the
//! precedence is always task, then subject, then session, then run, and
//! absent components are omitted entirely rather than filled with a
//! placeholder.

use camino::{Utf8Path, Utf8PathBuf};

use crate::contrast::TaskId;

/// The identity of one analysis unit.
///
/// Derived once during discovery and shared by the assembler, the executor
/// and the group-level glob patterns, so that outputs written by a run can
/// be found again without any bookkeeping beyond the path convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentity {
    pub task: TaskId,
    pub subject: String,
    pub session: Option<String>,
    pub run: Option<String>,
}

impl RunIdentity {
    pub fn new(task: TaskId, subject: impl Into<String>) -> Self {
        Self {
            task,
            subject: subject.into(),
            session: None,
            run: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    /// Human-readable workflow name, e.g. `task_msit_sub_01_ses_01`.
    pub fn workflow_name(&self) -> String {
        let mut name = format!("task_{}_sub_{}", self.task, self.subject);

        if let Some(session) = &self.session {
            name.push_str("_ses_");
            name.push_str(session);
        }

        if let Some(run) = &self.run {
            name.push_str("_run_");
            name.push_str(run);
        }

        name
    }

    /// Output directory under `base`, e.g. `base/task-msit/sub-01/ses-01`.
    pub fn output_dir(&self, base: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        let mut dir = base
            .as_ref()
            .join(format!("task-{}", self.task))
            .join(format!("sub-{}", self.subject));

        if let Some(session) = &self.session {
            dir.push(format!("ses-{session}"));
        }

        if let Some(run) = &self.run {
            dir.push(format!("run-{run}"));
        }

        dir
    }
}

impl std::fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.workflow_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_path_with_all_components() {
        let id = RunIdentity::new(TaskId::Msit, "01")
            .with_session("02")
            .with_run("1");

        assert_eq!(id.workflow_name(), "task_msit_sub_01_ses_02_run_1");
        assert_eq!(
            id.output_dir("out"),
            Utf8PathBuf::from("out/task-msit/sub-01/ses-02/run-1")
        );
    }

    #[test]
    fn absent_components_are_omitted() {
        let id = RunIdentity::new(TaskId::Stroop, "07");
        assert_eq!(id.workflow_name(), "task_stroop_sub_07");
        assert_eq!(id.output_dir("out"), Utf8PathBuf::from("out/task-stroop/sub-07"));

        let id = RunIdentity::new(TaskId::Stroop, "07").with_run("2");
        assert_eq!(id.workflow_name(), "task_stroop_sub_07_run_2");
        assert_eq!(
            id.output_dir("out"),
            Utf8PathBuf::from("out/task-stroop/sub-07/run-2")
        );
    }

    #[test]
    fn distinct_tuples_give_distinct_names() {
        let ids = [
            RunIdentity::new(TaskId::Msit, "01"),
            RunIdentity::new(TaskId::Msit, "02"),
            RunIdentity::new(TaskId::Msit, "01").with_session("01"),
            RunIdentity::new(TaskId::Msit, "01").with_session("02"),
            RunIdentity::new(TaskId::Stroop, "01"),
        ];

        let names: std::collections::HashSet<_> =
            ids.iter().map(RunIdentity::workflow_name).collect();
        let paths: std::collections::HashSet<_> =
            ids.iter().map(|id| id.output_dir("out")).collect();

        assert_eq!(names.len(), ids.len());
        assert_eq!(paths.len(), ids.len());
    }

    #[test]
    fn naming_is_deterministic() {
        let id = RunIdentity::new(TaskId::Emoreap, "11").with_session("01");
        assert_eq!(id.workflow_name(), id.workflow_name());
        assert_eq!(id.output_dir("/base"), id.output_dir("/base"));
    }
}
