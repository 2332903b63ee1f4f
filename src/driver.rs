//! Orchestration: command line surface, run planning, and dispatch of the
//! first-level batch and the group-level analyses.

use std::collections::BTreeSet;
use std::io::Write;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use console::style;

use crate::config::AnalysisConfig;
use crate::contrast::{TaskId, contrasts};
use crate::error::{BidsGlmError, ConfigError, LayoutError};
use crate::exec::{ExecPolicy, run_batch};
use crate::first_level::RunInputs;
use crate::group_level::GroupInputs;
use crate::ident::RunIdentity;
use crate::layout::{Layout, group_copes};
use crate::pipeline::Pipeline;
use crate::{first_level, group_level};

#[derive(Debug, Parser)]
#[command(name = "bidsglm", about = "BIDS task-fMRI GLM analysis with FSL")]
pub struct Opts {
    /// Task paradigm to analyze.
    #[arg(value_enum)]
    pub task_id: TaskId,

    /// Analysis level; `group` runs the first level first.
    #[arg(value_enum)]
    pub analysis_level: AnalysisLevel,

    /// Root of the raw BIDS dataset.
    #[arg(short = 'b', long)]
    pub bids_dir: Utf8PathBuf,

    /// Root of the fMRIPrep derivatives.
    #[arg(short = 'f', long)]
    pub fmriprep_dir: Utf8PathBuf,

    /// Where analysis results are written.
    #[arg(short = 'o', long)]
    pub output_dir: Utf8PathBuf,

    /// Restrict the analysis to these subjects (with or without `sub-`).
    #[arg(long, num_args = 1..)]
    pub participant_label: Vec<String>,

    /// Concurrent pipelines; 1 runs everything serially.
    #[arg(long, default_value_t = 1)]
    pub ncpus: usize,

    /// Scratch directory for intermediate files.
    #[arg(short = 'w', long)]
    pub work_dir: Option<Utf8PathBuf>,

    /// JSON file overriding the per-task defaults.
    #[arg(long)]
    pub config_file: Option<Utf8PathBuf>,

    /// Brain mask in group space; required for group analyses.
    #[arg(long)]
    pub group_mask: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AnalysisLevel {
    Participant,
    Group,
}

/// One unit accepted for first-level analysis.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub identity: RunIdentity,
    pub inputs: RunInputs,
}

/// One unit excluded from the batch, with the reason it was excluded.
#[derive(Debug, Clone)]
pub struct SkippedRun {
    pub identity: RunIdentity,
    pub reason: String,
}

/// The outcome of discovery: what will run and what will not. Skips are
/// reported, never silent; a skipped unit does not fail the batch.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub accepted: Vec<PlannedRun>,
    pub skipped: Vec<SkippedRun>,
}

/// Enumerate every (subject, session) unit for the task and sort each into
/// accepted or skipped. A unit is skipped when its output directory
/// already exists or when any of its four input files cannot be resolved;
/// any other layout failure aborts planning.
pub fn plan_first_level(
    layout: &Layout,
    task: TaskId,
    participant_filter: &[String],
    first_level_base: &Utf8Path,
) -> Result<RunPlan, BidsGlmError> {
    let mut plan = RunPlan {
        accepted: Vec::new(),
        skipped: Vec::new(),
    };

    for subject in layout.subjects(participant_filter)? {
        for session in layout.sessions(&subject)? {
            let mut identity = RunIdentity::new(task, subject.clone());
            if let Some(session) = &session {
                identity = identity.with_session(session.clone());
            }

            if identity.output_dir(first_level_base).exists() {
                plan.skipped.push(SkippedRun {
                    identity,
                    reason: "output directory already exists".to_string(),
                });
                continue;
            }

            match layout.run_inputs(&subject, session.as_deref(), task) {
                Ok(inputs) => plan.accepted.push(PlannedRun { identity, inputs }),
                Err(err @ LayoutError::NotFound { .. }) => plan.skipped.push(SkippedRun {
                    identity,
                    reason: err.to_string(),
                }),
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(plan)
}

/// Run the requested analysis end to end.
pub fn run(opts: &Opts) -> Result<(), BidsGlmError> {
    let s = Instant::now();
    let task = opts.task_id;

    let config = AnalysisConfig::resolve(opts.config_file.as_deref(), task)?;
    let contrasts = contrasts(task);
    let layout = Layout::new(&opts.bids_dir, &opts.fmriprep_dir);

    // Group analyses need the mask up front, not after hours of fitting.
    let group_mask = match opts.analysis_level {
        AnalysisLevel::Group => Some(
            opts.group_mask
                .clone()
                .ok_or(ConfigError::MissingGroupMask)?,
        ),
        AnalysisLevel::Participant => None,
    };

    eprintln!(
        "Running {} on task {}",
        style("bidsglm").red(),
        style(task).blue()
    );

    write_logs(&opts.output_dir, task, &config, &contrasts)?;

    let first_level_base = opts.output_dir.join("first_level");
    let work_dir = opts
        .work_dir
        .clone()
        .unwrap_or_else(|| opts.output_dir.join("work"));
    let policy = if opts.ncpus > 1 {
        ExecPolicy::Workers(opts.ncpus)
    } else {
        ExecPolicy::Serial
    };

    let tr = layout.repetition_time(task)?;
    let plan = plan_first_level(&layout, task, &opts.participant_label, &first_level_base)?;
    for skip in &plan.skipped {
        tracing::warn!("Skipping {}: {}", skip.identity, skip.reason);
    }
    tracing::info!(
        "Planned {} first-level runs ({} skipped)",
        plan.accepted.len(),
        plan.skipped.len()
    );

    let pipelines: Vec<Pipeline> = plan
        .accepted
        .iter()
        .map(|run| {
            first_level::assemble(
                &run.identity,
                &run.inputs,
                tr,
                &config.config_first,
                &contrasts,
                &first_level_base,
            )
        })
        .collect::<Result<_, _>>()?;

    let results = run_batch(&pipelines, &work_dir, policy)?;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        tracing::warn!("{failed} of {} first-level pipelines failed", results.len());
    }

    if let Some(mask) = group_mask {
        run_group(opts, task, &config, contrasts.len(), &mask, &work_dir, policy)?;
    }

    eprintln!("Analysis finished {}", crate::utils::as_overhead(s));
    Ok(())
}

/// Group dispatch: one pipeline per (session, contrast) with at least one
/// discovered cope. Group pipelines always re-run.
fn run_group(
    opts: &Opts,
    task: TaskId,
    config: &AnalysisConfig,
    n_contrasts: usize,
    mask: &Utf8Path,
    work_dir: &Utf8Path,
    policy: ExecPolicy,
) -> Result<(), BidsGlmError> {
    let layout = Layout::new(&opts.bids_dir, &opts.fmriprep_dir);
    let first_level_base = opts.output_dir.join("first_level");
    let group_base = opts.output_dir.join("group_level");

    // Sessions may differ between subjects; group each session separately.
    let mut sessions: BTreeSet<Option<String>> = BTreeSet::new();
    for subject in layout.subjects(&opts.participant_label)? {
        sessions.extend(layout.sessions(&subject)?);
    }

    let mut pipelines = Vec::new();
    for session in &sessions {
        for cope_ix in 1..=n_contrasts {
            let (copes, varcopes) =
                group_copes(&first_level_base, task, session.as_deref(), cope_ix)?;
            if copes.is_empty() {
                tracing::warn!("No copes found for contrast {cope_ix}, skipping its group fit");
                continue;
            }

            let inputs = GroupInputs {
                copes,
                varcopes,
                mask: mask.to_path_buf(),
            };
            pipelines.push(group_level::assemble(
                task,
                session.as_deref(),
                cope_ix,
                &inputs,
                &config.config_group,
                &group_base,
            )?);
        }
    }

    tracing::info!("Planned {} group pipelines", pipelines.len());
    let results = run_batch(&pipelines, work_dir, policy)?;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        tracing::warn!("{failed} of {} group pipelines failed", results.len());
    }

    Ok(())
}

/// Record the resolved contrasts and configuration next to the outputs,
/// before anything runs, so a finished tree is self-describing.
fn write_logs(
    output_dir: &Utf8Path,
    task: TaskId,
    config: &AnalysisConfig,
    contrasts: &[crate::contrast::Contrast],
) -> Result<(), BidsGlmError> {
    let log_dir = output_dir.join(format!("log/task-{task}"));
    std::fs::create_dir_all(&log_dir)?;

    let mut contrast_log = std::fs::File::create(log_dir.join("contrast.log"))?;
    for contrast in contrasts {
        writeln!(
            contrast_log,
            "{}: {:?} {:?}",
            contrast.name, contrast.conditions, contrast.weights
        )?;
    }

    let mut config_log = std::fs::File::create(log_dir.join("config.log"))?;
    let rendered = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Parse(log_dir.join("config.log"), e))?;
    writeln!(config_log, "{rendered}")?;

    Ok(())
}
