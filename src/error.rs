use camino::Utf8PathBuf;
use thiserror::Error;

/// Top-level error for the `bidsglm` binary and library entry points.
#[derive(Debug, Error)]
pub enum BidsGlmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Design(#[from] DesignError),

    #[error("Pipeline '{0}':\n{1}")]
    Assembly(String, PipelineError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),

    #[error("Group analysis requires --group-mask")]
    MissingGroupMask,
}

/// Errors raised while querying the BIDS raw and derivatives trees.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("Couldn't read dataset directory '{0}'.\n{1}")]
    ReadDir(Utf8PathBuf, std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("No {what} found for sub-{subject} (task {task})")]
    NotFound {
        what: &'static str,
        subject: String,
        task: String,
    },

    #[error("No repetition time sidecar found for task {0}")]
    NoSidecar(String),

    #[error("Couldn't parse sidecar '{0}'.\n{1}")]
    Sidecar(Utf8PathBuf, serde_json::Error),

    #[error("Sidecar '{0}' has no RepetitionTime field")]
    NoRepetitionTime(Utf8PathBuf),
}

/// Errors raised while reading a tab-separated table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Couldn't read table '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Table '{0}' is empty")]
    Empty(Utf8PathBuf),

    #[error("Table '{file}' row {row} has {got} cells, expected {expected}")]
    Ragged {
        file: Utf8PathBuf,
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("Table '{file}' has no column '{column}'")]
    MissingColumn { file: Utf8PathBuf, column: String },

    #[error("Table '{file}' column '{column}' row {row}: '{value}' is not a number")]
    BadNumber {
        file: Utf8PathBuf,
        column: String,
        row: usize,
        value: String,
    },
}

/// Errors raised while building the per-run subject information.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Requested confound '{0}' is absent from the confounds table")]
    MissingConfound(String),

    #[error("start_ix {start_ix} exceeds the {rows} confound rows")]
    TrimExceedsRows { start_ix: usize, rows: usize },

    #[error("Events table has no trials")]
    NoTrials,
}

/// Errors raised while rendering FEAT design files.
#[derive(Debug, Error)]
pub enum DesignError {
    #[error("Contrast '{contrast}' references condition '{condition}', which has no trials")]
    UnknownCondition { contrast: String, condition: String },

    #[error("Design has no timepoints after the trim")]
    NoTimepoints,
}

/// Errors raised while assembling or validating a pipeline graph.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cycle detected in pipeline graph")]
    Cycle,

    #[error("Node '{node}' wires unknown output field '{field}'")]
    UnknownOutput { node: String, field: &'static str },

    #[error("Node '{node}' input field '{field}' is not wired")]
    UnwiredInput { node: String, field: &'static str },

    #[error("Node '{node}' input field '{field}' is wired more than once")]
    DuplicateInput { node: String, field: &'static str },

    #[error("Group design needs matching cope/varcope lists, got {copes} and {varcopes}")]
    CopeCountMismatch { copes: usize, varcopes: usize },

    #[error("Group design needs at least one cope image")]
    NoCopes,
}

/// Errors raised while executing a pipeline graph.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Node '{node}': input file '{path}' does not exist")]
    MissingInput { node: String, path: Utf8PathBuf },

    #[error("Node '{node}': no value for input field '{field}'")]
    MissingField { node: String, field: &'static str },

    #[error("Node '{node}': couldn't spawn '{program}'.\n{source}")]
    Spawn {
        node: String,
        program: &'static str,
        source: std::io::Error,
    },

    #[error("Node '{node}': '{program}' exited with {status}\n{stderr}")]
    Tool {
        node: String,
        program: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Node '{node}': couldn't parse stdout '{value}' as a number")]
    StdoutParse { node: String, value: String },

    #[error("Node '{node}': declared output '{pattern}' matched nothing")]
    NoOutput { node: String, pattern: String },

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
