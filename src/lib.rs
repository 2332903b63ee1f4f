#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod contrast;
mod driver;
mod error;
mod exec;
mod first_level;
mod fsf;
mod group_level;
mod ident;
mod layout;
mod model;
mod pipeline;
mod table;
mod utils;

pub use crate::config::{AnalysisConfig, FirstLevelConfig, FlameMode, GroupLevelConfig};
pub use crate::contrast::{Contrast, Stat, TaskId, contrasts};
pub use crate::driver::{AnalysisLevel, Opts, PlannedRun, RunPlan, SkippedRun, plan_first_level, run};
pub use crate::error::*;
pub use crate::exec::{ExecPolicy, run_batch, run_pipeline};
pub use crate::first_level::RunInputs;
pub use crate::group_level::GroupInputs;
pub use crate::ident::RunIdentity;
pub use crate::layout::{Layout, group_copes};
pub use crate::model::{Condition, SubjectInfo, build_subject_info};
pub use crate::pipeline::{
    Invocation, NodeHandle, OutputSpec, Pipeline, PipelineBuilder, Route, SourceValue,
};
pub use crate::utils::init_logging;
