//! First-level pipeline assembly: one run of one subject, from the
//! preprocessed BOLD series to fitted GLM statistics on disk.
//!
//! Assembly is side-effect free apart from reading the two TSV tables; all
//! image processing happens when the executor runs the pipeline.

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::FirstLevelConfig;
use crate::contrast::Contrast;
use crate::error::BidsGlmError;
use crate::fsf::first_level_design;
use crate::ident::RunIdentity;
use crate::model::build_subject_info;
use crate::pipeline::{Invocation, OutputSpec, Pipeline, PipelineBuilder, Route};

/// The four files a first-level run needs, resolved by the layout query.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub bold: Utf8PathBuf,
    pub mask: Utf8PathBuf,
    pub events: Utf8PathBuf,
    pub confounds: Utf8PathBuf,
}

/// Assemble the fixed first-level topology for one run:
/// trim, mask, SUSAN smooth, render the FEAT model, expand it with
/// `feat_model`, fit with `film_gls`, and sink the results under the run's
/// output directory.
pub fn assemble(
    identity: &RunIdentity,
    inputs: &RunInputs,
    tr: f64,
    config: &FirstLevelConfig,
    contrasts: &[Contrast],
    output_base: &Utf8Path,
) -> Result<Pipeline, BidsGlmError> {
    let info = build_subject_info(
        &inputs.events,
        &inputs.confounds,
        &config.confounds,
        config.start_ix,
        config.motion_24,
    )?;
    let design_files = first_level_design(&info, tr, config.high_pass, contrasts)?;

    let name = identity.workflow_name();
    let mut builder = PipelineBuilder::new(&name);

    let source = builder.source(
        "inputs",
        vec![
            ("bold", inputs.bold.as_path().into()),
            ("mask", inputs.mask.as_path().into()),
        ],
    );

    // Drop the leading volumes the model also ignores.
    let trim = builder.tool(
        "trim",
        Invocation::new("fslroi")
            .input("in_file")
            .output("out_file")
            .arg(config.start_ix.to_string())
            .arg("-1"),
        vec![OutputSpec::new("out_file", "trimmed.nii.gz")],
    );

    let mask = builder.tool(
        "mask",
        Invocation::new("fslmaths")
            .input("in_file")
            .arg("-mas")
            .input("mask_file")
            .output("out_file"),
        vec![OutputSpec::new("out_file", "masked.nii.gz")],
    );

    // SUSAN's brightness threshold follows the usual convention: three
    // quarters of the within-mask median intensity.
    let median = builder.tool_capture(
        "median",
        Invocation::new("fslstats")
            .input("in_file")
            .arg("-k")
            .input("mask_file")
            .arg("-p")
            .arg("50"),
        "brightness_threshold",
        0.75,
    );

    let sigma = config.fwhm / (8.0 * std::f64::consts::LN_2).sqrt();
    let smooth = builder.tool(
        "smooth",
        Invocation::new("susan")
            .input("in_file")
            .input("brightness_threshold")
            .arg(format!("{sigma:.6}"))
            .arg("3")
            .arg("1")
            .arg("0")
            .output("smoothed_file"),
        vec![OutputSpec::new("smoothed_file", "smoothed.nii.gz")],
    );

    let model = builder.render_with_companions("model", "fsf_file", "ev_files", design_files);

    // feat_model takes the design prefix and reads the EV files by the
    // relative names the fsf records, so both are staged alongside it.
    let design = builder.tool_with_stages(
        "design",
        Invocation::new("feat_model").input_stem("fsf_file"),
        vec![
            OutputSpec::new("design_file", "design.mat"),
            OutputSpec::new("tcon_file", "design.con"),
            OutputSpec::optional("design_image", "design.png"),
        ],
        vec!["ev_files"],
    );

    let estimate = builder.tool(
        "estimate",
        Invocation::new("film_gls")
            .key_input("--in=", "in_file")
            .key_input("--pd=", "design_file")
            .key_input("--con=", "tcon_file")
            .arg("--thr=100")
            .arg("--sa")
            .arg("--ms=5")
            .arg("--rn=results"),
        vec![
            OutputSpec::new("param_estimates", "results/pe*.nii.gz"),
            OutputSpec::new("copes", "results/cope*.nii.gz"),
            OutputSpec::new("varcopes", "results/varcope*.nii.gz"),
            OutputSpec::new("tstats", "results/tstat*.nii.gz"),
            OutputSpec::new("zstats", "results/zstat*.nii.gz"),
        ],
    );

    let sink = builder.sink(
        "datasink",
        identity.output_dir(output_base),
        vec![
            Route { input: "param_estimates", subdir: "betas" },
            Route { input: "copes", subdir: "copes" },
            Route { input: "varcopes", subdir: "varcopes" },
            Route { input: "tstats", subdir: "stats" },
            Route { input: "zstats", subdir: "stats" },
            Route { input: "design_image", subdir: "design_image" },
        ],
    );

    builder.wire(source, "bold", trim, "in_file");
    builder.wire(trim, "out_file", mask, "in_file");
    builder.wire(source, "mask", mask, "mask_file");
    builder.wire(mask, "out_file", median, "in_file");
    builder.wire(source, "mask", median, "mask_file");
    builder.wire(mask, "out_file", smooth, "in_file");
    builder.wire(median, "brightness_threshold", smooth, "brightness_threshold");
    builder.wire(model, "fsf_file", design, "fsf_file");
    builder.wire(model, "ev_files", design, "ev_files");
    builder.wire(smooth, "smoothed_file", estimate, "in_file");
    builder.wire(design, "design_file", estimate, "design_file");
    builder.wire(design, "tcon_file", estimate, "tcon_file");
    builder.wire(estimate, "param_estimates", sink, "param_estimates");
    builder.wire(estimate, "copes", sink, "copes");
    builder.wire(estimate, "varcopes", sink, "varcopes");
    builder.wire(estimate, "tstats", sink, "tstats");
    builder.wire(estimate, "zstats", sink, "zstats");
    builder.wire(design, "design_image", sink, "design_image");

    builder
        .finish()
        .map_err(|e| BidsGlmError::Assembly(name, e))
}
