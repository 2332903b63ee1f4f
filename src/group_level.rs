//! Group-level pipeline assembly: one-sample mixed-effects statistics over
//! the first-level cope images of one contrast, with optional
//! permutation testing.

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::GroupLevelConfig;
use crate::contrast::TaskId;
use crate::error::{BidsGlmError, PipelineError};
use crate::fsf::group_design;
use crate::pipeline::{Invocation, OutputSpec, Pipeline, PipelineBuilder, Route};

/// The discovered inputs for one contrast's group analysis. The cope and
/// varcope lists are parallel: index `i` of both belongs to the same run.
#[derive(Debug, Clone)]
pub struct GroupInputs {
    pub copes: Vec<Utf8PathBuf>,
    pub varcopes: Vec<Utf8PathBuf>,
    pub mask: Utf8PathBuf,
}

/// Assemble the group topology for one contrast: merge copes and varcopes
/// into 4D images, render the intercept-only design, fit mixed effects
/// with `flameo`, and, when requested, run threshold-free `randomise` on
/// the absolute cope values. Results sink under `task-X[/ses-S]/cond_N/`.
pub fn assemble(
    task: TaskId,
    session: Option<&str>,
    cope_ix: usize,
    inputs: &GroupInputs,
    config: &GroupLevelConfig,
    output_base: &Utf8Path,
) -> Result<Pipeline, BidsGlmError> {
    let name = match session {
        Some(session) => format!("task_{task}_group_ses_{session}_cope{cope_ix}"),
        None => format!("task_{task}_group_cope{cope_ix}"),
    };

    if inputs.copes.is_empty() {
        return Err(BidsGlmError::Assembly(name, PipelineError::NoCopes));
    }
    if inputs.copes.len() != inputs.varcopes.len() {
        return Err(BidsGlmError::Assembly(
            name,
            PipelineError::CopeCountMismatch {
                copes: inputs.copes.len(),
                varcopes: inputs.varcopes.len(),
            },
        ));
    }

    let design_files = group_design(inputs.copes.len())?;
    let mut output_dir = output_base.join(format!("task-{task}"));
    if let Some(session) = session {
        output_dir.push(format!("ses-{session}"));
    }
    output_dir.push(format!("cond_{cope_ix}"));

    let mut builder = PipelineBuilder::new(&name);

    let source = builder.source(
        "inputs",
        vec![
            ("copes", inputs.copes.clone().into()),
            ("varcopes", inputs.varcopes.clone().into()),
            ("mask", inputs.mask.as_path().into()),
        ],
    );

    let merge_copes = builder.tool(
        "merge_copes",
        Invocation::new("fslmerge")
            .arg("-t")
            .output("merged_file")
            .input("in_files"),
        vec![OutputSpec::new("merged_file", "merged_copes.nii.gz")],
    );

    let merge_varcopes = builder.tool(
        "merge_varcopes",
        Invocation::new("fslmerge")
            .arg("-t")
            .output("merged_file")
            .input("in_files"),
        vec![OutputSpec::new("merged_file", "merged_varcopes.nii.gz")],
    );

    // flameo wants the design as three separate files.
    let mut design_files = design_files.into_iter();
    let renders: Vec<_> = ["design_mat", "design_con", "design_grp"]
        .into_iter()
        .zip(design_files.by_ref())
        .map(|(node, (file_name, contents))| {
            builder.render(node, "design_file", file_name, contents)
        })
        .collect();
    let (mat, con, grp) = (renders[0], renders[1], renders[2]);

    let flame = builder.tool(
        "flame",
        Invocation::new("flameo")
            .key_input("--cope=", "cope_file")
            .key_input("--varcope=", "var_cope_file")
            .key_input("--mask=", "mask_file")
            .key_input("--dm=", "design_file")
            .key_input("--tc=", "tcon_file")
            .key_input("--cs=", "group_file")
            .arg(format!("--runmode={}", config.flame_mode.as_str()))
            .arg("--ld=stats"),
        vec![
            OutputSpec::new("pes", "stats/pe*.nii.gz"),
            OutputSpec::new("tstats", "stats/tstat*.nii.gz"),
            OutputSpec::new("zstats", "stats/zstat*.nii.gz"),
            OutputSpec::optional("zfstats", "stats/zfstat*.nii.gz"),
        ],
    );

    let mut routes = vec![
        Route { input: "pes", subdir: "flame" },
        Route { input: "tstats", subdir: "flame" },
        Route { input: "zstats", subdir: "flame" },
        Route { input: "zfstats", subdir: "flame" },
    ];

    let permutation = if config.randomise {
        // randomise's one-sample test is one-sided, so it runs on the
        // absolute cope values; the sign is read off the FLAME t maps.
        let absolute = builder.tool(
            "absolute",
            Invocation::new("fslmaths")
                .input("in_file")
                .arg("-abs")
                .output("out_file"),
            vec![OutputSpec::new("out_file", "abs_copes.nii.gz")],
        );

        let randomise = builder.tool(
            "randomise",
            Invocation::new("randomise")
                .arg("-i")
                .input("in_file")
                .arg("-o")
                .arg("tfce")
                .arg("-m")
                .input("mask_file")
                .arg("-1")
                .arg("-T")
                .arg("-n")
                .arg(config.n_perms.to_string())
                .arg(format!("--seed={}", config.seed)),
            vec![
                OutputSpec::new("t_corrected_p_files", "tfce_tfce_corrp_tstat*.nii.gz"),
                OutputSpec::new("tstat_files", "tfce_tstat*.nii.gz"),
            ],
        );

        routes.push(Route { input: "t_corrected_p_files", subdir: "randomise" });
        routes.push(Route { input: "tstat_files", subdir: "randomise" });
        Some((absolute, randomise))
    } else {
        None
    };

    let sink = builder.sink("datasink", output_dir, routes);

    builder.wire(source, "copes", merge_copes, "in_files");
    builder.wire(source, "varcopes", merge_varcopes, "in_files");
    builder.wire(merge_copes, "merged_file", flame, "cope_file");
    builder.wire(merge_varcopes, "merged_file", flame, "var_cope_file");
    builder.wire(source, "mask", flame, "mask_file");
    builder.wire(mat, "design_file", flame, "design_file");
    builder.wire(con, "design_file", flame, "tcon_file");
    builder.wire(grp, "design_file", flame, "group_file");
    builder.wire(flame, "pes", sink, "pes");
    builder.wire(flame, "tstats", sink, "tstats");
    builder.wire(flame, "zstats", sink, "zstats");
    builder.wire(flame, "zfstats", sink, "zfstats");

    if let Some((absolute, randomise)) = permutation {
        builder.wire(merge_copes, "merged_file", absolute, "in_file");
        builder.wire(absolute, "out_file", randomise, "in_file");
        builder.wire(source, "mask", randomise, "mask_file");
        builder.wire(randomise, "t_corrected_p_files", sink, "t_corrected_p_files");
        builder.wire(randomise, "tstat_files", sink, "tstat_files");
    }

    builder
        .finish()
        .map_err(|e| BidsGlmError::Assembly(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;

    fn inputs(n: usize) -> GroupInputs {
        GroupInputs {
            copes: (0..n)
                .map(|i| Utf8PathBuf::from(format!("/out/sub-{i:02}/copes/cope1.nii.gz")))
                .collect(),
            varcopes: (0..n)
                .map(|i| Utf8PathBuf::from(format!("/out/sub-{i:02}/varcopes/varcope1.nii.gz")))
                .collect(),
            mask: Utf8PathBuf::from("/masks/group.nii.gz"),
        }
    }

    #[test]
    fn randomise_node_present_iff_requested() {
        let mut config = AnalysisConfig::defaults(TaskId::Msit).config_group;
        let base = Utf8Path::new("/out/group_level");

        let with = assemble(TaskId::Msit, None, 1, &inputs(4), &config, base).unwrap();
        assert!(with.invokes("randomise"));
        assert!(with.invokes("flameo"));

        config.randomise = false;
        let without = assemble(TaskId::Msit, None, 1, &inputs(4), &config, base).unwrap();
        assert!(!without.invokes("randomise"));
        assert!(without.invokes("flameo"));
        assert_eq!(without.node_count(), with.node_count() - 2);
    }

    #[test]
    fn cope_varcope_mismatch_is_rejected() {
        let config = AnalysisConfig::defaults(TaskId::Msit).config_group;
        let mut bad = inputs(4);
        bad.varcopes.pop();

        let err = assemble(TaskId::Msit, None, 1, &bad, &config, Utf8Path::new("/out")).unwrap_err();
        assert!(matches!(
            err,
            BidsGlmError::Assembly(_, PipelineError::CopeCountMismatch { copes: 4, varcopes: 3 })
        ));
    }

    #[test]
    fn empty_cope_list_is_rejected() {
        let config = AnalysisConfig::defaults(TaskId::Msit).config_group;
        let err = assemble(TaskId::Msit, None, 1, &inputs(0), &config, Utf8Path::new("/out")).unwrap_err();
        assert!(matches!(err, BidsGlmError::Assembly(_, PipelineError::NoCopes)));
    }

    #[test]
    fn pipeline_is_named_after_task_and_cope() {
        let config = AnalysisConfig::defaults(TaskId::Stroop).config_group;
        let pipeline =
            assemble(TaskId::Stroop, Some("01"), 3, &inputs(2), &config, Utf8Path::new("/out")).unwrap();
        assert_eq!(pipeline.name(), "task_stroop_group_ses_01_cope3");
    }
}
