//! Rendering of FEAT design files.
//!
//! The first-level design is written as a `design.fsf` plus the custom EV
//! timing files it references, ready for `feat_model` to expand into
//! `design.mat`/`design.con`. The group design is the intercept-only
//! matrix/contrast/group trio consumed directly by `flameo`.

use crate::contrast::Contrast;
use crate::error::DesignError;
use crate::model::SubjectInfo;

/// Rendered file set: names paired with contents. The primary file
/// (`design.fsf` or `design.mat`) always comes first.
pub type RenderedFiles = Vec<(String, String)>;

/// Render the first-level design for one run.
///
/// Task conditions become custom three-column EVs convolved with the
/// double-gamma HRF plus its temporal derivative; nuisance regressors
/// become unconvolved one-entry-per-volume EVs. Contrasts are written in
/// real units with zero weight on every derivative and nuisance column,
/// and prewhitening is requested.
pub fn first_level_design(
    info: &SubjectInfo,
    tr: f64,
    high_pass: f64,
    contrasts: &[Contrast],
) -> Result<RenderedFiles, DesignError> {
    let npts = info.n_timepoints();
    if npts == 0 {
        return Err(DesignError::NoTimepoints);
    }

    let n_cond = info.conditions.len();
    let n_reg = info.regressors.len();
    let evs_orig = n_cond + n_reg;
    // Each task EV carries a temporal derivative column.
    let evs_real = 2 * n_cond + n_reg;

    let mut fsf = String::new();
    let mut line = |text: String| {
        fsf.push_str(&text);
        fsf.push('\n');
    };

    line("set fmri(version) 6.00".to_string());
    line("set fmri(level) 1".to_string());
    line("set fmri(analysis) 2".to_string());
    line("set fmri(inputtype) 2".to_string());
    line(format!("set fmri(tr) {tr:.6}"));
    line(format!("set fmri(npts) {npts}"));
    line("set fmri(ndelete) 0".to_string());
    line("set fmri(temphp_yn) 1".to_string());
    line(format!("set fmri(paradigm_hp) {high_pass:.6}"));
    line("set fmri(prewhiten_yn) 1".to_string());
    line(format!("set fmri(evs_orig) {evs_orig}"));
    line(format!("set fmri(evs_real) {evs_real}"));
    line("set fmri(evs_vox) 0".to_string());
    line(format!("set fmri(ncon_orig) {}", contrasts.len()));
    line(format!("set fmri(ncon_real) {}", contrasts.len()));
    line("set fmri(nftests_orig) 0".to_string());
    line("set fmri(nftests_real) 0".to_string());
    line("set fmri(con_mode_old) real".to_string());
    line("set fmri(con_mode) real".to_string());

    let mut files: RenderedFiles = Vec::new();

    for (ix, condition) in info.conditions.iter().enumerate() {
        let ev = ix + 1;
        let file_name = format!("ev_{}.txt", sanitize(&condition.name));

        line(format!("set fmri(evtitle{ev}) \"{}\"", condition.name));
        line(format!("set fmri(shape{ev}) 3"));
        line(format!("set fmri(convolve{ev}) 3"));
        line(format!("set fmri(convolve_phase{ev}) 0"));
        line(format!("set fmri(tempfilt_yn{ev}) 1"));
        line(format!("set fmri(deriv_yn{ev}) 1"));
        line(format!("set fmri(custom{ev}) \"{file_name}\""));

        let mut contents = String::new();
        for ((onset, duration), amplitude) in condition
            .onsets
            .iter()
            .zip(&condition.durations)
            .zip(&condition.amplitudes)
        {
            contents.push_str(&format!("{onset:.6}\t{duration:.6}\t{amplitude:.6}\n"));
        }
        files.push((file_name, contents));
    }

    for (ix, name) in info.regressor_names.iter().enumerate() {
        let ev = n_cond + ix + 1;
        let file_name = format!("conf_{}.txt", sanitize(name));

        line(format!("set fmri(evtitle{ev}) \"{name}\""));
        line(format!("set fmri(shape{ev}) 2"));
        line(format!("set fmri(convolve{ev}) 0"));
        line(format!("set fmri(convolve_phase{ev}) 0"));
        line(format!("set fmri(tempfilt_yn{ev}) 1"));
        line(format!("set fmri(deriv_yn{ev}) 0"));
        line(format!("set fmri(custom{ev}) \"{file_name}\""));

        let mut contents = String::new();
        for value in &info.regressors[ix] {
            contents.push_str(&format!("{value:.6}\n"));
        }
        files.push((file_name, contents));
    }

    // FEAT expects the full orthogonalisation grid even when unused.
    for ev in 1..=evs_orig {
        for other in 0..=evs_orig {
            line(format!("set fmri(ortho{ev}.{other}) 0"));
        }
    }

    for (cx, contrast) in contrasts.iter().enumerate() {
        let con = cx + 1;
        line(format!("set fmri(conpic_real.{con}) 1"));
        line(format!("set fmri(conname_real.{con}) \"{}\"", contrast.name));

        let mut weights = vec![0.0; evs_real];
        for (condition, weight) in contrast.conditions.iter().zip(&contrast.weights) {
            let ix = info
                .conditions
                .iter()
                .position(|c| &c.name == condition)
                .ok_or_else(|| DesignError::UnknownCondition {
                    contrast: contrast.name.clone(),
                    condition: condition.clone(),
                })?;
            // Real columns interleave each task EV with its derivative.
            weights[2 * ix] = *weight;
        }
        for (col, weight) in weights.iter().enumerate() {
            line(format!("set fmri(con_real{con}.{}) {weight}", col + 1));
        }
    }

    files.insert(0, ("design.fsf".to_string(), fsf));
    Ok(files)
}

/// Render the one-sample group design for `n` input images: an
/// intercept-only design matrix, a single "group mean" contrast, and one
/// variance group covering everybody.
pub fn group_design(n: usize) -> Result<RenderedFiles, DesignError> {
    if n == 0 {
        return Err(DesignError::NoTimepoints);
    }

    let mut mat = String::new();
    mat.push_str("/NumWaves 1\n");
    mat.push_str(&format!("/NumPoints {n}\n"));
    mat.push_str("/PPheights 1.000000\n");
    mat.push_str("/Matrix\n");
    for _ in 0..n {
        mat.push_str("1.000000\n");
    }

    let mut con = String::new();
    con.push_str("/ContrastName1 group mean\n");
    con.push_str("/NumWaves 1\n");
    con.push_str("/NumContrasts 1\n");
    con.push_str("/PPheights 1.000000\n");
    con.push_str("/Matrix\n");
    con.push_str("1.000000\n");

    let mut grp = String::new();
    grp.push_str("/NumWaves 1\n");
    grp.push_str(&format!("/NumPoints {n}\n"));
    grp.push_str("/Matrix\n");
    for _ in 0..n {
        grp.push_str("1\n");
    }

    Ok(vec![
        ("design.mat".to_string(), mat),
        ("design.con".to_string(), con),
        ("design.grp".to_string(), grp),
    ])
}

/// Condition and regressor names become file names; keep them shell-safe.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contrast::{Stat, contrasts};
    use crate::contrast::TaskId;
    use crate::model::Condition;

    fn info() -> SubjectInfo {
        SubjectInfo {
            conditions: vec![
                Condition {
                    name: "Congruent".to_string(),
                    onsets: vec![4.0, 7.0],
                    durations: vec![2.0, 2.0],
                    amplitudes: vec![1.0, 1.0],
                },
                Condition {
                    name: "Incongruent".to_string(),
                    onsets: vec![1.0],
                    durations: vec![2.0],
                    amplitudes: vec![1.0],
                },
            ],
            regressor_names: vec!["trans_x".to_string()],
            regressors: vec![vec![0.1, 0.2, 0.3]],
            filled_rows: 0,
        }
    }

    #[test]
    fn fsf_declares_evs_and_prewhitening() {
        let files = first_level_design(&info(), 2.0, 187.0, &contrasts(TaskId::Msit)).unwrap();
        let (name, fsf) = &files[0];

        assert_eq!(name, "design.fsf");
        assert!(fsf.contains("set fmri(npts) 3"));
        assert!(fsf.contains("set fmri(tr) 2.000000"));
        assert!(fsf.contains("set fmri(paradigm_hp) 187.000000"));
        assert!(fsf.contains("set fmri(prewhiten_yn) 1"));
        // Two task EVs plus one nuisance EV; derivatives double the task EVs.
        assert!(fsf.contains("set fmri(evs_orig) 3"));
        assert!(fsf.contains("set fmri(evs_real) 5"));
        assert!(fsf.contains("set fmri(ncon_real) 3"));
    }

    #[test]
    fn task_evs_are_convolved_and_nuisance_evs_are_not() {
        let files = first_level_design(&info(), 2.0, 187.0, &contrasts(TaskId::Msit)).unwrap();
        let fsf = &files[0].1;

        assert!(fsf.contains("set fmri(evtitle1) \"Congruent\""));
        assert!(fsf.contains("set fmri(shape1) 3"));
        assert!(fsf.contains("set fmri(convolve1) 3"));
        assert!(fsf.contains("set fmri(deriv_yn1) 1"));

        assert!(fsf.contains("set fmri(evtitle3) \"trans_x\""));
        assert!(fsf.contains("set fmri(shape3) 2"));
        assert!(fsf.contains("set fmri(convolve3) 0"));
        assert!(fsf.contains("set fmri(deriv_yn3) 0"));
    }

    #[test]
    fn contrast_weights_land_on_real_columns() {
        let files = first_level_design(&info(), 2.0, 187.0, &contrasts(TaskId::Msit)).unwrap();
        let fsf = &files[0].1;

        // Congruent > Incongruent: +1 on column 1, -1 on column 3 (the
        // derivative columns 2 and 4 and the nuisance column 5 stay zero).
        assert!(fsf.contains("set fmri(con_real3.1) 1"));
        assert!(fsf.contains("set fmri(con_real3.2) 0"));
        assert!(fsf.contains("set fmri(con_real3.3) -1"));
        assert!(fsf.contains("set fmri(con_real3.4) 0"));
        assert!(fsf.contains("set fmri(con_real3.5) 0"));
    }

    #[test]
    fn ev_files_accompany_the_fsf() {
        let files = first_level_design(&info(), 2.0, 187.0, &contrasts(TaskId::Msit)).unwrap();

        let ev: &str = &files
            .iter()
            .find(|(name, _)| name == "ev_Congruent.txt")
            .unwrap()
            .1;
        assert_eq!(ev, "4.000000\t2.000000\t1.000000\n7.000000\t2.000000\t1.000000\n");

        let conf: &str = &files
            .iter()
            .find(|(name, _)| name == "conf_trans_x.txt")
            .unwrap()
            .1;
        assert_eq!(conf.lines().count(), 3);
    }

    #[test]
    fn unknown_contrast_condition_is_rejected() {
        let bad = vec![Contrast {
            name: "missing".to_string(),
            stat: Stat::T,
            conditions: vec!["Nope".to_string()],
            weights: vec![1.0],
        }];

        let err = first_level_design(&info(), 2.0, 187.0, &bad).unwrap_err();
        assert!(matches!(err, DesignError::UnknownCondition { condition, .. } if condition == "Nope"));
    }

    #[test]
    fn group_design_is_intercept_only() {
        let files = group_design(4).unwrap();

        let mat = &files[0].1;
        assert!(mat.contains("/NumWaves 1"));
        assert!(mat.contains("/NumPoints 4"));
        assert_eq!(mat.matches("1.000000\n").count(), 5);

        let con = &files[1].1;
        assert!(con.contains("/NumContrasts 1"));

        let grp = &files[2].1;
        assert_eq!(grp.lines().filter(|l| *l == "1").count(), 4);
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(group_design(0).is_err());
    }
}
