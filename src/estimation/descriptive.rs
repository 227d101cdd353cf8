// src/estimation/descriptive.rs
//
// Weighted descriptive estimation (means, totals, proportions) with
// design-based variance from the linearization pass, over the whole sample or
// over domains. Missing values on the analysis column are excluded from that
// one statistic only; the count of exclusions is logged so sample-size
// discrepancies stay explainable.

use polars::prelude::*;
use rayon::prelude::*;

use crate::design::SurveyDesign;
use crate::dist::{t_quantile, two_sided_p_t};
use crate::error::Result;
use crate::estimation::linearization::linearized_variance;

/// Design-based uncertainty attached to a point estimate. Absent entirely
/// when the design cannot support a variance (single effective cluster,
/// non-positive degrees of freedom); absence is the visible "undefined"
/// branch, never a NaN standing in for a number.
#[derive(Debug, Clone, Copy)]
pub struct VarianceEstimate {
    pub variance: f64,
    pub std_error: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub p_value: f64,
    pub df: i64,
    /// Design effect: design-based variance over the with-replacement SRS
    /// variance of the same estimator.
    pub deff: f64,
}

#[derive(Debug, Clone)]
pub struct EstimateResult {
    pub estimate: f64,
    pub uncertainty: Option<VarianceEstimate>,
    pub n: usize,
    pub n_excluded: usize,
}

impl EstimateResult {
    /// Interval at an arbitrary confidence level using the stored df.
    pub fn confidence_interval(&self, level: f64) -> Option<(f64, f64)> {
        let u = self.uncertainty.as_ref()?;
        let t = t_quantile(0.5 + level / 2.0, u.df as f64);
        Some((
            self.estimate - t * u.std_error,
            self.estimate + t * u.std_error,
        ))
    }

    /// Single-row result table.
    pub fn to_frame(&self, label: &str) -> DataFrame {
        let u = self.uncertainty.as_ref();
        df![
            "term" => [label],
            "estimate" => [self.estimate],
            "std_error" => [u.map(|u| u.std_error)],
            "ci_low" => [u.map(|u| u.ci_low)],
            "ci_high" => [u.map(|u| u.ci_high)],
            "p_value" => [u.map(|u| u.p_value)],
            "df" => [u.map(|u| u.df)],
            "n" => [self.n as u32],
            "deff" => [u.map(|u| u.deff)],
        ]
        .expect("columns share one length")
    }
}

/// Outcome of one domain's estimate: an explicit branch per group rather
/// than a silently skipped entry.
#[derive(Debug, Clone)]
pub enum DomainOutcome {
    Estimated(EstimateResult),
    Undefined { reason: String },
}

#[derive(Debug, Clone)]
pub struct DomainEstimate {
    pub group: String,
    pub outcome: DomainOutcome,
}

/// Per-domain estimates of one column, keyed by the grouping level.
#[derive(Debug, Clone)]
pub struct DomainTable {
    pub column: String,
    pub group_by: String,
    pub domains: Vec<DomainEstimate>,
}

impl DomainTable {
    pub fn to_frame(&self) -> DataFrame {
        let mut groups = Vec::new();
        let mut estimates: Vec<Option<f64>> = Vec::new();
        let mut ses: Vec<Option<f64>> = Vec::new();
        let mut ci_los: Vec<Option<f64>> = Vec::new();
        let mut ci_his: Vec<Option<f64>> = Vec::new();
        let mut ps: Vec<Option<f64>> = Vec::new();
        let mut dfs: Vec<Option<i64>> = Vec::new();
        let mut ns: Vec<Option<u32>> = Vec::new();
        let mut deffs: Vec<Option<f64>> = Vec::new();
        let mut notes: Vec<Option<String>> = Vec::new();

        for d in &self.domains {
            groups.push(d.group.clone());
            match &d.outcome {
                DomainOutcome::Estimated(r) => {
                    let u = r.uncertainty.as_ref();
                    estimates.push(Some(r.estimate));
                    ses.push(u.map(|u| u.std_error));
                    ci_los.push(u.map(|u| u.ci_low));
                    ci_his.push(u.map(|u| u.ci_high));
                    ps.push(u.map(|u| u.p_value));
                    dfs.push(u.map(|u| u.df));
                    ns.push(Some(r.n as u32));
                    deffs.push(u.map(|u| u.deff));
                    notes.push(if u.is_none() {
                        Some(String::from("variance undefined"))
                    } else {
                        None
                    });
                }
                DomainOutcome::Undefined { reason } => {
                    estimates.push(None);
                    ses.push(None);
                    ci_los.push(None);
                    ci_his.push(None);
                    ps.push(None);
                    dfs.push(None);
                    ns.push(None);
                    deffs.push(None);
                    notes.push(Some(reason.clone()));
                }
            }
        }

        df![
            "group" => groups,
            "estimate" => estimates,
            "std_error" => ses,
            "ci_low" => ci_los,
            "ci_high" => ci_his,
            "p_value" => ps,
            "df" => dfs,
            "n" => ns,
            "deff" => deffs,
            "note" => notes,
        ]
        .expect("columns share one length")
    }

    /// Rows contributing to any estimated domain.
    pub fn total_n(&self) -> usize {
        self.domains
            .iter()
            .map(|d| match &d.outcome {
                DomainOutcome::Estimated(r) => r.n + r.n_excluded,
                DomainOutcome::Undefined { .. } => 0,
            })
            .sum()
    }
}

enum Statistic {
    Mean,
    Total,
}

/// Weighted mean of a numeric column with linearized variance.
///
/// The point estimate is the ratio sum(w x) / sum(w); its linearized residual
/// is u_i = w_i (x_i - estimate) / sum(w). Returns `Ok(None)` when the domain
/// holds no usable rows.
pub fn weighted_mean(design: &SurveyDesign, column: &str) -> Result<Option<EstimateResult>> {
    estimate(design, column, Statistic::Mean)
}

/// Weighted total of a numeric column. The linearized score of a total is
/// the raw weighted contribution w_i x_i.
pub fn weighted_total(design: &SurveyDesign, column: &str) -> Result<Option<EstimateResult>> {
    estimate(design, column, Statistic::Total)
}

fn estimate(
    design: &SurveyDesign,
    column: &str,
    statistic: Statistic,
) -> Result<Option<EstimateResult>> {
    let xs = design.numeric_column(column)?;
    let weights = design.weights();
    let n_rows = design.n_rows();

    let mut used: Vec<(usize, f64, f64)> = Vec::new();
    let mut n_excluded = 0usize;
    for i in 0..n_rows {
        if !design.is_active(i) {
            continue;
        }
        match xs[i] {
            Some(x) => used.push((i, x, weights[i])),
            None => n_excluded += 1,
        }
    }
    if n_excluded > 0 {
        log::debug!(
            "{}: excluded {} row(s) with missing values",
            column,
            n_excluded
        );
    }
    if used.is_empty() {
        log::warn!("{}: no usable rows in domain", column);
        return Ok(None);
    }

    let sum_w: f64 = used.iter().map(|&(_, _, w)| w).sum();
    let sum_wx: f64 = used.iter().map(|&(_, x, w)| w * x).sum();
    let point = match statistic {
        Statistic::Mean => sum_wx / sum_w,
        Statistic::Total => sum_wx,
    };

    let mut scores = vec![0.0_f64; n_rows];
    for &(i, x, w) in &used {
        scores[i] = match statistic {
            Statistic::Mean => w * (x - point) / sum_w,
            Statistic::Total => w * x,
        };
    }

    let uncertainty = variance_for(design, &scores, &used, sum_w, point, &statistic);

    Ok(Some(EstimateResult {
        estimate: point,
        uncertainty,
        n: used.len(),
        n_excluded,
    }))
}

fn variance_for(
    design: &SurveyDesign,
    scores: &[f64],
    used: &[(usize, f64, f64)],
    sum_w: f64,
    point: f64,
    statistic: &Statistic,
) -> Option<VarianceEstimate> {
    let df = design.degrees_of_freedom();
    if df <= 0 || design.effective_clusters() < 2 || used.len() < 2 {
        log::warn!("variance undefined: fewer than two effective clusters in domain");
        return None;
    }

    let (variance, _diag) = linearized_variance(scores, design);
    let std_error = variance.max(0.0).sqrt();
    let t = t_quantile(0.975, df as f64);
    let p_value = if std_error > 0.0 {
        two_sided_p_t(point / std_error, df as f64)
    } else {
        f64::NAN
    };

    let srs = srs_variance(used, sum_w, statistic);
    let deff = if srs > 0.0 { variance / srs } else { f64::NAN };

    Some(VarianceEstimate {
        variance,
        std_error,
        ci_low: point - t * std_error,
        ci_high: point + t * std_error,
        p_value,
        df,
        deff,
    })
}

/// With-replacement SRS variance of the same estimator, the DEFF baseline.
fn srs_variance(used: &[(usize, f64, f64)], sum_w: f64, statistic: &Statistic) -> f64 {
    let n = used.len() as f64;
    if n < 2.0 {
        return f64::NAN;
    }
    let mu: f64 = used.iter().map(|&(_, x, w)| (w / sum_w) * x).sum();
    let ss: f64 = used
        .iter()
        .map(|&(_, x, w)| (w / sum_w) * (x - mu).powi(2))
        .sum();
    let s2 = (n / (n - 1.0)) * ss;
    match statistic {
        Statistic::Mean => s2 / n,
        Statistic::Total => sum_w.powi(2) * s2 / n,
    }
}

/// Level estimate for a categorical (or 0/1) column.
#[derive(Debug, Clone)]
pub struct LevelEstimate {
    pub level: String,
    pub result: EstimateResult,
}

/// Weighted proportion of each level of `column`: the weighted mean of the
/// per-level indicator. Rows missing on `column` are excluded from every
/// level's estimate.
pub fn proportions(design: &SurveyDesign, column: &str) -> Result<Vec<LevelEstimate>> {
    let labels = design.categorical_column(column)?;
    let levels = design.levels_of(column)?;
    let weights = design.weights();
    let n_rows = design.n_rows();

    let mut out = Vec::with_capacity(levels.len());
    for level in levels {
        let mut used: Vec<(usize, f64, f64)> = Vec::new();
        let mut n_excluded = 0usize;
        for i in 0..n_rows {
            if !design.is_active(i) {
                continue;
            }
            match &labels[i] {
                Some(l) => {
                    let ind = if *l == level { 1.0 } else { 0.0 };
                    used.push((i, ind, weights[i]));
                }
                None => n_excluded += 1,
            }
        }
        if used.is_empty() {
            continue;
        }
        let sum_w: f64 = used.iter().map(|&(_, _, w)| w).sum();
        let point: f64 = used.iter().map(|&(_, x, w)| w * x).sum::<f64>() / sum_w;

        let mut scores = vec![0.0_f64; n_rows];
        for &(i, x, w) in &used {
            scores[i] = w * (x - point) / sum_w;
        }
        let uncertainty = variance_for(design, &scores, &used, sum_w, point, &Statistic::Mean);

        out.push(LevelEstimate {
            level,
            result: EstimateResult {
                estimate: point,
                uncertainty,
                n: used.len(),
                n_excluded,
            },
        });
    }
    Ok(out)
}

/// Render level estimates as a result table.
pub fn proportions_frame(column: &str, levels: &[LevelEstimate]) -> DataFrame {
    let mut table = DomainTable {
        column: column.to_string(),
        group_by: String::from("level"),
        domains: Vec::new(),
    };
    for l in levels {
        table.domains.push(DomainEstimate {
            group: l.level.clone(),
            outcome: DomainOutcome::Estimated(l.result.clone()),
        });
    }
    table.to_frame()
}

/// Weighted mean of `column` within each level of `group_by`.
///
/// Every level present in the domain appears in the output with an explicit
/// outcome; a level whose rows are all missing on `column` is carried as
/// `Undefined` and noted at warn level, never dropped silently and never
/// fatal to its siblings. Domains are independent read-only restrictions, so
/// they are estimated in parallel.
pub fn by_domain(design: &SurveyDesign, column: &str, group_by: &str) -> Result<DomainTable> {
    let levels = design.levels_of(group_by)?;

    let domains: Vec<DomainEstimate> = levels
        .par_iter()
        .map(|level| {
            let outcome = match design
                .subset_where(group_by, level)
                .and_then(|sub| weighted_mean(&sub, column))
            {
                Ok(Some(result)) => DomainOutcome::Estimated(result),
                Ok(None) => {
                    log::warn!("domain {}={}: no usable rows", group_by, level);
                    DomainOutcome::Undefined {
                        reason: String::from("no usable rows"),
                    }
                }
                Err(e) => {
                    log::warn!("domain {}={}: {}", group_by, level, e);
                    DomainOutcome::Undefined {
                        reason: e.to_string(),
                    }
                }
            };
            DomainEstimate {
                group: level.clone(),
                outcome,
            }
        })
        .collect();

    Ok(DomainTable {
        column: column.to_string(),
        group_by: group_by.to_string(),
        domains,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::build_design;
    use approx::assert_relative_eq;

    fn srs_table() -> DataFrame {
        df![
            "x" => [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0],
            "w" => [1.0; 8],
            "grp" => ["a", "a", "a", "a", "b", "b", "b", "b"],
        ]
        .unwrap()
    }

    #[test]
    fn srs_mean_and_variance_match_classical_values() {
        let d = build_design(srs_table(), "w", None, None).unwrap();
        let r = weighted_mean(&d, "x").unwrap().unwrap();
        assert_relative_eq!(r.estimate, 5.0, epsilon = 1e-12);

        // Classical variance of the mean: s^2 / n
        let s2 = [2.0_f64, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .map(|x| (x - 5.0_f64).powi(2))
            .sum::<f64>()
            / 7.0;
        let u = r.uncertainty.unwrap();
        assert_relative_eq!(u.variance, s2 / 8.0, max_relative = 1e-9);
        assert_relative_eq!(u.deff, 1.0, max_relative = 1e-9);
        assert!(u.ci_low < r.estimate && r.estimate < u.ci_high);
    }

    #[test]
    fn weighting_moves_the_mean() {
        let t = df![
            "x" => [0.0, 1.0],
            "w" => [1.0, 3.0],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let r = weighted_mean(&d, "x").unwrap().unwrap();
        assert_relative_eq!(r.estimate, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn total_scales_with_weights() {
        let t = df![
            "x" => [1.0, 2.0, 3.0],
            "w" => [2.0, 2.0, 2.0],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let r = weighted_total(&d, "x").unwrap().unwrap();
        assert_relative_eq!(r.estimate, 12.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_values_excluded_per_statistic() {
        let t = df![
            "x" => vec![Some(1.0), None, Some(3.0), Some(5.0)],
            "w" => [1.0; 4],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let r = weighted_mean(&d, "x").unwrap().unwrap();
        assert_eq!(r.n, 3);
        assert_eq!(r.n_excluded, 1);
        assert_relative_eq!(r.estimate, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_domain_reports_none() {
        let d = build_design(srs_table(), "w", None, None).unwrap();
        let sub = d.subset_where("grp", "zzz").unwrap();
        assert!(weighted_mean(&sub, "x").unwrap().is_none());
    }

    #[test]
    fn domains_partition_the_sample() {
        let d = build_design(srs_table(), "w", None, None).unwrap();
        let table = by_domain(&d, "x", "grp").unwrap();
        assert_eq!(table.domains.len(), 2);
        assert_eq!(table.total_n(), d.n_active());

        for dom in &table.domains {
            match &dom.outcome {
                DomainOutcome::Estimated(r) => assert_eq!(r.n, 4),
                DomainOutcome::Undefined { .. } => panic!("both domains estimable"),
            }
        }
    }

    #[test]
    fn proportions_sum_to_one() {
        let d = build_design(srs_table(), "w", None, None).unwrap();
        let props = proportions(&d, "grp").unwrap();
        let total: f64 = props.iter().map(|p| p.result.estimate).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn single_cluster_domain_has_undefined_variance() {
        let t = df![
            "x" => [1.0, 2.0, 3.0, 4.0],
            "w" => [1.0; 4],
            "psu" => ["c1", "c1", "c2", "c2"],
            "grp" => ["a", "a", "b", "b"],
        ]
        .unwrap();
        let d = build_design(t, "w", None, Some("psu")).unwrap();
        let sub = d.subset_where("grp", "a").unwrap();
        let r = weighted_mean(&sub, "x").unwrap().unwrap();
        assert_relative_eq!(r.estimate, 1.5, epsilon = 1e-12);
        assert!(r.uncertainty.is_none());
    }

    #[test]
    fn result_frame_has_semantic_columns() {
        let d = build_design(srs_table(), "w", None, None).unwrap();
        let r = weighted_mean(&d, "x").unwrap().unwrap();
        let frame = r.to_frame("x");
        for col in [
            "term",
            "estimate",
            "std_error",
            "ci_low",
            "ci_high",
            "p_value",
            "df",
            "n",
        ] {
            assert!(frame.column(col).is_ok(), "missing column {}", col);
        }
    }
}
