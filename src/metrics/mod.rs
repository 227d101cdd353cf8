// src/metrics/mod.rs
//
// Epidemiological quantities derived from fitted models and descriptive
// estimates. Uncertainty is always propagated from the upstream covariance
// (delta method on the log scale where the scale is multiplicative); nothing
// here re-estimates variance from raw data.

use polars::prelude::*;
use rayon::prelude::*;

use crate::design::SurveyDesign;
use crate::dist::{normal_quantile, two_sided_p_z};
use crate::error::Result;
use crate::estimation::descriptive::EstimateResult;
use crate::regression::{fit_weighted_glm, GlmFit, GlmOptions, ModelSpec};

/// A derived quantity with a propagated 95% interval and Wald p-value.
#[derive(Debug, Clone)]
pub struct DerivedMetric {
    pub term: String,
    pub value: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub p_value: f64,
}

impl DerivedMetric {
    pub fn to_frame(&self, label: &str) -> DataFrame {
        df![
            "term" => [self.term.as_str()],
            "metric" => [label],
            "estimate" => [self.value],
            "ci_low" => [self.ci_low],
            "ci_high" => [self.ci_high],
            "p_value" => [self.p_value],
        ]
        .expect("columns share one length")
    }
}

/// Odds ratio for a model term: exp(beta) with the interval computed on the
/// log scale from the sandwich standard error, then exponentiated. The
/// resulting interval is deliberately asymmetric around the point estimate;
/// a symmetric OR-scale interval would be wrong.
pub fn odds_ratio(fit: &GlmFit, term: &str) -> Result<DerivedMetric> {
    let (b, se) = log_scale(fit, term)?;
    let z = normal_quantile(0.975);
    Ok(DerivedMetric {
        term: term.to_string(),
        value: b.exp(),
        ci_low: (b - z * se).exp(),
        ci_high: (b + z * se).exp(),
        p_value: wald_p(b, se),
    })
}

/// Annual percent change from the coefficient of a continuous year term:
/// exp(beta_year) - 1, intervals transformed endpoint-wise. Crude or
/// adjusted is the caller's choice of ModelSpec; a crude trend is only a
/// summary, the adjusted fit is the interpretable one.
pub fn annual_percent_change(fit: &GlmFit, year_term: &str) -> Result<DerivedMetric> {
    let (b, se) = log_scale(fit, year_term)?;
    let z = normal_quantile(0.975);
    Ok(DerivedMetric {
        term: year_term.to_string(),
        value: b.exp() - 1.0,
        ci_low: (b - z * se).exp() - 1.0,
        ci_high: (b + z * se).exp() - 1.0,
        p_value: wald_p(b, se),
    })
}

fn log_scale(fit: &GlmFit, term: &str) -> Result<(f64, f64)> {
    let b = fit.coefficient(term)?;
    let se = fit.std_error(term)?;
    Ok((b, se))
}

fn wald_p(b: f64, se: f64) -> f64 {
    if se > 0.0 {
        two_sided_p_z(b / se)
    } else {
        f64::NAN
    }
}

/// Population attributable fraction under the odds-ratio-for-relative-risk
/// approximation: p (OR - 1) / (1 + p (OR - 1)), with p the weighted
/// exposure prevalence.
///
/// The approximation overstates the fraction when the outcome is not rare;
/// only the point value is computed, and no exactness is claimed. The
/// upstream prevalence and odds ratio keep their own intervals.
#[derive(Debug, Clone, Copy)]
pub struct AttributableFraction {
    pub value: f64,
    pub exposure_prevalence: f64,
    pub odds_ratio: f64,
}

pub fn population_attributable_fraction(
    prevalence: &EstimateResult,
    or: &DerivedMetric,
) -> AttributableFraction {
    let p = prevalence.estimate;
    let excess = p * (or.value - 1.0);
    AttributableFraction {
        value: excess / (1.0 + excess),
        exposure_prevalence: p,
        odds_ratio: or.value,
    }
}

/// One alternate-outcome fit in a sensitivity comparison; failures are
/// carried as rows, not dropped.
#[derive(Debug, Clone)]
pub enum SensitivityOutcome {
    Fitted(DerivedMetric),
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SensitivityRow {
    pub outcome: String,
    pub result: SensitivityOutcome,
}

#[derive(Debug, Clone)]
pub struct SensitivityComparison {
    pub exposure_term: String,
    pub rows: Vec<SensitivityRow>,
}

impl SensitivityComparison {
    pub fn to_frame(&self) -> DataFrame {
        let mut outcomes = Vec::new();
        let mut ors: Vec<Option<f64>> = Vec::new();
        let mut ci_los: Vec<Option<f64>> = Vec::new();
        let mut ci_his: Vec<Option<f64>> = Vec::new();
        let mut ps: Vec<Option<f64>> = Vec::new();
        let mut notes: Vec<Option<String>> = Vec::new();

        for row in &self.rows {
            outcomes.push(row.outcome.clone());
            match &row.result {
                SensitivityOutcome::Fitted(m) => {
                    ors.push(Some(m.value));
                    ci_los.push(Some(m.ci_low));
                    ci_his.push(Some(m.ci_high));
                    ps.push(Some(m.p_value));
                    notes.push(None);
                }
                SensitivityOutcome::Failed { reason } => {
                    ors.push(None);
                    ci_los.push(None);
                    ci_his.push(None);
                    ps.push(None);
                    notes.push(Some(reason.clone()));
                }
            }
        }

        df![
            "outcome" => outcomes,
            "odds_ratio" => ors,
            "ci_low" => ci_los,
            "ci_high" => ci_his,
            "p_value" => ps,
            "note" => notes,
        ]
        .expect("columns share one length")
    }
}

/// Refit the same adjusted model against each alternate outcome column and
/// collect the exposure odds ratio per outcome. Fits are independent and run
/// in parallel; a failed alternate (separation, too few clusters) becomes an
/// explicit row and never aborts its siblings.
pub fn sensitivity_comparison(
    design: &SurveyDesign,
    spec: &ModelSpec,
    exposure_term: &str,
    outcomes: &[&str],
    options: &GlmOptions,
) -> SensitivityComparison {
    let rows: Vec<SensitivityRow> = outcomes
        .par_iter()
        .map(|outcome| {
            let alt_spec = spec.with_response(outcome);
            let result = match fit_weighted_glm(design, &alt_spec, options)
                .and_then(|fit| odds_ratio(&fit, exposure_term))
            {
                Ok(metric) => SensitivityOutcome::Fitted(metric),
                Err(e) => {
                    log::warn!("sensitivity fit for {}: {}", outcome, e);
                    SensitivityOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            SensitivityRow {
                outcome: outcome.to_string(),
                result,
            }
        })
        .collect();

    SensitivityComparison {
        exposure_term: exposure_term.to_string(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::build_design;
    use crate::estimation::weighted_mean;
    use approx::assert_relative_eq;

    fn fit_example() -> GlmFit {
        let t = df![
            "y" => [1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            "x" => [1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            "w" => [1.2, 0.8, 1.0, 1.5, 0.9, 1.1, 0.7, 1.3, 1.0, 1.0, 0.6, 1.4],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let spec = ModelSpec::new("y").continuous("x");
        fit_weighted_glm(&d, &spec, &GlmOptions::default()).unwrap()
    }

    #[test]
    fn odds_ratio_interval_brackets_and_is_asymmetric() {
        let fit = fit_example();
        let or = odds_ratio(&fit, "x").unwrap();
        assert!(or.ci_low < or.value && or.value < or.ci_high);

        let below = or.value - or.ci_low;
        let above = or.ci_high - or.value;
        assert!((below - above).abs() > 1e-9, "log-scale interval is not symmetric on the OR scale");
        assert_relative_eq!(
            or.value,
            fit.coefficient("x").unwrap().exp(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn apc_is_coefficient_on_percent_scale() {
        let fit = fit_example();
        let apc = annual_percent_change(&fit, "x").unwrap();
        assert_relative_eq!(
            apc.value,
            fit.coefficient("x").unwrap().exp() - 1.0,
            epsilon = 1e-12
        );
        assert!(apc.ci_low < apc.value && apc.value < apc.ci_high);
    }

    #[test]
    fn paf_is_zero_at_null_and_monotone_in_or() {
        let prev = EstimateResult {
            estimate: 0.4,
            uncertainty: None,
            n: 100,
            n_excluded: 0,
        };
        let metric = |or: f64| DerivedMetric {
            term: String::from("x"),
            value: or,
            ci_low: or,
            ci_high: or,
            p_value: 1.0,
        };

        let null = population_attributable_fraction(&prev, &metric(1.0));
        assert_relative_eq!(null.value, 0.0, epsilon = 1e-12);

        let mut last = 0.0;
        for or in [1.2, 1.5, 2.0, 3.0, 5.0] {
            let paf = population_attributable_fraction(&prev, &metric(or)).value;
            assert!(paf > last, "PAF must increase with OR");
            last = paf;
        }
        assert!(last < 1.0);
    }

    #[test]
    fn paf_closed_form() {
        let prev = EstimateResult {
            estimate: 0.25,
            uncertainty: None,
            n: 10,
            n_excluded: 0,
        };
        let or = DerivedMetric {
            term: String::from("x"),
            value: 2.0,
            ci_low: 1.5,
            ci_high: 2.7,
            p_value: 0.01,
        };
        let paf = population_attributable_fraction(&prev, &or);
        assert_relative_eq!(paf.value, 0.25 / 1.25, epsilon = 1e-12);
    }

    #[test]
    fn sensitivity_rows_survive_sibling_failure() {
        let t = df![
            "y1" => [1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            // y2 is perfectly predicted by x: this fit must fail alone
            "y2" => [1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            "x" =>  [1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            "w" => [1.0; 12],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let spec = ModelSpec::new("y1").continuous("x");
        let cmp = sensitivity_comparison(&d, &spec, "x", &["y1", "y2"], &GlmOptions::default());

        assert_eq!(cmp.rows.len(), 2);
        let y1 = cmp.rows.iter().find(|r| r.outcome == "y1").unwrap();
        let y2 = cmp.rows.iter().find(|r| r.outcome == "y2").unwrap();
        assert!(matches!(y1.result, SensitivityOutcome::Fitted(_)));
        assert!(matches!(y2.result, SensitivityOutcome::Failed { .. }));

        let frame = cmp.to_frame();
        assert_eq!(frame.height(), 2);
    }

    #[test]
    fn paf_from_estimated_prevalence() {
        let t = df![
            "exposed" => [1.0, 0.0, 1.0, 0.0, 0.0],
            "w" => [1.0; 5],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let prev = weighted_mean(&d, "exposed").unwrap().unwrap();
        assert_relative_eq!(prev.estimate, 0.4, epsilon = 1e-12);

        let or = DerivedMetric {
            term: String::from("exposed"),
            value: 1.8,
            ci_low: 1.1,
            ci_high: 2.9,
            p_value: 0.02,
        };
        let paf = population_attributable_fraction(&prev, &or);
        assert_relative_eq!(paf.value, 0.4 * 0.8 / (1.0 + 0.4 * 0.8), epsilon = 1e-12);
    }
}
