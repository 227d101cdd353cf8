// src/regression/glm.rs
//
// Survey-weighted quasi-binomial regression (logit link), fitted by
// iteratively reweighted least squares. The model-based covariance from the
// final IRLS step is reported for reference, but the covariance of record is
// the design-based sandwich: (X'WX)^-1 V (X'WX)^-1, where V is the
// linearized covariance of the summed score contributions
// w_i (y_i - mu_i) x_i under the design's strata and clusters. The sandwich
// absorbs overdispersion, so the Pearson dispersion is reported alongside
// rather than folded in.

use ndarray::{Array1, Array2};

use crate::design::SurveyDesign;
use crate::dist::{t_quantile, two_sided_p_t};
use crate::error::{EpiSvyError, Result};
use crate::estimation::linearization::linearized_covariance;
use crate::regression::model_matrix::{build_model_matrix, ModelSpec};

const MU_FLOOR: f64 = 1.0e-10;

/// IRLS controls. Defaults: tolerance 1e-8 on the max absolute coefficient
/// change, 25 iterations, divergence flagged past |beta| = 15 on the logit
/// scale (an odds ratio above 3 million; fitted probabilities pinned within
/// ~3e-7 of 0 or 1).
#[derive(Debug, Clone, Copy)]
pub struct GlmOptions {
    pub tol: f64,
    pub max_iter: usize,
    pub separation_threshold: f64,
}

impl Default for GlmOptions {
    fn default() -> Self {
        Self {
            tol: 1.0e-8,
            max_iter: 25,
            separation_threshold: 15.0,
        }
    }
}

/// A fitted model. Created once per call and immutable after return;
/// downstream metrics only read it.
#[derive(Debug, Clone)]
pub struct GlmFit {
    pub terms: Vec<String>,
    pub coefficients: Vec<f64>,
    /// Design-based sandwich covariance; the covariance of record.
    pub cov_sandwich: Array2<f64>,
    /// Naive model-based covariance, scaled by the Pearson dispersion.
    pub cov_model: Array2<f64>,
    /// Pearson chi-square over residual df.
    pub dispersion: f64,
    pub deviance: f64,
    pub null_deviance: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Design degrees of freedom (clusters - strata).
    pub df: i64,
    pub n: usize,
    pub n_excluded: usize,
}

impl GlmFit {
    pub fn term_index(&self, term: &str) -> Option<usize> {
        self.terms.iter().position(|t| t == term)
    }

    pub fn coefficient(&self, term: &str) -> Result<f64> {
        let j = self.require_term(term)?;
        Ok(self.coefficients[j])
    }

    /// Standard error from the sandwich covariance diagonal.
    pub fn std_error(&self, term: &str) -> Result<f64> {
        let j = self.require_term(term)?;
        Ok(self.cov_sandwich[[j, j]].max(0.0).sqrt())
    }

    fn require_term(&self, term: &str) -> Result<usize> {
        self.term_index(term).ok_or_else(|| EpiSvyError::UnknownTerm {
            term: term.to_string(),
        })
    }

    /// Wald coefficient table: Student-t reference at the design df.
    pub fn to_frame(&self) -> polars::prelude::DataFrame {
        use polars::prelude::*;

        let p = self.terms.len();
        let mut ses = Vec::with_capacity(p);
        let mut ci_lo = Vec::with_capacity(p);
        let mut ci_hi = Vec::with_capacity(p);
        let mut pvals = Vec::with_capacity(p);
        let t_crit = if self.df > 0 {
            t_quantile(0.975, self.df as f64)
        } else {
            f64::NAN
        };
        for j in 0..p {
            let se = self.cov_sandwich[[j, j]].max(0.0).sqrt();
            let b = self.coefficients[j];
            ses.push(se);
            ci_lo.push(b - t_crit * se);
            ci_hi.push(b + t_crit * se);
            pvals.push(if se > 0.0 && self.df > 0 {
                two_sided_p_t(b / se, self.df as f64)
            } else {
                f64::NAN
            });
        }

        df![
            "term" => self.terms.clone(),
            "estimate" => self.coefficients.clone(),
            "std_error" => ses,
            "ci_low" => ci_lo,
            "ci_high" => ci_hi,
            "p_value" => pvals,
            "df" => vec![self.df; p],
        ]
        .expect("columns share one length")
    }
}

/// Fit `spec` on `design` by weighted IRLS with a design-based covariance.
///
/// Restricted (subset) designs reuse the same solver; a domain with fewer
/// effective clusters than coefficients plus one is refused rather than
/// returning an ill-conditioned fit. Non-convergence and separation are
/// errors carrying the last iterate, never a silently returned poor fit.
pub fn fit_weighted_glm(
    design: &SurveyDesign,
    spec: &ModelSpec,
    options: &GlmOptions,
) -> Result<GlmFit> {
    let mm = build_model_matrix(design, spec)?;
    let n = mm.y.len();
    let p = mm.labels.len();

    let effective = effective_clusters(design, &mm.rows);
    if n < p + 1 || effective < p + 1 {
        return Err(EpiSvyError::insufficient(
            format!("glm fit of {}", spec.response),
            p + 1,
            effective.min(n),
        ));
    }

    // Intercept-only start at the weighted log-odds of the response.
    let sum_w: f64 = mm.weights.iter().sum();
    let ybar = (mm
        .y
        .iter()
        .zip(mm.weights.iter())
        .map(|(&y, &w)| w * y)
        .sum::<f64>()
        / sum_w)
        .clamp(1.0e-6, 1.0 - 1.0e-6);
    let mut beta = Array1::<f64>::zeros(p);
    beta[0] = (ybar / (1.0 - ybar)).ln();

    let mut eta = Array1::<f64>::zeros(n);
    let mut mu = Array1::<f64>::zeros(n);
    let mut iterations = 0usize;
    let mut converged = false;
    let mut last_change = f64::INFINITY;

    while iterations < options.max_iter {
        iterations += 1;

        eta.assign(&mm.x.dot(&beta));
        for i in 0..n {
            mu[i] = inv_logit(eta[i]);
        }

        // Weighted normal equations with working weights w mu (1 - mu) and
        // working response eta + (y - mu) / (mu (1 - mu)).
        let mut xtwx = Array2::<f64>::zeros((p, p));
        let mut xtwz = Array1::<f64>::zeros(p);
        for i in 0..n {
            let v = mu[i] * (1.0 - mu[i]);
            let ww = mm.weights[i] * v;
            let z = eta[i] + (mm.y[i] - mu[i]) / v;
            for j in 0..p {
                let xij = mm.x[[i, j]];
                xtwz[j] += ww * z * xij;
                for k in j..p {
                    xtwx[[j, k]] += ww * xij * mm.x[[i, k]];
                }
            }
        }
        for j in 0..p {
            for k in 0..j {
                xtwx[[j, k]] = xtwx[[k, j]];
            }
        }

        let beta_new = solve_linear_system(&xtwx, &xtwz, "weighted normal equations")?;
        let delta = beta_new
            .iter()
            .zip(beta.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        beta = beta_new;
        last_change = delta;

        let (worst, worst_abs) = beta
            .iter()
            .enumerate()
            .map(|(j, b)| (j, b.abs()))
            .fold((0, 0.0), |acc, v| if v.1 > acc.1 { v } else { acc });
        if worst_abs > options.separation_threshold {
            return Err(EpiSvyError::Separation {
                term: mm.labels[worst].clone(),
                coefficient: beta[worst],
                iterations,
            });
        }

        log::debug!(
            "irls iteration {}: max coefficient change {:e}",
            iterations,
            delta
        );
        if delta < options.tol {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(EpiSvyError::ConvergenceFailure {
            iterations,
            last_change,
            last_beta: beta.to_vec(),
        });
    }

    // Final state for dispersion, deviance and the covariance pair.
    eta.assign(&mm.x.dot(&beta));
    for i in 0..n {
        mu[i] = inv_logit(eta[i]);
    }

    let mut pearson = 0.0_f64;
    let mut deviance = 0.0_f64;
    let mut null_deviance = 0.0_f64;
    let mu0 = ybar;
    for i in 0..n {
        let v = mu[i] * (1.0 - mu[i]);
        let r = mm.y[i] - mu[i];
        pearson += mm.weights[i] * r * r / v;
        deviance += binomial_deviance(mm.y[i], mu[i], mm.weights[i]);
        null_deviance += binomial_deviance(mm.y[i], mu0, mm.weights[i]);
    }
    let resid_df = (n - p) as f64;
    let dispersion = if resid_df > 0.0 {
        pearson / resid_df
    } else {
        f64::NAN
    };

    let mut xtwx = Array2::<f64>::zeros((p, p));
    for i in 0..n {
        let ww = mm.weights[i] * mu[i] * (1.0 - mu[i]);
        for j in 0..p {
            for k in j..p {
                xtwx[[j, k]] += ww * mm.x[[i, j]] * mm.x[[i, k]];
            }
        }
    }
    for j in 0..p {
        for k in 0..j {
            xtwx[[j, k]] = xtwx[[k, j]];
        }
    }
    let bread = invert(&xtwx, "information matrix")?;

    // Score residuals aligned with the full table; rows outside the model
    // frame contribute zero, keeping cluster totals design-consistent.
    let mut scores = Array2::<f64>::zeros((design.n_rows(), p));
    for (k, &row) in mm.rows.iter().enumerate() {
        let u = mm.weights[k] * (mm.y[k] - mu[k]);
        for j in 0..p {
            scores[[row, j]] = u * mm.x[[k, j]];
        }
    }
    let (meat, diag) = linearized_covariance(scores.view(), design);
    let cov_sandwich = bread.dot(&meat).dot(&bread);
    let cov_model = bread.mapv(|v| v * dispersion);

    if diag.singleton_strata > 0 {
        log::warn!(
            "{} singleton stratum(s) in variance pass for {}",
            diag.singleton_strata,
            spec.response
        );
    }

    Ok(GlmFit {
        terms: mm.labels,
        coefficients: beta.to_vec(),
        cov_sandwich,
        cov_model,
        dispersion,
        deviance,
        null_deviance,
        iterations,
        converged,
        df: design.degrees_of_freedom(),
        n,
        n_excluded: mm.n_excluded,
    })
}

fn inv_logit(eta: f64) -> f64 {
    let mu = 1.0 / (1.0 + (-eta).exp());
    mu.clamp(MU_FLOOR, 1.0 - MU_FLOOR)
}

/// Unit deviance for binary y, weighted.
fn binomial_deviance(y: f64, mu: f64, w: f64) -> f64 {
    let ll = if y > 0.5 { mu.ln() } else { (1.0 - mu).ln() };
    -2.0 * w * ll
}

fn effective_clusters(design: &SurveyDesign, rows: &[usize]) -> usize {
    let cluster_idx = design.cluster_idx();
    let mut seen = vec![false; design.n_clusters() as usize];
    for &i in rows {
        seen[cluster_idx[i] as usize] = true;
    }
    seen.iter().filter(|&&s| s).count()
}

/// Solve Ax = b by Gaussian elimination with partial pivoting.
fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>, context: &'static str) -> Result<Array1<f64>> {
    let n = a.nrows();
    let mut aug = Array2::<f64>::zeros((n, n + 1));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n]] = b[i];
    }
    eliminate(&mut aug, n, 1, context)?;
    back_substitute_one(&aug, n)
}

/// Invert a symmetric positive-definite matrix via elimination on [A | I].
fn invert(a: &Array2<f64>, context: &'static str) -> Result<Array2<f64>> {
    let n = a.nrows();
    let mut aug = Array2::<f64>::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }
    eliminate(&mut aug, n, n, context)?;

    let mut inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        for i in (0..n).rev() {
            let mut sum = aug[[i, n + col]];
            for j in (i + 1)..n {
                sum -= aug[[i, j]] * inv[[j, col]];
            }
            inv[[i, col]] = sum / aug[[i, i]];
        }
    }
    Ok(inv)
}

/// Forward elimination with partial pivoting over an n x (n + extra)
/// augmented matrix.
fn eliminate(aug: &mut Array2<f64>, n: usize, extra: usize, context: &'static str) -> Result<()> {
    let width = n + extra;
    for k in 0..n {
        let mut max_val = aug[[k, k]].abs();
        let mut max_row = k;
        for i in (k + 1)..n {
            let val = aug[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_row = i;
            }
        }
        if max_val < 1.0e-10 {
            return Err(EpiSvyError::Singular { context });
        }
        if max_row != k {
            for j in 0..width {
                let tmp = aug[[k, j]];
                aug[[k, j]] = aug[[max_row, j]];
                aug[[max_row, j]] = tmp;
            }
        }
        for i in (k + 1)..n {
            let factor = aug[[i, k]] / aug[[k, k]];
            for j in k..width {
                aug[[i, j]] -= factor * aug[[k, j]];
            }
        }
    }
    Ok(())
}

fn back_substitute_one(aug: &Array2<f64>, n: usize) -> Result<Array1<f64>> {
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = aug[[i, n]];
        for j in (i + 1)..n {
            sum -= aug[[i, j]] * x[j];
        }
        x[i] = sum / aug[[i, i]];
    }
    Ok(x)
}
