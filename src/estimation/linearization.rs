// src/estimation/linearization.rs
//
// First-order Taylor linearization of design-based sampling variance.
//
// Any differentiable statistic expressed as a weighted sum of per-unit
// contributions has its sampling covariance approximated by the covariance of
// its linearized scores: scores are totaled within each cluster, centered on
// the stratum mean of cluster totals, and the centered cross products are
// summed over strata with the (n_h / (n_h - 1)) with-replacement scaling,
// where n_h counts clusters (not rows) in stratum h.

use ndarray::{Array1, Array2, ArrayView2};

use crate::design::SurveyDesign;

/// What the variance pass observed about the design. Strata with a single
/// cluster cannot contribute a variance term; they are counted here rather
/// than silently absorbed, and the design degrees of freedom
/// (clusters - strata) already reflect the loss.
#[derive(Debug, Clone, Copy)]
pub struct LinearizationDiag {
    pub strata: u32,
    pub clusters: u32,
    pub singleton_strata: u32,
}

/// Covariance matrix of a vector-valued statistic from its per-unit score
/// rows. `scores` must have one row per table row (zero rows for units
/// outside the current domain) and one column per statistic component.
///
/// # Panics
/// Panics if the score row count does not match the design's table.
pub fn linearized_covariance(
    scores: ArrayView2<f64>,
    design: &SurveyDesign,
) -> (Array2<f64>, LinearizationDiag) {
    let n = scores.nrows();
    let p = scores.ncols();
    assert_eq!(
        n,
        design.n_rows(),
        "score rows must match the design's table"
    );

    let n_clusters = design.n_clusters() as usize;
    let n_strata = design.n_strata() as usize;
    let cluster_idx = design.cluster_idx();
    let strata_idx = design.strata_idx();

    // Total scores within each cluster; record which stratum owns it.
    let mut cluster_totals = Array2::<f64>::zeros((n_clusters, p));
    let mut cluster_stratum = vec![u32::MAX; n_clusters];
    for i in 0..n {
        let c = cluster_idx[i] as usize;
        cluster_stratum[c] = strata_idx[i];
        for j in 0..p {
            cluster_totals[[c, j]] += scores[[i, j]];
        }
    }

    let mut clusters_in: Vec<Vec<usize>> = vec![Vec::new(); n_strata];
    for (c, &h) in cluster_stratum.iter().enumerate() {
        if h != u32::MAX {
            clusters_in[h as usize].push(c);
        }
    }

    let mut cov = Array2::<f64>::zeros((p, p));
    let mut singleton_strata = 0u32;
    let mut centered = Array1::<f64>::zeros(p);

    for members in &clusters_in {
        let n_h = members.len();
        if n_h == 0 {
            continue;
        }
        if n_h == 1 {
            singleton_strata += 1;
            continue;
        }

        let mut mean = Array1::<f64>::zeros(p);
        for &c in members {
            for j in 0..p {
                mean[j] += cluster_totals[[c, j]];
            }
        }
        mean.mapv_inplace(|v| v / n_h as f64);

        let scale = n_h as f64 / (n_h as f64 - 1.0);
        for &c in members {
            for j in 0..p {
                centered[j] = cluster_totals[[c, j]] - mean[j];
            }
            for j in 0..p {
                for k in j..p {
                    cov[[j, k]] += scale * centered[j] * centered[k];
                }
            }
        }
    }

    // Mirror the upper triangle
    for j in 0..p {
        for k in 0..j {
            cov[[j, k]] = cov[[k, j]];
        }
    }

    if let Some(fpc) = design.fpc() {
        cov.mapv_inplace(|v| v * fpc);
    }

    if singleton_strata > 0 {
        log::debug!(
            "{} singleton stratum(s) contributed no variance term",
            singleton_strata
        );
    }

    let diag = LinearizationDiag {
        strata: design.n_strata(),
        clusters: design.n_clusters(),
        singleton_strata,
    };
    (cov, diag)
}

/// Scalar convenience wrapper over [`linearized_covariance`].
pub fn linearized_variance(scores: &[f64], design: &SurveyDesign) -> (f64, LinearizationDiag) {
    let view = ArrayView2::from_shape((scores.len(), 1), scores)
        .expect("contiguous score slice views as a column");
    let (cov, diag) = linearized_covariance(view, design);
    (cov[[0, 0]], diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::build_design;
    use approx::assert_relative_eq;
    use polars::prelude::*;

    #[test]
    fn unstratified_element_design_matches_classical_form() {
        // One cluster per row, one stratum: n/(n-1) * sum (u - u_bar)^2
        let t = df!["w" => [1.0, 1.0, 1.0, 1.0]].unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let u = [0.1, -0.2, 0.05, 0.05];
        let (var, diag) = linearized_variance(&u, &d);

        let ubar: f64 = u.iter().sum::<f64>() / 4.0;
        let expected: f64 = (4.0 / 3.0) * u.iter().map(|v| (v - ubar).powi(2)).sum::<f64>();
        assert_relative_eq!(var, expected, epsilon = 1e-12);
        assert_eq!(diag.singleton_strata, 0);
        assert_eq!(diag.clusters, 4);
    }

    #[test]
    fn stratified_variance_sums_over_strata() {
        let t = df![
            "w" => [1.0; 6],
            "h" => ["a", "a", "a", "b", "b", "b"],
        ]
        .unwrap();
        let whole = build_design(t.clone(), "w", Some("h"), None).unwrap();
        let u = [0.3, -0.1, 0.2, -0.4, 0.1, 0.25];
        let (var, _) = linearized_variance(&u, &whole);

        let part = |vals: &[f64]| -> f64 {
            let m = vals.iter().sum::<f64>() / vals.len() as f64;
            (vals.len() as f64 / (vals.len() as f64 - 1.0))
                * vals.iter().map(|v| (v - m).powi(2)).sum::<f64>()
        };
        assert_relative_eq!(var, part(&u[..3]) + part(&u[3..]), epsilon = 1e-12);
    }

    #[test]
    fn rows_pool_into_cluster_totals() {
        // Two rows per cluster: totals drive the variance, not rows.
        let t = df![
            "w" => [1.0; 4],
            "psu" => ["c1", "c1", "c2", "c2"],
        ]
        .unwrap();
        let d = build_design(t, "w", None, Some("psu")).unwrap();
        let u = [0.1, 0.2, -0.05, -0.25];
        let (var, diag) = linearized_variance(&u, &d);

        // Cluster totals are [0.3, -0.3] with mean 0; scale is 2/1.
        let totals = [0.3_f64, -0.3];
        let expected: f64 = 2.0 * totals.iter().map(|v| v * v).sum::<f64>();
        assert_relative_eq!(var, expected, epsilon = 1e-12);
        assert_eq!(diag.clusters, 2);
    }

    #[test]
    fn singleton_stratum_contributes_zero_and_is_counted() {
        let t = df![
            "w" => [1.0; 4],
            "h" => ["a", "a", "a", "b"],
        ]
        .unwrap();
        let d = build_design(t, "w", Some("h"), None).unwrap();
        let u = [0.3, -0.1, 0.2, 5.0];
        let (var, diag) = linearized_variance(&u, &d);

        let m = (0.3 - 0.1 + 0.2) / 3.0;
        let expected: f64 = (3.0 / 2.0)
            * [0.3_f64, -0.1, 0.2]
                .iter()
                .map(|v| (v - m).powi(2))
                .sum::<f64>();
        assert_relative_eq!(var, expected, epsilon = 1e-12);
        assert_eq!(diag.singleton_strata, 1);
    }

    #[test]
    fn covariance_matrix_is_symmetric() {
        let t = df!["w" => [1.0; 5]].unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let scores =
            Array2::from_shape_vec((5, 2), vec![0.1, 0.4, -0.2, 0.3, 0.05, -0.6, 0.1, 0.2, -0.05, -0.3])
                .unwrap();
        let (cov, _) = linearized_covariance(scores.view(), &d);
        assert_relative_eq!(cov[[0, 1]], cov[[1, 0]], epsilon = 1e-14);
        assert!(cov[[0, 0]] >= 0.0 && cov[[1, 1]] >= 0.0);
    }

    #[test]
    fn fpc_scales_the_matrix() {
        let t = df!["w" => [1.0; 4]].unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let d_fpc = d.clone().with_fpc(0.5);
        let u = [0.1, -0.2, 0.05, 0.05];
        let (v0, _) = linearized_variance(&u, &d);
        let (v1, _) = linearized_variance(&u, &d_fpc);
        assert_relative_eq!(v1, 0.5 * v0, epsilon = 1e-14);
    }
}
