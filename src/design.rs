// src/design.rs

use std::collections::HashMap;
use std::sync::Arc;

use polars::prelude::*;

use crate::error::{EpiSvyError, Result};

/// Immutable description of a complex sampling design bound to an analysis
/// table.
///
/// The design owns the table (shared via `Arc`), the weight column, and the
/// optional stratification/clustering columns. Stratum and cluster labels are
/// reindexed to dense `u32` codes at construction; a missing strata column
/// means a single stratum, a missing cluster column means each row is its own
/// sampling unit.
///
/// A design carries an optional domain membership mask. `subset` composes
/// masks without copying the table, so a restricted design keeps every row
/// (with out-of-domain rows contributing zero linearized scores) and the full
/// stratum/cluster structure. Restricted designs are independent read-only
/// snapshots; they share nothing mutable and may be used from parallel
/// contexts freely.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    table: Arc<DataFrame>,
    weight_col: String,
    strata_col: Option<String>,
    cluster_col: Option<String>,
    fpc: Option<f64>,
    weights: Arc<Vec<f64>>,
    strata_idx: Arc<Vec<u32>>,
    cluster_idx: Arc<Vec<u32>>,
    stratum_labels: Arc<Vec<String>>,
    n_strata: u32,
    n_clusters: u32,
    mask: Option<Arc<Vec<bool>>>,
}

/// Validate a design specification against a table. Entry point for callers;
/// equivalent to [`SurveyDesign::new`].
pub fn build_design(
    table: DataFrame,
    weight_col: &str,
    strata_col: Option<&str>,
    cluster_col: Option<&str>,
) -> Result<SurveyDesign> {
    SurveyDesign::new(table, weight_col, strata_col, cluster_col)
}

impl SurveyDesign {
    pub fn new(
        table: DataFrame,
        weight_col: &str,
        strata_col: Option<&str>,
        cluster_col: Option<&str>,
    ) -> Result<Self> {
        let n = table.height();

        let weights = extract_weights(&table, weight_col)?;

        let (strata_idx, stratum_labels) = match strata_col {
            Some(col) => {
                let labels = extract_labels(&table, col)?;
                index_labels(&labels)
            }
            None => (vec![0u32; n], vec![String::from("_all")]),
        };
        let n_strata = stratum_labels.len() as u32;

        let (cluster_idx, cluster_labels) = match cluster_col {
            Some(col) => {
                let labels = extract_labels(&table, col)?;
                index_labels(&labels)
            }
            None => ((0..n as u32).collect(), Vec::new()),
        };
        let n_clusters = if cluster_col.is_some() {
            cluster_labels.len() as u32
        } else {
            n as u32
        };

        // A cluster drawn from two strata is a design inconsistency.
        if cluster_col.is_some() {
            let mut cluster_stratum: HashMap<u32, u32> = HashMap::new();
            for (&c, &h) in cluster_idx.iter().zip(strata_idx.iter()) {
                match cluster_stratum.get(&c) {
                    Some(&seen) if seen != h => {
                        return Err(EpiSvyError::ClusterSpansStrata {
                            cluster: cluster_labels[c as usize].clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        cluster_stratum.insert(c, h);
                    }
                }
            }
        }

        let mut stratum_weight = vec![0.0_f64; n_strata as usize];
        for (&w, &h) in weights.iter().zip(strata_idx.iter()) {
            stratum_weight[h as usize] += w;
        }
        for (h, &sum) in stratum_weight.iter().enumerate() {
            if sum <= 0.0 {
                return Err(EpiSvyError::ZeroWeightStratum {
                    stratum: stratum_labels[h].clone(),
                });
            }
        }

        log::debug!(
            "built design: {} rows, {} strata, {} clusters",
            n,
            n_strata,
            n_clusters
        );

        Ok(Self {
            table: Arc::new(table),
            weight_col: weight_col.to_string(),
            strata_col: strata_col.map(str::to_string),
            cluster_col: cluster_col.map(str::to_string),
            fpc: None,
            weights: Arc::new(weights),
            strata_idx: Arc::new(strata_idx),
            cluster_idx: Arc::new(cluster_idx),
            stratum_labels: Arc::new(stratum_labels),
            n_strata,
            n_clusters,
            mask: None,
        })
    }

    /// Attach a finite-population correction factor multiplying the
    /// first-stage variance. Off by default.
    pub fn with_fpc(mut self, factor: f64) -> Self {
        self.fpc = Some(factor);
        self
    }

    /// Restrict the design to rows where `mask` is true. Null mask entries
    /// count as false. The restriction composes with any existing one; an
    /// empty result is a valid (explicitly empty) design, not an error.
    pub fn subset(&self, mask: &BooleanChunked) -> Result<SurveyDesign> {
        let n = self.table.height();
        if mask.len() != n {
            return Err(EpiSvyError::MaskLengthMismatch {
                expected: n,
                found: mask.len(),
            });
        }
        let combined: Vec<bool> = match &self.mask {
            Some(current) => mask
                .iter()
                .zip(current.iter())
                .map(|(m, &c)| m.unwrap_or(false) && c)
                .collect(),
            None => mask.iter().map(|m| m.unwrap_or(false)).collect(),
        };
        let mut restricted = self.clone();
        restricted.mask = Some(Arc::new(combined));
        Ok(restricted)
    }

    /// Restrict to rows where a categorical column equals `value`.
    pub fn subset_where(&self, column: &str, value: &str) -> Result<SurveyDesign> {
        let labels = self.categorical_column(column)?;
        let mask: Vec<bool> = labels
            .iter()
            .map(|l| l.as_deref() == Some(value))
            .collect();
        let mask = BooleanChunked::from_slice("mask".into(), &mask);
        self.subset(&mask)
    }

    pub fn table(&self) -> &DataFrame {
        &self.table
    }

    pub fn weight_col(&self) -> &str {
        &self.weight_col
    }

    pub fn strata_col(&self) -> Option<&str> {
        self.strata_col.as_deref()
    }

    pub fn cluster_col(&self) -> Option<&str> {
        self.cluster_col.as_deref()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn strata_idx(&self) -> &[u32] {
        &self.strata_idx
    }

    pub fn cluster_idx(&self) -> &[u32] {
        &self.cluster_idx
    }

    pub fn n_strata(&self) -> u32 {
        self.n_strata
    }

    pub fn n_clusters(&self) -> u32 {
        self.n_clusters
    }

    pub fn fpc(&self) -> Option<f64> {
        self.fpc
    }

    pub fn n_rows(&self) -> usize {
        self.table.height()
    }

    /// True when row `i` belongs to the current domain.
    pub fn is_active(&self, i: usize) -> bool {
        match &self.mask {
            Some(m) => m[i],
            None => true,
        }
    }

    /// Number of rows in the current domain.
    pub fn n_active(&self) -> usize {
        match &self.mask {
            Some(m) => m.iter().filter(|&&b| b).count(),
            None => self.table.height(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_active() == 0
    }

    /// Design degrees of freedom: clusters minus strata over the full table.
    /// Domains inherit this value; their own cluster count only gates
    /// estimability.
    pub fn degrees_of_freedom(&self) -> i64 {
        self.n_clusters as i64 - self.n_strata as i64
    }

    /// Clusters containing at least one in-domain row.
    pub fn effective_clusters(&self) -> usize {
        match &self.mask {
            None => self.n_clusters as usize,
            Some(m) => {
                let mut seen = vec![false; self.n_clusters as usize];
                for (i, &active) in m.iter().enumerate() {
                    if active {
                        seen[self.cluster_idx[i] as usize] = true;
                    }
                }
                seen.iter().filter(|&&s| s).count()
            }
        }
    }

    /// Read a column as f64 values (integers and booleans are widened).
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let s = column_series(&self.table, name)?;
        let ca = s
            .cast(&DataType::Float64)
            .map_err(|_| EpiSvyError::NotNumeric {
                column: name.to_string(),
            })?;
        let ca = ca.f64().map_err(|_| EpiSvyError::NotNumeric {
            column: name.to_string(),
        })?;
        Ok(ca.iter().collect())
    }

    /// Read a column as string labels (numeric codes are formatted).
    pub fn categorical_column(&self, name: &str) -> Result<Vec<Option<String>>> {
        let s = column_series(&self.table, name)?;
        let ca = s
            .cast(&DataType::String)
            .map_err(|_| EpiSvyError::missing_column(name))?;
        let ca = ca.str().map_err(|_| EpiSvyError::missing_column(name))?;
        Ok(ca.iter().map(|v| v.map(str::to_string)).collect())
    }

    /// Sorted distinct levels of a column over in-domain, non-null rows.
    pub fn levels_of(&self, name: &str) -> Result<Vec<String>> {
        let labels = self.categorical_column(name)?;
        let mut levels: Vec<String> = labels
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_active(*i))
            .filter_map(|(_, l)| l.clone())
            .collect();
        levels.sort();
        levels.dedup();
        Ok(levels)
    }

    /// Label behind a dense stratum index, for diagnostics.
    pub fn stratum_label(&self, h: u32) -> &str {
        &self.stratum_labels[h as usize]
    }
}

fn column_series(table: &DataFrame, name: &str) -> Result<Series> {
    Ok(table
        .column(name)
        .map_err(|_| EpiSvyError::missing_column(name))?
        .as_materialized_series()
        .clone())
}

fn extract_weights(table: &DataFrame, weight_col: &str) -> Result<Vec<f64>> {
    let s = column_series(table, weight_col)?;
    let ca = s
        .cast(&DataType::Float64)
        .map_err(|_| EpiSvyError::NotNumeric {
            column: weight_col.to_string(),
        })?;
    let ca = ca.f64().map_err(|_| EpiSvyError::NotNumeric {
        column: weight_col.to_string(),
    })?;
    let mut weights = Vec::with_capacity(ca.len());
    for (row, v) in ca.iter().enumerate() {
        match v {
            Some(w) if w > 0.0 => weights.push(w),
            Some(w) => return Err(EpiSvyError::NonPositiveWeight { row, weight: w }),
            None => {
                return Err(EpiSvyError::NullDesignValue {
                    column: weight_col.to_string(),
                    row,
                })
            }
        }
    }
    Ok(weights)
}

fn extract_labels(table: &DataFrame, col: &str) -> Result<Vec<String>> {
    let s = column_series(table, col)?;
    let ca = s
        .cast(&DataType::String)
        .map_err(|_| EpiSvyError::missing_column(col))?;
    let ca = ca.str().map_err(|_| EpiSvyError::missing_column(col))?;
    let mut labels = Vec::with_capacity(ca.len());
    for (row, v) in ca.iter().enumerate() {
        match v {
            Some(l) => labels.push(l.to_string()),
            None => {
                return Err(EpiSvyError::NullDesignValue {
                    column: col.to_string(),
                    row,
                })
            }
        }
    }
    Ok(labels)
}

/// Dense reindexing of categorical labels, first-appearance order.
fn index_labels(labels: &[String]) -> (Vec<u32>, Vec<String>) {
    let mut map: HashMap<&str, u32> = HashMap::new();
    let mut distinct: Vec<String> = Vec::new();
    let indices = labels
        .iter()
        .map(|l| {
            *map.entry(l.as_str()).or_insert_with(|| {
                distinct.push(l.clone());
                (distinct.len() - 1) as u32
            })
        })
        .collect();
    (indices, distinct)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_table() -> DataFrame {
        df![
            "y" => [1.0, 0.0, 1.0, 1.0, 0.0, 0.0],
            "w" => [1.0, 1.5, 0.5, 1.0, 1.0, 1.0],
            "stratum" => ["a", "a", "a", "b", "b", "b"],
            "psu" => ["a1", "a1", "a2", "b1", "b2", "b2"],
            "grp" => ["x", "y", "x", "y", "x", "y"],
        ]
        .unwrap()
    }

    #[test]
    fn builds_and_indexes() {
        let d = build_design(toy_table(), "w", Some("stratum"), Some("psu")).unwrap();
        assert_eq!(d.n_strata(), 2);
        assert_eq!(d.n_clusters(), 4);
        assert_eq!(d.degrees_of_freedom(), 2);
        assert_eq!(d.n_active(), 6);
    }

    #[test]
    fn default_design_is_one_row_one_cluster() {
        let d = build_design(toy_table(), "w", None, None).unwrap();
        assert_eq!(d.n_strata(), 1);
        assert_eq!(d.n_clusters(), 6);
        assert_eq!(d.degrees_of_freedom(), 5);
    }

    #[test]
    fn rejects_non_positive_weight() {
        let t = df!["w" => [1.0, 0.0]].unwrap();
        let err = build_design(t, "w", None, None).unwrap_err();
        assert!(matches!(
            err,
            EpiSvyError::NonPositiveWeight { row: 1, .. }
        ));
    }

    #[test]
    fn rejects_missing_column() {
        let t = df!["w" => [1.0, 2.0]].unwrap();
        let err = build_design(t, "weight", None, None).unwrap_err();
        assert!(matches!(err, EpiSvyError::MissingColumn { .. }));
    }

    #[test]
    fn rejects_cluster_spanning_strata() {
        let t = df![
            "w" => [1.0, 1.0],
            "stratum" => ["a", "b"],
            "psu" => ["c1", "c1"],
        ]
        .unwrap();
        let err = build_design(t, "w", Some("stratum"), Some("psu")).unwrap_err();
        assert!(matches!(err, EpiSvyError::ClusterSpansStrata { .. }));
    }

    #[test]
    fn subset_composes_and_preserves_structure() {
        let d = build_design(toy_table(), "w", Some("stratum"), Some("psu")).unwrap();
        let sub = d.subset_where("grp", "x").unwrap();
        assert_eq!(sub.n_active(), 3);
        assert_eq!(sub.n_rows(), 6);
        assert_eq!(sub.n_clusters(), 4);
        // Composition with a second restriction
        let sub2 = sub.subset_where("stratum", "a").unwrap();
        assert_eq!(sub2.n_active(), 2);
        assert_eq!(sub2.effective_clusters(), 2);
    }

    #[test]
    fn empty_subset_is_explicit_not_error() {
        let d = build_design(toy_table(), "w", None, None).unwrap();
        let sub = d.subset_where("grp", "nonexistent").unwrap();
        assert!(sub.is_empty());
        assert_eq!(sub.n_active(), 0);
    }
}
