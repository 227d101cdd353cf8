// src/regression/model_matrix.rs
//
// Explicit design-matrix construction: a model is a named response plus an
// ordered list of terms, each mapping to one or more numeric columns. This
// decouples "what model" from "how it is solved" - the IRLS solver only ever
// sees a numeric matrix.

use ndarray::Array2;

use crate::design::SurveyDesign;
use crate::error::{EpiSvyError, Result};

/// One model term.
#[derive(Debug, Clone)]
pub enum Term {
    /// A numeric column entering the matrix as-is.
    Continuous(String),
    /// A categorical column dummy-coded against a chosen reference level.
    Categorical { column: String, reference: String },
}

impl Term {
    pub fn column(&self) -> &str {
        match self {
            Term::Continuous(c) => c,
            Term::Categorical { column, .. } => column,
        }
    }
}

/// Response + predictors, assembled builder-style.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub response: String,
    pub terms: Vec<Term>,
}

impl ModelSpec {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            terms: Vec::new(),
        }
    }

    pub fn continuous(mut self, column: &str) -> Self {
        self.terms.push(Term::Continuous(column.to_string()));
        self
    }

    pub fn categorical(mut self, column: &str, reference: &str) -> Self {
        self.terms.push(Term::Categorical {
            column: column.to_string(),
            reference: reference.to_string(),
        });
        self
    }

    /// Same predictors against a different response; used for side-by-side
    /// fits over alternate outcome columns.
    pub fn with_response(&self, response: &str) -> Self {
        Self {
            response: response.to_string(),
            terms: self.terms.clone(),
        }
    }
}

/// Numeric model frame over the design's in-domain, complete-case rows.
#[derive(Debug, Clone)]
pub struct ModelMatrix {
    /// n_used x p predictor matrix, intercept first.
    pub x: Array2<f64>,
    pub y: Vec<f64>,
    pub weights: Vec<f64>,
    /// Table row behind each model row; keeps score rows alignable with the
    /// design for the variance pass.
    pub rows: Vec<usize>,
    /// Column labels: "(Intercept)", then term columns in order.
    pub labels: Vec<String>,
    pub n_excluded: usize,
}

enum TermData {
    Continuous {
        label: String,
        values: Vec<Option<f64>>,
    },
    Categorical {
        labels: Vec<String>,
        /// Non-reference levels, in sorted order, paired with the row labels.
        levels: Vec<String>,
        values: Vec<Option<String>>,
    },
}

impl TermData {
    fn width(&self) -> usize {
        match self {
            TermData::Continuous { .. } => 1,
            TermData::Categorical { levels, .. } => levels.len(),
        }
    }

    fn is_missing(&self, row: usize) -> bool {
        match self {
            TermData::Continuous { values, .. } => values[row].is_none(),
            TermData::Categorical { values, .. } => values[row].is_none(),
        }
    }
}

/// Build the numeric model frame for `spec` over `design`.
///
/// Rows are kept when the response and every term column are present
/// (complete case per model); the dropped count is logged. The response must
/// be coded 0/1. A categorical reference level must occur in the data.
pub fn build_model_matrix(design: &SurveyDesign, spec: &ModelSpec) -> Result<ModelMatrix> {
    let n_rows = design.n_rows();
    let response = design.numeric_column(&spec.response)?;

    let mut term_data: Vec<TermData> = Vec::with_capacity(spec.terms.len());
    for term in &spec.terms {
        match term {
            Term::Continuous(column) => term_data.push(TermData::Continuous {
                label: column.clone(),
                values: design.numeric_column(column)?,
            }),
            Term::Categorical { column, reference } => {
                let values = design.categorical_column(column)?;
                let observed = design.levels_of(column)?;
                if !observed.iter().any(|l| l == reference) {
                    return Err(EpiSvyError::ReferenceLevelNotFound {
                        column: column.clone(),
                        level: reference.clone(),
                    });
                }
                let levels: Vec<String> =
                    observed.into_iter().filter(|l| l != reference).collect();
                let labels = levels
                    .iter()
                    .map(|l| format!("{}[{}]", column, l))
                    .collect();
                term_data.push(TermData::Categorical {
                    labels,
                    levels,
                    values,
                });
            }
        }
    }

    let mut rows = Vec::new();
    let mut n_excluded = 0usize;
    for i in 0..n_rows {
        if !design.is_active(i) {
            continue;
        }
        let missing = response[i].is_none() || term_data.iter().any(|t| t.is_missing(i));
        if missing {
            n_excluded += 1;
        } else {
            rows.push(i);
        }
    }
    if n_excluded > 0 {
        log::debug!(
            "model {}: excluded {} incomplete row(s)",
            spec.response,
            n_excluded
        );
    }

    let p = 1 + term_data.iter().map(TermData::width).sum::<usize>();
    let n_used = rows.len();

    let mut labels = Vec::with_capacity(p);
    labels.push(String::from("(Intercept)"));
    for t in &term_data {
        match t {
            TermData::Continuous { label, .. } => labels.push(label.clone()),
            TermData::Categorical { labels: ls, .. } => labels.extend(ls.iter().cloned()),
        }
    }

    let mut x = Array2::<f64>::zeros((n_used, p));
    let mut y = Vec::with_capacity(n_used);
    let mut weights = Vec::with_capacity(n_used);
    let design_weights = design.weights();

    for (k, &i) in rows.iter().enumerate() {
        let yv = response[i].expect("complete-case row");
        if yv != 0.0 && yv != 1.0 {
            return Err(EpiSvyError::NonBinaryResponse {
                column: spec.response.clone(),
                value: yv,
                row: i,
            });
        }
        y.push(yv);
        weights.push(design_weights[i]);

        x[[k, 0]] = 1.0;
        let mut j = 1usize;
        for t in &term_data {
            match t {
                TermData::Continuous { values, .. } => {
                    x[[k, j]] = values[i].expect("complete-case row");
                    j += 1;
                }
                TermData::Categorical { levels, values, .. } => {
                    let v = values[i].as_deref().expect("complete-case row");
                    for level in levels {
                        x[[k, j]] = if v == level { 1.0 } else { 0.0 };
                        j += 1;
                    }
                }
            }
        }
    }

    Ok(ModelMatrix {
        x,
        y,
        weights,
        rows,
        labels,
        n_excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::build_design;
    use polars::prelude::*;

    fn table() -> DataFrame {
        df![
            "disability" => [1.0, 0.0, 1.0, 0.0, 1.0],
            "arthritis" => [1.0, 0.0, 1.0, 1.0, 0.0],
            "age_group" => ["65_74", "75_84", "65_74", "85_up", "75_84"],
            "w" => [1.0; 5],
        ]
        .unwrap()
    }

    #[test]
    fn intercept_and_dummy_layout() {
        let d = build_design(table(), "w", None, None).unwrap();
        let spec = ModelSpec::new("disability")
            .continuous("arthritis")
            .categorical("age_group", "65_74");
        let mm = build_model_matrix(&d, &spec).unwrap();

        assert_eq!(
            mm.labels,
            vec![
                "(Intercept)",
                "arthritis",
                "age_group[75_84]",
                "age_group[85_up]"
            ]
        );
        assert_eq!(mm.x.dim(), (5, 4));
        // Row 1 is a 75_84 non-arthritic
        assert_eq!(mm.x[[1, 0]], 1.0);
        assert_eq!(mm.x[[1, 1]], 0.0);
        assert_eq!(mm.x[[1, 2]], 1.0);
        assert_eq!(mm.x[[1, 3]], 0.0);
    }

    #[test]
    fn missing_reference_level_is_an_error() {
        let d = build_design(table(), "w", None, None).unwrap();
        let spec = ModelSpec::new("disability").categorical("age_group", "under_65");
        let err = build_model_matrix(&d, &spec).unwrap_err();
        assert!(matches!(err, EpiSvyError::ReferenceLevelNotFound { .. }));
    }

    #[test]
    fn non_binary_response_is_an_error() {
        let t = df![
            "y" => [0.0, 2.0],
            "x" => [0.0, 1.0],
            "w" => [1.0; 2],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let spec = ModelSpec::new("y").continuous("x");
        let err = build_model_matrix(&d, &spec).unwrap_err();
        assert!(matches!(err, EpiSvyError::NonBinaryResponse { .. }));
    }

    #[test]
    fn incomplete_rows_are_dropped_and_counted() {
        let t = df![
            "y" => vec![Some(1.0), Some(0.0), None, Some(1.0)],
            "x" => vec![Some(1.0), None, Some(0.0), Some(1.0)],
            "w" => [1.0; 4],
        ]
        .unwrap();
        let d = build_design(t, "w", None, None).unwrap();
        let spec = ModelSpec::new("y").continuous("x");
        let mm = build_model_matrix(&d, &spec).unwrap();
        assert_eq!(mm.rows, vec![0, 3]);
        assert_eq!(mm.n_excluded, 2);
    }
}
