// src/error.rs

use thiserror::Error;

/// Unified error type for `episvy` operations.
#[derive(Debug, Error)]
pub enum EpiSvyError {
    /// Raised when a referenced column does not exist in the bound table.
    #[error("column `{column}` not found in the analysis table")]
    MissingColumn { column: String },

    /// Raised when a column cannot be read as numeric values.
    #[error("column `{column}` is not numeric")]
    NotNumeric { column: String },

    /// Raised when a sampling weight is zero or negative.
    #[error("weight at row {row} must be strictly positive, found {weight}")]
    NonPositiveWeight { row: usize, weight: f64 },

    /// Raised when a cluster identifier appears in more than one stratum.
    #[error("cluster `{cluster}` spans more than one stratum")]
    ClusterSpansStrata { cluster: String },

    /// Raised when the weights within a stratum sum to zero.
    #[error("weights sum to zero in stratum `{stratum}`")]
    ZeroWeightStratum { stratum: String },

    /// Raised when a weight, stratum or cluster value is missing.
    #[error("design column `{column}` has a missing value at row {row}")]
    NullDesignValue { column: String, row: usize },

    /// Raised when a domain mask has the wrong length for the bound table.
    #[error("subset mask length {found} does not match table length {expected}")]
    MaskLengthMismatch { expected: usize, found: usize },

    /// Raised when a regression response is not coded 0/1.
    #[error("response column `{column}` must be coded 0/1, found {value} at row {row}")]
    NonBinaryResponse {
        column: String,
        value: f64,
        row: usize,
    },

    /// Raised when a categorical reference level is absent from the data.
    #[error("reference level `{level}` not found in column `{column}`")]
    ReferenceLevelNotFound { column: String, level: String },

    /// Raised when a fit or metric references an unknown model term.
    #[error("term `{term}` is not part of the fitted model")]
    UnknownTerm { term: String },

    /// Raised when too few rows or clusters remain for the requested model.
    /// Sibling domains are unaffected; only this fit is abandoned.
    #[error("insufficient data in {context}: needed {needed} effective clusters, found {available}")]
    InsufficientData {
        context: String,
        needed: usize,
        available: usize,
    },

    /// Raised when IRLS fails to converge within the iteration cap. The last
    /// iterate is carried for diagnosis; it is never substituted for a fit.
    #[error("IRLS did not converge after {iterations} iterations; last max coefficient change {last_change}")]
    ConvergenceFailure {
        iterations: usize,
        last_change: f64,
        last_beta: Vec<f64>,
    },

    /// Raised when coefficients diverge, indicating a covariate that
    /// perfectly predicts the outcome.
    #[error("perfect separation detected at iteration {iterations}: coefficient for `{term}` reached {coefficient}")]
    Separation {
        term: String,
        coefficient: f64,
        iterations: usize,
    },

    /// Raised when the weighted normal equations are singular.
    #[error("matrix in {context} is singular")]
    Singular { context: &'static str },
}

impl EpiSvyError {
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    pub fn insufficient(context: impl Into<String>, needed: usize, available: usize) -> Self {
        Self::InsufficientData {
            context: context.into(),
            needed,
            available,
        }
    }
}

pub type Result<T> = std::result::Result<T, EpiSvyError>;
