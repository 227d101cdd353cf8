// src/estimation/mod.rs
pub mod descriptive;
pub mod linearization;

pub use descriptive::{
    by_domain, proportions, proportions_frame, weighted_mean, weighted_total, DomainEstimate,
    DomainOutcome, DomainTable, EstimateResult, LevelEstimate, VarianceEstimate,
};
pub use linearization::{linearized_covariance, linearized_variance, LinearizationDiag};
