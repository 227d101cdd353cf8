// src/lib.rs

//! Design-based estimation for complex-sample surveys.
//!
//! `episvy` estimates population parameters and fits regression models whose
//! standard errors reflect the sampling design rather than assuming a simple
//! random sample. It provides
//!
//! - a validated [`SurveyDesign`] binding weights, strata and clusters to a
//!   `polars` table, with cheap read-only domain restriction (`design`
//!   module),
//! - weighted means, totals and proportions with Taylor-linearized variance,
//!   over the whole sample or over domains (`estimation` module),
//! - survey-weighted quasi-binomial regression with a design-based sandwich
//!   covariance (`regression` module), and
//! - derived epidemiological measures with propagated uncertainty: odds
//!   ratios, annual percent change, population attributable fraction, and
//!   side-by-side sensitivity fits (`metrics` module).
//!
//! Variance estimation treats clusters, not rows, as the unit of independent
//! replication: linearized scores are totaled within clusters, centered on
//! their stratum mean, and summed across strata. Degrees of freedom are
//! clusters minus strata. Domains that cannot support a variance (a single
//! effective cluster) report it as explicitly undefined.
//!
//! # Quick start
//!
//! ```no_run
//! use episvy::{build_design, fit_weighted_glm, odds_ratio, weighted_mean};
//! use episvy::{GlmOptions, ModelSpec};
//! use polars::prelude::*;
//!
//! let table = df![
//!     "disability" => [1.0, 0.0, 1.0, 0.0],
//!     "arthritis" => [1.0, 1.0, 0.0, 0.0],
//!     "age_group" => ["65_74", "75_84", "65_74", "85_up"],
//!     "year" => [2010.0, 2012.0, 2014.0, 2016.0],
//!     "wt" => [1.3, 0.9, 1.1, 0.7],
//! ]
//! .unwrap();
//!
//! // Year-as-stratum with implicit one-row clusters is a common simplified
//! // approximation; substitute true strata/PSU columns when available.
//! let design = build_design(table, "wt", Some("year"), None).unwrap();
//!
//! let prevalence = weighted_mean(&design, "arthritis").unwrap().unwrap();
//!
//! let spec = ModelSpec::new("disability")
//!     .continuous("arthritis")
//!     .categorical("age_group", "65_74")
//!     .continuous("year");
//! let fit = fit_weighted_glm(&design, &spec, &GlmOptions::default()).unwrap();
//! let or = odds_ratio(&fit, "arthritis").unwrap();
//! println!("exposure prevalence {:.3}", prevalence.estimate);
//! println!("adjusted OR {:.2} [{:.2}, {:.2}]", or.value, or.ci_low, or.ci_high);
//! ```
//!
//! Every estimator is a pure synchronous function of (design, columns,
//! options); designs are shareable snapshots, so independent domain fits may
//! run concurrently. Numerical failures (non-convergence, separation, too
//! few clusters) surface as typed errors and are never replaced with a
//! default value.

pub mod design;
pub mod dist;
pub mod error;
pub mod estimation;
pub mod metrics;
pub mod regression;

pub use design::{build_design, SurveyDesign};
pub use error::{EpiSvyError, Result};
pub use estimation::{
    by_domain, proportions, proportions_frame, weighted_mean, weighted_total, DomainEstimate,
    DomainOutcome, DomainTable, EstimateResult, LevelEstimate, VarianceEstimate,
};
pub use metrics::{
    annual_percent_change, odds_ratio, population_attributable_fraction, sensitivity_comparison,
    AttributableFraction, DerivedMetric, SensitivityComparison, SensitivityOutcome, SensitivityRow,
};
pub use regression::{fit_weighted_glm, GlmFit, GlmOptions, ModelSpec, Term};
