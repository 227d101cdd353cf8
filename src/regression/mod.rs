// src/regression/mod.rs
pub mod glm;
pub mod model_matrix;

pub use glm::{fit_weighted_glm, GlmFit, GlmOptions};
pub use model_matrix::{build_model_matrix, ModelMatrix, ModelSpec, Term};
