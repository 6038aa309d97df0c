use crate::cubature::ErrorNorm;
use crate::error::AveragingError;
use serde::{Deserialize, Serialize};

pub fn default_relative_tol() -> f64 {
    1e-4
}

pub fn default_max_evals() -> usize {
    100_000
}

pub fn default_workers() -> usize {
    1
}

/// Stopping rules and resources for one cubature call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubatureOptions {
    #[serde(default = "default_relative_tol")]
    pub relative_tol: f64,
    #[serde(default)]
    pub absolute_tol: f64,
    /// Upper bound on integrand evaluations; the only bound on work.
    #[serde(default = "default_max_evals")]
    pub max_evals: usize,
    #[serde(default)]
    pub error_norm: ErrorNorm,
    /// Threads used to evaluate pending sub-regions. One keeps everything on
    /// the calling thread.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for CubatureOptions {
    fn default() -> Self {
        Self {
            relative_tol: default_relative_tol(),
            absolute_tol: 0.0,
            max_evals: default_max_evals(),
            error_norm: ErrorNorm::default(),
            workers: default_workers(),
        }
    }
}

impl CubatureOptions {
    pub fn with_relative_tol(mut self, relative_tol: f64) -> Self {
        self.relative_tol = relative_tol;
        self
    }

    pub fn with_max_evals(mut self, max_evals: usize) -> Self {
        self.max_evals = max_evals;
        self
    }

    pub fn with_error_norm(mut self, error_norm: ErrorNorm) -> Self {
        self.error_norm = error_norm;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<(), AveragingError> {
        let tol_ok = |t: f64| t.is_finite() && t >= 0.0;
        if !tol_ok(self.relative_tol) || !tol_ok(self.absolute_tol) {
            return Err(AveragingError::InvalidConfig(format!(
                "tolerances must be finite and non-negative, got relative={} absolute={}",
                self.relative_tol, self.absolute_tol
            )));
        }
        if self.relative_tol == 0.0 && self.absolute_tol == 0.0 {
            return Err(AveragingError::InvalidConfig(
                "at least one of relative_tol or absolute_tol must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(AveragingError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        self.error_norm.validate()
    }
}

/// How the weighted integral is turned into an average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Normalization {
    /// ∫ f · ρ over the integration bounds; ρ is assumed to carry unit mass.
    #[default]
    Expectation,
    /// ∫ f over finite bounds divided by their volume; densities are ignored.
    UniformMean,
    /// ∫ f · ρ divided by the mass of ρ inside the integration bounds.
    TruncatedExpectation,
}

/// Configuration of one averaging run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AveragingConfig {
    #[serde(default)]
    pub cubature: CubatureOptions,
    #[serde(default)]
    pub normalization: Normalization,
}
