use thiserror::Error;

/// Failures that abort an averaging run.
///
/// Every variant is fatal to the call that produced it: a malformed domain,
/// weight or model output invalidates all subsequent numeric results. Running
/// out of evaluation budget is not an error; see `CubatureResult::converged`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AveragingError {
    #[error("Invalid integration domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid weight function for parameter '{parameter}': {reason}")]
    InvalidWeight { parameter: String, reason: String },

    #[error("Model evaluation #{call} failed: {reason}")]
    ModelEvaluation { call: usize, reason: String },

    #[error(
        "Integrand returned {found} values but the integration was declared with {expected} output dimensions."
    )]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AveragingError {
    pub(crate) fn weight(parameter: &str, reason: impl Into<String>) -> Self {
        AveragingError::InvalidWeight {
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }
}
