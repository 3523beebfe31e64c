//! Calculation errors

use reagent_pool::HandlerError;

/// Errors raised by the reference calculations
#[derive(Debug, thiserror::Error)]
pub enum CalcError {
    /// Payload did not match the expected shape
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Formula could not be parsed
    #[error("invalid formula '{formula}': {reason}")]
    Formula { formula: String, reason: String },

    #[error("unknown element: {0}")]
    UnknownElement(String),

    /// Equation text is malformed
    #[error("invalid equation: {0}")]
    Equation(String),

    /// No unique positive integer balance exists
    #[error("cannot balance equation: {0}")]
    Unbalanceable(String),

    /// Input values are inconsistent or out of range
    #[error("invalid input: {0}")]
    Input(String),

    /// Matrix is singular or rank deficient
    #[error("singular matrix: {0}")]
    Singular(String),

    /// Thermodynamic data missing for a compound
    #[error("no thermodynamic data for {0}")]
    MissingData(String),
}

impl CalcError {
    pub(crate) fn formula(formula: &str, reason: impl Into<String>) -> Self {
        Self::Formula {
            formula: formula.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error is the caller's fault rather than a numeric failure
    pub fn is_input_error(&self) -> bool {
        !matches!(self, Self::Unbalanceable(_) | Self::Singular(_))
    }
}

impl From<CalcError> for HandlerError {
    fn from(err: CalcError) -> Self {
        if err.is_input_error() {
            HandlerError::invalid_input(err.to_string())
        } else {
            HandlerError::failed(err.to_string())
        }
    }
}
