//! Error taxonomy for the session coordinator.
//!
//! Validation errors never leave the client, transport errors are surfaced as-is,
//! and the structured "no active dataset" signal is the only error the coordinator
//! reacts to on its own.

use serde::Serialize;
use thiserror::Error;

/// Failures reported by a [`crate::backend::Backend`].
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend no longer holds an uploaded dataset.
    #[error("no active dataset: {message}")]
    NoActiveDataset { message: String },
    /// Non-2xx response; `message` is the body or its `error` field, verbatim.
    #[error("{message}")]
    Status { status: u16, message: String },
    /// 2xx response that reports a failure (`{error}` or `success: false`).
    #[error("{message}")]
    Rejected { message: String },
    #[error("request failed: {message}")]
    Transport { message: String },
    #[error("unexpected response from server: {message}")]
    Decode { message: String },
}

impl BackendError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        BackendError::Transport {
            message: err.to_string(),
        }
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        BackendError::Decode {
            message: err.to_string(),
        }
    }

    pub fn is_session_loss(&self) -> bool {
        matches!(self, BackendError::NoActiveDataset { .. })
    }
}

/// Local form checks. Messages are shown to the user verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please select at least one column to treat.")]
    NoTreatmentColumns,
    #[error("Please select at least one interval to treat.")]
    NoTreatmentIntervals,
    #[error("Interval {0} is empty; the start must precede the end.")]
    EmptyInterval(String),
    #[error("Could not parse interval '{0}'; expected start..end.")]
    InvalidInterval(String),
    #[error("Please select a treatment method.")]
    MissingTreatmentMethod,
    #[error("Unknown treatment method '{0}'.")]
    UnknownTreatmentMethod(String),

    #[error("Please build a formula before generating a feature.")]
    EmptyFormula,
    #[error("Please select Column 1.")]
    MissingFirstOperand,
    #[error("Please enter an operator before Column {0}.")]
    MissingOperator(u8),
    #[error("Column 1 cannot be preceded by an operator.")]
    InfixOnFirstColumn,
    #[error("Column {0} is empty but has an operator or function set.")]
    DanglingToken(u8),
    #[error("Unknown function or number '{0}'.")]
    UnknownUnaryToken(String),
    #[error("Unknown operator '{0}'.")]
    UnknownOperator(String),
    #[error("Formula slot must be 1, 2 or 3 (got {0}).")]
    InvalidSlot(u8),

    #[error("Please select a target or objective variable.")]
    MissingTarget,
    #[error("Please select whether to maximize or minimize the target.")]
    MissingDirection,
    #[error("Please select at least one feature to build the ML model.")]
    NoFeatures,
    #[error("Please specify a valid split percentage between 1 and 99.")]
    InvalidSplitPercent,
    #[error("Please select valid start and end dates for custom time-based split.")]
    MissingSplitDates,
    #[error("Unknown train/test split '{0}'.")]
    UnknownSplit(String),
    #[error("Please select a model type.")]
    MissingModelFamily,
    #[error("Unknown model type '{0}'.")]
    UnknownModelFamily(String),
    #[error("Please train a model before requesting {0}.")]
    NoTrainedModel(&'static str),

    #[error("Target or columns not selected for Q-cut analysis")]
    QuantileSelection,
    #[error("Please select both X and Y columns")]
    DualAxesSelection,
    #[error("Select at least two columns for correlation analysis")]
    CorrelationSelection,
    #[error("Please select a target for {0} analysis")]
    MissingExplorationTarget(&'static str),
    #[error("Please select at least one column for {0} analysis")]
    MissingExplorationColumns(&'static str),
    #[error("Please select at least one column for analysis.")]
    VariabilitySelection,

    #[error("Please choose at least one context file to upload.")]
    NoContextFiles,
}

/// The four error classes the UI distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Transport,
    SessionLoss,
    PartialData,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transport => "transport",
            ErrorClass::SessionLoss => "session loss",
            ErrorClass::PartialData => "partial data",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("No dataset uploaded. Upload a file first.")]
    NoDataset,
    /// Replaying the upload after a session loss failed.
    #[error("session lost and re-upload failed: {source}")]
    RecoveryFailed { source: BackendError },
    /// Backend reported success but omitted part of an atomic result. The operation failed as a whole.
    #[error("incomplete {what} in backend response")]
    Incomplete { what: &'static str },
    /// The dataset file could not be read locally.
    #[error("{message}")]
    Unreadable { message: String },
}

impl CoordinatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordinatorError::Validation(_)
            | CoordinatorError::NoDataset
            | CoordinatorError::Unreadable { .. } => ErrorClass::Validation,
            CoordinatorError::Backend(e) if e.is_session_loss() => ErrorClass::SessionLoss,
            CoordinatorError::RecoveryFailed { .. } => ErrorClass::SessionLoss,
            CoordinatorError::Backend(_) | CoordinatorError::Incomplete { .. } => ErrorClass::Transport,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_taxonomy() {
        assert_eq!(
            CoordinatorError::from(ValidationError::NoFeatures).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            CoordinatorError::from(BackendError::Status {
                status: 500,
                message: "boom".into()
            })
            .class(),
            ErrorClass::Transport
        );
        assert_eq!(
            CoordinatorError::from(BackendError::NoActiveDataset {
                message: "No data uploaded".into()
            })
            .class(),
            ErrorClass::SessionLoss
        );
    }

    #[test]
    fn incomplete_atomic_reply_is_a_backend_failure() {
        let err = CoordinatorError::Incomplete { what: "test plot" };
        assert_eq!(err.class(), ErrorClass::Transport);
        assert_ne!(err.class(), ErrorClass::PartialData);
    }

    #[test]
    fn status_errors_show_the_backend_text_verbatim() {
        let err = CoordinatorError::from(BackendError::Status {
            status: 422,
            message: "Target column contains NaN".into(),
        });
        assert_eq!(err.to_string(), "Target column contains NaN");
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[test]
    fn backend_messages_are_verbatim() {
        let err = CoordinatorError::from(BackendError::Rejected {
            message: "Column 'temp' not found".into(),
        });
        assert_eq!(err.to_string(), "Column 'temp' not found");
    }
}
