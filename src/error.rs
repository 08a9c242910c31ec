use thiserror::Error;

/// Everything that can go wrong while building an experiment or running an
/// operation over one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CytoError {
    /// Experiment or operation misconfigured before use.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `apply` called on an operation that is not valid for the experiment.
    #[error("operation '{0}' is not valid for this experiment")]
    Validation(String),

    /// A required prior transform is missing from a channel's history.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A stateful operation was used out of order.
    #[error("invalid state: {0}")]
    State(String),

    /// `apply` met a group that was never estimated.
    #[error("no fitted model for group {0}")]
    Lookup(String),

    /// A subset expression failed to parse or refers to unknown columns.
    #[error("invalid expression: {0}")]
    Expression(String),

    /// An event handed to a fitted model has a NaN or infinite channel value.
    #[error("group {group}: event {row} has a non-finite '{channel}' value")]
    NonFinite {
        group: String,
        row: usize,
        channel: String,
    },

    /// Mixture-model fitting failed for one group.
    #[error("fit failed for group {group}: {reason}")]
    Fit { group: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CytoError>;
