//! Contract errors.
//!
//! Every operation fails with exactly one [`Error`]; the variant determines
//! the [`ErrorCategory`] reported to the host. `Display` renders
//! `"<category>: <reason>"` so callers and tests can match on the tag and a
//! substring of the reason. The first error aborts the transaction: the
//! overlay is discarded, no events are published, no transfers committed.

use smc_state_store::StateError;
use smp_partitions::PartitionsError;

/// The stable error tags of the contract interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidInput,
    NotFound,
    InvalidStateTransition,
    ConstraintViolation,
    Arith,
    Auth,
    AlreadyExists,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidStateTransition => "invalid_state_transition",
            ErrorCategory::ConstraintViolation => "constraint_violation",
            ErrorCategory::Arith => "arith",
            ErrorCategory::Auth => "auth",
            ErrorCategory::AlreadyExists => "already_exists",
            ErrorCategory::Internal => "internal",
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid_input: {0}")]
    InvalidInput(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("invalid_state_transition: {0}")]
    InvalidStateTransition(String),
    #[error("constraint_violation: {0}")]
    ConstraintViolation(String),
    #[error("arith: {0}")]
    Arith(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("internal: {0}")]
    Internal(String),
    /// Rejected at dispatch time, before any handler runs.
    #[error("invalid_storage_function_name: {0}")]
    UnknownFunction(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidInput(_) | Error::UnknownFunction(_) => ErrorCategory::InvalidInput,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::InvalidStateTransition(_) => ErrorCategory::InvalidStateTransition,
            Error::ConstraintViolation(_) => ErrorCategory::ConstraintViolation,
            Error::Arith(_) => ErrorCategory::Arith,
            Error::Auth(_) => ErrorCategory::Auth,
            Error::AlreadyExists(_) => ErrorCategory::AlreadyExists,
            Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Checked-arithmetic overflow/underflow.
    pub fn overflow(what: &str) -> Error {
        Error::Arith(format!("{what}: value overflow"))
    }
}

impl From<StateError> for Error {
    fn from(e: StateError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<PartitionsError> for Error {
    fn from(e: PartitionsError) -> Self {
        match e {
            PartitionsError::ItemNotFound(item) => Error::NotFound(format!("partitions: {item}")),
            PartitionsError::ItemAlreadyExists(item) => {
                Error::AlreadyExists(format!("partitions: {item}"))
            }
            PartitionsError::Empty => Error::NotFound("partitions are empty".into()),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Self {
        Error::InvalidInput(format!("decoding failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_category_tag_and_reason() {
        let err = Error::ConstraintViolation("insufficient funds".into());
        assert_eq!(err.to_string(), "constraint_violation: insufficient funds");
        assert_eq!(err.category(), ErrorCategory::ConstraintViolation);
    }

    #[test]
    fn unknown_function_maps_to_invalid_input() {
        let err = Error::UnknownFunction("no_such_op".into());
        assert_eq!(err.category(), ErrorCategory::InvalidInput);
        assert!(err.to_string().starts_with("invalid_storage_function_name"));
    }

    #[test]
    fn partitions_errors_keep_their_category() {
        let err: Error = PartitionsError::ItemAlreadyExists("b1".into()).into();
        assert_eq!(err.category(), ErrorCategory::AlreadyExists);
        let err: Error = PartitionsError::Store("io".into()).into();
        assert_eq!(err.category(), ErrorCategory::Internal);
    }
}
