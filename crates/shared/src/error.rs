//! Error type shared by every medshare crate.

use thiserror::Error;

/// Failure of a backend operation.
///
/// Each variant maps onto the status code the HTTP-shaped facade reports
/// (see [`MedshareError::code`]).
#[derive(Debug, Error)]
pub enum MedshareError {
    #[error("No user is logged in")]
    NotLoggedIn,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Authorization expired: {0}")]
    Expired(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MedshareError {
    /// HTTP-equivalent status code.
    pub fn code(&self) -> u16 {
        match self {
            MedshareError::NotLoggedIn => 401,
            MedshareError::Forbidden(_) => 403,
            MedshareError::NotFound(_) => 404,
            MedshareError::Conflict(_) | MedshareError::InvalidState(_) => 409,
            MedshareError::Expired(_) => 410,
            MedshareError::Validation(_) => 422,
            MedshareError::Serialization(_) | MedshareError::Io(_) => 500,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        MedshareError::NotFound(what.into())
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        MedshareError::Forbidden(reason.into())
    }
}

pub type MedshareResult<T> = Result<T, MedshareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(MedshareError::NotLoggedIn.code(), 401);
        assert_eq!(MedshareError::forbidden("doctor only").code(), 403);
        assert_eq!(MedshareError::not_found("file").code(), 404);
        assert_eq!(MedshareError::Conflict("dup".into()).code(), 409);
        assert_eq!(MedshareError::InvalidState("processed".into()).code(), 409);
        assert_eq!(MedshareError::Expired("req".into()).code(), 410);
        assert_eq!(MedshareError::Validation("title".into()).code(), 422);
    }

    #[test]
    fn test_error_messages() {
        let err = MedshareError::not_found("Medical file file_1");
        assert_eq!(err.to_string(), "Not found: Medical file file_1");

        let err: MedshareError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), 500);
    }
}
