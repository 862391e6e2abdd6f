use crate::db::errors::DbError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Configuration could not be validated
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Database layer error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns a user-safe error message, without leaking internal implementation details.
    ///
    /// Pool exhaustion and unreachable databases end up as a generic internal
    /// error; details belong in the server log.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidConfig { message } => format!("Invalid configuration: {message}"),
            Error::Database(db_err) => match db_err {
                DbError::NoAssignment { context_id } => format!("Context {context_id} does not exist"),
                DbError::UnknownServer { name } => format!("Server '{name}' is not registered"),
                _ => "Internal server error".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_pool_details() {
        let err = Error::from(DbError::NoConnection {
            pool_id: 3,
            source: sqlx::Error::PoolTimedOut,
        });
        assert_eq!(err.user_message(), "Internal server error");

        let err = Error::from(DbError::NoConfigDb {
            source: sqlx::Error::PoolTimedOut,
        });
        assert_eq!(err.user_message(), "Internal server error");
    }

    #[test]
    fn test_user_message_for_unknown_context() {
        let err = Error::from(DbError::NoAssignment { context_id: 42 });
        assert_eq!(err.user_message(), "Context 42 does not exist");
    }
}
