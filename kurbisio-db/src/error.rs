use kurbisio_core::ApiError;

/// Errors that can occur in the storage layer.
#[derive(Debug)]
pub enum DbError {
    /// The statement matched no row (the `RowNotFound` sentinel).
    NotFound,
    /// A unique constraint was violated (SQLSTATE 23505); carries the
    /// constraint name when the server reported one.
    Conflict(String),
    /// A foreign key was violated (SQLSTATE 23503): a referenced row does
    /// not exist.
    ForeignKey(String),
    /// Any other driver failure.
    Database(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::NotFound => write!(f, "no rows"),
            DbError::Conflict(constraint) => write!(f, "unique violation: {constraint}"),
            DbError::ForeignKey(constraint) => write!(f, "missing referenced row: {constraint}"),
            DbError::Database(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Database(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => ApiError::NotFound("no such resource".into()),
            DbError::ForeignKey(_) => ApiError::NotFound("no such resource".into()),
            // Handlers that can produce conflicts translate them before this
            // point so they can attach the conflicting row; anything that
            // reaches here is unexpected.
            other => ApiError::internal(other.to_string()),
        }
    }
}

/// Extension trait converting `sqlx::Error` into [`DbError`].
///
/// An orphan-rule workaround, same as the data layer's `into_data_error`:
/// `From<sqlx::Error>` cannot be implemented on a foreign error type here.
pub trait SqlxErrorExt {
    fn into_db_error(self) -> DbError;
}

impl SqlxErrorExt for sqlx::Error {
    fn into_db_error(self) -> DbError {
        match &self {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                DbError::Conflict(db.constraint().unwrap_or_default().to_owned())
            }
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                DbError::ForeignKey(db.constraint().unwrap_or_default().to_owned())
            }
            _ => DbError::Database(Box::new(self)),
        }
    }
}
