use kurbisio_core::ApiError;
use kurbisio_db::DbError;

/// Errors raised while authenticating a request or refreshing key material.
#[derive(Debug)]
pub enum AccessError {
    /// The token is malformed or its signature does not verify.
    InvalidToken(String),
    /// The token has expired.
    TokenExpired,
    /// The key id from the token header is not in the key set.
    UnknownKeyId(String),
    /// Fetching or parsing the JWKS document failed.
    KeysFetch(String),
    /// A capability lookup against the store failed.
    Db(DbError),
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessError::InvalidToken(msg) => write!(f, "invalid token: {msg}"),
            AccessError::TokenExpired => write!(f, "token expired"),
            AccessError::UnknownKeyId(kid) => write!(f, "unknown signing key: {kid}"),
            AccessError::KeysFetch(msg) => write!(f, "key fetch error: {msg}"),
            AccessError::Db(err) => write!(f, "capability lookup failed: {err}"),
        }
    }
}

impl std::error::Error for AccessError {}

impl From<DbError> for AccessError {
    fn from(err: DbError) -> Self {
        AccessError::Db(err)
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            // Authentication failures all render the same to the caller.
            AccessError::InvalidToken(_)
            | AccessError::TokenExpired
            | AccessError::UnknownKeyId(_) => ApiError::Unauthorized("unauthorized".into()),
            AccessError::KeysFetch(msg) => ApiError::internal(msg),
            AccessError::Db(err) => ApiError::internal(err.to_string()),
        }
    }
}
