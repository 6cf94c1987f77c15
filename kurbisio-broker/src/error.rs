use kurbisio_db::DbError;

/// Broker failures. Connection-level errors terminate the offending
/// connection; listener-level errors terminate the broker.
#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
    /// TLS material could not be loaded or the configuration is invalid.
    Tls(String),
    /// The client certificate is missing or its common name is not a UUID.
    CertificateRejected(String),
    /// The peer violated the protocol or the topic ACL.
    Protocol(String),
    /// Twin persistence failed.
    Db(DbError),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(err) => write!(f, "i/o error: {err}"),
            BrokerError::Tls(msg) => write!(f, "tls error: {msg}"),
            BrokerError::CertificateRejected(msg) => {
                write!(f, "client certificate rejected: {msg}")
            }
            BrokerError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            BrokerError::Db(err) => write!(f, "twin persistence failed: {err}"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(err) => Some(err),
            BrokerError::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Io(err)
    }
}

impl From<DbError> for BrokerError {
    fn from(err: DbError) -> Self {
        BrokerError::Db(err)
    }
}
