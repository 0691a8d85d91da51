//! Error type shared across the engine.
//!
//! Every public operation fails with an [`Error`]; the pair returned by
//! [`Error::domain_code`] is the stable external identity of a failure.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The domain half of the external `(domain, code)` error identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Domain {
    /// Engine-level errors (storage contract, revision model, queries).
    Db,
    /// Operating system / filesystem errors.
    Posix,
    /// Errors surfaced by the relational backing store.
    Sql,
    /// Body or meta encoding errors.
    Encoding,
    /// Transport-level errors seen by the replicator.
    Network,
    /// Close status of the message-bus socket.
    WebSocket,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("document revision conflict")]
    Conflict,
    #[error("data is corrupt: {0}")]
    Corrupt(String),
    #[error("database is busy: {0}")]
    Busy(String),
    #[error("cannot open file: {0}")]
    CantOpenFile(String),
    #[error("database is read-only")]
    NotWriteable,
    #[error("no transaction is open")]
    NotInTransaction,
    #[error("a transaction is still open")]
    TransactionNotClosed,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("connection reset by peer")]
    NetworkReset,
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("remote error {code}: {message}")]
    Remote {
        /// HTTP-style status from the peer.
        code: i32,
        message: String,
    },
    #[error("socket closed: {code} {reason}")]
    WebSocketClosed { code: i32, reason: String },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Error::InvalidQuery(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// The stable `(domain, code)` pair identifying this error externally.
    pub fn domain_code(&self) -> (Domain, i32) {
        use Error::*;
        match self {
            NotFound => (Domain::Db, 1),
            Conflict => (Domain::Db, 2),
            Corrupt(_) => (Domain::Db, 3),
            Busy(_) => (Domain::Db, 4),
            CantOpenFile(_) => (Domain::Db, 5),
            NotWriteable => (Domain::Db, 6),
            NotInTransaction => (Domain::Db, 7),
            TransactionNotClosed => (Domain::Db, 8),
            Unsupported(_) => (Domain::Db, 9),
            InvalidParameter(_) => (Domain::Db, 10),
            InvalidQuery(_) => (Domain::Db, 11),
            Canceled => (Domain::Db, 12),
            Timeout => (Domain::Network, 1),
            NetworkReset => (Domain::Network, 2),
            UnknownHost(_) => (Domain::Network, 3),
            Unauthorized => (Domain::Network, 4),
            Forbidden => (Domain::Network, 5),
            Remote { code, .. } => (Domain::Network, *code),
            WebSocketClosed { code, .. } => (Domain::WebSocket, *code),
            Sql(err) => (
                Domain::Sql,
                err.sqlite_error().map(|e| e.extended_code).unwrap_or(-1),
            ),
            Io(err) => (Domain::Posix, err.raw_os_error().unwrap_or(-1)),
            Encoding(_) => (Domain::Encoding, 1),
        }
    }

    /// Whether the replicator should back off and retry after this error.
    ///
    /// HTTP 408 and 429 are transient; all other 4xx remote statuses are
    /// permanent, 5xx are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Busy(_) | Error::Timeout | Error::NetworkReset | Error::UnknownHost(_) => true,
            Error::Remote { code, .. } => {
                *code == 408 || *code == 429 || (500..600).contains(code)
            }
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidParameter(format!("invalid URL: {err}"))
    }
}
