//! Error type for the storage engine.

/// Result type used throughout the engine. The error parameter is swappable
/// the way `anyhow::Result` allows, for modules that bridge to collaborators.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the storage and query engine.
///
/// Unique-constraint violations are split out of the general database error
/// so that callers racing on a dataset name can tell the loser apart from a
/// broken database file.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no dataset named {0:?}")]
    UnknownDataset(String),
    #[error("dataset {dataset:?} has no field {field:?}")]
    UnknownField { dataset: String, field: String },
    #[error("malformed query: {0}")]
    BadQuery(String),
    #[error("integrity violation: {0}")]
    Integrity(#[source] rusqlite::Error),
    #[error("cannot decode segment: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Db(#[source] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid input: {0}")]
    Input(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Integrity(e)
            }
            _ => Error::Db(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn constraint_violations_map_to_integrity() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER UNIQUE); INSERT INTO t VALUES (1);")
            .unwrap();
        let err: Error = conn
            .execute("INSERT INTO t VALUES (1)", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn other_failures_map_to_db() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: Error = conn.execute("SELECT * FROM nope", []).unwrap_err().into();
        assert!(matches!(err, Error::Db(_)));
    }
}
