use std::path::PathBuf;

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trim_to_rows ({trim_to_rows}) must be non-negative and below max_rows ({max_rows})")]
    InvalidLimits { max_rows: i64, trim_to_rows: i64 },

    #[error("creating database directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Attach a short context string to a sqlx error.
pub(crate) trait SqlContext<T> {
    fn sql_context(self, context: &'static str) -> StoreResult<T>;
}

impl<T> SqlContext<T> for Result<T, sqlx::Error> {
    fn sql_context(self, context: &'static str) -> StoreResult<T> {
        self.map_err(|source| StoreError::Sqlite { context, source })
    }
}
