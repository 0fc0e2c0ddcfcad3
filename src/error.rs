//! Error types for the crate.

use thiserror::Error;

/// Errors reported by the emission routines, the connection opener, and the
/// compressed storage layer.
///
/// SQL emission never degrades silently: a routine that cannot produce
/// correct SQL reports an error instead of producing a weaker query.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is outside its domain, or an argument does not
    /// pass validation (identifiers, level parameters, page sizes).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A schema-level misuse, such as an ambiguous reference-sequence
    /// catalog read. Reuse of a `_gri_*` column or index name surfaces as
    /// [`Error::Sqlite`] with the host engine's duplicate-name message.
    #[error("schema error: {0}")]
    Schema(String),

    /// Observed database state contradicts the caller's claim, such as a
    /// query ceiling below the largest populated level, or a database file
    /// that is neither empty nor in the compressed layout.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The query planner's level probe failed. Callers can bypass probing
    /// by supplying an explicit ceiling and floor.
    #[error("level probe on table {table} failed: {source}")]
    Probe {
        /// The table whose range index was probed.
        table: String,
        /// The underlying database error.
        #[source]
        source: rusqlite::Error,
    },

    /// An error surfaced by the host engine, with its native code and
    /// message.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// An error from the compressed storage layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
