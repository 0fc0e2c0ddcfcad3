//! # GenomicSQLite: genomic range indexing and compressed storage for SQLite.
//!
//! This crate equips SQLite databases for large genomics datasets with two
//! tightly coupled subsystems.
//!
//! ### Genomic range index
//!
//! A genomic range index (GRI) answers interval-overlap queries over a
//! feature table with coordinates `(chromosome or rid, begin, end)`. It is
//! built entirely out of ordinary relational primitives: four virtual
//! generated columns and one composite B-tree index. Features are binned by
//! a base-16 *level* derived from their length, which makes overlap queries
//! logarithmic in the maximum feature length.
//!
//! The crate emits SQL rather than executing it. [`gri::create_genomic_range_index_sql`]
//! returns the indexing script; [`gri::genomic_range_rowids_sql`] returns a
//! parenthesized subquery yielding the rowids overlapping a query range,
//! shaped to the observed length distribution of the indexed data. Because
//! the routines return strings, callers can compose them into arbitrary
//! outer queries, including range joins, and prepare them once for many
//! executions.
//!
//! The optional [`refseq`] catalog maps chromosome names to compact integer
//! reference-sequence ids and back, and can be seeded from the bundled
//! GRCh38 assembly.
//!
//! ### Compressed storage
//!
//! [`db::open`] opens databases through a virtual file system that
//! transparently compresses the database file chunk-by-chunk with zstd
//! (see [`vfs`]), tuned by a [`db::TuningConfig`]. An existing plain
//! database can be converted with [`db::vacuum_into_sql`]. JSON support
//! needs no extra surface: the host engine's bundled JSON functions work
//! unchanged on compressed databases.
//!
//! ### Basic usage
//!
//! ```
//! use genomicsqlite::db::{self, TuningConfig};
//! use genomicsqlite::gri;
//! use genomicsqlite::utils;
//! use rusqlite::OpenFlags;
//! use std::fs;
//!
//! let db_file = utils::temp_file_name("crate-doc");
//! let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
//! let conn = db::open(&db_file, flags, &TuningConfig::default()).unwrap();
//!
//! // A feature table with a genomic range index.
//! conn.execute_batch(
//!     "CREATE TABLE exons (chrom TEXT, beg INTEGER, end INTEGER)"
//! ).unwrap();
//! let create = gri::create_genomic_range_index_sql(
//!     "exons", "chrom", "beg", "end", -1
//! ).unwrap();
//! conn.execute_batch(&create).unwrap();
//! conn.execute_batch(
//!     "INSERT INTO exons VALUES ('chr1', 1000, 1100), ('chr1', 5000, 5600)"
//! ).unwrap();
//!
//! // Overlap query: which exons intersect chr1:1050-2000?
//! let rowids = gri::genomic_range_rowids_sql(
//!     &conn, "exons", None, None, None, -1, -1
//! ).unwrap();
//! let query = format!("SELECT COUNT(*) FROM exons WHERE _rowid_ IN {}", rowids);
//! let hits: i64 = conn
//!     .query_row(&query, rusqlite::params!["chr1", 1050, 2000], |row| row.get(0))
//!     .unwrap();
//! assert_eq!(hits, 1);
//!
//! drop(conn);
//! fs::remove_file(&db_file).unwrap();
//! ```

pub mod db;
pub mod error;
pub mod gri;
pub mod refseq;
pub mod utils;
pub mod vfs;

pub use db::{identify_storage, init, open, vacuum_into_sql, version, StorageKind, TuningConfig};
pub use error::{Error, Result};
pub use gri::{
    create_genomic_range_index_sql, detect_levels, genomic_range_rowids_safe_sql,
    genomic_range_rowids_sql, RangeIndexLevels,
};
pub use refseq::{
    put_reference_assembly_sql, put_reference_sequence_sql, reference_sequences_by_name,
    reference_sequences_by_rid, ReferenceSequence,
};
pub use vfs::{PageStore, StoreParams};
