use super::*;

use crate::gri;
use crate::refseq;
use crate::utils;
use crate::vfs;

use rusqlite::params;

use std::fs;
use std::path::PathBuf;

//-----------------------------------------------------------------------------

fn rw_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
}

// Small pages and a fixed worker count keep the tests fast and
// deterministic.
fn test_config() -> TuningConfig {
    TuningConfig {
        page_cache_mib: 64,
        threads: 1,
        inner_page_kib: 4,
        outer_page_kib: 16,
        ..TuningConfig::default()
    }
}

fn open_test_db(path: &PathBuf, config: &TuningConfig) -> Connection {
    let conn = open(path, rw_flags(), config);
    assert!(conn.is_ok(), "Failed to open database: {}", conn.unwrap_err());
    conn.unwrap()
}

fn row_count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), (), |row| row.get(0))
        .unwrap()
}

//-----------------------------------------------------------------------------

#[test]
fn config_validation() {
    assert!(test_config().validate().is_ok());
    let cases: Vec<TuningConfig> = vec![
        TuningConfig { inner_page_kib: 7, ..TuningConfig::default() },
        TuningConfig { outer_page_kib: 3, ..TuningConfig::default() },
        TuningConfig { zstd_level: 23, ..TuningConfig::default() },
        TuningConfig { zstd_level: -6, ..TuningConfig::default() },
        TuningConfig { threads: 0, ..TuningConfig::default() },
        TuningConfig { threads: 65, ..TuningConfig::default() },
        TuningConfig { page_cache_mib: 0, ..TuningConfig::default() },
    ];
    for (i, config) in cases.iter().enumerate() {
        assert!(
            matches!(config.validate(), Err(Error::Config(_))),
            "Case {} should have been rejected: {:?}",
            i, config
        );
    }
}

#[test]
fn thread_resolution() {
    let config = TuningConfig { threads: 4, ..TuningConfig::default() };
    assert_eq!(config.resolved_threads(), 4, "Explicit thread count should pass through");
    let config = TuningConfig { threads: -1, ..TuningConfig::default() };
    let resolved = config.resolved_threads();
    assert!(
        (1..=TuningConfig::MAX_AUTO_THREADS).contains(&resolved),
        "Automatic thread count out of range: {}",
        resolved
    );
}

//-----------------------------------------------------------------------------

#[test]
fn create_and_reopen() {
    let db_file = utils::temp_file_name("db-create");
    let conn = open_test_db(&db_file, &test_config());
    conn.execute_batch(
        "CREATE TABLE kv (k INTEGER PRIMARY KEY, v TEXT NOT NULL);
         BEGIN;
         INSERT INTO kv (v)
         WITH RECURSIVE series(value) AS
             (SELECT 1 UNION ALL SELECT value + 1 FROM series WHERE value < 1000)
         SELECT 'value ' || value FROM series;
         COMMIT",
    )
    .unwrap();
    assert_eq!(row_count(&conn, "kv"), 1000, "Wrong row count");
    let reported: String = conn
        .query_row("SELECT genomicsqlite_version()", (), |row| row.get(0))
        .unwrap();
    assert_eq!(reported, version(), "Wrong version function result");
    drop(conn);

    // The file on disk is in the compressed layout, not a raw database.
    assert_eq!(identify_storage(&db_file), StorageKind::Compressed, "Wrong storage kind");
    let header = fs::read(&db_file).unwrap();
    assert_eq!(&header[..8], &vfs::STORE_MAGIC[..], "Container magic missing");

    // Reopen read-only with a different configuration; the page sizes come
    // from the file, the rest from the new configuration.
    let conn = open(&db_file, OpenFlags::SQLITE_OPEN_READ_ONLY, &TuningConfig::default());
    assert!(conn.is_ok(), "Failed to reopen database: {}", conn.unwrap_err());
    let conn = conn.unwrap();
    assert_eq!(row_count(&conn, "kv"), 1000, "Rows lost across reopen");
    let last: String = conn
        .query_row("SELECT v FROM kv WHERE k = 1000", (), |row| row.get(0))
        .unwrap();
    assert_eq!(last, "value 1000", "Wrong row content after reopen");
    drop(conn);
    fs::remove_file(&db_file).unwrap();
}

#[test]
fn refuses_plain_database() {
    let db_file = utils::temp_file_name("db-plain");
    let plain = Connection::open(&db_file).unwrap();
    plain
        .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1)")
        .unwrap();
    drop(plain);
    assert_eq!(identify_storage(&db_file), StorageKind::PlainDatabase, "Wrong storage kind");

    let result = open(&db_file, rw_flags(), &test_config());
    assert!(
        matches!(result, Err(Error::Integrity(_))),
        "Plain database should be refused"
    );
    fs::remove_file(&db_file).unwrap();
}

#[test]
fn refuses_foreign_files() {
    let db_file = utils::temp_file_name("db-foreign");
    fs::write(&db_file, b"this is not a database at all").unwrap();
    assert_eq!(identify_storage(&db_file), StorageKind::Unknown, "Wrong storage kind");

    let result = open(&db_file, rw_flags(), &test_config());
    assert!(matches!(result, Err(Error::Integrity(_))), "Foreign file should be refused");
    fs::remove_file(&db_file).unwrap();
}

#[test]
fn storage_identification() {
    let missing = utils::temp_file_name("db-missing");
    assert_eq!(identify_storage(&missing), StorageKind::Missing, "Missing file misidentified");

    let empty = utils::temp_file_name("db-empty");
    fs::write(&empty, b"").unwrap();
    assert_eq!(identify_storage(&empty), StorageKind::Missing, "Empty file misidentified");
    fs::remove_file(&empty).unwrap();

    assert_eq!(
        identify_storage(std::env::temp_dir()),
        StorageKind::Unknown,
        "Directory misidentified"
    );
}

#[test]
fn readonly_open_of_missing_database_fails() {
    let db_file = utils::temp_file_name("db-noexist");
    let result = open(&db_file, OpenFlags::SQLITE_OPEN_READ_ONLY, &test_config());
    assert!(matches!(result, Err(Error::Sqlite(_))), "Opening a missing file read-only should fail");
}

//-----------------------------------------------------------------------------

#[test]
fn compression_is_effective() {
    let fill = "GATTACA".repeat(64);
    let insert = format!(
        "CREATE TABLE reads (id INTEGER PRIMARY KEY, seq TEXT NOT NULL);
         BEGIN;
         INSERT INTO reads (seq)
         WITH RECURSIVE series(value) AS
             (SELECT 1 UNION ALL SELECT value + 1 FROM series WHERE value < 4000)
         SELECT '{}' FROM series;
         COMMIT",
        fill
    );

    let compressed_file = utils::temp_file_name("db-compressed");
    let conn = open_test_db(&compressed_file, &test_config());
    conn.execute_batch(&insert).unwrap();
    drop(conn);

    let plain_file = utils::temp_file_name("db-plain-twin");
    let plain = Connection::open(&plain_file).unwrap();
    plain.execute_batch("PRAGMA page_size = 4096").unwrap();
    plain.execute_batch(&insert).unwrap();
    drop(plain);

    let compressed_len = fs::metadata(&compressed_file).unwrap().len();
    let plain_len = fs::metadata(&plain_file).unwrap().len();
    assert!(
        compressed_len * 2 < plain_len,
        "Compression ineffective: {} compressed vs {} plain",
        compressed_len, plain_len
    );
    fs::remove_file(&compressed_file).unwrap();
    fs::remove_file(&plain_file).unwrap();
}

#[test]
fn unsafe_load_roundtrip() {
    let db_file = utils::temp_file_name("db-unsafe");
    let config = TuningConfig { unsafe_load: true, ..test_config() };
    let conn = open_test_db(&db_file, &config);
    conn.execute_batch(
        "CREATE TABLE bulk (x INTEGER);
         INSERT INTO bulk
         WITH RECURSIVE series(value) AS
             (SELECT 1 UNION ALL SELECT value + 1 FROM series WHERE value < 10000)
         SELECT value FROM series",
    )
    .unwrap();
    assert_eq!(row_count(&conn, "bulk"), 10000, "Wrong row count under unsafe_load");
    // With synchronous writes off, the buffered chunks are committed when
    // the connection closes.
    drop(conn);

    let conn = open_test_db(&db_file, &test_config());
    assert_eq!(row_count(&conn, "bulk"), 10000, "Rows lost after unsafe_load close");
    drop(conn);
    fs::remove_file(&db_file).unwrap();
}

//-----------------------------------------------------------------------------

#[test]
fn range_index_on_a_compressed_database() {
    let db_file = utils::temp_file_name("db-gri");
    let conn = open_test_db(&db_file, &test_config());
    conn.execute_batch("CREATE TABLE features (chrom TEXT, beg INTEGER, end INTEGER)")
        .unwrap();
    let create = gri::create_genomic_range_index_sql("features", "chrom", "beg", "end", -1).unwrap();
    conn.execute_batch(&create).unwrap();
    conn.execute_batch(
        "INSERT INTO features VALUES
         ('chr1', 100, 200), ('chr1', 300, 400), ('chr1', 150, 350)",
    )
    .unwrap();

    let assembly = refseq::put_reference_assembly_sql("GRCh38_no_alt_analysis_set", None).unwrap();
    conn.execute_batch(&assembly).unwrap();

    let subquery = gri::genomic_range_rowids_sql(&conn, "features", None, None, None, -1, -1).unwrap();
    let sql = format!("SELECT _rowid_ FROM features WHERE _rowid_ IN {}", subquery);
    let run = |conn: &Connection| -> Vec<i64> {
        let mut statement = conn.prepare(&sql).unwrap();
        let rows = statement
            .query_map(params!["chr1", 180, 320], |row| row.get(0))
            .unwrap();
        rows.collect::<rusqlite::Result<Vec<i64>>>().unwrap()
    };
    assert_eq!(run(&conn), vec![1, 2, 3], "Wrong overlap results on a compressed database");
    drop(conn);

    // Everything must survive a reopen from disk.
    let conn = open_test_db(&db_file, &test_config());
    assert_eq!(run(&conn), vec![1, 2, 3], "Wrong overlap results after reopen");
    let refseqs = refseq::reference_sequences_by_name(&conn, None, None).unwrap();
    assert_eq!(refseqs.len(), 25, "Reference catalog lost across reopen");
    assert_eq!(refseqs["chr12"].length, 133275309, "Wrong chr12 length");
    drop(conn);
    fs::remove_file(&db_file).unwrap();
}

//-----------------------------------------------------------------------------

#[test]
fn vacuum_into_sql_validation() {
    let sql = vacuum_into_sql("/tmp/dest.db", &test_config()).unwrap();
    assert!(sql.contains("PRAGMA page_size = 4096"), "Missing page size pragma: {}", sql);
    assert!(sql.contains("VACUUM INTO 'file:/tmp/dest.db?vfs=zstd"), "Missing vacuum statement: {}", sql);
    assert!(sql.contains("outer_page_size=16384"), "Missing storage keys: {}", sql);

    let result = vacuum_into_sql("", &test_config());
    assert!(matches!(result, Err(Error::Config(_))), "Empty destination was accepted");

    let sql = vacuum_into_sql("it's.db", &test_config()).unwrap();
    assert!(sql.contains("it''s.db"), "Destination quoting failed: {}", sql);
}

#[test]
fn vacuum_into_compressed_and_again() {
    // A plain database as the source.
    let src_file = utils::temp_file_name("vacuum-src");
    let src = Connection::open(&src_file).unwrap();
    src.execute_batch(
        "CREATE TABLE features (chrom TEXT, beg INTEGER, end INTEGER);
         BEGIN;
         INSERT INTO features
         WITH RECURSIVE series(value) AS
             (SELECT 1 UNION ALL SELECT value + 1 FROM series WHERE value < 5000)
         SELECT 'chr1', value * 100, value * 100 + 50 FROM series;
         COMMIT",
    )
    .unwrap();

    // Compress it with VACUUM INTO from the plain connection.
    init().unwrap();
    let first = utils::temp_file_name("vacuum-a");
    let sql = vacuum_into_sql(first.to_str().unwrap(), &test_config()).unwrap();
    src.execute_batch(&sql).unwrap();
    drop(src);
    assert_eq!(identify_storage(&first), StorageKind::Compressed, "Vacuum output not compressed");

    // The copy opens through the compressed VFS with identical content.
    let conn = open_test_db(&first, &test_config());
    assert_eq!(row_count(&conn, "features"), 5000, "Rows lost in vacuum");

    // Vacuuming the copy again with the same configuration reproduces it
    // byte for byte.
    let second = utils::temp_file_name("vacuum-b");
    let sql = vacuum_into_sql(second.to_str().unwrap(), &test_config()).unwrap();
    conn.execute_batch(&sql).unwrap();
    drop(conn);
    assert_eq!(
        fs::read(&first).unwrap(),
        fs::read(&second).unwrap(),
        "Re-vacuum should be byte-identical"
    );

    fs::remove_file(&src_file).unwrap();
    fs::remove_file(&first).unwrap();
    fs::remove_file(&second).unwrap();
}

//-----------------------------------------------------------------------------
