//! Opening and tuning compressed database connections.
//!
//! [`open`] is the way applications obtain a connection: it registers the
//! compressed VFS with the host engine on first use, checks that the target
//! file is either empty or already in the compressed layout, opens the
//! database through the VFS, and applies tuning pragmas derived from a
//! [`TuningConfig`]. Opening a compressed database through the default
//! (uncompressed) VFS would expose the raw container to the application and
//! invite corruption, so the opener refuses files it does not recognize
//! rather than guessing.
//!
//! [`vacuum_into_sql`] emits the statement that copies any database,
//! compressed or plain, into a freshly compressed file.

use crate::error::{Error, Result};
use crate::vfs;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags};

use tracing::debug;

#[cfg(test)]
mod tests;

//-----------------------------------------------------------------------------

/// Returns the version of this crate.
///
/// The same string is available in SQL as `genomicsqlite_version()` on
/// connections obtained from [`open`].
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Registers the compressed VFS with the host engine.
///
/// [`open`] calls this on demand; it is public for callers that want to use
/// the `vfs=zstd` URI parameter with connections they open themselves, for
/// example to execute [`vacuum_into_sql`] from a plain database.
/// Registration happens once per process.
pub fn init() -> Result<()> {
    vfs::shim::register()?;
    Ok(())
}

//-----------------------------------------------------------------------------

/// Tuning configuration for compressed database connections.
///
/// The page sizes are fixed when the database file is created; the other
/// keys take effect per connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TuningConfig {
    /// Trade crash safety for bulk-load speed: disables journaling and
    /// synchronous writes and defers foreign-key checks for this
    /// connection's lifetime. A crash can lose the database.
    pub unsafe_load: bool,
    /// Host engine page-cache size in MiB.
    pub page_cache_mib: i64,
    /// Worker budget for chunk compression and the engine's sorter, or -1
    /// for `min(host cpus, 8)`.
    pub threads: i64,
    /// Zstd compression level for newly written chunks, in [-5, 22].
    pub zstd_level: i32,
    /// Host engine page size in KiB; one of {1, 2, 4, 8, 16, 32, 64}.
    pub inner_page_kib: u32,
    /// Compressed storage chunk size in KiB; same domain.
    pub outer_page_kib: u32,
}

impl TuningConfig {
    /// Default for `page_cache_mib`.
    pub const DEFAULT_PAGE_CACHE_MIB: i64 = 1024;
    /// Default for `zstd_level`.
    pub const DEFAULT_ZSTD_LEVEL: i32 = 6;
    /// Default for `inner_page_kib`.
    pub const DEFAULT_INNER_PAGE_KIB: u32 = 16;
    /// Default for `outer_page_kib`.
    pub const DEFAULT_OUTER_PAGE_KIB: u32 = 32;
    /// Largest worker count chosen automatically with `threads = -1`.
    pub const MAX_AUTO_THREADS: usize = 8;

    const PAGE_KIB: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_cache_mib <= 0 {
            return Err(Error::Config(format!(
                "page_cache_MiB must be positive, got {}",
                self.page_cache_mib
            )));
        }
        if self.threads != -1 && !(1..=64).contains(&self.threads) {
            return Err(Error::Config(format!(
                "threads must be -1 or in 1..=64, got {}",
                self.threads
            )));
        }
        if !(-5..=22).contains(&self.zstd_level) {
            return Err(Error::Config(format!(
                "zstd_level must be in -5..=22, got {}",
                self.zstd_level
            )));
        }
        if !Self::PAGE_KIB.contains(&self.inner_page_kib) {
            return Err(Error::Config(format!(
                "inner_page_KiB must be one of {:?}, got {}",
                Self::PAGE_KIB,
                self.inner_page_kib
            )));
        }
        if !Self::PAGE_KIB.contains(&self.outer_page_kib) {
            return Err(Error::Config(format!(
                "outer_page_KiB must be one of {:?}, got {}",
                Self::PAGE_KIB,
                self.outer_page_kib
            )));
        }
        Ok(())
    }

    /// Returns the worker count after resolving `threads = -1` against the
    /// host cpu count.
    pub fn resolved_threads(&self) -> usize {
        if self.threads < 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(Self::MAX_AUTO_THREADS)
        } else {
            self.threads as usize
        }
    }

    // URI filename carrying the storage-layer keys down to the VFS.
    fn storage_uri(&self, path: &str) -> String {
        format!(
            "file:{}?vfs={}&outer_page_size={}&zstd_level={}&threads={}",
            path,
            vfs::VFS_NAME,
            self.outer_page_kib as u64 * 1024,
            self.zstd_level,
            self.resolved_threads(),
        )
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            unsafe_load: false,
            page_cache_mib: Self::DEFAULT_PAGE_CACHE_MIB,
            threads: -1,
            zstd_level: Self::DEFAULT_ZSTD_LEVEL,
            inner_page_kib: Self::DEFAULT_INNER_PAGE_KIB,
            outer_page_kib: Self::DEFAULT_OUTER_PAGE_KIB,
        }
    }
}

//-----------------------------------------------------------------------------

// The first bytes of an uncompressed SQLite database.
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Storage layout of a potential database file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// The file does not exist or is empty.
    Missing,
    /// The file is in the compressed layout.
    Compressed,
    /// The file is an uncompressed SQLite database.
    PlainDatabase,
    /// The file is something else.
    Unknown,
}

/// Determines the storage layout of the given file.
pub fn identify_storage<P: AsRef<Path>>(path: P) -> StorageKind {
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(_) => return StorageKind::Missing,
    };
    if !metadata.is_file() {
        return StorageKind::Unknown;
    }
    if metadata.len() == 0 {
        return StorageKind::Missing;
    }

    let mut header = [0u8; 16];
    let n = match File::open(&path).and_then(|mut file| file.read(&mut header)) {
        Ok(n) => n,
        Err(_) => return StorageKind::Unknown,
    };
    if n >= vfs::STORE_MAGIC.len() && header[..vfs::STORE_MAGIC.len()] == vfs::STORE_MAGIC {
        StorageKind::Compressed
    } else if n >= SQLITE_HEADER.len() && header[..SQLITE_HEADER.len()] == SQLITE_HEADER[..] {
        StorageKind::PlainDatabase
    } else {
        StorageKind::Unknown
    }
}

//-----------------------------------------------------------------------------

/// Opens a compressed database, creating it if the flags allow.
///
/// Registers the compressed VFS on first use, opens the file through it
/// with the supplied flags, registers the `genomicsqlite_version()` SQL
/// function on the connection, and applies the tuning pragmas derived from
/// `config`. The target file must not exist, be empty, or already be in
/// the compressed layout; anything else is refused before the host engine
/// touches it.
///
/// The path must be expressible as a URI filename, so it should not
/// contain `?` or `#`.
///
/// # Examples
///
/// ```
/// use genomicsqlite::db::{self, TuningConfig};
/// use genomicsqlite::utils;
/// use rusqlite::OpenFlags;
/// use std::fs;
///
/// let db_file = utils::temp_file_name("opener");
/// let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
/// let conn = db::open(&db_file, flags, &TuningConfig::default()).unwrap();
/// conn.execute_batch("CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (1), (2)").unwrap();
///
/// let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", (), |row| row.get(0)).unwrap();
/// assert_eq!(count, 2);
/// let version: String = conn
///     .query_row("SELECT genomicsqlite_version()", (), |row| row.get(0))
///     .unwrap();
/// assert_eq!(version, db::version());
///
/// drop(conn);
/// fs::remove_file(&db_file).unwrap();
/// ```
pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags, config: &TuningConfig) -> Result<Connection> {
    config.validate()?;
    init()?;

    let path = path.as_ref();
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::Config(format!("path {} is not valid UTF-8", path.display())))?;
    match identify_storage(path) {
        StorageKind::Missing | StorageKind::Compressed => {}
        StorageKind::PlainDatabase => {
            return Err(Error::Integrity(format!(
                "{} is an uncompressed SQLite database; copy it with vacuum_into_sql first",
                path.display()
            )));
        }
        StorageKind::Unknown => {
            return Err(Error::Integrity(format!(
                "{} is neither empty nor a compressed database",
                path.display()
            )));
        }
    }

    let uri = config.storage_uri(path_str);
    let conn = Connection::open_with_flags(&uri, flags | OpenFlags::SQLITE_OPEN_URI)?;
    conn.create_scalar_function(
        "genomicsqlite_version",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |_| Ok(version().to_string()),
    )?;
    apply_tuning(&conn, config)?;
    debug!(path = %path.display(), "opened compressed database");
    Ok(conn)
}

// Pragmas may or may not return a row; step through whatever comes back.
fn exec_pragma(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut statement = conn.prepare(sql)?;
    let mut rows = statement.query(())?;
    while rows.next()?.is_some() {}
    Ok(())
}

fn apply_tuning(conn: &Connection, config: &TuningConfig) -> rusqlite::Result<()> {
    // Page size only takes effect while the database is still empty.
    exec_pragma(conn, &format!("PRAGMA page_size = {}", config.inner_page_kib as u64 * 1024))?;
    // Negative cache_size is a budget in KiB rather than pages.
    exec_pragma(conn, &format!("PRAGMA cache_size = -{}", config.page_cache_mib * 1024))?;
    exec_pragma(conn, &format!("PRAGMA threads = {}", config.resolved_threads()))?;
    if config.unsafe_load {
        exec_pragma(conn, "PRAGMA journal_mode = OFF")?;
        exec_pragma(conn, "PRAGMA synchronous = OFF")?;
        exec_pragma(conn, "PRAGMA defer_foreign_keys = ON")?;
    }
    Ok(())
}

//-----------------------------------------------------------------------------

/// Returns SQL that copies the connection's database into a freshly
/// compressed file at `dest`.
///
/// The emitted script sets the page size for the copy and then runs the
/// host engine's `VACUUM INTO` with a URI destination that routes through
/// the compressed VFS. It can be executed on any connection that has URI
/// filenames enabled and the VFS registered (see [`init`]), including a
/// connection to a plain, uncompressed database.
///
/// The destination must not exist; `VACUUM INTO` refuses to overwrite.
pub fn vacuum_into_sql(dest: &str, config: &TuningConfig) -> Result<String> {
    config.validate()?;
    if dest.is_empty() {
        return Err(Error::Config(String::from("destination path must not be empty")));
    }
    let uri = config.storage_uri(dest);
    Ok(format!(
        "PRAGMA page_size = {};\nVACUUM INTO '{}'",
        config.inner_page_kib as u64 * 1024,
        uri.replace('\'', "''"),
    ))
}

//-----------------------------------------------------------------------------
