//! Genomic range indexing for feature tables.
//!
//! A genomic range index (GRI) makes interval-overlap queries over a feature
//! table efficient using only ordinary relational primitives. Indexing a
//! table adds four virtual generated columns (`_gri_rid`, `_gri_beg`,
//! `_gri_len`, `_gri_lvl`) and a composite B-tree index over
//! `(_gri_rid, _gri_lvl, _gri_beg)`. Features are classified by *level*:
//! an interval of length `L` has level `ceil(log16(L))`, so a query needs to
//! consult at most one bounded range scan per populated level.
//!
//! The routines in this module are SQL generators, not executors. They
//! return SQL text for the caller to execute or to compose into larger
//! queries (joins, `WITH`, views). The caller is responsible for sanitizing
//! the coordinate expressions it passes in; they are interpolated verbatim
//! so that arithmetic coordinate sources and correlated references to other
//! tables keep working.
//!
//! See [`create_genomic_range_index_sql`] for indexing a table and
//! [`genomic_range_rowids_sql`] for querying it.

use crate::error::{Error, Result};

use rusqlite::Connection;

use tracing::debug;


//-----------------------------------------------------------------------------

// Level and bin arithmetic.

/// The largest level in a genomic range index.
///
/// Positions may reach `2^60 = 16^15`, so an interval of any representable
/// length fits within level 15.
pub const MAX_LEVEL: i64 = 15;

/// Returns the level of the half-open interval `[beg, end)`.
///
/// The level is the smallest `l` such that `end - beg <= 16^l`, clamped
/// below by `max(0, floor)` and above by [`MAX_LEVEL`]. Empty intervals are
/// classified at the floor level. Returns [`None`] when `end < beg`; such
/// intervals are excluded from the index and never match a query.
pub fn interval_level(beg: i64, end: i64, floor: i64) -> Option<i64> {
    let len = end - beg;
    if len < 0 {
        return None;
    }
    let floor = floor.clamp(0, MAX_LEVEL);
    let mut level = 0;
    while level < MAX_LEVEL && len > (1i64 << (4 * level)) {
        level += 1;
    }
    Some(level.max(floor))
}

/// Returns the bin of position `pos` at the given level.
///
/// Level `l` partitions the coordinate axis into bins of width `16^l`.
/// Bins are conceptual: nothing stores them, because a bin is implicit in
/// `(_gri_lvl, _gri_beg)` and a range scan on the composite index is
/// cheaper than bin-equality lookups.
pub fn position_bin(pos: i64, level: i64) -> i64 {
    let level = level.clamp(0, MAX_LEVEL);
    pos >> (4 * level)
}

/// Returns the first and last bin of the half-open interval `[beg, end)` at
/// the given level.
///
/// An empty interval occupies a single bin. An interval no longer than the
/// bin width spans at most two adjacent bins.
pub fn interval_bins(beg: i64, end: i64, level: i64) -> (i64, i64) {
    let last = if end > beg { end - 1 } else { beg };
    (position_bin(beg, level), position_bin(last, level))
}

//-----------------------------------------------------------------------------

// Parameter validation shared by the emitters.

// Conservative identifier check for table and schema names. Coordinate
// expressions are not checked; they pass through verbatim.
pub(crate) fn check_identifier(what: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid {} identifier: {:?}", what, name)))
    }
}

// Floor and ceiling parameters are levels, with -1 meaning "unset".
fn check_level_param(what: &str, value: i64) -> Result<()> {
    if (-1..=MAX_LEVEL).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be in -1..=15, got {}", what, value)))
    }
}

fn check_expression(what: &str, expr: &str) -> Result<()> {
    if expr.trim().is_empty() {
        Err(Error::Config(format!("{} expression must not be empty", what)))
    } else {
        Ok(())
    }
}

//-----------------------------------------------------------------------------

/// Returns SQL that adds a genomic range index to the given table.
///
/// The table must be an ordinary rowid table. The emitted script adds the
/// virtual generated columns `_gri_rid`, `_gri_beg`, `_gri_len` and
/// `_gri_lvl`, and creates the composite index `_gri_<table>` over
/// `(_gri_rid, _gri_lvl, _gri_beg)`. The generated columns are not
/// materialized in the table, but they are materialized in the index, and
/// writes to the base table maintain the index transparently.
///
/// The script must be executed within a single transaction so that a
/// partial failure can be rolled back. Re-running it against an
/// already-indexed table fails with the host engine's duplicate-column
/// error.
///
/// # Arguments
///
/// * `table`: Name of an existing rowid table.
/// * `rid_expr`: SQL expression for the reference-sequence id or chromosome
///   name, typically a column name. Interpolated verbatim.
/// * `beg_expr`: SQL expression for the interval begin position.
/// * `end_expr`: SQL expression for the interval end position.
/// * `floor`: Levels below this collapse into one; in `0..=15`, or -1 for
///   the default of 0.
///
/// A row whose coordinates are NULL, or whose end position is before its
/// begin position, gets a NULL `_gri_lvl` and is never matched by a range
/// query.
///
/// # Examples
///
/// ```
/// use genomicsqlite::gri;
/// use rusqlite::Connection;
///
/// let conn = Connection::open_in_memory().unwrap();
/// conn.execute_batch(
///     "CREATE TABLE features (chrom TEXT, beg INTEGER, end INTEGER)"
/// ).unwrap();
/// let sql = gri::create_genomic_range_index_sql(
///     "features", "chrom", "beg", "end", -1
/// ).unwrap();
/// conn.execute_batch(&sql).unwrap();
/// ```
pub fn create_genomic_range_index_sql(
    table: &str,
    rid_expr: &str, beg_expr: &str, end_expr: &str,
    floor: i64,
) -> Result<String> {
    check_identifier("table", table)?;
    check_expression("rid", rid_expr)?;
    check_expression("begin", beg_expr)?;
    check_expression("end", end_expr)?;
    check_level_param("floor", floor)?;
    let floor = floor.max(0);

    // The level column must agree exactly with interval_level(). The CASE
    // ladder finds the smallest level whose bin width covers the length,
    // starting from the floor.
    let len_expr = format!("({})-({})", end_expr, beg_expr);
    let mut lvl_expr = format!("CASE WHEN {len} IS NULL OR {len} < 0 THEN NULL", len = len_expr);
    for level in floor..MAX_LEVEL {
        lvl_expr.push_str(&format!(
            " WHEN {} <= {:#x} THEN {}",
            len_expr,
            1i64 << (4 * level),
            level
        ));
    }
    lvl_expr.push_str(&format!(" ELSE {} END", MAX_LEVEL));

    Ok(format!(
        "ALTER TABLE \"{table}\" ADD COLUMN _gri_rid AS ({rid}) VIRTUAL;\n\
         ALTER TABLE \"{table}\" ADD COLUMN _gri_beg INTEGER AS ({beg}) VIRTUAL;\n\
         ALTER TABLE \"{table}\" ADD COLUMN _gri_len INTEGER AS ({len}) VIRTUAL;\n\
         ALTER TABLE \"{table}\" ADD COLUMN _gri_lvl INTEGER AS ({lvl}) VIRTUAL;\n\
         CREATE INDEX \"_gri_{table}\" ON \"{table}\"(_gri_rid, _gri_lvl, _gri_beg)",
        table = table,
        rid = rid_expr,
        beg = beg_expr,
        len = len_expr,
        lvl = lvl_expr,
    ))
}

//-----------------------------------------------------------------------------

/// The set of levels populated in a genomic range index, as observed by
/// [`detect_levels`].
///
/// The observed floor/ceiling can be cached by callers that emit query SQL
/// repeatedly, but they become stale once writes extend the level range;
/// see [`genomic_range_rowids_sql`] for the invalidation rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeIndexLevels {
    levels: Vec<i64>,
}

impl RangeIndexLevels {
    /// Returns the populated levels in ascending order.
    pub fn levels(&self) -> &[i64] {
        &self.levels
    }

    /// Returns the smallest populated level, or [`None`] if the index is
    /// empty.
    pub fn floor(&self) -> Option<i64> {
        self.levels.first().copied()
    }

    /// Returns the largest populated level, or [`None`] if the index is
    /// empty.
    pub fn ceiling(&self) -> Option<i64> {
        self.levels.last().copied()
    }

    /// Returns `true` if no level is populated.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Probes the genomic range index on the given table for the set of
/// populated levels.
///
/// This issues one `SELECT DISTINCT` over the composite index. It is the
/// only routine in this module that executes SQL; everything else is a pure
/// string builder.
///
/// # Errors
///
/// Returns [`Error::Probe`] if the probe cannot run, for example because
/// the table has no genomic range index. Callers can bypass probing by
/// emitting with an explicit ceiling and floor.
pub fn detect_levels(conn: &Connection, table: &str) -> Result<RangeIndexLevels> {
    check_identifier("table", table)?;
    let sql = format!(
        "SELECT DISTINCT _gri_lvl FROM \"{table}\" INDEXED BY \"_gri_{table}\" \
         WHERE _gri_lvl IS NOT NULL ORDER BY _gri_lvl",
        table = table,
    );

    let probe = || -> rusqlite::Result<Vec<i64>> {
        let mut statement = conn.prepare(&sql)?;
        let mut rows = statement.query(())?;
        let mut levels: Vec<i64> = Vec::new();
        while let Some(row) = rows.next()? {
            levels.push(row.get(0)?);
        }
        Ok(levels)
    };

    match probe() {
        Ok(levels) => {
            debug!(table, ?levels, "probed range index levels");
            Ok(RangeIndexLevels { levels })
        }
        Err(source) => Err(Error::Probe { table: String::from(table), source }),
    }
}

//-----------------------------------------------------------------------------

// Query SQL generation.

const DEFAULT_QRID: &str = "?1";
const DEFAULT_QBEG: &str = "?2";
const DEFAULT_QEND: &str = "?3";

// One UNION ALL arm: a range scan on the composite index for a single
// level. A level-l feature is at most 16^l long, so one that overlaps the
// query began no earlier than qbeg - 16^l; features that end before the
// query starts are filtered by the final term.
fn level_arm(table: &str, qrid: &str, qbeg: &str, qend: &str, level: i64) -> String {
    format!(
        "SELECT _rowid_ FROM \"{table}\" INDEXED BY \"_gri_{table}\" \
         WHERE _gri_rid = ({qrid}) AND _gri_lvl = {level} \
         AND _gri_beg BETWEEN ({qbeg}) - {width:#x} AND ({qend}) - 1 \
         AND (_gri_beg + _gri_len) >= ({qbeg})",
        table = table,
        qrid = qrid,
        qbeg = qbeg,
        qend = qend,
        level = level,
        width = 1i64 << (4 * level),
    )
}

// Assembles the parenthesized subquery from per-level arms. The levels are
// emitted in descending order; the outer ORDER BY makes the result
// ascending by rowid regardless.
fn union_over_levels(table: &str, qrid: &str, qbeg: &str, qend: &str, levels: &[i64]) -> String {
    if levels.is_empty() {
        return format!("(SELECT _rowid_ FROM \"{}\" WHERE 0)", table);
    }
    let mut arms: Vec<String> = Vec::with_capacity(levels.len());
    for level in levels.iter().rev() {
        arms.push(level_arm(table, qrid, qbeg, qend, *level));
    }
    format!(
        "(SELECT _rowid_ FROM (\n{}\n) ORDER BY _rowid_)",
        arms.join("\n UNION ALL\n")
    )
}

/// Returns a subquery yielding the rowids of rows whose interval overlaps
/// the query range, probing the index to prune unused levels.
///
/// The result is a parenthesized `SELECT` suitable for composition into a
/// containing query, typically `... WHERE _rowid_ IN <subquery>`. It
/// matches the rows that are not disjoint from the query range:
/// `qrid = _gri_rid AND _gri_beg < qend AND _gri_beg + _gri_len >= qbeg`.
/// Under the recommended zero-based half-open convention this includes a
/// feature whose end abuts the query begin, while the exclusive query end
/// stays exclusive; callers wanting strict overlap or containment tighten
/// the result in their outer `WHERE`. Output is ascending by rowid with no
/// duplicates. Rows with NULL coordinates never match, and the query range
/// must be nonempty (`qbeg < qend`).
///
/// # Arguments
///
/// * `conn`: Connection used for probing.
/// * `table`: Name of a table indexed with
///   [`create_genomic_range_index_sql`].
/// * `qrid`, `qbeg`, `qend`: SQL expressions for the query range,
///   defaulting to the parameters `?1`, `?2`, `?3`. Interpolated verbatim;
///   they may reference other tables in the enclosing query, which enables
///   range joins.
/// * `ceiling`: Largest level to query, or -1 to probe the index for the
///   populated set.
/// * `floor`: Smallest level to query, or -1 to probe for it.
///
/// # Plan shape and invalidation
///
/// With `ceiling = -1`, the index is probed and exactly the populated
/// levels are baked into the emitted SQL as a literal `UNION ALL`. The
/// probe runs here, at emission, not per query: the point of emitting SQL
/// is that the caller prepares it once and re-binds it many times. The
/// price is that later writes creating features at a level outside the
/// baked set invalidate the emission, and the caller must regenerate.
/// On databases with concurrent writers the emission may be stale by the
/// time it first executes; such callers should supply an explicit
/// `ceiling`, which stays correct under any future writes bounded by it.
///
/// With `ceiling >= 0` and `floor >= 0`, no probe runs (see
/// [`genomic_range_rowids_safe_sql`]). With `ceiling >= 0` and
/// `floor = -1`, the probe determines the smallest populated level, and a
/// populated level above the ceiling is reported as
/// [`Error::Integrity`].
///
/// # Examples
///
/// ```
/// use genomicsqlite::gri;
/// use rusqlite::Connection;
///
/// let conn = Connection::open_in_memory().unwrap();
/// conn.execute_batch(
///     "CREATE TABLE features (chrom TEXT, beg INTEGER, end INTEGER)"
/// ).unwrap();
/// let create = gri::create_genomic_range_index_sql(
///     "features", "chrom", "beg", "end", -1
/// ).unwrap();
/// conn.execute_batch(&create).unwrap();
/// conn.execute_batch(
///     "INSERT INTO features VALUES
///      ('chr1', 100, 200), ('chr1', 300, 400), ('chr1', 150, 350)"
/// ).unwrap();
///
/// let subquery = gri::genomic_range_rowids_sql(
///     &conn, "features", None, None, None, -1, -1
/// ).unwrap();
/// let query = format!("SELECT beg FROM features WHERE _rowid_ IN {}", subquery);
/// let mut statement = conn.prepare(&query).unwrap();
/// let begs: Vec<i64> = statement
///     .query_map(rusqlite::params!["chr1", 180, 320], |row| row.get(0))
///     .unwrap()
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(begs, vec![100, 300, 150]);
/// ```
pub fn genomic_range_rowids_sql(
    conn: &Connection,
    table: &str,
    qrid: Option<&str>, qbeg: Option<&str>, qend: Option<&str>,
    ceiling: i64, floor: i64,
) -> Result<String> {
    check_identifier("table", table)?;
    check_level_param("ceiling", ceiling)?;
    check_level_param("floor", floor)?;
    if ceiling >= 0 && floor >= 0 {
        return genomic_range_rowids_safe_sql(table, qrid, qbeg, qend, ceiling, floor);
    }
    let qrid = qrid.unwrap_or(DEFAULT_QRID);
    let qbeg = qbeg.unwrap_or(DEFAULT_QBEG);
    let qend = qend.unwrap_or(DEFAULT_QEND);
    check_expression("qrid", qrid)?;
    check_expression("qbeg", qbeg)?;
    check_expression("qend", qend)?;

    let probed = detect_levels(conn, table)?;
    let levels: Vec<i64> = if ceiling >= 0 {
        // Explicit ceiling with a probed floor: the full range stays
        // correct under future writes bounded by the ceiling.
        if let Some(observed) = probed.ceiling() {
            if observed > ceiling {
                return Err(Error::Integrity(format!(
                    "ceiling {} is below the largest populated level {} in the range index on {}",
                    ceiling, observed, table
                )));
            }
        }
        (probed.floor().unwrap_or(0)..=ceiling).collect()
    } else {
        // Probed levels, optionally cut at an explicit floor.
        probed
            .levels()
            .iter()
            .copied()
            .filter(|level| floor < 0 || *level >= floor)
            .collect()
    };

    Ok(union_over_levels(table, qrid, qbeg, qend, &levels))
}

/// Returns the overlap subquery for an explicit level range, without
/// probing the index.
///
/// This is the offline variant of [`genomic_range_rowids_sql`]: it needs no
/// connection, and the emitted SQL covers every level in
/// `[max(0, floor), ceiling]`, so it remains correct under any future
/// writes whose feature lengths stay within level `ceiling`. The price is
/// up to `ceiling - floor + 1` range scans per query even when most levels
/// are empty.
///
/// # Errors
///
/// Returns [`Error::Config`] if `ceiling` is not an actual level or the
/// floor exceeds it.
pub fn genomic_range_rowids_safe_sql(
    table: &str,
    qrid: Option<&str>, qbeg: Option<&str>, qend: Option<&str>,
    ceiling: i64, floor: i64,
) -> Result<String> {
    check_identifier("table", table)?;
    check_level_param("floor", floor)?;
    if !(0..=MAX_LEVEL).contains(&ceiling) {
        return Err(Error::Config(format!(
            "an explicit ceiling in 0..=15 is required, got {}",
            ceiling
        )));
    }
    let floor = floor.max(0);
    if floor > ceiling {
        return Err(Error::Config(format!(
            "floor {} exceeds ceiling {}",
            floor, ceiling
        )));
    }
    let qrid = qrid.unwrap_or(DEFAULT_QRID);
    let qbeg = qbeg.unwrap_or(DEFAULT_QBEG);
    let qend = qend.unwrap_or(DEFAULT_QEND);
    check_expression("qrid", qrid)?;
    check_expression("qbeg", qbeg)?;
    check_expression("qend", qend)?;

    let levels: Vec<i64> = (floor..=ceiling).collect();
    Ok(union_over_levels(table, qrid, qbeg, qend, &levels))
}

//-----------------------------------------------------------------------------
