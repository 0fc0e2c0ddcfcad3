//! Reference-sequence catalog.
//!
//! Feature tables can store chromosomes either as text names or as compact
//! integer reference-sequence ids (rids). The catalog table `_gri_refseq`
//! records the mapping between the two, together with sequence lengths and
//! optional assembly metadata. The write side is SQL emission, like the
//! rest of the crate; the read side produces snapshot lookup maps in both
//! directions.
//!
//! The catalog is optional. Tables indexed on text chromosome names never
//! need it.

use crate::error::{Error, Result};
use crate::gri;

use std::collections::BTreeMap;

use rusqlite::Connection;


//-----------------------------------------------------------------------------

/// One row of the `_gri_refseq` catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceSequence {
    /// Reference-sequence id; the value stored in feature tables.
    pub rid: i64,
    /// Sequence name, e.g. `chr1`.
    pub name: String,
    /// Sequence length in base pairs.
    pub length: i64,
    /// Assembly the sequence belongs to, if known.
    pub assembly: Option<String>,
    /// Refget digest of the sequence, if known.
    pub refget_id: Option<String>,
    /// Further metadata as a JSON object; defaults to `{}`.
    pub meta_json: String,
}

//-----------------------------------------------------------------------------

// The primary sequences of the GRCh38 analysis set, with their lengths.
// Rids are assigned in karyotype order starting from 1.
const GRCH38_NO_ALT_ANALYSIS_SET: [(&str, i64); 25] = [
    ("chr1", 248956422),
    ("chr2", 242193529),
    ("chr3", 198295559),
    ("chr4", 190214555),
    ("chr5", 181538259),
    ("chr6", 170805979),
    ("chr7", 159345973),
    ("chr8", 145138636),
    ("chr9", 138394717),
    ("chr10", 133797422),
    ("chr11", 135086622),
    ("chr12", 133275309),
    ("chr13", 114364328),
    ("chr14", 107043718),
    ("chr15", 101991189),
    ("chr16", 90338345),
    ("chr17", 83257441),
    ("chr18", 80373285),
    ("chr19", 58617616),
    ("chr20", 64444167),
    ("chr21", 46709983),
    ("chr22", 50818468),
    ("chrX", 156040895),
    ("chrY", 57227415),
    ("chrM", 16569),
];

//-----------------------------------------------------------------------------

// SQL helpers.

// "schema". prefix for attached-database targets, or nothing.
fn schema_prefix(schema: Option<&str>) -> Result<String> {
    match schema {
        Some(name) => {
            gri::check_identifier("schema", name)?;
            Ok(format!("\"{}\".", name))
        }
        None => Ok(String::new()),
    }
}

// SQL string literal with single quotes doubled.
fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_optional(value: Option<&str>) -> String {
    match value {
        Some(value) => quote_string(value),
        None => String::from("NULL"),
    }
}

// Idempotent DDL for the catalog table and its uniqueness index.
// Name uniqueness is scoped by assembly when both are populated; rows with
// a NULL assembly are not constrained against each other.
fn refseq_ddl(schema: Option<&str>) -> Result<String> {
    let prefix = schema_prefix(schema)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {prefix}\"_gri_refseq\"(\n\
         _gri_rid INTEGER NOT NULL PRIMARY KEY,\n\
         gri_refseq_name TEXT NOT NULL,\n\
         gri_refseq_length INTEGER NOT NULL,\n\
         gri_assembly TEXT,\n\
         gri_refget_id TEXT,\n\
         gri_refseq_meta_json TEXT DEFAULT '{{}}');\n\
         CREATE UNIQUE INDEX IF NOT EXISTS {prefix}\"_gri_refseq_name\" \
         ON \"_gri_refseq\"(gri_assembly, gri_refseq_name)",
        prefix = prefix,
    ))
}

//-----------------------------------------------------------------------------

/// Returns SQL that creates the `_gri_refseq` catalog (idempotently) and
/// inserts one reference sequence.
///
/// # Arguments
///
/// * `name`: Sequence name; must be nonempty.
/// * `length`: Sequence length in base pairs; must be nonnegative.
/// * `assembly`: Assembly name, if known.
/// * `refget_id`: Refget digest, if known.
/// * `meta_json`: JSON object with further metadata; defaults to `{}`.
/// * `rid`: Explicit reference-sequence id, or -1 to let the host engine
///   assign the next free id.
/// * `schema`: Attached-database schema holding the catalog, if not `main`.
pub fn put_reference_sequence_sql(
    name: &str, length: i64,
    assembly: Option<&str>, refget_id: Option<&str>, meta_json: Option<&str>,
    rid: i64,
    schema: Option<&str>,
) -> Result<String> {
    if name.is_empty() {
        return Err(Error::Config(String::from("reference sequence name must not be empty")));
    }
    if length < 0 {
        return Err(Error::Config(format!(
            "reference sequence length must be nonnegative, got {}", length
        )));
    }
    if rid < -1 {
        return Err(Error::Config(format!("rid must be -1 or nonnegative, got {}", rid)));
    }

    let prefix = schema_prefix(schema)?;
    let rid_value = if rid < 0 { String::from("NULL") } else { rid.to_string() };
    let insert = format!(
        "INSERT INTO {prefix}\"_gri_refseq\"\
         (_gri_rid, gri_refseq_name, gri_refseq_length, gri_assembly, gri_refget_id, gri_refseq_meta_json)\n\
         VALUES({rid}, {name}, {length}, {assembly}, {refget}, {meta})",
        prefix = prefix,
        rid = rid_value,
        name = quote_string(name),
        length = length,
        assembly = quote_optional(assembly),
        refget = quote_optional(refget_id),
        meta = quote_string(meta_json.unwrap_or("{}")),
    );
    Ok(format!("{};\n{}", refseq_ddl(schema)?, insert))
}

/// Returns SQL that creates the `_gri_refseq` catalog (idempotently) and
/// loads a bundled reference assembly into it.
///
/// The only bundled assembly is `GRCh38_no_alt_analysis_set`: the 25
/// primary sequences chr1..chr22, chrX, chrY and chrM with rids 1..25 in
/// karyotype order. Loading the same assembly twice fails with the host
/// engine's uniqueness error.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unknown assembly name.
pub fn put_reference_assembly_sql(assembly: &str, schema: Option<&str>) -> Result<String> {
    if assembly != "GRCh38_no_alt_analysis_set" {
        return Err(Error::Config(format!("unknown bundled assembly: {:?}", assembly)));
    }
    let prefix = schema_prefix(schema)?;

    let mut rows: Vec<String> = Vec::with_capacity(GRCH38_NO_ALT_ANALYSIS_SET.len());
    for (index, (name, length)) in GRCH38_NO_ALT_ANALYSIS_SET.iter().enumerate() {
        rows.push(format!(
            "({}, {}, {}, {}, NULL, '{{}}')",
            index + 1,
            quote_string(name),
            length,
            quote_string(assembly),
        ));
    }
    Ok(format!(
        "{ddl};\n\
         INSERT INTO {prefix}\"_gri_refseq\"\
         (_gri_rid, gri_refseq_name, gri_refseq_length, gri_assembly, gri_refget_id, gri_refseq_meta_json)\n\
         VALUES\n{rows}",
        ddl = refseq_ddl(schema)?,
        prefix = prefix,
        rows = rows.join(",\n"),
    ))
}

//-----------------------------------------------------------------------------

// Read side. These are snapshots: the contract assumes the catalog is not
// being written concurrently.

fn query_reference_sequences(
    conn: &Connection,
    assembly: Option<&str>,
    schema: Option<&str>,
) -> Result<Vec<ReferenceSequence>> {
    let prefix = schema_prefix(schema)?;
    let filter = if assembly.is_some() { " WHERE gri_assembly = ?1" } else { "" };
    let sql = format!(
        "SELECT _gri_rid, gri_refseq_name, gri_refseq_length, gri_assembly, gri_refget_id, gri_refseq_meta_json \
         FROM {prefix}\"_gri_refseq\"{filter} ORDER BY _gri_rid",
        prefix = prefix,
        filter = filter,
    );

    let mut statement = conn.prepare(&sql)?;
    let mut rows = match assembly {
        Some(assembly) => statement.query((assembly,))?,
        None => statement.query(())?,
    };
    let mut result: Vec<ReferenceSequence> = Vec::new();
    while let Some(row) = rows.next()? {
        let meta: Option<String> = row.get(5)?;
        result.push(ReferenceSequence {
            rid: row.get(0)?,
            name: row.get(1)?,
            length: row.get(2)?,
            assembly: row.get(3)?,
            refget_id: row.get(4)?,
            meta_json: meta.unwrap_or_else(|| String::from("{}")),
        });
    }
    Ok(result)
}

/// Returns the reference sequences in the catalog, keyed by rid.
///
/// With `assembly`, only sequences of that assembly are returned.
pub fn reference_sequences_by_rid(
    conn: &Connection,
    assembly: Option<&str>,
    schema: Option<&str>,
) -> Result<BTreeMap<i64, ReferenceSequence>> {
    let sequences = query_reference_sequences(conn, assembly, schema)?;
    Ok(sequences.into_iter().map(|seq| (seq.rid, seq)).collect())
}

/// Returns the reference sequences in the catalog, keyed by name.
///
/// With `assembly`, only sequences of that assembly are returned.
///
/// # Errors
///
/// Returns [`Error::Schema`] if the same name appears more than once in the
/// selected rows, which can happen when sequences of several assemblies are
/// read without an assembly filter.
pub fn reference_sequences_by_name(
    conn: &Connection,
    assembly: Option<&str>,
    schema: Option<&str>,
) -> Result<BTreeMap<String, ReferenceSequence>> {
    let sequences = query_reference_sequences(conn, assembly, schema)?;
    let mut result: BTreeMap<String, ReferenceSequence> = BTreeMap::new();
    for seq in sequences {
        if let Some(previous) = result.insert(seq.name.clone(), seq) {
            return Err(Error::Schema(format!(
                "reference sequence name {:?} is ambiguous without an assembly filter",
                previous.name
            )));
        }
    }
    Ok(result)
}

//-----------------------------------------------------------------------------
