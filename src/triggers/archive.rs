//! Archive table layout and trigger body comparison
//!
//! An archive table holds the live table's columns followed by four audit
//! columns. `validFrom` is the only one a live table may already carry; the
//! trigger then copies the live value instead of writing NULL.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::DiscoveredColumn;

pub const VALID_FROM: &str = "validFrom";
pub const VALID_TO: &str = "validTo";
pub const UPDATED_BY_USER: &str = "updatedByUser";
pub const STATUS: &str = "status";

/// Status code written for an UPDATE pre-image
pub const STATUS_UPDATED: &str = "U";
/// Status code written for a DELETE pre-image
pub const STATUS_DELETED: &str = "D";

/// Audit columns in archive order
pub const AUDIT_COLUMNS: [&str; 4] = [VALID_FROM, VALID_TO, UPDATED_BY_USER, STATUS];

/// Audit columns a live table must not define itself
const RESERVED_COLUMNS: [&str; 3] = [VALID_TO, UPDATED_BY_USER, STATUS];

/// Dialect type names for the audit columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditColumnTypes {
    pub timestamp: &'static str,
    pub user: &'static str,
    pub status: &'static str,
}

/// A column definition in the archive table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveColumn {
    pub name: String,
    pub data_type: String,
}

fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Whether the live table carries its own `validFrom`
pub fn has_valid_from(columns: &[DiscoveredColumn]) -> bool {
    columns.iter().any(|c| same_name(&c.name, VALID_FROM))
}

/// First live column that clashes with a reserved audit column
pub fn audit_column_collision(columns: &[DiscoveredColumn]) -> Option<&str> {
    columns
        .iter()
        .map(|c| c.name.as_str())
        .find(|name| RESERVED_COLUMNS.iter().any(|r| same_name(name, r)))
}

fn audit_column_type(name: &str, types: &AuditColumnTypes) -> &'static str {
    match name {
        UPDATED_BY_USER => types.user,
        STATUS => types.status,
        _ => types.timestamp,
    }
}

/// Full archive column list for a live table
pub fn archive_columns(live: &[DiscoveredColumn], types: &AuditColumnTypes) -> Vec<ArchiveColumn> {
    let mut columns: Vec<ArchiveColumn> = live
        .iter()
        .map(|c| ArchiveColumn {
            name: c.name.clone(),
            data_type: c.data_type.clone(),
        })
        .collect();

    for audit in AUDIT_COLUMNS {
        if !live.iter().any(|c| same_name(&c.name, audit)) {
            columns.push(ArchiveColumn {
                name: audit.to_string(),
                data_type: audit_column_type(audit, types).to_string(),
            });
        }
    }
    columns
}

/// Archive columns that `archive` lacks, as definitions ready for ALTER TABLE
pub fn missing_archive_column_defs(
    live: &[DiscoveredColumn],
    archive: &[DiscoveredColumn],
    types: &AuditColumnTypes,
) -> Vec<ArchiveColumn> {
    archive_columns(live, types)
        .into_iter()
        .filter(|wanted| !archive.iter().any(|c| same_name(&c.name, &wanted.name)))
        .collect()
}

/// Names of the archive columns that `archive` lacks
pub fn missing_archive_columns(live: &[DiscoveredColumn], archive: &[DiscoveredColumn]) -> Vec<String> {
    live.iter()
        .map(|c| c.name.as_str())
        .chain(AUDIT_COLUMNS)
        .filter(|name| !archive.iter().any(|c| same_name(&c.name, name)))
        .fold(Vec::<String>::new(), |mut acc, name| {
            if !acc.iter().any(|n| same_name(n, name)) {
                acc.push(name.to_string());
            }
            acc
        })
}

/// Archive column names in the order the trigger inserts them
pub fn insert_column_list(columns: &[DiscoveredColumn], quote: impl Fn(&str) -> String) -> String {
    let mut names: Vec<String> = columns.iter().map(|c| quote(&c.name)).collect();
    if !has_valid_from(columns) {
        names.push(quote(VALID_FROM));
    }
    names.extend([VALID_TO, UPDATED_BY_USER, STATUS].map(&quote));
    names.join(", ")
}

/// Pre-image values for the live columns, then NULL for `validFrom` when the
/// live table has none. The trigger appends the remaining audit values.
pub fn insert_values(columns: &[DiscoveredColumn], old_value: impl Fn(&str) -> String) -> String {
    let mut values: Vec<String> = columns.iter().map(|c| old_value(&c.name)).collect();
    if !has_valid_from(columns) {
        values.push("NULL".to_string());
    }
    values.join(", ")
}

static RE_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Collapse whitespace runs and strip trailing `;` / `/` terminators
pub fn normalize_body(body: &str) -> String {
    let collapsed = RE_WHITESPACE.replace_all(body, " ");
    let mut normalized = collapsed.trim();
    loop {
        let stripped = normalized
            .trim_end_matches([';', '/'])
            .trim_end();
        if stripped.len() == normalized.len() {
            break;
        }
        normalized = stripped;
    }
    normalized.to_string()
}

/// sha256 hex digest of the normalised body
pub fn body_fingerprint(body: &str) -> String {
    format!("{:x}", Sha256::digest(normalize_body(body).as_bytes()))
}
