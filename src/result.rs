//! A minimal result-set accessor, standing in for libpq's `PGresult`.
//!
//! This is deliberately not a typed-decode layer — no `FromRow`, no derive
//! macros — the pool hands the callback raw column names and raw cell
//! bytes, matching `spec.md`'s "results are delivered whole" contract.
use bytes::{Buf, Bytes};

use crate::common::ByteStr;

/// One completed SQL statement's result, or the outcome of a non-`SELECT`
/// command.
pub struct PgResult {
    columns: Vec<ByteStr>,
    rows: Vec<Vec<Option<Bytes>>>,
    command_tag: ByteStr,
}

impl PgResult {
    pub(crate) fn new(columns: Vec<ByteStr>, rows: Vec<Vec<Option<Bytes>>>, command_tag: ByteStr) -> Self {
        Self { columns, rows, command_tag }
    }

    /// Number of rows in this result.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns in this result.
    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    /// Column name at `index`, or `None` if out of range.
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.columns.get(index).map(ByteStr::as_str)
    }

    /// Raw cell bytes at `(row, col)`. `None` means the column is out of
    /// range *or* the value itself was SQL `NULL` — use [`Self::is_null`]
    /// to tell the two apart.
    pub fn get(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Whether `(row, col)` held SQL `NULL`.
    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.rows.get(row).and_then(|r| r.get(col)), Some(None))
    }

    /// The server's command tag, e.g. `"INSERT 0 1"` or `"SELECT 3"`.
    pub fn command_tag(&self) -> &str {
        self.command_tag.as_str()
    }
}

impl std::fmt::Debug for PgResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgResult")
            .field("columns", &self.columns)
            .field("ntuples", &self.rows.len())
            .field("command_tag", &self.command_tag)
            .finish()
    }
}

/// Parses a `RowDescription` body into column names, per
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
pub(crate) fn parse_row_description(mut body: Bytes) -> Vec<ByteStr> {
    use crate::ext::BytesExt;

    let nfields = body.get_i16();
    let mut columns = Vec::with_capacity(nfields.max(0) as usize);
    for _ in 0..nfields {
        let name = body.get_nul_bytestr().expect("row description field name");
        body.advance(4 + 2 + 4 + 2 + 4 + 2); // table oid, attnum, type oid, typlen, typmod, format
        columns.push(name);
    }
    columns
}

/// Parses a `DataRow` body into per-column optional raw bytes.
pub(crate) fn parse_data_row(mut body: Bytes) -> Vec<Option<Bytes>> {
    let nfields = body.get_i16();
    let mut row = Vec::with_capacity(nfields.max(0) as usize);
    for _ in 0..nfields {
        let len = body.get_i32();
        if len < 0 {
            row.push(None);
        } else {
            row.push(Some(body.split_to(len as usize)));
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_distinguish_null_from_out_of_range() {
        let columns = vec![ByteStr::copy_from_str("id"), ByteStr::copy_from_str("name")];
        let rows = vec![vec![Some(Bytes::from_static(b"1")), None]];
        let result = PgResult::new(columns, rows, ByteStr::copy_from_str("SELECT 1"));

        assert_eq!(result.ntuples(), 1);
        assert_eq!(result.nfields(), 2);
        assert_eq!(result.get(0, 0), Some(&b"1"[..]));
        assert_eq!(result.get(0, 1), None);
        assert!(result.is_null(0, 1));
        assert!(!result.is_null(0, 0));
        assert!(!result.is_null(5, 0));
        assert_eq!(result.column_name(1), Some("name"));
    }
}
