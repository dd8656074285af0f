//! Dataset lifecycle: bounded clearing, deletion, and source cleanup.
//!
//! A wide dataset can hold millions of segment rows; deleting them in one
//! statement would pin a write transaction for the whole sweep. Contents are
//! instead removed in chunks of 1000 rows, each chunk its own committed
//! transaction, so readers of other datasets are never starved.

use rusqlite::{Connection, OptionalExtension};

use crate::err::Result;

/// Rows deleted per committed chunk.
const DELETE_CHUNK: usize = 1000;

/// Child tables holding per-field rows.
const FIELD_TABLES: &[&str] = &[
    "code",
    "feature",
    "field_gene",
    "field_position",
    "field_score",
];

/// Remove all fields of a dataset and everything hanging off them. The
/// dataset row itself is kept.
pub fn clear_dataset(conn: &mut Connection, dataset_id: i64) -> Result<()> {
    tracing::debug!("clearing contents of dataset {}", dataset_id);
    for table in FIELD_TABLES {
        // SQLite lacks DELETE ... LIMIT without a nonstandard build flag;
        // the rowid subselect is the portable spelling.
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN (
                 SELECT t.rowid FROM {table} t
                 JOIN field f ON f.id = t.field_id
                 WHERE f.dataset_id = ?1 LIMIT {DELETE_CHUNK})"
        );
        delete_in_chunks(conn, &sql, dataset_id)?;
    }
    let sql = format!(
        "DELETE FROM field WHERE rowid IN (
             SELECT rowid FROM field WHERE dataset_id = ?1 LIMIT {DELETE_CHUNK})"
    );
    delete_in_chunks(conn, &sql, dataset_id)?;
    Ok(())
}

fn delete_in_chunks(conn: &mut Connection, sql: &str, dataset_id: i64) -> Result<()> {
    loop {
        let affected = {
            let tx = conn.transaction()?;
            let affected = tx.execute(sql, [dataset_id])?;
            tx.commit()?;
            affected
        };
        if affected == 0 {
            return Ok(());
        }
        tracing::trace!("deleted {} rows", affected);
    }
}

/// Delete a dataset by name. Missing datasets are not an error.
pub fn delete_dataset(conn: &mut Connection, name: &str) -> Result<bool> {
    let dataset_id: Option<i64> = conn
        .query_row("SELECT id FROM dataset WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?;
    let Some(dataset_id) = dataset_id else {
        tracing::info!("no dataset named {:?}, nothing to delete", name);
        return Ok(false);
    };
    clear_dataset(conn, dataset_id)?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM dataset WHERE id = ?1", [dataset_id])?;
    tx.commit()?;
    tracing::info!("deleted dataset {:?}", name);
    Ok(true)
}

/// Delete `source` rows no longer referenced by any dataset. Returns the
/// number of rows removed.
pub fn clean_sources(conn: &Connection) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM source WHERE id NOT IN (SELECT source_id FROM dataset_source)",
        [],
    )?;
    tracing::debug!("removed {} orphaned sources", removed);
    Ok(removed)
}
