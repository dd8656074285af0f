//! Relational schema of the column store.
//!
//! One `dataset` row per logical matrix; one `field` row per column of the
//! matrix; scores in fixed-width segments in `field_score`; categorical
//! dictionaries in `code`; genomic rows in `field_position` / `field_gene`.
//! Every child table cascades on delete so that removing a dataset row (or a
//! field row) leaves nothing behind. `sequence` backs the block-reserving id
//! allocators.

use rusqlite::Connection;

use crate::err::Result;

/// Name of the sequence feeding `field.id`.
pub const FIELD_IDS: &str = "FIELD_IDS";
/// Name of the sequence feeding `feature.id`.
pub const FEATURE_IDS: &str = "FEATURE_IDS";

const DDL: &str = "
CREATE TABLE IF NOT EXISTS dataset (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    probemap TEXT,
    shorttitle TEXT,
    longtitle TEXT,
    grouptitle TEXT,
    platform TEXT,
    cohort TEXT,
    security TEXT,
    datasubtype TEXT,
    type TEXT,
    text TEXT,
    rows INTEGER,
    status TEXT NOT NULL DEFAULT 'loading'
);

CREATE TABLE IF NOT EXISTS source (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dataset_source (
    dataset_id INTEGER NOT NULL REFERENCES dataset (id) ON DELETE CASCADE,
    source_id INTEGER NOT NULL REFERENCES source (id) ON DELETE CASCADE,
    PRIMARY KEY (dataset_id, source_id)
);

CREATE TABLE IF NOT EXISTS field (
    id INTEGER PRIMARY KEY,
    dataset_id INTEGER NOT NULL REFERENCES dataset (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE (dataset_id, name)
);

CREATE TABLE IF NOT EXISTS field_score (
    field_id INTEGER NOT NULL REFERENCES field (id) ON DELETE CASCADE,
    i INTEGER NOT NULL,
    scores BLOB NOT NULL,
    UNIQUE (field_id, i)
);

CREATE TABLE IF NOT EXISTS feature (
    id INTEGER PRIMARY KEY,
    field_id INTEGER NOT NULL REFERENCES field (id) ON DELETE CASCADE,
    shorttitle TEXT,
    longtitle TEXT,
    priority REAL,
    valuetype TEXT,
    visibility TEXT
);

CREATE TABLE IF NOT EXISTS code (
    id INTEGER PRIMARY KEY,
    field_id INTEGER NOT NULL REFERENCES field (id) ON DELETE CASCADE,
    ordering INTEGER NOT NULL CHECK (ordering >= 0),
    value TEXT NOT NULL,
    UNIQUE (field_id, ordering)
);

CREATE TABLE IF NOT EXISTS field_position (
    field_id INTEGER NOT NULL REFERENCES field (id) ON DELETE CASCADE,
    row INTEGER NOT NULL,
    bin INTEGER NOT NULL,
    chrom TEXT NOT NULL,
    chromstart INTEGER NOT NULL,
    chromend INTEGER NOT NULL,
    strand TEXT
);
CREATE INDEX IF NOT EXISTS field_position_chrom_bin ON field_position (field_id, chrom, bin);
CREATE INDEX IF NOT EXISTS field_position_row ON field_position (field_id, row);

CREATE TABLE IF NOT EXISTS field_gene (
    field_id INTEGER NOT NULL REFERENCES field (id) ON DELETE CASCADE,
    row INTEGER NOT NULL,
    gene TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS field_gene_gene ON field_gene (field_id, gene);
CREATE INDEX IF NOT EXISTS field_gene_row ON field_gene (field_id, row);

CREATE TABLE IF NOT EXISTS sequence (
    name TEXT PRIMARY KEY,
    next INTEGER NOT NULL
);
INSERT OR IGNORE INTO sequence (name, next) VALUES ('FIELD_IDS', 1);
INSERT OR IGNORE INTO sequence (name, next) VALUES ('FEATURE_IDS', 1);
";

/// Create all tables, indices, and sequence rows. Idempotent.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(DDL)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use rusqlite::Connection;

    fn connect() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", true).unwrap();
        super::init(&conn).unwrap();
        conn
    }

    #[test]
    fn init_is_idempotent() {
        let conn = connect();
        super::init(&conn).unwrap();
    }

    #[test]
    fn dataset_names_are_unique() {
        let conn = connect();
        conn.execute("INSERT INTO dataset (name) VALUES ('d')", [])
            .unwrap();
        assert!(conn
            .execute("INSERT INTO dataset (name) VALUES ('d')", [])
            .is_err());
    }

    #[test]
    fn deleting_a_dataset_cascades_to_all_children() {
        let conn = connect();
        conn.execute_batch(
            "INSERT INTO dataset (id, name) VALUES (1, 'd');
             INSERT INTO field (id, dataset_id, name) VALUES (10, 1, 'f');
             INSERT INTO field_score (field_id, i, scores) VALUES (10, 0, x'0000803f');
             INSERT INTO feature (field_id, valuetype) VALUES (10, 'category');
             INSERT INTO code (field_id, ordering, value) VALUES (10, 0, 'a');
             INSERT INTO field_position (field_id, row, bin, chrom, chromstart, chromend)
                 VALUES (10, 0, 4681, 'chr1', 0, 10);
             INSERT INTO field_gene (field_id, row, gene) VALUES (10, 0, 'TP53');
             INSERT INTO source (id, name, mtime, hash) VALUES (5, 'f.tsv', 0, 'h');
             INSERT INTO dataset_source (dataset_id, source_id) VALUES (1, 5);",
        )
        .unwrap();

        conn.execute("DELETE FROM dataset WHERE id = 1", []).unwrap();

        for table in [
            "field",
            "field_score",
            "feature",
            "code",
            "field_position",
            "field_gene",
            "dataset_source",
        ] {
            let n: i64 = conn
                .query_row(&format!("SELECT count(*) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0, "{} not empty after cascade", table);
        }
        // Sources are kept; clean_sources removes orphans separately.
        let n: i64 = conn
            .query_row("SELECT count(*) FROM source", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn segment_index_is_unique_per_field() {
        let conn = connect();
        conn.execute_batch(
            "INSERT INTO dataset (id, name) VALUES (1, 'd');
             INSERT INTO field (id, dataset_id, name) VALUES (10, 1, 'f');
             INSERT INTO field_score (field_id, i, scores) VALUES (10, 0, x'00');",
        )
        .unwrap();
        assert!(conn
            .execute(
                "INSERT INTO field_score (field_id, i, scores) VALUES (10, 0, x'00')",
                []
            )
            .is_err());
    }
}
