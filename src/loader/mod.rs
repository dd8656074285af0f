//! Loader pipeline: ingest a matrix source into the column store.
//!
//! A load runs on a single connection as a series of small transactions:
//! the metadata upsert and source-hash gate, the bounded clearing of any
//! previous contents, then the column inserts batched 1000 statements per
//! commit. A load that dies mid-way leaves the dataset in `status =
//! loading`; a later forced load restores consistency.

pub mod source;

use std::cell::Cell;
use std::collections::BTreeSet;

use indexmap::IndexMap;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::binning;
use crate::codec::{self, SEGMENT_SIZE};
use crate::common::{
    MAX_CATEGORY_VALUE, MAX_DATASET_NAME, MAX_FIELD_NAME, MAX_METADATA_TEXT, MAX_SOURCE_PATH,
};
use crate::db::lifecycle;
use crate::db::schema::{FEATURE_IDS, FIELD_IDS};
use crate::db::sequence::IdAllocator;
use crate::err::{Error, Result};
use self::source::{Column, ColumnData, FeatureMeta, MatrixSource, ValueType};

/// Statements per committed sub-transaction.
const BATCH_SIZE: usize = 1000;

/// A physical input file, identified by path, mtime, and content hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    /// Milliseconds since the epoch.
    pub mtime: i64,
    /// Lowercase hex SHA-256 of the file contents.
    pub hash: String,
}

/// Normalized dataset metadata. Fields left `None` do not overwrite values
/// already stored for the dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatasetMeta {
    pub probe_map: Option<String>,
    pub short_title: Option<String>,
    pub long_title: Option<String>,
    pub group_title: Option<String>,
    pub platform: Option<String>,
    pub cohort: Option<String>,
    pub security: Option<String>,
    pub data_sub_type: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Raw metadata JSON as received, stored verbatim.
    #[serde(skip)]
    pub text: Option<String>,
}

/// Everything needed to load one dataset.
pub struct LoadRequest {
    pub dataset: String,
    pub sources: Vec<SourceSpec>,
    pub metadata: DatasetMeta,
    pub matrix: Box<dyn MatrixSource>,
    /// Display metadata by field name, merged under per-column metadata.
    pub features: Option<IndexMap<String, FeatureMeta>>,
    /// Reload even when the source set is unchanged.
    pub force: bool,
}

/// Outcome of a load.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSummary {
    pub rows: i64,
    pub warnings: Vec<String>,
}

/// Load a dataset. Holds `conn` for the whole load; see module docs for the
/// transaction structure.
pub fn run(conn: &mut Connection, req: LoadRequest) -> Result<LoadSummary> {
    let LoadRequest {
        dataset,
        sources,
        metadata,
        matrix,
        features,
        force,
    } = req;
    check_limits(&dataset, &sources, &metadata)?;
    tracing::info!("loading dataset {:?}", dataset);

    // Metadata upsert and the source-hash gate, one transaction.
    let dataset_id = {
        let tx = conn.transaction()?;
        let existed: Option<i64> = tx
            .query_row(
                "SELECT id FROM dataset WHERE name = ?1",
                [&dataset],
                |row| row.get(0),
            )
            .optional()?;
        upsert_dataset(&tx, &dataset, &metadata)?;
        let dataset_id: i64 = tx.query_row(
            "SELECT id FROM dataset WHERE name = ?1",
            [&dataset],
            |row| row.get(0),
        )?;

        let old_sources = read_sources(&tx, dataset_id)?;
        let new_sources: BTreeSet<SourceSpec> = sources.iter().cloned().collect();
        if existed.is_some() && !force && old_sources == new_sources {
            tracing::info!("dataset {:?} is unchanged, metadata updated", dataset);
            tx.execute(
                "UPDATE dataset SET status = 'loaded' WHERE id = ?1",
                [dataset_id],
            )?;
            let rows: Option<i64> = tx.query_row(
                "SELECT rows FROM dataset WHERE id = ?1",
                [dataset_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            return Ok(LoadSummary {
                rows: rows.unwrap_or(0),
                warnings: Vec::new(),
            });
        }

        tx.execute(
            "UPDATE dataset SET status = 'loading' WHERE id = ?1",
            [dataset_id],
        )?;
        tx.commit()?;
        dataset_id
    };

    // Drop previous contents in bounded chunks, then relink sources.
    lifecycle::clear_dataset(conn, dataset_id)?;
    {
        let tx = conn.transaction()?;
        link_sources(&tx, dataset_id, &sources)?;
        tx.commit()?;
    }

    // Stream the columns.
    let mut warnings = Vec::new();
    let mut dataset_rows = 0i64;
    let mut field_ids = IdAllocator::new(FIELD_IDS);
    let mut feature_ids = IdAllocator::new(FEATURE_IDS);
    let columns = matrix
        .into_columns()
        .map_err(|e| Error::Input(e.to_string()))?;
    {
        let batch = Batch::begin(conn)?;
        for column in columns {
            let column = column.map_err(|e| Error::Input(e.to_string()))?;
            let rows = load_column(
                &batch,
                &mut field_ids,
                &mut feature_ids,
                dataset_id,
                column,
                features.as_ref(),
                &mut warnings,
            )?;
            dataset_rows = dataset_rows.max(rows);
        }
        batch.finish()?;
    }

    // Final bookkeeping: row count, warnings, status.
    {
        let tx = conn.transaction()?;
        let text: Option<String> = tx.query_row(
            "SELECT text FROM dataset WHERE id = ?1",
            [dataset_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE dataset SET rows = ?1, text = ?2, status = 'loaded' WHERE id = ?3",
            rusqlite::params![dataset_rows, fold_warnings(text, &warnings), dataset_id],
        )?;
        tx.commit()?;
    }
    tracing::info!(
        "loaded dataset {:?}: {} rows, {} warnings",
        dataset,
        dataset_rows,
        warnings.len()
    );

    Ok(LoadSummary {
        rows: dataset_rows,
        warnings,
    })
}

fn check_limits(dataset: &str, sources: &[SourceSpec], metadata: &DatasetMeta) -> Result<()> {
    if dataset.len() > MAX_DATASET_NAME {
        return Err(Error::Input(format!(
            "dataset name exceeds {} characters",
            MAX_DATASET_NAME
        )));
    }
    for spec in sources {
        if spec.name.len() > MAX_SOURCE_PATH {
            return Err(Error::Input(format!(
                "source path exceeds {} characters: {:?}",
                MAX_SOURCE_PATH, spec.name
            )));
        }
    }
    if metadata.text.as_ref().map_or(0, String::len) > MAX_METADATA_TEXT {
        return Err(Error::Input(format!(
            "dataset metadata text exceeds {} characters",
            MAX_METADATA_TEXT
        )));
    }
    Ok(())
}

/// Insert or update the dataset row. Present metadata keys overwrite stored
/// values; absent keys survive.
fn upsert_dataset(tx: &Transaction, name: &str, meta: &DatasetMeta) -> Result<()> {
    tx.execute(
        "INSERT INTO dataset
             (name, probemap, shorttitle, longtitle, grouptitle, platform,
              cohort, security, datasubtype, type, text)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (name) DO UPDATE SET
             probemap = COALESCE(excluded.probemap, dataset.probemap),
             shorttitle = COALESCE(excluded.shorttitle, dataset.shorttitle),
             longtitle = COALESCE(excluded.longtitle, dataset.longtitle),
             grouptitle = COALESCE(excluded.grouptitle, dataset.grouptitle),
             platform = COALESCE(excluded.platform, dataset.platform),
             cohort = COALESCE(excluded.cohort, dataset.cohort),
             security = COALESCE(excluded.security, dataset.security),
             datasubtype = COALESCE(excluded.datasubtype, dataset.datasubtype),
             type = COALESCE(excluded.type, dataset.type),
             text = COALESCE(excluded.text, dataset.text)",
        rusqlite::params![
            name,
            meta.probe_map,
            meta.short_title,
            meta.long_title,
            meta.group_title,
            meta.platform,
            meta.cohort,
            meta.security,
            meta.data_sub_type,
            meta.kind,
            meta.text,
        ],
    )?;
    Ok(())
}

fn read_sources(conn: &Connection, dataset_id: i64) -> Result<BTreeSet<SourceSpec>> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.name, s.mtime, s.hash
         FROM source s JOIN dataset_source ds ON ds.source_id = s.id
         WHERE ds.dataset_id = ?1",
    )?;
    let specs = stmt
        .query_map([dataset_id], |row| {
            Ok(SourceSpec {
                name: row.get(0)?,
                mtime: row.get(1)?,
                hash: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(specs)
}

/// Replace the dataset's source links, inserting any missing `source` rows.
/// Identical files are reused across datasets.
fn link_sources(tx: &Transaction, dataset_id: i64, sources: &[SourceSpec]) -> Result<()> {
    tx.execute(
        "DELETE FROM dataset_source WHERE dataset_id = ?1",
        [dataset_id],
    )?;
    for spec in sources {
        let source_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM source WHERE name = ?1 AND mtime = ?2 AND hash = ?3",
                rusqlite::params![spec.name, spec.mtime, spec.hash],
                |row| row.get(0),
            )
            .optional()?;
        let source_id = match source_id {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO source (name, mtime, hash) VALUES (?1, ?2, ?3)",
                    rusqlite::params![spec.name, spec.mtime, spec.hash],
                )?;
                tx.last_insert_rowid()
            }
        };
        tx.execute(
            "INSERT OR IGNORE INTO dataset_source (dataset_id, source_id) VALUES (?1, ?2)",
            rusqlite::params![dataset_id, source_id],
        )?;
    }
    Ok(())
}

/// Fold loader warnings into the raw metadata JSON under `"loader"`. The
/// raw text is stored as received; it is only reserialized when a warning
/// key is actually added or a stale one stripped.
fn fold_warnings(text: Option<String>, warnings: &[String]) -> Option<String> {
    let parsed: Option<serde_json::Value> = text
        .as_deref()
        .and_then(|t| serde_json::from_str(t).ok())
        .filter(serde_json::Value::is_object);
    if warnings.is_empty() {
        match parsed {
            Some(mut value) if value.get("loader").is_some() => {
                value.as_object_mut().expect("checked object").remove("loader");
                Some(value.to_string())
            }
            _ => text,
        }
    } else {
        let mut value = parsed.unwrap_or_else(|| serde_json::json!({}));
        value.as_object_mut().expect("checked object").insert(
            "loader".to_string(),
            serde_json::json!({ "warnings": warnings }),
        );
        Some(value.to_string())
    }
}

/// Commits the running transaction every [`BATCH_SIZE`] statements. Rolls
/// back the open sub-transaction when dropped before `finish`.
struct Batch<'c> {
    conn: &'c Connection,
    pending: Cell<usize>,
    open: Cell<bool>,
}

impl<'c> Batch<'c> {
    fn begin(conn: &'c Connection) -> Result<Self> {
        conn.execute_batch("BEGIN")?;
        Ok(Self {
            conn,
            pending: Cell::new(0),
            open: Cell::new(true),
        })
    }

    fn conn(&self) -> &Connection {
        self.conn
    }

    fn bump(&self) -> Result<()> {
        self.pending.set(self.pending.get() + 1);
        if self.pending.get() >= BATCH_SIZE {
            self.conn.execute_batch("COMMIT; BEGIN")?;
            self.pending.set(0);
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.open.set(false);
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.open.get() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

/// Writes a stream of scores as consecutive segments of one field.
struct SegmentWriter<'b, 'c> {
    batch: &'b Batch<'c>,
    field_id: i64,
    chunk: Vec<f32>,
    next_index: i64,
    rows: i64,
}

impl<'b, 'c> SegmentWriter<'b, 'c> {
    fn new(batch: &'b Batch<'c>, field_id: i64) -> Self {
        Self {
            batch,
            field_id,
            chunk: Vec::with_capacity(SEGMENT_SIZE),
            next_index: 0,
            rows: 0,
        }
    }

    fn push(&mut self, score: f32) -> Result<()> {
        self.chunk.push(score);
        if self.chunk.len() == SEGMENT_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut stmt = self.batch.conn().prepare_cached(
            "INSERT INTO field_score (field_id, i, scores) VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(rusqlite::params![
            self.field_id,
            self.next_index,
            codec::encode(&self.chunk)
        ])?;
        drop(stmt);
        self.batch.bump()?;
        self.rows += self.chunk.len() as i64;
        self.next_index += 1;
        self.chunk.clear();
        Ok(())
    }

    fn finish(mut self) -> Result<i64> {
        if !self.chunk.is_empty() {
            self.flush()?;
        }
        Ok(self.rows)
    }
}

#[allow(clippy::too_many_arguments)]
fn load_column(
    batch: &Batch,
    field_ids: &mut IdAllocator,
    feature_ids: &mut IdAllocator,
    dataset_id: i64,
    column: Column,
    features_hint: Option<&IndexMap<String, FeatureMeta>>,
    warnings: &mut Vec<String>,
) -> Result<i64> {
    let Column {
        name,
        data,
        feature,
    } = column;
    if name.len() > MAX_FIELD_NAME {
        return Err(Error::Input(format!(
            "field name of {} characters exceeds {}",
            name.len(),
            MAX_FIELD_NAME
        )));
    }
    let data = match data {
        ColumnData::Unsupported { value_type } => {
            tracing::warn!("skipping field {:?}: unknown value type {:?}", name, value_type);
            warnings.push(format!(
                "skipping field {:?}: unknown value type {:?}",
                name, value_type
            ));
            return Ok(0);
        }
        data => data,
    };
    let feature = feature.or_else(|| {
        features_hint
            .and_then(|hint| hint.get(&name))
            .cloned()
    });

    let field_id = field_ids.next(batch.conn())?;
    batch
        .conn()
        .prepare_cached("INSERT INTO field (id, dataset_id, name) VALUES (?1, ?2, ?3)")?
        .execute(rusqlite::params![field_id, dataset_id, name])?;
    batch.bump()?;
    tracing::debug!("field {:?} -> id {}", name, field_id);

    match data {
        ColumnData::Float(rows) => {
            let mut writer = SegmentWriter::new(batch, field_id);
            for score in rows {
                writer.push(score)?;
            }
            let n = writer.finish()?;
            if let Some(meta) = feature {
                insert_feature(batch, feature_ids, field_id, ValueType::Float, &meta)?;
            }
            Ok(n)
        }
        ColumnData::Category { rows, order } => {
            let supplied = order.is_some();
            let mut order = order.unwrap_or_default();
            let mut unknown = 0usize;
            let mut writer = SegmentWriter::new(batch, field_id);
            for value in rows {
                let score = match value {
                    None => f32::NAN,
                    Some(value) => {
                        if value.len() > MAX_CATEGORY_VALUE {
                            return Err(Error::Input(format!(
                                "categorical value in field {:?} exceeds {} characters",
                                name, MAX_CATEGORY_VALUE
                            )));
                        }
                        match order.get(&value) {
                            Some(&ordering) => ordering as f32,
                            None if supplied => {
                                unknown += 1;
                                f32::NAN
                            }
                            None => {
                                let ordering = order.len() as u32;
                                order.insert(value, ordering);
                                ordering as f32
                            }
                        }
                    }
                };
                writer.push(score)?;
            }
            let n = writer.finish()?;
            if unknown > 0 {
                warnings.push(format!(
                    "field {:?}: {} values not in the supplied ordering",
                    name, unknown
                ));
            }
            insert_feature(
                batch,
                feature_ids,
                field_id,
                ValueType::Category,
                &feature.unwrap_or_default(),
            )?;
            let mut stmt = batch.conn().prepare_cached(
                "INSERT INTO code (field_id, ordering, value) VALUES (?1, ?2, ?3)",
            )?;
            for (value, ordering) in &order {
                stmt.execute(rusqlite::params![field_id, ordering, value])?;
                batch.bump()?;
            }
            Ok(n)
        }
        ColumnData::Position(rows) => {
            let mut count = 0i64;
            let mut stmt = batch.conn().prepare_cached(
                "INSERT INTO field_position
                     (field_id, row, bin, chrom, chromstart, chromend, strand)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (row, pos) in rows.enumerate() {
                let bin = binning::bin_from_range(pos.chrom_start, pos.chrom_end)
                    .map_err(|e| Error::Input(format!("field {:?} row {}: {}", name, row, e)))?;
                stmt.execute(rusqlite::params![
                    field_id,
                    row as i64,
                    bin,
                    pos.chrom,
                    pos.chrom_start,
                    pos.chrom_end,
                    pos.strand
                ])?;
                batch.bump()?;
                count = row as i64 + 1;
            }
            drop(stmt);
            insert_feature(
                batch,
                feature_ids,
                field_id,
                ValueType::Position,
                &feature.unwrap_or_default(),
            )?;
            Ok(count)
        }
        ColumnData::Genes(rows) => {
            let mut count = 0i64;
            let mut stmt = batch
                .conn()
                .prepare_cached("INSERT INTO field_gene (field_id, row, gene) VALUES (?1, ?2, ?3)")?;
            for (row, genes) in rows.enumerate() {
                for gene in genes {
                    stmt.execute(rusqlite::params![field_id, row as i64, gene])?;
                    batch.bump()?;
                }
                count = row as i64 + 1;
            }
            drop(stmt);
            insert_feature(
                batch,
                feature_ids,
                field_id,
                ValueType::Genes,
                &feature.unwrap_or_default(),
            )?;
            Ok(count)
        }
        ColumnData::Unsupported { .. } => unreachable!("handled above"),
    }
}

fn insert_feature(
    batch: &Batch,
    feature_ids: &mut IdAllocator,
    field_id: i64,
    value_type: ValueType,
    meta: &FeatureMeta,
) -> Result<()> {
    let feature_id = feature_ids.next(batch.conn())?;
    batch
        .conn()
        .prepare_cached(
            "INSERT INTO feature
                 (id, field_id, shorttitle, longtitle, priority, valuetype, visibility)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(rusqlite::params![
            feature_id,
            field_id,
            meta.short_title,
            meta.long_title,
            meta.priority,
            value_type.to_string(),
            meta.visibility
        ])?;
    batch.bump()?;
    Ok(())
}
