//! Genomic fetch: dense score retrieval addressed by sample lists.
//!
//! Samples are stored as rows of the dataset; the special `sampleID`
//! category field maps each storage row to a sample ordering. A fetch
//! translates the request's sample names through the `sampleID` code
//! dictionary, scans that column for matching rows, and reads the minimum
//! set of score segments to fill caller-ordered output buffers.

pub mod ast;

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use indexmap::IndexMap;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::binning;
use crate::cache::SegmentCache;
use crate::codec::{self, SEGMENT_SIZE};
use crate::err::{Error, Result};

/// One fetch request: a dataset, the score columns wanted, and the samples
/// addressing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub dataset: String,
    pub columns: Vec<String>,
    pub samples: Vec<String>,
}

/// A request with its data filled in. Every buffer in `data` has one slot
/// per requested sample, in request order; columns absent from the dataset
/// are omitted from the map. `codes` carries the dictionaries of requested
/// category columns, ordered by code ordering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    #[serde(flatten)]
    pub request: FetchRequest,
    pub data: IndexMap<String, Vec<f32>>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub codes: IndexMap<String, Vec<String>>,
}

/// Answer a batch of fetch requests.
pub fn fetch(
    conn: &Connection,
    cache: &SegmentCache,
    requests: Vec<FetchRequest>,
) -> Result<Vec<FetchResult>> {
    requests
        .into_iter()
        .map(|request| fetch_one(conn, cache, request))
        .collect()
}

fn dataset_id_by_name(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row("SELECT id FROM dataset WHERE name = ?1", [name], |row| {
        row.get(0)
    })
    .optional()?
    .ok_or_else(|| Error::UnknownDataset(name.to_string()))
}

fn field_id_by_name(conn: &Connection, dataset_id: i64, name: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM field WHERE dataset_id = ?1 AND name = ?2",
        rusqlite::params![dataset_id, name],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

fn fetch_one(conn: &Connection, cache: &SegmentCache, request: FetchRequest) -> Result<FetchResult> {
    let dataset_id = dataset_id_by_name(conn, &request.dataset)?;
    let sample_field =
        field_id_by_name(conn, dataset_id, "sampleID")?.ok_or_else(|| Error::UnknownField {
            dataset: request.dataset.clone(),
            field: "sampleID".to_string(),
        })?;

    // Sample name -> ordering, from the sampleID dictionary.
    let mut stmt =
        conn.prepare_cached("SELECT value, ordering FROM code WHERE field_id = ?1")?;
    let code_map: HashMap<String, u32> = stmt
        .query_map([sample_field], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
        })?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    // Output slots per ordering; duplicate requested samples get duplicate
    // slots, samples missing from the dictionary keep their NaN prefill.
    let mut slots: HashMap<u32, Vec<usize>> = HashMap::new();
    for (slot, sample) in request.samples.iter().enumerate() {
        if let Some(&ordering) = code_map.get(sample) {
            slots.entry(ordering).or_default().push(slot);
        }
    }

    // Scan the sampleID column for matching storage rows. Row j lives at
    // offset j % S of segment j / S, so the shuffle map is naturally keyed
    // by segment index.
    let mut shuffle: BTreeMap<i64, Vec<(usize, Vec<usize>)>> = BTreeMap::new();
    let mut segment_index = 0i64;
    while let Some(segment) = cache.segment(sample_field, segment_index)? {
        for (offset, &score) in segment.iter().enumerate() {
            if score.is_nan() {
                continue;
            }
            if let Some(outs) = slots.get(&(score as u32)) {
                shuffle
                    .entry(segment_index)
                    .or_default()
                    .push((offset, outs.clone()));
            }
        }
        if segment.len() < SEGMENT_SIZE {
            break;
        }
        segment_index += 1;
    }

    // Requested columns that exist, in request order.
    let wanted: Rc<Vec<SqlValue>> = Rc::new(
        request
            .columns
            .iter()
            .map(|name| SqlValue::Text(name.clone()))
            .collect(),
    );
    let mut stmt = conn.prepare_cached(
        "SELECT name, id FROM field
         WHERE dataset_id = ?1 AND name IN (SELECT value FROM rarray(?2))",
    )?;
    let existing: HashMap<String, i64> = stmt
        .query_map(rusqlite::params![dataset_id, Rc::clone(&wanted)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let mut data: IndexMap<String, Vec<f32>> = IndexMap::new();
    for name in &request.columns {
        if existing.contains_key(name) && !data.contains_key(name) {
            data.insert(name.clone(), vec![f32::NAN; request.samples.len()]);
        }
    }

    // One round-trip for every needed (column, segment) pair.
    if !data.is_empty() && !shuffle.is_empty() {
        let names: Rc<Vec<SqlValue>> = Rc::new(
            data.keys()
                .map(|name| SqlValue::Text(name.clone()))
                .collect(),
        );
        let bins: Rc<Vec<SqlValue>> =
            Rc::new(shuffle.keys().map(|&i| SqlValue::Integer(i)).collect());
        let mut stmt = conn.prepare_cached(
            "SELECT f.name, s.i, s.scores
             FROM field f JOIN field_score s ON s.field_id = f.id
             WHERE f.dataset_id = ?1
               AND f.name IN (SELECT value FROM rarray(?2))
               AND s.i IN (SELECT value FROM rarray(?3))",
        )?;
        let segments = stmt
            .query_map(rusqlite::params![dataset_id, names, bins], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for (name, segment_index, payload) in segments {
            let scores = codec::decode(&payload).map_err(|e| match e {
                Error::Decode(reason) => {
                    Error::Decode(format!("field {:?} segment {}: {}", name, segment_index, reason))
                }
                other => other,
            })?;
            let Some(buffer) = data.get_mut(&name) else {
                continue;
            };
            let Some(placements) = shuffle.get(&segment_index) else {
                continue;
            };
            for (offset, outs) in placements {
                if let Some(&score) = scores.get(*offset) {
                    for &out in outs {
                        buffer[out] = score;
                    }
                }
            }
        }
    }

    // Dictionaries of requested category columns.
    let mut codes: IndexMap<String, Vec<String>> = IndexMap::new();
    let mut stmt = conn
        .prepare_cached("SELECT value FROM code WHERE field_id = ?1 ORDER BY ordering")?;
    for name in data.keys() {
        let field_id = existing[name];
        let values: Vec<String> = stmt
            .query_map([field_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        if !values.is_empty() {
            codes.insert(name.clone(), values);
        }
    }
    drop(stmt);

    Ok(FetchResult {
        request,
        data,
        codes,
    })
}

/// Probe names of the dataset's `position` field overlapping `[start, end)`
/// on `chrom`, resolved through the `name` field's code dictionary. The bin
/// index narrows the candidates; exact bounds are compared afterwards.
pub fn probes_in_range(
    conn: &Connection,
    cache: &SegmentCache,
    dataset: &str,
    chrom: &str,
    start: i64,
    end: i64,
) -> Result<Vec<String>> {
    let dataset_id = dataset_id_by_name(conn, dataset)?;
    let position_field =
        field_id_by_name(conn, dataset_id, "position")?.ok_or_else(|| Error::UnknownField {
            dataset: dataset.to_string(),
            field: "position".to_string(),
        })?;
    let name_field =
        field_id_by_name(conn, dataset_id, "name")?.ok_or_else(|| Error::UnknownField {
            dataset: dataset.to_string(),
            field: "name".to_string(),
        })?;

    let bins: Rc<Vec<SqlValue>> = Rc::new(
        binning::overlapping_bins(start, end)?
            .into_iter()
            .map(SqlValue::Integer)
            .collect(),
    );
    let mut stmt = conn.prepare_cached(
        "SELECT row FROM field_position
         WHERE field_id = ?1 AND chrom = ?2
           AND bin IN (SELECT value FROM rarray(?3))
           AND chromstart < ?4 AND chromend > ?5
         ORDER BY row",
    )?;
    let rows: Vec<i64> = stmt
        .query_map(
            rusqlite::params![position_field, chrom, bins, end, start],
            |row| row.get(0),
        )?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(name) = cache.row_value(name_field, row)? {
            names.push(name);
        }
    }
    Ok(names)
}
