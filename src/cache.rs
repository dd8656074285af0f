//! Process-wide LRU cache over decoded score segments.
//!
//! Keys are `(field_id, segment_index)`; values are decoded float buffers.
//! The cache owns a dedicated reader connection for filling misses, so the
//! lookup functions can be called from SQL scalar functions running on any
//! pooled connection. Sharing is sound because segments are immutable for
//! the life of a field: fields are never updated in place, only deleted and
//! reinserted under fresh ids.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension};

use crate::codec::{self, SEGMENT_SIZE};
use crate::err::{Error, Result};

/// Capacity of the cache in segments.
pub const CACHE_CAPACITY: usize = 128;

type Key = (i64, i64);

pub struct SegmentCache {
    segments: Mutex<LruCache<Key, Arc<Vec<f32>>>>,
    conn: Mutex<Connection>,
}

impl SegmentCache {
    /// Wrap a dedicated reader connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            segments: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            conn: Mutex::new(conn),
        }
    }

    /// Decoded scores of segment `i` of a field, or `None` when the segment
    /// row does not exist. Concurrent misses on the same key may decode
    /// twice; the last insert wins and both callers observe equal data.
    pub fn segment(&self, field_id: i64, i: i64) -> Result<Option<Arc<Vec<f32>>>> {
        if let Some(hit) = self.segments.lock().get(&(field_id, i)) {
            return Ok(Some(Arc::clone(hit)));
        }
        let payload: Option<Vec<u8>> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT scores FROM field_score WHERE field_id = ?1 AND i = ?2",
                rusqlite::params![field_id, i],
                |row| row.get(0),
            )
            .optional()?
        };
        let Some(payload) = payload else {
            return Ok(None);
        };
        let scores = codec::decode(&payload).map_err(|e| match e {
            Error::Decode(reason) => {
                Error::Decode(format!("field {} segment {}: {}", field_id, i, reason))
            }
            other => other,
        })?;
        let scores = Arc::new(scores);
        self.segments
            .lock()
            .put((field_id, i), Arc::clone(&scores));
        Ok(Some(scores))
    }

    /// Score of one row of a field, `None` when the row is absent. Absent
    /// rows are expected on sparse columns and are not an error.
    pub fn row_score(&self, field_id: i64, row: i64) -> Result<Option<f32>> {
        if row < 0 {
            return Ok(None);
        }
        let s = SEGMENT_SIZE as i64;
        match self.segment(field_id, row / s)? {
            Some(segment) => Ok(segment.get((row % s) as usize).copied()),
            None => Ok(None),
        }
    }

    /// Categorical value of one row of a field: the row score interpreted as
    /// a code ordering and resolved against the `code` table. `None` when
    /// the row, the score, or the code is missing.
    pub fn row_value(&self, field_id: i64, row: i64) -> Result<Option<String>> {
        let Some(score) = self.row_score(field_id, row)? else {
            return Ok(None);
        };
        if score.is_nan() {
            return Ok(None);
        }
        let ordering = score as i64;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM code WHERE field_id = ?1 AND ordering = ?2",
            rusqlite::params![field_id, ordering],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }
}

/// Register the row-lookup scalar functions on a connection:
/// `unpack_score(field_id, row)` and `unpack_value(field_id, row)`. Queries
/// joining on encoded columns use these to project original values.
///
/// The cache handle is asserted unwind-safe: its locks guard every access,
/// so a panic inside a lookup cannot leave observable broken state.
pub fn register_functions(conn: &Connection, cache: Arc<SegmentCache>) -> rusqlite::Result<()> {
    let scores = std::panic::AssertUnwindSafe(Arc::clone(&cache));
    conn.create_scalar_function(
        "unpack_score",
        2,
        FunctionFlags::SQLITE_UTF8,
        move |ctx| {
            let field_id = ctx.get::<i64>(0)?;
            let row = ctx.get::<i64>(1)?;
            scores
                .row_score(field_id, row)
                .map(|v| v.map(f64::from))
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )?;
    let values = std::panic::AssertUnwindSafe(cache);
    conn.create_scalar_function(
        "unpack_value",
        2,
        FunctionFlags::SQLITE_UTF8,
        move |ctx| {
            let field_id = ctx.get::<i64>(0)?;
            let row = ctx.get::<i64>(1)?;
            values
                .row_value(field_id, row)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rusqlite::Connection;

    use super::SegmentCache;
    use crate::codec;
    use crate::db::schema;

    /// Two connections to one shared in-memory database.
    fn connect_pair(name: &str) -> (Connection, Connection) {
        let uri = format!("file:{}?mode=memory&cache=shared", name);
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI;
        let a = Connection::open_with_flags(&uri, flags).unwrap();
        let b = Connection::open_with_flags(&uri, flags).unwrap();
        schema::init(&a).unwrap();
        (a, b)
    }

    fn seed_scores(conn: &Connection, field_id: i64, scores: &[f32]) {
        conn.execute(
            "INSERT OR IGNORE INTO dataset (id, name) VALUES (1, 'd')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO field (id, dataset_id, name) VALUES (?1, 1, ?2)",
            rusqlite::params![field_id, format!("f{}", field_id)],
        )
        .unwrap();
        for (i, chunk) in scores.chunks(codec::SEGMENT_SIZE).enumerate() {
            conn.execute(
                "INSERT INTO field_score (field_id, i, scores) VALUES (?1, ?2, ?3)",
                rusqlite::params![field_id, i as i64, codec::encode(chunk)],
            )
            .unwrap();
        }
    }

    #[test]
    fn row_score_spans_segments() {
        let (main, reader) = connect_pair("cache_spans");
        let scores: Vec<f32> = (0..1500).map(|i| i as f32).collect();
        seed_scores(&main, 7, &scores);

        let cache = SegmentCache::new(reader);
        assert_eq!(cache.row_score(7, 0).unwrap(), Some(0.0));
        assert_eq!(cache.row_score(7, 999).unwrap(), Some(999.0));
        assert_eq!(cache.row_score(7, 1000).unwrap(), Some(1000.0));
        assert_eq!(cache.row_score(7, 1499).unwrap(), Some(1499.0));
        // Off the end of the last segment and off the column entirely.
        assert_eq!(cache.row_score(7, 1500).unwrap(), None);
        assert_eq!(cache.row_score(7, 5000).unwrap(), None);
        assert_eq!(cache.row_score(7, -1).unwrap(), None);
    }

    #[test]
    fn missing_field_yields_missing() {
        let (_main, reader) = connect_pair("cache_missing");
        let cache = SegmentCache::new(reader);
        assert_eq!(cache.segment(99, 0).unwrap(), None);
        assert_eq!(cache.row_score(99, 0).unwrap(), None);
        assert_eq!(cache.row_value(99, 0).unwrap(), None);
    }

    #[test]
    fn row_value_resolves_codes() {
        let (main, reader) = connect_pair("cache_codes");
        seed_scores(&main, 3, &[0.0, 1.0, f32::NAN]);
        main.execute_batch(
            "INSERT INTO code (field_id, ordering, value) VALUES (3, 0, 'low');
             INSERT INTO code (field_id, ordering, value) VALUES (3, 1, 'high');",
        )
        .unwrap();

        let cache = SegmentCache::new(reader);
        assert_eq!(cache.row_value(3, 0).unwrap(), Some("low".into()));
        assert_eq!(cache.row_value(3, 1).unwrap(), Some("high".into()));
        // NaN row and out-of-dictionary orderings are null, not errors.
        assert_eq!(cache.row_value(3, 2).unwrap(), None);
        assert_eq!(cache.row_value(3, 7).unwrap(), None);
    }

    #[test]
    fn unpack_functions_are_callable_from_sql() {
        let (main, reader) = connect_pair("cache_udf");
        seed_scores(&main, 4, &[0.0, 1.0]);
        main.execute_batch(
            "INSERT INTO code (field_id, ordering, value) VALUES (4, 0, 'wt');
             INSERT INTO code (field_id, ordering, value) VALUES (4, 1, 'mut');",
        )
        .unwrap();

        let cache = Arc::new(SegmentCache::new(reader));
        super::register_functions(&main, cache).unwrap();

        let score: f64 = main
            .query_row("SELECT unpack_score(4, 1)", [], |r| r.get(0))
            .unwrap();
        assert_eq!(score, 1.0);
        let value: String = main
            .query_row("SELECT unpack_value(4, 0)", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, "wt");
        let missing: Option<String> = main
            .query_row("SELECT unpack_value(4, 99)", [], |r| r.get(0))
            .unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn eviction_keeps_the_cache_bounded() {
        let (main, reader) = connect_pair("cache_evict");
        for field_id in 0..(super::CACHE_CAPACITY as i64 + 10) {
            seed_scores(&main, field_id + 100, &[field_id as f32]);
        }
        let cache = SegmentCache::new(reader);
        for field_id in 0..(super::CACHE_CAPACITY as i64 + 10) {
            assert_eq!(
                cache.row_score(field_id + 100, 0).unwrap(),
                Some(field_id as f32)
            );
        }
        assert!(cache.segments.lock().len() <= super::CACHE_CAPACITY);
    }
}
