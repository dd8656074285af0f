//! Block-reserving id allocator over the `sequence` table.
//!
//! The loader allocates one id per field and per feature. Reserving ids in
//! blocks keeps the sequence row out of the per-insert hot path; a block of
//! 2000 amortizes the round-trip over a whole field batch. Unused ids from a
//! reserved block are simply never handed out again, which is fine: ids only
//! need to be unique and increasing.

use rusqlite::Connection;

use crate::err::Result;

/// Default number of ids reserved per round-trip.
pub const BLOCK_SIZE: i64 = 2000;

/// Allocator handing out ids from blocks reserved in the `sequence` table.
pub struct IdAllocator {
    name: &'static str,
    block: i64,
    next: i64,
    ceiling: i64,
}

impl IdAllocator {
    pub fn new(name: &'static str) -> Self {
        Self::with_block(name, BLOCK_SIZE)
    }

    pub fn with_block(name: &'static str, block: i64) -> Self {
        assert!(block > 0);
        Self {
            name,
            block,
            next: 0,
            ceiling: 0,
        }
    }

    /// Next id, reserving a fresh block when the current one is exhausted.
    ///
    /// The reservation takes part in whatever transaction is open on `conn`,
    /// so a rolled-back load also rolls back its reservations.
    pub fn next(&mut self, conn: &Connection) -> Result<i64> {
        if self.next == self.ceiling {
            let upper: i64 = conn.query_row(
                "UPDATE sequence SET next = next + ?1 WHERE name = ?2 RETURNING next",
                rusqlite::params![self.block, self.name],
                |row| row.get(0),
            )?;
            self.ceiling = upper;
            self.next = upper - self.block;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}
