//! Batched allocation of unique identifiers.
//!
//! Every identifier (space tokens, file ids, link group ids) comes from one
//! persisted counter.  Rather than hitting the database for every token, an
//! allocator claims a block of [`STEP`] consecutive values in its own short
//! write transaction and hands them out from memory.  A crash loses the rest
//! of the block, never hands out a value twice.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use rusqlite::params;
use tracing::{debug, warn};

use crate::database::{rw_tx, sql, DbPool, Unsigned};
use crate::err::{DatabaseError, Error};

/// Number of tokens claimed per database round trip.
pub(crate) const STEP: u64 = 10_000;

/// Delay before the first retry of a failed claim.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// The block of tokens an allocator currently serves from.
#[derive(Debug)]
struct Block {
    /// First token of the block.
    base: u64,
    /// Number of tokens of the block already handed out.
    offset: u64,
}

/// A process-wide source of unique, increasing tokens.
#[derive(Debug)]
pub(crate) struct TokenAllocator {
    /// The current block; `None` until the first claim succeeds.
    block: Mutex<Option<Block>>,
    /// Size of each claimed block.
    step: u64,
    /// How many times a claim is attempted before giving up.
    attempts: u32,
}

impl TokenAllocator {
    /// Create an allocator claiming blocks of `step` tokens, trying each
    /// claim at most `attempts` times.
    pub(crate) fn new(step: u64, attempts: u32) -> Self {
        TokenAllocator {
            block: Mutex::new(None),
            step: step.max(1),
            attempts: attempts.max(1),
        }
    }

    /// Return the next unused token.
    ///
    /// Claims a new block from `pool` when the current one is used up.  The
    /// claim runs in its own transaction, so it must not be called from
    /// within another write transaction on the same database.
    pub(crate) fn next_token(&self, pool: &DbPool) -> Result<u64, Error> {
        let mut block = self.block.lock().unwrap_or_else(PoisonError::into_inner);
        match block.as_mut() {
            Some(b) if b.offset < self.step => {
                let token = b.base + b.offset;
                b.offset += 1;
                Ok(token)
            }
            _ => {
                let base = self.claim_with_retry(pool)?;
                *block = Some(Block { base, offset: 1 });
                Ok(base)
            }
        }
    }

    /// Claim a block, retrying with exponential backoff.
    ///
    /// A failed attempt leaves the current block untouched; no token of a
    /// block is handed out before the claim committed.
    fn claim_with_retry(&self, pool: &DbPool) -> Result<u64, Error> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match claim(pool, self.step) {
                Ok(base) => {
                    debug!(base, step = self.step, "claimed token block");
                    return Ok(base);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(error = %e, attempt, "failed to claim token block, retrying");
                    let jitter = rand::rng().random_range(0..=delay.as_millis() / 2);
                    let jitter = u64::try_from(jitter).unwrap_or_default();
                    std::thread::sleep(delay + Duration::from_millis(jitter));
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Reserve `step` tokens in the counter row and return the first one.
fn claim(pool: &DbPool, step: u64) -> Result<u64, DatabaseError> {
    rw_tx(pool, |tx| {
        let base = tx
            .query_row(
                sql!("SELECT next_token FROM spacemgr_next_token WHERE rowid = 1"),
                params![],
                |row| row.get::<_, Unsigned>(0),
            )?
            .0;
        let next = base.checked_add(step).ok_or_else(|| DatabaseError::Corrupt {
            what: "token counter exhausted".into(),
        })?;
        tx.execute(
            sql!("UPDATE spacemgr_next_token SET next_token = ?1 WHERE rowid = 1"),
            params![Unsigned(next)],
        )?;
        Ok(base)
    })
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_time_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use std::collections::HashSet;
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::database::{open, read_tx};

    fn stored_counter(pool: &DbPool) -> u64 {
        read_tx(pool, |tx| {
            Ok::<_, DatabaseError>(
                tx.query_row(sql!("SELECT next_token FROM spacemgr_next_token"), params![], |row| {
                    row.get::<_, Unsigned>(0)
                })?
                .0,
            )
        })
        .unwrap()
    }

    #[test]
    fn serves_blocks() {
        let db_dir = tempdir().unwrap();
        let pool = open(db_dir.path().join("db"), Duration::from_secs(1)).unwrap();
        let alloc = TokenAllocator::new(3, 1);

        let tokens: Vec<u64> = (0..7).map(|_| alloc.next_token(&pool).unwrap()).collect();
        assert_eq!(tokens, vec![1, 2, 3, 4, 5, 6, 7]);
        // Three blocks claimed.
        assert_eq!(stored_counter(&pool), 10);
    }

    #[test]
    fn survives_restart() {
        let db_dir = tempdir().unwrap();
        let path = db_dir.path().join("db");
        let first = {
            let pool = open(&path, Duration::from_secs(1)).unwrap();
            let alloc = TokenAllocator::new(STEP, 1);
            alloc.next_token(&pool).unwrap()
        };
        let pool = open(&path, Duration::from_secs(1)).unwrap();
        let alloc = TokenAllocator::new(STEP, 1);
        let second = alloc.next_token(&pool).unwrap();
        assert_eq!(second, first + STEP);
    }

    #[test]
    fn allocators_never_collide() {
        let db_dir = tempdir().unwrap();
        let pool = open(db_dir.path().join("db"), Duration::from_secs(5)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    // Separate allocators stand in for separate processes.
                    let alloc = TokenAllocator::new(5, 4);
                    (0..20)
                        .map(|_| alloc.next_token(&pool).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t), "token {t} handed out twice");
            }
        }
        assert_eq!(seen.len(), 80);

        let shared = Arc::new(TokenAllocator::new(STEP, 1));
        let a = shared.next_token(&pool).unwrap();
        let b = shared.next_token(&pool).unwrap();
        assert_eq!(b, a + 1);
    }
}
