//! Access to the database schema and transactions.
//!
//! This module is not intended to provide a high-level ORM; it initializes
//! the database, hands out transactions, and converts between rows and the
//! data model.
//!
//! # Locking
//!
//! SQLite has no row locks.  Every mutating operation runs inside a
//! transaction opened with `BEGIN EXCLUSIVE`, which takes the database-wide
//! write lock up front.  That lock lives in the database file, so it
//! serializes writers across threads and across processes sharing the same
//! store, and it is the equivalent of reading every touched row with
//! `SELECT ... FOR UPDATE`.  A writer that cannot get the lock waits for the
//! configured busy timeout and then fails with `SQLITE_BUSY`.
//!
//! Readers use deferred transactions and never block writers (the database
//! runs in WAL mode).

use std::num::NonZero;
use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Row, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::auth::VoRule;
use crate::err::DatabaseError;
use crate::types::{LinkGroup, LinkGroupFlags, Space, SpaceFile};

/// The connection pool type used throughout the crate.
pub(crate) type DbPool = Pool<SqliteConnectionManager>;

/// A no-op macro just returning the supplied.
///
/// The purpose of this macro is to semantically mark [`str`] literals to be
/// SQL statement.
///
/// Keep in mind that the compiler will not notice if you forget this macro.
/// Unfortunately, you have to ensure it yourself.
macro_rules! sql {
    ($s:literal) => {
        $s
    };
}

pub(crate) use sql;

/// Version 1 of the database schema.
const V1_SCHEMA: &str = sql!(
    "
-- Meta table to store the current schema version.
CREATE TABLE spacemgr_schema_version(
    version TEXT NOT NULL -- currently, always `1`
) STRICT;

-- The token counter.  Holds exactly one row: the first token of the next
-- block that has not been handed to any allocator yet.
CREATE TABLE spacemgr_next_token(
    next_token INTEGER NOT NULL,
    CHECK(next_token >= 0)
) STRICT;

-- Named pools of capacity, as reported by the capacity feed.
CREATE TABLE link_group(
    id                  INTEGER PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    free_space_bytes    INTEGER NOT NULL,
    reserved_space_bytes INTEGER NOT NULL DEFAULT 0,
    last_update_time    INTEGER NOT NULL,
    online_allowed      INTEGER NOT NULL,
    nearline_allowed    INTEGER NOT NULL,
    replica_allowed     INTEGER NOT NULL,
    output_allowed      INTEGER NOT NULL,
    custodial_allowed   INTEGER NOT NULL,
    CHECK(free_space_bytes >= 0),
    CHECK(reserved_space_bytes >= 0),
    CHECK(online_allowed IN (0, 1)),
    CHECK(nearline_allowed IN (0, 1)),
    CHECK(replica_allowed IN (0, 1)),
    CHECK(output_allowed IN (0, 1)),
    CHECK(custodial_allowed IN (0, 1))
) STRICT;

-- The allow-list of each link group; `*` is the wildcard.
CREATE TABLE link_group_vo(
    link_group_id   INTEGER NOT NULL,
    vo_group        TEXT NOT NULL,
    vo_role         TEXT NOT NULL,
    PRIMARY KEY(link_group_id, vo_group, vo_role),
    FOREIGN KEY(link_group_id) REFERENCES link_group(id) ON DELETE CASCADE
) STRICT;

-- Space reservations.
CREATE TABLE space_reservation(
    id                      INTEGER PRIMARY KEY,
    link_group_id           INTEGER NOT NULL,
    vo_group                TEXT,
    vo_role                 TEXT,
    retention_policy        TEXT NOT NULL,
    access_latency          TEXT NOT NULL,
    size_bytes              INTEGER NOT NULL,
    creation_time           INTEGER NOT NULL,
    lifetime                INTEGER NOT NULL,
    description             TEXT,
    state                   TEXT NOT NULL,
    used_size_bytes         INTEGER NOT NULL DEFAULT 0,
    allocated_size_bytes    INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(link_group_id) REFERENCES link_group(id),
    CHECK(retention_policy IN ('CUSTODIAL', 'OUTPUT', 'REPLICA')),
    CHECK(access_latency IN ('ONLINE', 'NEARLINE')),
    CHECK(state IN ('RESERVED', 'RELEASED', 'EXPIRED')),
    CHECK(size_bytes >= 0),
    CHECK(used_size_bytes >= 0),
    CHECK(allocated_size_bytes >= 0),
    CHECK(lifetime >= -1)
) STRICT;

CREATE INDEX space_reservation_state_idx ON space_reservation(state);
CREATE INDEX space_reservation_link_group_idx ON space_reservation(link_group_id);
CREATE INDEX space_reservation_description_idx ON space_reservation(description);

-- Files placed in space reservations.
CREATE TABLE space_file(
    id                      INTEGER PRIMARY KEY,
    space_reservation_id    INTEGER NOT NULL,
    vo_group                TEXT,
    vo_role                 TEXT,
    size_bytes              INTEGER NOT NULL,
    creation_time           INTEGER NOT NULL,
    lifetime                INTEGER NOT NULL,
    pnfs_path               TEXT,
    pnfs_id                 TEXT,
    state                   TEXT NOT NULL,
    deleted                 INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(space_reservation_id) REFERENCES space_reservation(id),
    CHECK(state IN ('RESERVED', 'TRANSFERRING', 'STORED', 'FLUSHED')),
    CHECK(size_bytes >= 0),
    CHECK(lifetime >= -1),
    CHECK(deleted IN (0, 1))
) STRICT;

CREATE INDEX space_file_space_idx ON space_file(space_reservation_id);
CREATE INDEX space_file_pnfs_id_idx ON space_file(pnfs_id);
CREATE INDEX space_file_pnfs_path_idx ON space_file(pnfs_path);
CREATE INDEX space_file_state_idx ON space_file(state);

INSERT INTO spacemgr_next_token(next_token) VALUES (1);
INSERT INTO spacemgr_schema_version(version) VALUES ('1');
"
);

/// Options set on every new connection.
const GLOBAL_OPTIONS: &str = sql!(
    "
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;
"
);

/// Opens a database from disk, creating a [`Pool`] for it.
///
/// This function is the entry point for everything requiring a database
/// handle; it initializes the schema of an empty database and rejects one
/// with an unknown schema version.  Every connection of the pool gets the
/// global pragmas and a busy timeout of `busy_timeout`.
///
/// Open the database once per process and share the [`Pool`]: opening
/// several connections to a WAL database simultaneously can fail with
/// `SQLITE_BUSY` before any busy handler is installed.
pub(crate) fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<DbPool, DatabaseError> {
    let max_size = std::thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(8);
    let max_size = u32::try_from(max_size).unwrap_or(u32::MAX).max(2);

    let manager = SqliteConnectionManager::file(path.as_ref()).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(GLOBAL_OPTIONS)
    });
    let pool = Pool::builder().max_size(max_size).build(manager)?;

    rw_tx(&pool, |tx| {
        let has_schema_version = tx
            .query_row(
                sql!(
                    "
                    SELECT name
                    FROM sqlite_master
                      WHERE type = 'table'
                        AND name = 'spacemgr_schema_version'
                    "
                ),
                params![],
                |_| Ok(()),
            )
            .map(|()| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                e => Err(e),
            })?;

        if has_schema_version {
            let version = tx.query_row(
                sql!("SELECT version FROM spacemgr_schema_version WHERE rowid = 1"),
                params![],
                |row| row.get::<_, String>(0),
            )?;

            match version.as_ref() {
                "1" => {}
                unknown => {
                    return Err(DatabaseError::IncompatibleSchema {
                        version: unknown.into(),
                    })
                }
            }
        } else {
            debug!("initializing empty database");
            tx.execute_batch(V1_SCHEMA)?;
        }

        Ok::<_, DatabaseError>(())
    })?;

    Ok(pool)
}

/// Executes a closure `op` with a given read-only [`Transaction`].
///
/// The [`Transaction`] always gets rolled back the moment `op` returns.
///
/// **The closure shall not perform write operations!**
/// Not only do they get rolled back anyways, but upgrading the [`Transaction`]
/// from a read to a write transaction will lead to other simultaneous write
/// upgrades to fail.
pub(crate) fn read_tx<U, E, F>(pool: &DbPool, op: F) -> Result<U, E>
where
    F: FnOnce(&Transaction<'_>) -> Result<U, E>,
    E: From<DatabaseError>,
{
    let mut conn = pool.get().map_err(DatabaseError::from)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Deferred)
        .map_err(DatabaseError::from)?;
    let res = op(&tx);
    tx.rollback().map_err(DatabaseError::from)?;
    res
}

/// Executes a closure `op` with a given read-write [`Transaction`].
///
/// The [`Transaction`] gets committed if `op` returns `Ok`, and rolled back
/// if it returns `Err`, so that a failed operation never leaves a partial
/// set of counter updates behind.
///
/// The [`Transaction`] gets created with [`TransactionBehavior::Exclusive`],
/// meaning it will immediately hold the write lock, retrying in the case of
/// a [`rusqlite::ErrorCode::DatabaseBusy`] until the busy timeout elapses.
pub(crate) fn rw_tx<U, E, F>(pool: &DbPool, op: F) -> Result<U, E>
where
    F: FnOnce(&Transaction<'_>) -> Result<U, E>,
    E: From<DatabaseError>,
{
    let mut conn = pool.get().map_err(DatabaseError::from)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(DatabaseError::from)?;
    match op(&tx) {
        Ok(res) => {
            tx.commit().map_err(DatabaseError::from)?;
            Ok(res)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback() {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

/// An unsigned integer stored in an SQLite `INTEGER` column.
///
/// SQLite integers are signed; values above `i64::MAX` are rejected on the
/// way in, negative values on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unsigned(pub(crate) u64);

impl ToSql for Unsigned {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let v = i64::try_from(self.0)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(v))
    }
}

impl FromSql for Unsigned {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let v = i64::column_result(value)?;
        u64::try_from(v)
            .map(Unsigned)
            .map_err(|_| FromSqlError::OutOfRange(v))
    }
}

/// Convert a `link_group` row.
///
/// The allow-list is left empty; see [`load_vo_rules`].
pub(crate) fn link_group_from_row(row: &Row<'_>) -> rusqlite::Result<LinkGroup> {
    Ok(LinkGroup {
        id: row.get("id")?,
        name: row.get("name")?,
        free_space: row.get::<_, Unsigned>("free_space_bytes")?.0,
        reserved_space: row.get::<_, Unsigned>("reserved_space_bytes")?.0,
        last_update_time: row.get("last_update_time")?,
        flags: LinkGroupFlags {
            online_allowed: row.get("online_allowed")?,
            nearline_allowed: row.get("nearline_allowed")?,
            replica_allowed: row.get("replica_allowed")?,
            output_allowed: row.get("output_allowed")?,
            custodial_allowed: row.get("custodial_allowed")?,
        },
        vo_rules: Vec::new(),
    })
}

/// Convert a `space_reservation` row.
pub(crate) fn space_from_row(row: &Row<'_>) -> rusqlite::Result<Space> {
    Ok(Space {
        id: row.get("id")?,
        link_group_id: row.get("link_group_id")?,
        vo_group: row.get("vo_group")?,
        vo_role: row.get("vo_role")?,
        retention_policy: row.get("retention_policy")?,
        access_latency: row.get("access_latency")?,
        size: row.get::<_, Unsigned>("size_bytes")?.0,
        creation_time: row.get("creation_time")?,
        lifetime: row.get("lifetime")?,
        description: row.get("description")?,
        state: row.get("state")?,
        used: row.get::<_, Unsigned>("used_size_bytes")?.0,
        allocated: row.get::<_, Unsigned>("allocated_size_bytes")?.0,
    })
}

/// Convert a `space_file` row.
pub(crate) fn file_from_row(row: &Row<'_>) -> rusqlite::Result<SpaceFile> {
    Ok(SpaceFile {
        id: row.get("id")?,
        space_id: row.get("space_reservation_id")?,
        vo_group: row.get("vo_group")?,
        vo_role: row.get("vo_role")?,
        size: row.get::<_, Unsigned>("size_bytes")?.0,
        creation_time: row.get("creation_time")?,
        lifetime: row.get("lifetime")?,
        path: row.get("pnfs_path")?,
        pnfs_id: row.get("pnfs_id")?,
        state: row.get("state")?,
        deleted: row.get("deleted")?,
    })
}

/// Load the allow-list of `link_group`.
pub(crate) fn load_vo_rules(
    tx: &Transaction<'_>,
    link_group: &mut LinkGroup,
) -> Result<(), DatabaseError> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        SELECT vo_group, vo_role
        FROM link_group_vo
        WHERE link_group_id = ?1
        ORDER BY vo_group, vo_role
        "
    ))?;
    link_group.vo_rules = stmt
        .query_map(params![link_group.id], |row| {
            let group: String = row.get(0)?;
            let role: String = row.get(1)?;
            Ok(VoRule::from_stored(&group, &role))
        })?
        .collect::<Result<_, _>>()?;
    Ok(())
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
    use std::sync::{Arc, Once};

    use rusqlite::Connection;
    use tempfile::tempdir;

    use super::*;

    const BUSY: Duration = Duration::from_millis(1000);

    #[test]
    fn open() {
        let db_dir = tempdir().unwrap();
        let db_path = db_dir.path().join("db");

        super::open(&db_path, BUSY).unwrap();
        let conn = Connection::open(&db_path).unwrap();

        // Check if the version and the counter were initialized properly.
        let version = conn
            .query_row(
                "SELECT version FROM spacemgr_schema_version WHERE rowid = 1",
                params![],
                |row| row.get::<_, String>(0),
            )
            .unwrap();
        assert_eq!(version, "1");
        let next = conn
            .query_row("SELECT next_token FROM spacemgr_next_token", params![], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap();
        assert_eq!(next, 1);

        // Opening again leaves the content alone.
        conn.execute("UPDATE spacemgr_next_token SET next_token = 5", params![])
            .unwrap();
        super::open(&db_path, BUSY).unwrap();
        let next = conn
            .query_row("SELECT next_token FROM spacemgr_next_token", params![], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap();
        assert_eq!(next, 5);

        // Set the version to something unknown.
        conn.execute("UPDATE spacemgr_schema_version SET version = 42", params![])
            .unwrap();
        drop(conn);

        assert_eq!(
            super::open(&db_path, BUSY).unwrap_err().to_string(),
            "incompatible schema version: 42"
        );
    }

    #[test]
    fn rw_tx_rolls_back_on_error() {
        let db_dir = tempdir().unwrap();
        let pool = super::open(db_dir.path().join("db"), BUSY).unwrap();

        let res: Result<(), DatabaseError> = super::rw_tx(&pool, |tx| {
            tx.execute_batch("UPDATE spacemgr_next_token SET next_token = 99")?;
            Err(DatabaseError::Corrupt {
                what: "forced".into(),
            })
        });
        assert!(res.is_err());

        let next: i64 = super::read_tx(&pool, |tx| {
            tx.query_row(sql!("SELECT next_token FROM spacemgr_next_token"), params![], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::from)
        })
        .unwrap();
        assert_eq!(next, 1);

        super::rw_tx(&pool, |tx| {
            tx.execute_batch("UPDATE spacemgr_next_token SET next_token = 99")?;
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
        let next: i64 = super::read_tx(&pool, |tx| {
            tx.query_row(sql!("SELECT next_token FROM spacemgr_next_token"), params![], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::from)
        })
        .unwrap();
        assert_eq!(next, 99);
    }

    #[test]
    fn unsigned_rejects_negative() {
        let db_dir = tempdir().unwrap();
        let pool = super::open(db_dir.path().join("db"), BUSY).unwrap();
        let res: Result<Unsigned, DatabaseError> = super::read_tx(&pool, |tx| {
            Ok(tx.query_row(sql!("SELECT -1"), params![], |row| row.get(0))?)
        });
        assert!(res.is_err());
        let res: Result<Unsigned, DatabaseError> = super::read_tx(&pool, |tx| {
            Ok(tx.query_row(sql!("SELECT 17"), params![], |row| row.get(0))?)
        });
        assert_eq!(res.unwrap(), Unsigned(17));
    }

    #[test]
    fn rw_tx_busy_timeout_working() {
        let db_dir = tempdir().unwrap();
        let db_path = db_dir.path().join("db");
        let writer_acquired = Arc::new(Once::new());
        let pool = super::open(db_path, BUSY).unwrap();

        let t1 = std::thread::spawn({
            let pool = pool.clone();
            let writer_acquired = writer_acquired.clone();
            move || {
                super::rw_tx(&pool, move |_tx| {
                    println!("t1 acquired write lock");
                    writer_acquired.call_once(|| ());
                    std::thread::sleep(Duration::from_millis(500));
                    println!("t1 released write lock");
                    Ok::<_, DatabaseError>(())
                })
            }
        });

        let t2 = std::thread::spawn(move || {
            writer_acquired.wait();
            super::rw_tx(&pool, move |_tx| {
                println!("t2 acquired write lock");
                Ok::<_, DatabaseError>(())
            })
        });

        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();
    }

    #[test]
    fn rw_tx_busy_timeout_busy() {
        let db_dir = tempdir().unwrap();
        let db_path = db_dir.path().join("db");
        let writer_acquired = Arc::new(Once::new());
        let pool = super::open(db_path, BUSY).unwrap();

        let t1 = std::thread::spawn({
            let pool = pool.clone();
            let writer_acquired = writer_acquired.clone();
            move || {
                super::rw_tx(&pool, move |_tx| {
                    writer_acquired.call_once(|| ());
                    std::thread::sleep(Duration::from_millis(1500));
                    Ok::<_, DatabaseError>(())
                })
            }
        });

        let t2 = std::thread::spawn(move || {
            writer_acquired.wait();
            super::rw_tx(&pool, move |_tx| Ok::<_, DatabaseError>(()))
        });

        t1.join().unwrap().unwrap();
        let e = t2.join().unwrap().unwrap_err();
        match e {
            DatabaseError::LowLevel(e) => {
                assert_eq!(e.sqlite_error_code(), Some(rusqlite::ErrorCode::DatabaseBusy))
            }
            e => panic!("unexpected error: {e}"),
        }
    }
}
