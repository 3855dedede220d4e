//! Periodic expiry of reservations and abandoned file placements.

use std::future::Future;
use std::sync::Arc;

use rusqlite::{named_params, Transaction};
use tracing::{debug, info, warn};

use crate::accounting::{lock_file, lock_space, remove_file, update_space, SpaceUpdate};
use crate::database::{read_tx, rw_tx, sql};
use crate::err::Error;
use crate::manager::SpaceManager;
use crate::types::{FileId, SpaceState, SpaceToken, Timestamp};

/// The outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct SweepReport {
    /// Transient files removed after their lifetime ran out.
    pub files_removed: usize,
    /// Reservations moved to EXPIRED.
    pub spaces_expired: usize,
    /// Rows that could not be processed; they are retried next time.
    pub failures: usize,
}

impl SpaceManager {
    /// Run one sweep.
    ///
    /// First (if enabled by configuration) removes the files that stayed
    /// RESERVED or TRANSFERRING past their lifetime in a RESERVED
    /// reservation, then expires the RESERVED reservations past their own
    /// lifetime.  Every row is handled in its own transaction and checked
    /// again once locked; a row that fails is logged and skipped.
    pub fn expire_once(&self) -> Result<SweepReport, Error> {
        self.ensure_enabled()?;
        let now = self.now();
        let mut report = SweepReport::default();

        if self.config().cleanup_expired_space_files() {
            for id in read_tx(self.pool(), |tx| expired_files(tx, now))? {
                match rw_tx(self.pool(), |tx| remove_if_expired(tx, id, now)) {
                    Ok(true) => report.files_removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(file = %id, error = %e, "failed to remove expired file");
                        report.failures += 1;
                    }
                }
            }
        }

        for token in read_tx(self.pool(), |tx| expired_spaces(tx, now))? {
            match rw_tx(self.pool(), |tx| expire_if_due(tx, token, now)) {
                Ok(true) => report.spaces_expired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(space = %token, error = %e, "failed to expire space reservation");
                    report.failures += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(?report, "swept expired reservations");
        }
        Ok(report)
    }
}

/// Return the transient files past their lifetime in RESERVED reservations.
fn expired_files(tx: &Transaction<'_>, now: Timestamp) -> Result<Vec<FileId>, Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        SELECT f.id FROM space_file f
        JOIN space_reservation s ON s.id = f.space_reservation_id
        WHERE s.state = 'RESERVED'
          AND f.state IN ('RESERVED', 'TRANSFERRING')
          AND f.lifetime != -1
          AND f.creation_time + f.lifetime < :now
        ORDER BY f.id
        "
    ))?;
    let ids = stmt
        .query_map(named_params! { ":now": now }, |row| row.get(0))?
        .collect::<Result<Vec<FileId>, _>>()?;
    Ok(ids)
}

/// Return the RESERVED reservations past their lifetime.
fn expired_spaces(tx: &Transaction<'_>, now: Timestamp) -> Result<Vec<SpaceToken>, Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        SELECT id FROM space_reservation
        WHERE state = 'RESERVED'
          AND lifetime != -1
          AND creation_time + lifetime < :now
        ORDER BY id
        "
    ))?;
    let tokens = stmt
        .query_map(named_params! { ":now": now }, |row| row.get(0))?
        .collect::<Result<Vec<SpaceToken>, _>>()?;
    Ok(tokens)
}

/// Remove file `id` if it is still transient and expired.
fn remove_if_expired(tx: &Transaction<'_>, id: FileId, now: Timestamp) -> Result<bool, Error> {
    let file = match lock_file(tx, id) {
        Ok(file) => file,
        Err(Error::NotFound { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut space = lock_space(tx, file.space_id)?;
    if space.state != SpaceState::Reserved || !file.is_expired_at(now) {
        return Ok(false);
    }
    debug!(file = %id, space = %space.id, path = ?file.path, "file placement expired");
    remove_file(tx, &mut space, &file)?;
    Ok(true)
}

/// Expire reservation `token` if it is still RESERVED and past its lifetime.
fn expire_if_due(tx: &Transaction<'_>, token: SpaceToken, now: Timestamp) -> Result<bool, Error> {
    let mut space = lock_space(tx, token)?;
    if space.state != SpaceState::Reserved || !space.is_expired_at(now) {
        return Ok(false);
    }
    update_space(
        tx,
        &mut space,
        &SpaceUpdate {
            state: Some(SpaceState::Expired),
            ..Default::default()
        },
    )?;
    Ok(true)
}

/// Sweep every configured period until `shutdown` resolves.
///
/// The database work runs on the blocking thread pool.
pub async fn run_sweeper<F>(manager: Arc<SpaceManager>, shutdown: F)
where
    F: Future<Output = ()>,
{
    let period = manager.config().expire_space_reservations_period();
    info!(period = %humantime::format_duration(period), "space reservation sweeper started");
    tokio::pin!(shutdown);
    loop {
        let m = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || m.expire_once()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "sweep failed"),
            Err(e) => warn!(error = %e, "sweep task panicked"),
        }
        tokio::select! {
            () = &mut shutdown => break,
            () = tokio::time::sleep(period) => {}
        }
    }
    info!("space reservation sweeper stopped");
}
