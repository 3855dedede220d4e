//! Capacity bookkeeping for link groups, reservations and files.
//!
//! Every function here takes the [`Transaction`] of an exclusive write
//! transaction (see [`rw_tx`](crate::database::rw_tx)).  Reading a row inside
//! such a transaction is reading it "for update": nobody else can write until
//! we commit.  When a function returns `Err`, the caller's transaction is
//! rolled back, so partial counter updates never become visible.
//!
//! The rules, in short:
//!
//! * A link group's reserved bytes track the *unused* part of its RESERVED
//!   reservations.  They move with a reservation's size, with its used bytes,
//!   and with its lifecycle; they never move with its allocated bytes.
//! * A reservation's allocated bytes count files still arriving
//!   (RESERVED, TRANSFERRING); its used bytes count files on disk (STORED).
//! * A link group's free bytes drop when a file lands on disk and come back
//!   when it leaves the disk (removed or flushed).
//!
//! When a reservation and its link group are both touched, the reservation
//! is always read first.

use rusqlite::{named_params, params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::auth::VoOwner;
use crate::database::{
    file_from_row, link_group_from_row, load_vo_rules, space_from_row, sql, Unsigned,
};
use crate::err::Error;
use crate::types::{
    AccessLatency, FileId, FileState, Lifetime, LinkGroup, LinkGroupId, RetentionPolicy, Space,
    SpaceFile, SpaceState, SpaceToken, Timestamp,
};

/// Convert a byte count to a signed delta.
pub(crate) fn signed(bytes: u64) -> Result<i64, Error> {
    i64::try_from(bytes).map_err(|_| Error::InvalidArgument(format!("size {} is too large", bytes)))
}

/// Apply `delta` to the counter `what`, failing if it would leave the range
/// of a `u64`.
fn offset(value: u64, delta: i64, what: &str) -> Result<u64, Error> {
    value
        .checked_add_signed(delta)
        .ok_or_else(|| Error::Bug(format!("{} would become {} {:+}", what, value, delta)))
}

/// Read a reservation for update.
pub(crate) fn lock_space(tx: &Transaction<'_>, token: SpaceToken) -> Result<Space, Error> {
    find_space(tx, token)?.ok_or_else(|| Error::no_such_space(token))
}

/// Read a reservation, if it exists.
pub(crate) fn find_space(tx: &Transaction<'_>, token: SpaceToken) -> Result<Option<Space>, Error> {
    let mut stmt = tx.prepare_cached(sql!("SELECT * FROM space_reservation WHERE id = :id"))?;
    Ok(stmt
        .query_row(named_params! { ":id": token }, space_from_row)
        .optional()?)
}

/// Read a link group for update, including its allow-list.
pub(crate) fn lock_link_group(tx: &Transaction<'_>, id: LinkGroupId) -> Result<LinkGroup, Error> {
    let mut stmt = tx.prepare_cached(sql!("SELECT * FROM link_group WHERE id = :id"))?;
    let mut lg = stmt
        .query_row(named_params! { ":id": id }, link_group_from_row)
        .optional()?
        .ok_or_else(|| Error::no_such_link_group(id))?;
    load_vo_rules(tx, &mut lg)?;
    Ok(lg)
}

/// Read a link group by name, including its allow-list.
pub(crate) fn find_link_group_by_name(
    tx: &Transaction<'_>,
    name: &str,
) -> Result<Option<LinkGroup>, Error> {
    let mut stmt = tx.prepare_cached(sql!("SELECT * FROM link_group WHERE name = :name"))?;
    let lg = stmt
        .query_row(named_params! { ":name": name }, link_group_from_row)
        .optional()?;
    match lg {
        Some(mut lg) => {
            load_vo_rules(tx, &mut lg)?;
            Ok(Some(lg))
        }
        None => Ok(None),
    }
}

/// Read a file for update.
pub(crate) fn lock_file(tx: &Transaction<'_>, id: FileId) -> Result<SpaceFile, Error> {
    let mut stmt = tx.prepare_cached(sql!("SELECT * FROM space_file WHERE id = :id"))?;
    stmt.query_row(named_params! { ":id": id }, file_from_row)
        .optional()?
        .ok_or_else(|| Error::no_such_file(id))
}

/// Read the files with namespace identity `pnfs_id`.
pub(crate) fn files_by_pnfs_id(
    tx: &Transaction<'_>,
    pnfs_id: &str,
) -> Result<Vec<SpaceFile>, Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "SELECT * FROM space_file WHERE pnfs_id = :pnfs_id ORDER BY id"
    ))?;
    let files = stmt
        .query_map(named_params! { ":pnfs_id": pnfs_id }, file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

/// Read the transient files with `path`, optionally limited to one
/// reservation.
pub(crate) fn transient_files_by_path(
    tx: &Transaction<'_>,
    token: Option<SpaceToken>,
    path: &str,
) -> Result<Vec<SpaceFile>, Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        SELECT * FROM space_file
        WHERE pnfs_path = :path
          AND state IN ('RESERVED', 'TRANSFERRING')
          AND (:space IS NULL OR space_reservation_id = :space)
        ORDER BY id
        "
    ))?;
    let files = stmt
        .query_map(named_params! { ":path": path, ":space": token }, file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

/// Write the mutable columns of `space` back.
fn store_space(tx: &Transaction<'_>, space: &Space) -> Result<(), Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        UPDATE space_reservation
        SET vo_group = :vo_group,
            vo_role = :vo_role,
            retention_policy = :retention_policy,
            access_latency = :access_latency,
            size_bytes = :size,
            lifetime = :lifetime,
            description = :description,
            state = :state,
            used_size_bytes = :used,
            allocated_size_bytes = :allocated
        WHERE id = :id
        "
    ))?;
    stmt.execute(named_params! {
        ":vo_group": space.vo_group,
        ":vo_role": space.vo_role,
        ":retention_policy": space.retention_policy,
        ":access_latency": space.access_latency,
        ":size": Unsigned(space.size),
        ":lifetime": space.lifetime,
        ":description": space.description,
        ":state": space.state,
        ":used": Unsigned(space.used),
        ":allocated": Unsigned(space.allocated),
        ":id": space.id,
    })?;
    Ok(())
}

/// Write the mutable columns of `file` back.
fn store_file(tx: &Transaction<'_>, file: &SpaceFile) -> Result<(), Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        UPDATE space_file
        SET vo_group = :vo_group,
            vo_role = :vo_role,
            size_bytes = :size,
            lifetime = :lifetime,
            pnfs_path = :path,
            pnfs_id = :pnfs_id,
            state = :state,
            deleted = :deleted
        WHERE id = :id
        "
    ))?;
    stmt.execute(named_params! {
        ":vo_group": file.vo_group,
        ":vo_role": file.vo_role,
        ":size": Unsigned(file.size),
        ":lifetime": file.lifetime,
        ":path": file.path,
        ":pnfs_id": file.pnfs_id,
        ":state": file.state,
        ":deleted": file.deleted,
        ":id": file.id,
    })?;
    Ok(())
}

/// Move `free_delta` and `reserved_delta` bytes in link group `id`.
fn adjust_link_group(
    tx: &Transaction<'_>,
    id: LinkGroupId,
    free_delta: i64,
    reserved_delta: i64,
) -> Result<(), Error> {
    if free_delta == 0 && reserved_delta == 0 {
        return Ok(());
    }
    let lg = lock_link_group(tx, id)?;
    // Free space is a measurement the capacity feed overwrites on every
    // refresh, so it saturates instead of failing.
    let free = lg.free_space.saturating_add_signed(free_delta);
    let reserved = offset(lg.reserved_space, reserved_delta, "link group reserved space")?;
    let mut stmt = tx.prepare_cached(sql!(
        "
        UPDATE link_group
        SET free_space_bytes = :free, reserved_space_bytes = :reserved
        WHERE id = :id
        "
    ))?;
    stmt.execute(named_params! {
        ":free": Unsigned(free),
        ":reserved": Unsigned(reserved),
        ":id": id,
    })?;
    trace!(link_group = %id, free_delta, reserved_delta, "adjusted link group");
    Ok(())
}

/// Add `delta` to the used bytes of `space`.
///
/// While the reservation is RESERVED, its link group's reserved bytes move
/// by the opposite amount: bytes in use are no longer merely promised.
fn adjust_used(tx: &Transaction<'_>, space: &mut Space, delta: i64) -> Result<(), Error> {
    space.used = offset(space.used, delta, "space used size")?;
    if space.state == SpaceState::Reserved {
        adjust_link_group(tx, space.link_group_id, 0, -delta)?;
    }
    Ok(())
}

/// Add `delta` to the allocated bytes of `space`.  No link group counter
/// moves.
fn adjust_allocated(space: &mut Space, delta: i64) -> Result<(), Error> {
    space.allocated = offset(space.allocated, delta, "space allocated size")?;
    Ok(())
}

/// A request to create a reservation in a known link group.
#[derive(Debug, Clone)]
pub(crate) struct NewSpace<'a> {
    /// The link group.
    pub(crate) link_group: LinkGroupId,
    /// Recorded owner.
    pub(crate) owner: &'a VoOwner,
    /// Retention policy.
    pub(crate) retention_policy: RetentionPolicy,
    /// Access latency.
    pub(crate) access_latency: AccessLatency,
    /// Size in bytes.
    pub(crate) size: u64,
    /// Lifetime.
    pub(crate) lifetime: Lifetime,
    /// Description.
    pub(crate) description: Option<&'a str>,
}

/// Create reservation `token`, moving its size into the link group's
/// reserved bytes.
pub(crate) fn insert_space(
    tx: &Transaction<'_>,
    token: SpaceToken,
    new: &NewSpace<'_>,
    now: Timestamp,
) -> Result<Space, Error> {
    let lg = lock_link_group(tx, new.link_group)?;
    if lg.available_space() < i128::from(new.size) {
        return Err(Error::NoFreeSpace(format!(
            "link group {} has {} bytes available, {} requested",
            lg.name,
            lg.available_space(),
            new.size
        )));
    }

    let mut stmt = tx.prepare_cached(sql!(
        "
        INSERT INTO space_reservation(
            id, link_group_id, vo_group, vo_role, retention_policy, access_latency,
            size_bytes, creation_time, lifetime, description, state,
            used_size_bytes, allocated_size_bytes)
        VALUES (
            :id, :link_group, :vo_group, :vo_role, :retention_policy, :access_latency,
            :size, :now, :lifetime, :description, 'RESERVED', 0, 0)
        "
    ))?;
    stmt.execute(named_params! {
        ":id": token,
        ":link_group": new.link_group,
        ":vo_group": new.owner.group,
        ":vo_role": new.owner.role,
        ":retention_policy": new.retention_policy,
        ":access_latency": new.access_latency,
        ":size": Unsigned(new.size),
        ":now": now,
        ":lifetime": new.lifetime,
        ":description": new.description,
    })?;
    adjust_link_group(tx, new.link_group, 0, signed(new.size)?)?;

    debug!(space = %token, link_group = %lg.name, size = new.size, "created space reservation");
    lock_space(tx, token)
}

/// Changes to apply to a reservation; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct SpaceUpdate {
    /// New size in bytes.
    pub size: Option<u64>,
    /// New lifetime, counted from the creation time.
    pub lifetime: Option<Lifetime>,
    /// New description.
    pub description: Option<String>,
    /// New owner.
    pub owner: Option<VoOwner>,
    /// New retention policy.
    pub retention_policy: Option<RetentionPolicy>,
    /// New access latency.
    pub access_latency: Option<AccessLatency>,
    /// New state.
    pub state: Option<SpaceState>,
}

impl SpaceUpdate {
    /// Return true if applying this update changes nothing about `space`.
    pub(crate) fn is_noop_for(&self, space: &Space) -> bool {
        self.size.is_none_or(|s| s == space.size)
            && self.lifetime.is_none_or(|l| l == space.lifetime)
            && self
                .description
                .as_ref()
                .is_none_or(|d| space.description.as_ref() == Some(d))
            && self.owner.as_ref().is_none_or(|o| {
                o.group == space.vo_group && o.role == space.vo_role
            })
            && self
                .retention_policy
                .is_none_or(|p| p == space.retention_policy)
            && self.access_latency.is_none_or(|l| l == space.access_latency)
            && self.state.is_none_or(|s| s == space.state)
    }
}

/// Apply `update` to `space`.
///
/// A terminal reservation cannot be changed at all.  A resize may not go
/// below the bytes in use or allocated, and growing needs the difference to
/// be available in the link group.  Entering a terminal state hands the
/// unused bytes back to the link group.
pub(crate) fn update_space(
    tx: &Transaction<'_>,
    space: &mut Space,
    update: &SpaceUpdate,
) -> Result<(), Error> {
    if space.state.is_final() {
        if update.is_noop_for(space) {
            return Ok(());
        }
        return Err(Error::InvalidStateTransition(format!(
            "space reservation {} is {} and can no longer change",
            space.id, space.state
        )));
    }

    if let Some(size) = update.size {
        resize_space(tx, space, size)?;
    }
    if let Some(lifetime) = update.lifetime {
        space.lifetime = lifetime;
    }
    if let Some(description) = &update.description {
        space.description = Some(description.clone());
    }
    if let Some(owner) = &update.owner {
        space.vo_group = owner.group.clone();
        space.vo_role = owner.role.clone();
    }
    if let Some(policy) = update.retention_policy {
        space.retention_policy = policy;
    }
    if let Some(latency) = update.access_latency {
        space.access_latency = latency;
    }
    if let Some(state) = update.state {
        if state != space.state {
            // Only RESERVED reaches here, and every other state is final.
            let unused = signed(space.size)? - signed(space.used)?;
            adjust_link_group(tx, space.link_group_id, 0, -unused)?;
            space.state = state;
            debug!(space = %space.id, %state, "space reservation left RESERVED");
        }
    }
    store_space(tx, space)
}

/// Change the size of the non-final reservation `space` to `size`.
fn resize_space(tx: &Transaction<'_>, space: &mut Space, size: u64) -> Result<(), Error> {
    if size == space.size {
        return Ok(());
    }
    let floor = space.used.saturating_add(space.allocated);
    if size < floor {
        return Err(Error::InvalidStateTransition(format!(
            "cannot shrink space reservation {} to {} bytes: {} bytes are used or allocated",
            space.id, size, floor
        )));
    }
    let delta = signed(size)? - signed(space.size)?;
    if delta > 0 {
        let lg = lock_link_group(tx, space.link_group_id)?;
        if lg.available_space() < i128::from(delta) {
            return Err(Error::NoFreeSpace(format!(
                "link group {} has {} bytes available, {} more requested",
                lg.name,
                lg.available_space(),
                delta
            )));
        }
    }
    adjust_link_group(tx, space.link_group_id, 0, delta)?;
    space.size = size;
    Ok(())
}

/// A request to place a file in a reservation.
#[derive(Debug, Clone)]
pub(crate) struct NewFile<'a> {
    /// Owner of the file.
    pub(crate) owner: &'a VoOwner,
    /// Size in bytes.
    pub(crate) size: u64,
    /// Lifetime of the transient states.
    pub(crate) lifetime: Lifetime,
    /// Namespace path.
    pub(crate) path: Option<&'a str>,
    /// Namespace identity, if already known.
    pub(crate) pnfs_id: Option<&'a str>,
    /// Initial state.
    pub(crate) state: FileState,
}

/// Place file `id` in `space`.
///
/// Fails if the reservation is terminal or past its lifetime, if another
/// transient file with the same path is already placed there, or if the
/// reservation has less than `size` bytes available.
pub(crate) fn insert_file(
    tx: &Transaction<'_>,
    id: FileId,
    space: &mut Space,
    new: &NewFile<'_>,
    now: Timestamp,
) -> Result<SpaceFile, Error> {
    space.ensure_usable(now)?;
    if let Some(path) = new.path {
        if !transient_files_by_path(tx, Some(space.id), path)?.is_empty() {
            return Err(Error::Duplicate {
                token: space.id,
                path: path.to_owned(),
            });
        }
    }
    if new.size > space.available() {
        return Err(Error::NoFreeSpace(format!(
            "space reservation {} has {} bytes available, {} requested",
            space.id,
            space.available(),
            new.size
        )));
    }

    let size = signed(new.size)?;
    match new.state {
        FileState::Reserved | FileState::Transferring => adjust_allocated(space, size)?,
        FileState::Stored => {
            adjust_used(tx, space, size)?;
            adjust_link_group(tx, space.link_group_id, -size, 0)?;
        }
        FileState::Flushed => {
            return Err(Error::InvalidArgument(
                "a file cannot be placed in FLUSHED state".into(),
            ))
        }
    }
    store_space(tx, space)?;

    let mut stmt = tx.prepare_cached(sql!(
        "
        INSERT INTO space_file(
            id, space_reservation_id, vo_group, vo_role, size_bytes, creation_time,
            lifetime, pnfs_path, pnfs_id, state, deleted)
        VALUES (
            :id, :space, :vo_group, :vo_role, :size, :now,
            :lifetime, :path, :pnfs_id, :state, 0)
        "
    ))?;
    stmt.execute(named_params! {
        ":id": id,
        ":space": space.id,
        ":vo_group": new.owner.group,
        ":vo_role": new.owner.role,
        ":size": Unsigned(new.size),
        ":now": now,
        ":lifetime": new.lifetime,
        ":path": new.path,
        ":pnfs_id": new.pnfs_id,
        ":state": new.state,
    })?;

    debug!(file = %id, space = %space.id, size = new.size, state = %new.state, "placed file");
    lock_file(tx, id)
}

/// Move `file` (placed in `space`) to `state` with size `size`.
///
/// If the new size does not fit into what the reservation has available,
/// the reservation is grown to fit first.
pub(crate) fn update_file(
    tx: &Transaction<'_>,
    space: &mut Space,
    file: &mut SpaceFile,
    state: FileState,
    size: u64,
) -> Result<(), Error> {
    if !file.state.can_become(state) {
        return Err(Error::InvalidStateTransition(format!(
            "file {} cannot go from {} to {}",
            file.id, file.state, state
        )));
    }

    let old_size = signed(file.size)?;
    let new_size = signed(size)?;
    let growth = new_size - old_size;
    if growth > 0 && state != FileState::Flushed && !space.state.is_final() {
        let shortfall = growth - signed(space.available())?;
        if shortfall > 0 {
            let target = offset(space.size, shortfall, "space size")?;
            resize_space(tx, space, target)?;
        }
    }

    use FileState::*;
    match (file.state, state) {
        (Stored, Stored) => {
            adjust_used(tx, space, growth)?;
            adjust_link_group(tx, space.link_group_id, -growth, 0)?;
        }
        (Flushed, Flushed) => {}
        (from, to) if from.is_transient() && to.is_transient() => adjust_allocated(space, growth)?,
        (from, Stored) if from.is_transient() => {
            adjust_allocated(space, -old_size)?;
            adjust_used(tx, space, new_size)?;
            adjust_link_group(tx, space.link_group_id, -new_size, 0)?;
        }
        (from, Flushed) if from.is_transient() => adjust_allocated(space, -old_size)?,
        (Stored, Flushed) => {
            adjust_used(tx, space, -old_size)?;
            adjust_link_group(tx, space.link_group_id, new_size, 0)?;
        }
        (from, to) => {
            return Err(Error::Bug(format!(
                "unhandled file transition {} -> {}",
                from, to
            )))
        }
    }
    if space.used.saturating_add(space.allocated) > space.size {
        return Err(Error::NoFreeSpace(format!(
            "space reservation {} cannot hold file {}",
            space.id, file.id
        )));
    }

    trace!(file = %file.id, from = %file.state, to = %state, size, "file transition");
    file.state = state;
    file.size = size;
    store_space(tx, space)?;
    store_file(tx, file)
}

/// Change bookkeeping-neutral attributes of `file`.
pub(crate) fn store_file_attributes(tx: &Transaction<'_>, file: &SpaceFile) -> Result<(), Error> {
    store_file(tx, file)
}

/// Delete `file` from `space`, returning its bytes.
pub(crate) fn remove_file(
    tx: &Transaction<'_>,
    space: &mut Space,
    file: &SpaceFile,
) -> Result<(), Error> {
    let size = signed(file.size)?;
    match file.state {
        FileState::Reserved | FileState::Transferring => adjust_allocated(space, -size)?,
        FileState::Stored => {
            adjust_used(tx, space, -size)?;
            adjust_link_group(tx, space.link_group_id, size, 0)?;
        }
        FileState::Flushed => {}
    }
    store_space(tx, space)?;
    let mut stmt = tx.prepare_cached(sql!("DELETE FROM space_file WHERE id = :id"))?;
    stmt.execute(named_params! { ":id": file.id })?;
    debug!(file = %file.id, space = %space.id, state = %file.state, "removed file");
    Ok(())
}

/// Return the files of reservation `token`.
pub(crate) fn files_in_space(
    tx: &Transaction<'_>,
    token: SpaceToken,
) -> Result<Vec<SpaceFile>, Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "SELECT * FROM space_file WHERE space_reservation_id = :space ORDER BY id"
    ))?;
    let files = stmt
        .query_map(named_params! { ":space": token }, file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

/// Delete reservation `space`.
///
/// Files still placed in it are refused unless `force` is set, in which case
/// they are removed first.  A RESERVED reservation hands its unused bytes
/// back to the link group.
pub(crate) fn delete_space(tx: &Transaction<'_>, mut space: Space, force: bool) -> Result<(), Error> {
    let files = files_in_space(tx, space.id)?;
    if !files.is_empty() && !force {
        return Err(Error::InvalidStateTransition(format!(
            "space reservation {} still holds {} files",
            space.id,
            files.len()
        )));
    }
    for file in &files {
        remove_file(tx, &mut space, file)?;
    }
    if space.state == SpaceState::Reserved {
        let unused = signed(space.size)? - signed(space.used)?;
        adjust_link_group(tx, space.link_group_id, 0, -unused)?;
    }
    let mut stmt = tx.prepare_cached(sql!("DELETE FROM space_reservation WHERE id = :id"))?;
    stmt.execute(named_params! { ":id": space.id })?;
    debug!(space = %space.id, "deleted space reservation");
    Ok(())
}

/// Recompute the reserved bytes of every link group from its RESERVED
/// reservations.  Returns the number of link groups whose counter changed.
pub(crate) fn recompute_reserved_space(tx: &Transaction<'_>) -> Result<usize, Error> {
    let changed = tx.execute(
        sql!(
            "
            UPDATE link_group
            SET reserved_space_bytes = (
                SELECT COALESCE(SUM(s.size_bytes - s.used_size_bytes), 0)
                FROM space_reservation s
                WHERE s.link_group_id = link_group.id AND s.state = 'RESERVED')
            WHERE reserved_space_bytes != (
                SELECT COALESCE(SUM(s.size_bytes - s.used_size_bytes), 0)
                FROM space_reservation s
                WHERE s.link_group_id = link_group.id AND s.state = 'RESERVED')
            "
        ),
        params![],
    )?;
    Ok(changed)
}

/// Recompute the used and allocated bytes of every reservation from its
/// files, moving link group counters as if the difference had been applied
/// as a regular change.  Returns the number of reservations changed.
pub(crate) fn recompute_space_usage(tx: &Transaction<'_>) -> Result<usize, Error> {
    let mut stmt = tx.prepare(sql!(
        "
        SELECT s.id,
            COALESCE((SELECT SUM(f.size_bytes) FROM space_file f
                      WHERE f.space_reservation_id = s.id AND f.state = 'STORED'), 0) AS used,
            COALESCE((SELECT SUM(f.size_bytes) FROM space_file f
                      WHERE f.space_reservation_id = s.id
                        AND f.state IN ('RESERVED', 'TRANSFERRING')), 0) AS allocated
        FROM space_reservation s
        WHERE s.used_size_bytes != used OR s.allocated_size_bytes != allocated
        "
    ))?;
    let drift = stmt
        .query_map(params![], |row| {
            Ok((
                row.get::<_, SpaceToken>("id")?,
                row.get::<_, Unsigned>("used")?.0,
                row.get::<_, Unsigned>("allocated")?.0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (token, used, allocated) in &drift {
        let mut space = lock_space(tx, *token)?;
        let delta = signed(*used)? - signed(space.used)?;
        adjust_used(tx, &mut space, delta)?;
        space.allocated = *allocated;
        store_space(tx, &space)?;
        debug!(space = %token, used, allocated, "recomputed space usage");
    }
    Ok(drift.len())
}

#[cfg(test)]
pub(crate) mod test {
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
    use std::time::Duration;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::database::{open, rw_tx, DbPool};

    /// Create a database with one link group `lg` of `free` bytes.
    pub(crate) fn setup(free: u64) -> (TempDir, DbPool, LinkGroupId) {
        let dir = tempdir().unwrap();
        let pool = open(dir.path().join("db"), Duration::from_secs(1)).unwrap();
        let id = LinkGroupId::new(1_000_000);
        rw_tx(&pool, |tx| {
            tx.execute(
                sql!(
                    "
                    INSERT INTO link_group(
                        id, name, free_space_bytes, reserved_space_bytes, last_update_time,
                        online_allowed, nearline_allowed, replica_allowed, output_allowed,
                        custodial_allowed)
                    VALUES (?1, 'lg', ?2, 0, 0, 1, 1, 1, 1, 1)
                    "
                ),
                params![id, Unsigned(free)],
            )?;
            Ok::<_, Error>(())
        })
        .unwrap();
        (dir, pool, id)
    }

    fn link_group(pool: &DbPool, id: LinkGroupId) -> LinkGroup {
        rw_tx(pool, |tx| lock_link_group(tx, id)).unwrap()
    }

    fn new_space(pool: &DbPool, lg: LinkGroupId, token: u64, size: u64) -> Result<Space, Error> {
        let owner = VoOwner::default();
        rw_tx(pool, |tx| {
            insert_space(
                tx,
                SpaceToken::new(token),
                &NewSpace {
                    link_group: lg,
                    owner: &owner,
                    retention_policy: RetentionPolicy::Replica,
                    access_latency: AccessLatency::Online,
                    size,
                    lifetime: Lifetime::Infinite,
                    description: None,
                },
                Timestamp::from_millis(0),
            )
        })
    }

    fn new_file(
        pool: &DbPool,
        token: u64,
        id: u64,
        size: u64,
        state: FileState,
    ) -> Result<SpaceFile, Error> {
        let owner = VoOwner::default();
        rw_tx(pool, |tx| {
            let mut space = lock_space(tx, SpaceToken::new(token))?;
            insert_file(
                tx,
                FileId::new(id),
                &mut space,
                &NewFile {
                    owner: &owner,
                    size,
                    lifetime: Lifetime::Infinite,
                    path: Some("/data/f"),
                    pnfs_id: None,
                    state,
                },
                Timestamp::from_millis(0),
            )
        })
    }

    fn transition(pool: &DbPool, id: u64, state: FileState, size: u64) -> Result<(), Error> {
        rw_tx(pool, |tx| {
            let mut file = lock_file(tx, FileId::new(id))?;
            let mut space = lock_space(tx, file.space_id)?;
            update_file(tx, &mut space, &mut file, state, size)
        })
    }

    fn space(pool: &DbPool, token: u64) -> Space {
        rw_tx(pool, |tx| lock_space(tx, SpaceToken::new(token))).unwrap()
    }

    #[test]
    fn reserve_moves_size_into_link_group() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 600).unwrap();
        assert_eq!(link_group(&pool, lg).reserved_space, 600);

        let e = new_space(&pool, lg, 2, 401).unwrap_err();
        assert!(matches!(e, Error::NoFreeSpace(_)));
        assert_eq!(link_group(&pool, lg).reserved_space, 600);

        new_space(&pool, lg, 2, 400).unwrap();
        assert_eq!(link_group(&pool, lg).reserved_space, 1000);
    }

    #[test]
    fn file_lifecycle() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 1000).unwrap();

        new_file(&pool, 1, 10, 500, FileState::Reserved).unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.used, s.allocated), (0, 500));
        // Allocation does not touch the link group.
        assert_eq!(link_group(&pool, lg).reserved_space, 1000);

        transition(&pool, 10, FileState::Transferring, 500).unwrap();
        transition(&pool, 10, FileState::Stored, 500).unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.used, s.allocated), (500, 0));
        let g = link_group(&pool, lg);
        assert_eq!((g.free_space, g.reserved_space), (500, 500));

        rw_tx(&pool, |tx| {
            let file = lock_file(tx, FileId::new(10))?;
            let mut space = lock_space(tx, file.space_id)?;
            remove_file(tx, &mut space, &file)
        })
        .unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.used, s.allocated), (0, 0));
        let g = link_group(&pool, lg);
        assert_eq!((g.free_space, g.reserved_space), (1000, 1000));
    }

    #[test]
    fn flush_returns_bytes() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 1000).unwrap();
        new_file(&pool, 1, 10, 300, FileState::Stored).unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.used, s.allocated), (300, 0));
        let g = link_group(&pool, lg);
        assert_eq!((g.free_space, g.reserved_space), (700, 700));

        transition(&pool, 10, FileState::Flushed, 300).unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.used, s.allocated), (0, 0));
        let g = link_group(&pool, lg);
        assert_eq!((g.free_space, g.reserved_space), (1000, 1000));

        let e = transition(&pool, 10, FileState::Stored, 300).unwrap_err();
        assert!(matches!(e, Error::InvalidStateTransition(_)));
    }

    #[test]
    fn transient_flush_and_retry() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 1000).unwrap();
        new_file(&pool, 1, 10, 300, FileState::Transferring).unwrap();
        transition(&pool, 10, FileState::Reserved, 300).unwrap();
        assert_eq!(space(&pool, 1).allocated, 300);
        transition(&pool, 10, FileState::Flushed, 300).unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.used, s.allocated), (0, 0));
        assert_eq!(link_group(&pool, lg).free_space, 1000);
    }

    #[test]
    fn use_checks_capacity_and_duplicates() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 100).unwrap();
        let e = new_file(&pool, 1, 10, 101, FileState::Reserved).unwrap_err();
        assert!(matches!(e, Error::NoFreeSpace(_)));
        new_file(&pool, 1, 10, 60, FileState::Reserved).unwrap();
        let e = new_file(&pool, 1, 11, 10, FileState::Reserved).unwrap_err();
        assert!(matches!(e, Error::Duplicate { .. }));
    }

    #[test]
    fn stored_file_grows_its_space() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 100).unwrap();
        new_file(&pool, 1, 10, 100, FileState::Transferring).unwrap();
        transition(&pool, 10, FileState::Stored, 150).unwrap();
        let s = space(&pool, 1);
        assert_eq!((s.size, s.used, s.allocated), (150, 150, 0));
        let g = link_group(&pool, lg);
        // reserved = size - used of the single RESERVED space.
        assert_eq!((g.free_space, g.reserved_space), (850, 0));
    }

    #[test]
    fn update_rules() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 500).unwrap();
        new_file(&pool, 1, 10, 200, FileState::Stored).unwrap();
        // The stored file with the same path does not block a new one.
        new_file(&pool, 1, 11, 100, FileState::Reserved).unwrap();

        let update = |size: u64| {
            rw_tx(&pool, |tx| {
                let mut s = lock_space(tx, SpaceToken::new(1))?;
                update_space(
                    tx,
                    &mut s,
                    &SpaceUpdate {
                        size: Some(size),
                        ..Default::default()
                    },
                )
            })
        };
        // Floor is used + allocated.
        assert!(matches!(update(299), Err(Error::InvalidStateTransition(_))));
        update(300).unwrap();
        // free 800, reserved 300 - 200 = 100: 700 more is the ceiling.
        assert_eq!(link_group(&pool, lg).reserved_space, 100);
        assert!(matches!(update(1001), Err(Error::NoFreeSpace(_))));
        update(1000).unwrap();
        assert_eq!(link_group(&pool, lg).reserved_space, 800);

        // Releasing hands back size - used.
        rw_tx(&pool, |tx| {
            let mut s = lock_space(tx, SpaceToken::new(1))?;
            update_space(
                tx,
                &mut s,
                &SpaceUpdate {
                    state: Some(SpaceState::Released),
                    ..Default::default()
                },
            )
        })
        .unwrap();
        assert_eq!(link_group(&pool, lg).reserved_space, 0);
        assert!(matches!(update(900), Err(Error::InvalidStateTransition(_))));
        assert_eq!(link_group(&pool, lg).reserved_space, 0);
    }

    #[test]
    fn recompute() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 500).unwrap();
        new_file(&pool, 1, 10, 200, FileState::Stored).unwrap();
        rw_tx(&pool, |tx| {
            tx.execute_batch(
                "UPDATE link_group SET reserved_space_bytes = 7;
                 UPDATE space_reservation SET allocated_size_bytes = 50;",
            )?;
            Ok::<_, Error>(())
        })
        .unwrap();

        assert_eq!(rw_tx(&pool, |tx| recompute_space_usage(tx)).unwrap(), 1);
        assert_eq!(space(&pool, 1).allocated, 0);
        assert_eq!(rw_tx(&pool, |tx| recompute_reserved_space(tx)).unwrap(), 1);
        assert_eq!(link_group(&pool, lg).reserved_space, 300);
        assert_eq!(rw_tx(&pool, |tx| recompute_reserved_space(tx)).unwrap(), 0);
    }

    #[test]
    fn delete_refuses_live_files() {
        let (_dir, pool, lg) = setup(1000);
        new_space(&pool, lg, 1, 500).unwrap();
        new_file(&pool, 1, 10, 200, FileState::Stored).unwrap();
        let e = rw_tx(&pool, |tx| {
            let s = lock_space(tx, SpaceToken::new(1))?;
            delete_space(tx, s, false)
        })
        .unwrap_err();
        assert!(matches!(e, Error::InvalidStateTransition(_)));

        rw_tx(&pool, |tx| {
            let s = lock_space(tx, SpaceToken::new(1))?;
            delete_space(tx, s, true)
        })
        .unwrap();
        let g = link_group(&pool, lg);
        assert_eq!((g.free_space, g.reserved_space), (1000, 0));
    }
}
