//! The space manager: reservations, file placement, transfer events and
//! administration, on top of a shared database.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rusqlite::{named_params, params, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::accounting::{
    self, delete_space, files_by_pnfs_id, files_in_space, find_link_group_by_name, find_space,
    insert_file, insert_space, lock_file, lock_space, remove_file, store_file_attributes,
    transient_files_by_path, update_file, update_space, NewFile, NewSpace,
};
use crate::auth::{check_release, check_reserve, Subject, VoOwner};
use crate::config::SpaceManagerConfig;
use crate::database::{
    link_group_from_row, load_vo_rules, open, read_tx, rw_tx, space_from_row, sql, DbPool,
};
use crate::err::Error;
use crate::placement::{candidates, PlacementRequest};
use crate::token::{TokenAllocator, STEP};
use crate::types::{
    AccessLatency, FileId, FileState, Lifetime, LinkGroup, RetentionPolicy, Space, SpaceFile,
    SpaceState, SpaceToken, Timestamp,
};

pub use crate::accounting::SpaceUpdate;

/// The source of "now" for lifetime decisions.
type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// A request to reserve space in whichever link group fits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct ReserveRequest {
    /// Who asks.
    pub subject: Subject,
    /// Size in bytes.
    pub size: u64,
    /// Access latency; the configured default if absent.
    #[serde(default)]
    pub access_latency: Option<AccessLatency>,
    /// Retention policy; the configured default if absent.
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
    /// Lifetime of the reservation.
    pub lifetime: Lifetime,
    /// Free-form description, usable to look the reservation up later.
    #[serde(default)]
    pub description: Option<String>,
}

/// A reservation made by an administrator in a named link group.
///
/// No authorization check is made; the owner is recorded as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct AdminReserveRequest {
    /// Name of the link group.
    pub link_group: String,
    /// Owner to record.
    #[serde(default)]
    pub owner: VoOwner,
    /// Size in bytes.
    pub size: u64,
    /// Access latency; the configured default if absent.
    #[serde(default)]
    pub access_latency: Option<AccessLatency>,
    /// Retention policy; the configured default if absent.
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
    /// Lifetime of the reservation.
    pub lifetime: Lifetime,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A request to place a file in an existing reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct UseRequest {
    /// The reservation.
    pub token: SpaceToken,
    /// VO group and role of the writer.
    #[serde(default)]
    pub owner: VoOwner,
    /// Expected size of the file.
    pub size: u64,
    /// How long the file may stay transient; capped to what is left of the
    /// reservation's lifetime.
    pub lifetime: Lifetime,
    /// Namespace path.
    pub path: String,
    /// Namespace identity, if already known.
    #[serde(default)]
    pub pnfs_id: Option<String>,
}

/// A write that arrived without a reservation, for which one is created on
/// the fly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct ReserveAndUseRequest {
    /// Who writes.
    pub subject: Subject,
    /// Expected size of the file; also the size of the reservation.
    pub size: u64,
    /// Namespace path.
    pub path: String,
    /// Namespace identity, if already known.
    #[serde(default)]
    pub pnfs_id: Option<String>,
    /// Access latency; the configured default if absent.
    #[serde(default)]
    pub access_latency: Option<AccessLatency>,
    /// Retention policy; the configured default if absent.
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
}

/// How to look up space tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(clippy::exhaustive_enums)]
pub enum SpaceTokenQuery {
    /// RESERVED reservations the subject owns.
    Owner(Subject),
    /// RESERVED reservations with exactly this description.
    Description(String),
}

/// How to find the files whose reservations are wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(clippy::exhaustive_enums)]
pub enum FileQuery {
    /// By namespace identity.
    PnfsId(String),
    /// By namespace path.
    Path(String),
}

/// Criteria for listing reservations; every field left `None` matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct SpaceFilter {
    /// Only reservations in this state.
    pub state: Option<SpaceState>,
    /// Only reservations in the link group of this name.
    pub link_group: Option<String>,
    /// Only reservations owned by this group.
    pub vo_group: Option<String>,
    /// Only reservations owned by this role.
    pub vo_role: Option<String>,
    /// Only reservations with this description.
    pub description: Option<String>,
    /// At most this many results.
    pub limit: Option<usize>,
}

/// Criteria for listing reservations that are no longer usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct InvalidSpaceQuery {
    /// Include EXPIRED reservations.
    pub expired: bool,
    /// Include RELEASED reservations.
    pub released: bool,
    /// At most this many results, newest first.
    pub limit: usize,
}

impl Default for InvalidSpaceQuery {
    fn default() -> Self {
        InvalidSpaceQuery {
            expired: true,
            released: true,
            limit: 1000,
        }
    }
}

/// Which expired files to remove from a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct RemoveFilesQuery {
    /// The reservation.
    pub token: SpaceToken,
    /// Only files in these states; RESERVED and TRANSFERRING if empty.
    #[serde(default)]
    pub states: Vec<FileState>,
}

/// Owns the database and enforces the capacity rules on every change.
///
/// All operations are synchronous and may block on the database lock for up
/// to the configured busy timeout; call them from a blocking context.
pub struct SpaceManager {
    /// The database.
    pool: DbPool,
    /// Configuration.
    config: SpaceManagerConfig,
    /// Where new tokens and ids come from.
    tokens: TokenAllocator,
    /// When the last complete refresher pass started, in milliseconds.
    ///
    /// Link groups not updated since then are not offered for new
    /// reservations.
    last_refresh: AtomicI64,
    /// Returns the current time.
    clock: Clock,
}

impl fmt::Debug for SpaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceManager")
            .field("config", &self.config)
            .field("last_refresh", &self.watermark())
            .finish_non_exhaustive()
    }
}

impl SpaceManager {
    /// Open (or create) the database at `path` and construct a manager on it.
    pub fn open<P: AsRef<Path>>(path: P, config: SpaceManagerConfig) -> Result<Self, Error> {
        Self::open_with_clock(path, config, Timestamp::now)
    }

    /// Like [`SpaceManager::open`], but reading the time from `clock`.
    pub fn open_with_clock<P, C>(path: P, config: SpaceManagerConfig, clock: C) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        C: Fn() -> Timestamp + Send + Sync + 'static,
    {
        let pool = open(path, config.busy_timeout())?;
        let tokens = TokenAllocator::new(STEP, config.token_claim_attempts());
        let clock: Clock = Arc::new(clock);
        let started = clock();
        Ok(SpaceManager {
            pool,
            config,
            tokens,
            last_refresh: AtomicI64::new(started.as_millis()),
            clock,
        })
    }

    /// Return the configuration.
    pub fn config(&self) -> &SpaceManagerConfig {
        &self.config
    }

    /// Return the current time according to this manager's clock.
    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    /// Return the start time of the last complete refresher pass.
    pub fn watermark(&self) -> Timestamp {
        Timestamp::from_millis(self.last_refresh.load(Ordering::Acquire))
    }

    /// Record that a refresher pass started at `t` has completed.  The
    /// watermark never moves backwards.
    pub(crate) fn advance_watermark(&self, t: Timestamp) {
        self.last_refresh.fetch_max(t.as_millis(), Ordering::AcqRel);
    }

    /// Return the database.
    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Return a fresh identifier.  Must not be called inside a write
    /// transaction.
    pub(crate) fn next_id(&self) -> Result<u64, Error> {
        self.tokens.next_token(&self.pool)
    }

    /// Fail if the space manager is switched off.
    pub(crate) fn ensure_enabled(&self) -> Result<(), Error> {
        if self.config.enabled() {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    /// Pick a link group for `req` and create reservation `token` in it.
    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        tx: &Transaction<'_>,
        token: SpaceToken,
        subject: &Subject,
        placement: &PlacementRequest,
        lifetime: Lifetime,
        description: Option<&str>,
        now: Timestamp,
    ) -> Result<Space, Error> {
        let groups = candidates(tx, placement, self.watermark())?;
        if groups.is_empty() {
            return Err(Error::NoFreeSpace(format!(
                "no link group can hold {} bytes of {}/{}",
                placement.size, placement.retention_policy, placement.access_latency
            )));
        }
        for lg in &groups {
            match check_reserve(subject, &lg.vo_rules) {
                Ok(owner) => {
                    return insert_space(
                        tx,
                        token,
                        &NewSpace {
                            link_group: lg.id,
                            owner: &owner,
                            retention_policy: placement.retention_policy,
                            access_latency: placement.access_latency,
                            size: placement.size,
                            lifetime,
                            description,
                        },
                        now,
                    );
                }
                Err(e) => trace!(link_group = %lg.name, error = %e, "skipping link group"),
            }
        }
        Err(Error::Authorization(format!(
            "{} may not reserve in any of the {} link groups that fit",
            subject,
            groups.len()
        )))
    }

    /// Reserve space for `req.subject` and return the new token.
    pub fn reserve(&self, req: &ReserveRequest) -> Result<SpaceToken, Error> {
        self.ensure_enabled()?;
        let placement = PlacementRequest {
            size: req.size,
            access_latency: req
                .access_latency
                .unwrap_or(self.config.default_access_latency()),
            retention_policy: req
                .retention_policy
                .unwrap_or(self.config.default_retention_policy()),
        };
        let token = SpaceToken::new(self.next_id()?);
        let now = self.now();
        let space = rw_tx(&self.pool, |tx| {
            self.place(
                tx,
                token,
                &req.subject,
                &placement,
                req.lifetime,
                req.description.as_deref(),
                now,
            )
        })?;
        info!(
            space = %space.id,
            subject = %req.subject,
            size = space.size,
            lifetime = %space.lifetime,
            "reserved space"
        );
        Ok(space.id)
    }

    /// Reserve space in a named link group without checking authorization.
    pub fn admin_reserve(&self, req: &AdminReserveRequest) -> Result<SpaceToken, Error> {
        self.ensure_enabled()?;
        let access_latency = req
            .access_latency
            .unwrap_or(self.config.default_access_latency());
        let retention_policy = req
            .retention_policy
            .unwrap_or(self.config.default_retention_policy());
        let token = SpaceToken::new(self.next_id()?);
        let now = self.now();
        rw_tx(&self.pool, |tx| {
            let lg = find_link_group_by_name(tx, &req.link_group)?
                .ok_or_else(|| Error::no_such_link_group(&req.link_group))?;
            if !lg.flags.allows(access_latency, retention_policy) {
                return Err(Error::InvalidArgument(format!(
                    "link group {} does not accept {}/{}",
                    lg.name, retention_policy, access_latency
                )));
            }
            insert_space(
                tx,
                token,
                &NewSpace {
                    link_group: lg.id,
                    owner: &req.owner,
                    retention_policy,
                    access_latency,
                    size: req.size,
                    lifetime: req.lifetime,
                    description: req.description.as_deref(),
                },
                now,
            )
        })?;
        info!(space = %token, link_group = %req.link_group, size = req.size, "reserved space by administrator");
        Ok(token)
    }

    /// Place a file in an existing reservation and return its id.
    pub fn use_space(&self, req: &UseRequest) -> Result<FileId, Error> {
        self.ensure_enabled()?;
        if req.path.is_empty() {
            return Err(Error::InvalidArgument("empty path".into()));
        }
        let id = FileId::new(self.next_id()?);
        let now = self.now();
        rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, req.token)?;
            if self.config.match_vo_group_and_role() {
                let group_ok = space.vo_group.is_none() || space.vo_group == req.owner.group;
                let role_ok = space.vo_role.is_none() || space.vo_role == req.owner.role;
                if !(group_ok && role_ok) {
                    return Err(Error::Authorization(format!(
                        "space reservation {} does not belong to {:?}/{:?}",
                        space.id, req.owner.group, req.owner.role
                    )));
                }
            }
            let lifetime = match (req.lifetime, space.remaining_lifetime(now)) {
                (Lifetime::Finite(want), Some(left)) => Lifetime::Finite(want.min(left)),
                (Lifetime::Infinite, Some(left)) => Lifetime::Finite(left),
                (lifetime, None) => lifetime,
            };
            insert_file(
                tx,
                id,
                &mut space,
                &NewFile {
                    owner: &req.owner,
                    size: req.size,
                    lifetime,
                    path: Some(req.path.as_str()),
                    pnfs_id: req.pnfs_id.as_deref(),
                    state: FileState::Reserved,
                },
                now,
            )
        })?;
        debug!(file = %id, space = %req.token, path = %req.path, size = req.size, "placed file");
        Ok(id)
    }

    /// Create an implicit reservation sized for one file and place the file
    /// in it.
    pub fn reserve_and_use(&self, req: &ReserveAndUseRequest) -> Result<(SpaceToken, FileId), Error> {
        self.ensure_enabled()?;
        if !self.config.reserve_space_for_non_srm_transfers() {
            return Err(Error::Disabled);
        }
        let placement = PlacementRequest {
            size: req.size,
            access_latency: req
                .access_latency
                .unwrap_or(self.config.default_access_latency()),
            retention_policy: req
                .retention_policy
                .unwrap_or(self.config.default_retention_policy()),
        };
        let lifetime = Lifetime::Finite(self.config.implicit_reservation_lifetime());
        let token = SpaceToken::new(self.next_id()?);
        let id = FileId::new(self.next_id()?);
        let now = self.now();
        rw_tx(&self.pool, |tx| {
            let mut space = self.place(tx, token, &req.subject, &placement, lifetime, None, now)?;
            let owner = VoOwner {
                group: space.vo_group.clone(),
                role: space.vo_role.clone(),
            };
            insert_file(
                tx,
                id,
                &mut space,
                &NewFile {
                    owner: &owner,
                    size: req.size,
                    lifetime,
                    path: Some(req.path.as_str()),
                    pnfs_id: req.pnfs_id.as_deref(),
                    state: FileState::Reserved,
                },
                now,
            )
        })?;
        info!(space = %token, file = %id, path = %req.path, "created implicit reservation");
        Ok((token, id))
    }

    /// Withdraw a file placement that has not completed.
    ///
    /// Only transient files with `path` are considered; a file that has
    /// already moved on is left alone.
    pub fn cancel_use(&self, token: SpaceToken, path: &str) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, token)?;
            let files = transient_files_by_path(tx, Some(token), path)?;
            match files.as_slice() {
                [] => debug!(space = %token, path, "no transient file to cancel"),
                [file] => remove_file(tx, &mut space, file)?,
                _ => warn!(
                    space = %token,
                    path,
                    count = files.len(),
                    "several transient files with the same path; leaving them to expire"
                ),
            }
            Ok(())
        })
    }

    /// Release a reservation, handing its unused bytes back to the link
    /// group.
    ///
    /// With `subject` set, the subject must own the reservation; `None` is
    /// an administrative release.
    pub fn release(&self, token: SpaceToken, subject: Option<&Subject>) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, token)?;
            if let Some(subject) = subject {
                check_release(subject, &space)?;
            }
            if space.state.is_final() {
                return Err(Error::InvalidStateTransition(format!(
                    "space reservation {} is already {}",
                    token, space.state
                )));
            }
            update_space(
                tx,
                &mut space,
                &SpaceUpdate {
                    state: Some(SpaceState::Released),
                    ..Default::default()
                },
            )
        })?;
        info!(space = %token, "released space reservation");
        Ok(())
    }

    /// Make sure a reservation lives at least `lifetime` longer from now.
    ///
    /// A lifetime that is already long enough (or infinite) is left alone.
    pub fn extend_lifetime(&self, token: SpaceToken, lifetime: Lifetime) -> Result<(), Error> {
        self.ensure_enabled()?;
        let now = self.now();
        rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, token)?;
            space.ensure_usable(now)?;
            let new = match (space.lifetime, lifetime) {
                (Lifetime::Infinite, _) => return Ok(()),
                (Lifetime::Finite(_), Lifetime::Infinite) => Lifetime::Infinite,
                (Lifetime::Finite(_), Lifetime::Finite(wanted)) => {
                    let left = space.remaining_lifetime(now).unwrap_or_default();
                    if wanted <= left {
                        return Ok(());
                    }
                    Lifetime::Finite(now.saturating_since(space.creation_time) + wanted)
                }
            };
            debug!(space = %token, from = %space.lifetime, to = %new, "extending lifetime");
            update_space(
                tx,
                &mut space,
                &SpaceUpdate {
                    lifetime: Some(new),
                    ..Default::default()
                },
            )
        })
    }

    /// Change a reservation and return it as stored afterwards.
    ///
    /// With `subject` set, the subject must own the reservation.
    pub fn update_reservation(
        &self,
        token: SpaceToken,
        update: &SpaceUpdate,
        subject: Option<&Subject>,
    ) -> Result<Space, Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, token)?;
            if let Some(subject) = subject {
                check_release(subject, &space)?;
            }
            update_space(tx, &mut space, update)?;
            Ok(space)
        })
    }

    /// Return one reservation.
    pub fn get_space(&self, token: SpaceToken) -> Result<Space, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| lock_space(tx, token))
    }

    /// Return the reservations for `tokens`, in the same order; unknown
    /// tokens yield `None`.
    pub fn get_space_metadata(&self, tokens: &[SpaceToken]) -> Result<Vec<Option<Space>>, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| {
            tokens.iter().map(|t| find_space(tx, *t)).collect()
        })
    }

    /// Return the tokens of the RESERVED reservations matching `query`.
    pub fn get_space_tokens(&self, query: &SpaceTokenQuery) -> Result<Vec<SpaceToken>, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| match query {
            SpaceTokenQuery::Description(description) => {
                let mut stmt = tx.prepare_cached(sql!(
                    "
                    SELECT id FROM space_reservation
                    WHERE state = 'RESERVED' AND description = :description
                    ORDER BY id
                    "
                ))?;
                let tokens = stmt
                    .query_map(named_params! { ":description": description }, |row| row.get(0))?
                    .collect::<Result<Vec<SpaceToken>, _>>()?;
                Ok(tokens)
            }
            SpaceTokenQuery::Owner(subject) => {
                let mut stmt = tx.prepare_cached(sql!(
                    "
                    SELECT * FROM space_reservation
                    WHERE state = 'RESERVED' AND vo_group IS NOT NULL
                    ORDER BY id
                    "
                ))?;
                let spaces = stmt
                    .query_map(params![], space_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(spaces
                    .into_iter()
                    .filter(|s| check_release(subject, s).is_ok())
                    .map(|s| s.id)
                    .collect())
            }
        })
    }

    /// Return the tokens of the reservations holding the files matching
    /// `query`.
    pub fn get_file_space_tokens(&self, query: &FileQuery) -> Result<Vec<SpaceToken>, Error> {
        self.ensure_enabled()?;
        let (pnfs_id, path) = match query {
            FileQuery::PnfsId(p) => (Some(p.as_str()), None),
            FileQuery::Path(p) => (None, Some(p.as_str())),
        };
        read_tx(&self.pool, |tx| {
            let mut stmt = tx.prepare_cached(sql!(
                "
                SELECT DISTINCT space_reservation_id FROM space_file
                WHERE (:pnfs_id IS NULL OR pnfs_id = :pnfs_id)
                  AND (:path IS NULL OR pnfs_path = :path)
                ORDER BY space_reservation_id
                "
            ))?;
            let tokens = stmt
                .query_map(named_params! { ":pnfs_id": pnfs_id, ":path": path }, |row| {
                    row.get(0)
                })?
                .collect::<Result<Vec<SpaceToken>, _>>()?;
            Ok(tokens)
        })
    }

    /// Return every link group, with its allow-list.
    pub fn list_link_groups(&self) -> Result<Vec<LinkGroup>, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| {
            let mut stmt = tx.prepare_cached(sql!("SELECT * FROM link_group ORDER BY name"))?;
            let mut groups = stmt
                .query_map(params![], link_group_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            for lg in &mut groups {
                load_vo_rules(tx, lg)?;
            }
            Ok(groups)
        })
    }

    /// Return the reservations matching `filter`, oldest token first.
    pub fn list_space_reservations(&self, filter: &SpaceFilter) -> Result<Vec<Space>, Error> {
        self.ensure_enabled()?;
        let limit = filter
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        read_tx(&self.pool, |tx| {
            let mut stmt = tx.prepare_cached(sql!(
                "
                SELECT s.* FROM space_reservation s
                JOIN link_group g ON g.id = s.link_group_id
                WHERE (:state IS NULL OR s.state = :state)
                  AND (:link_group IS NULL OR g.name = :link_group)
                  AND (:vo_group IS NULL OR s.vo_group = :vo_group)
                  AND (:vo_role IS NULL OR s.vo_role = :vo_role)
                  AND (:description IS NULL OR s.description = :description)
                ORDER BY s.id
                LIMIT :limit
                "
            ))?;
            let spaces = stmt
                .query_map(
                    named_params! {
                        ":state": filter.state,
                        ":link_group": filter.link_group,
                        ":vo_group": filter.vo_group,
                        ":vo_role": filter.vo_role,
                        ":description": filter.description,
                        ":limit": limit,
                    },
                    space_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(spaces)
        })
    }

    /// Return EXPIRED and/or RELEASED reservations, newest first.
    pub fn list_invalid_spaces(&self, query: &InvalidSpaceQuery) -> Result<Vec<Space>, Error> {
        self.ensure_enabled()?;
        let (expired, released) = if query.expired || query.released {
            (query.expired, query.released)
        } else {
            (true, true)
        };
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        read_tx(&self.pool, |tx| {
            let mut stmt = tx.prepare_cached(sql!(
                "
                SELECT * FROM space_reservation
                WHERE (:expired AND state = 'EXPIRED')
                   OR (:released AND state = 'RELEASED')
                ORDER BY creation_time DESC, id DESC
                LIMIT :limit
                "
            ))?;
            let spaces = stmt
                .query_map(
                    named_params! {
                        ":expired": expired,
                        ":released": released,
                        ":limit": limit,
                    },
                    space_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(spaces)
        })
    }

    /// Return the files placed in reservation `token`.
    pub fn list_files(&self, token: SpaceToken) -> Result<Vec<SpaceFile>, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| {
            lock_space(tx, token)?;
            files_in_space(tx, token)
        })
    }

    /// Return the file placements with namespace identity `pnfs_id`.
    pub fn files_with_pnfs_id(&self, pnfs_id: &str) -> Result<Vec<SpaceFile>, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| files_by_pnfs_id(tx, pnfs_id))
    }

    /// Return one file placement.
    pub fn get_file(&self, id: FileId) -> Result<SpaceFile, Error> {
        self.ensure_enabled()?;
        read_tx(&self.pool, |tx| lock_file(tx, id))
    }

    /// Apply `op` to every placement of `pnfs_id`, each with its reservation
    /// locked.  An unknown `pnfs_id` is not an error: most files are written
    /// without a reservation.
    fn for_each_placement<F>(&self, pnfs_id: &str, what: &'static str, mut op: F) -> Result<(), Error>
    where
        F: FnMut(&Transaction<'_>, &mut Space, &mut SpaceFile) -> Result<(), Error>,
    {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let files = files_by_pnfs_id(tx, pnfs_id)?;
            if files.is_empty() {
                trace!(pnfs_id, what, "file not placed in any reservation");
            }
            for mut file in files {
                let mut space = lock_space(tx, file.space_id)?;
                op(tx, &mut space, &mut file)?;
            }
            Ok(())
        })
    }

    /// A mover for `pnfs_id` started (or failed to start).
    pub fn transfer_started(&self, pnfs_id: &str, success: bool) -> Result<(), Error> {
        self.for_each_placement(pnfs_id, "transfer started", |tx, space, file| {
            if !file.state.is_transient() {
                debug!(file = %file.id, state = %file.state, "transfer start on settled file; ignoring");
                return Ok(());
            }
            let size = file.size;
            if success {
                update_file(tx, space, file, FileState::Transferring, size)
            } else {
                // Forget the identity; a retry may create the file again.
                file.pnfs_id = None;
                update_file(tx, space, file, FileState::Reserved, size)
            }
        })
    }

    /// The transfer of `pnfs_id` ended; on success the file is on disk with
    /// `size` bytes.
    pub fn transfer_finished(&self, pnfs_id: &str, size: u64, success: bool) -> Result<(), Error> {
        self.for_each_placement(pnfs_id, "transfer finished", |tx, space, file| {
            if !file.state.is_transient() {
                debug!(file = %file.id, state = %file.state, "transfer end on settled file; ignoring");
                return Ok(());
            }
            if !success {
                let size = file.size;
                return update_file(tx, space, file, FileState::Reserved, size);
            }
            let keep_until_flushed = space.retention_policy == RetentionPolicy::Custodial
                && space.access_latency == AccessLatency::Nearline
                && self.config.return_flushed_space_to_reservation();
            if self.config.delete_stored_file_record() && !keep_until_flushed {
                remove_file(tx, space, file)
            } else {
                update_file(tx, space, file, FileState::Stored, size)
            }
        })
    }

    /// `pnfs_id` was written to tape.
    ///
    /// For NEARLINE reservations, the bytes of the stored file go back to
    /// the reservation.
    pub fn file_flushed(&self, pnfs_id: &str) -> Result<(), Error> {
        if !self.config.return_flushed_space_to_reservation() {
            return Ok(());
        }
        self.for_each_placement(pnfs_id, "file flushed", |tx, space, file| {
            if space.access_latency == AccessLatency::Online || file.state != FileState::Stored {
                return Ok(());
            }
            if self.config.delete_stored_file_record() {
                remove_file(tx, space, file)
            } else {
                let size = file.size;
                update_file(tx, space, file, FileState::Flushed, size)
            }
        })
    }

    /// `pnfs_id` was deleted from the namespace.
    pub fn file_removed(&self, pnfs_id: &str) -> Result<(), Error> {
        self.for_each_placement(pnfs_id, "file removed", |tx, space, file| {
            if self.config.return_removed_space_to_reservation() {
                remove_file(tx, space, file)
            } else {
                file.deleted = true;
                store_file_attributes(tx, file)
            }
        })
    }

    /// A pool was selected for writing `path`; record its namespace
    /// identity on the transient placement.
    pub fn select_pool(&self, token: Option<SpaceToken>, path: &str, pnfs_id: &str) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let files = transient_files_by_path(tx, token, path)?;
            let Some(mut file) = files.into_iter().next() else {
                trace!(path, "no transient placement for selected pool");
                return Ok(());
            };
            if file.pnfs_id.as_deref() == Some(pnfs_id) {
                return Ok(());
            }
            if let Some(old) = &file.pnfs_id {
                warn!(file = %file.id, old = %old, new = pnfs_id, "replacing namespace identity");
            }
            file.pnfs_id = Some(pnfs_id.to_owned());
            store_file_attributes(tx, &file)
        })
    }

    /// Mark a placement as deleted from the namespace without touching the
    /// accounting.
    pub fn mark_file_deleted(&self, id: FileId) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let mut file = lock_file(tx, id)?;
            file.deleted = true;
            store_file_attributes(tx, &file)
        })
    }

    /// Remove one placement, returning its bytes.
    pub fn remove_file(&self, id: FileId) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let file = lock_file(tx, id)?;
            let mut space = lock_space(tx, file.space_id)?;
            remove_file(tx, &mut space, &file)
        })?;
        info!(file = %id, "removed file by administrator");
        Ok(())
    }

    /// Remove the placements of reservation `query.token` that are in one
    /// of `query.states` and past their lifetime.  Returns how many were
    /// removed.
    pub fn remove_expired_files(&self, query: &RemoveFilesQuery) -> Result<usize, Error> {
        self.ensure_enabled()?;
        let states = if query.states.is_empty() {
            vec![FileState::Reserved, FileState::Transferring]
        } else {
            query.states.clone()
        };
        let now = self.now();
        let removed = rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, query.token)?;
            let mut removed = 0;
            for file in files_in_space(tx, query.token)? {
                if states.contains(&file.state) && file.lifetime.is_expired(file.creation_time, now) {
                    remove_file(tx, &mut space, &file)?;
                    removed += 1;
                }
            }
            Ok::<_, Error>(removed)
        })?;
        info!(space = %query.token, removed, "removed expired files");
        Ok(removed)
    }

    /// Delete a reservation entirely.  With `force`, its placements are
    /// removed first; otherwise a reservation still holding files is
    /// refused.
    pub fn delete_reservation(&self, token: SpaceToken, force: bool) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let space = lock_space(tx, token)?;
            delete_space(tx, space, force)
        })?;
        info!(space = %token, force, "deleted space reservation");
        Ok(())
    }

    /// Expire a RESERVED reservation now, regardless of its lifetime.
    pub fn force_expire(&self, token: SpaceToken) -> Result<(), Error> {
        self.ensure_enabled()?;
        rw_tx(&self.pool, |tx| {
            let mut space = lock_space(tx, token)?;
            if space.state.is_final() {
                return Err(Error::InvalidStateTransition(format!(
                    "space reservation {} is already {}",
                    token, space.state
                )));
            }
            update_space(
                tx,
                &mut space,
                &SpaceUpdate {
                    state: Some(SpaceState::Expired),
                    ..Default::default()
                },
            )
        })?;
        info!(space = %token, "expired space reservation by administrator");
        Ok(())
    }

    /// Recompute every link group's reserved bytes from its reservations.
    /// Returns how many link groups were corrected.
    pub fn fix_reserved_space(&self) -> Result<usize, Error> {
        self.ensure_enabled()?;
        let fixed = rw_tx(&self.pool, accounting::recompute_reserved_space)?;
        if fixed > 0 {
            warn!(fixed, "corrected link group reserved space");
        }
        Ok(fixed)
    }

    /// Recompute every reservation's used and allocated bytes from its
    /// files.  Returns how many reservations were corrected.
    pub fn fix_space_usage(&self) -> Result<usize, Error> {
        self.ensure_enabled()?;
        let fixed = rw_tx(&self.pool, accounting::recompute_space_usage)?;
        if fixed > 0 {
            warn!(fixed, "corrected space reservation usage");
        }
        Ok(fixed)
    }
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
    use std::time::Duration;

    use rusqlite::params;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::database::Unsigned;

    /// A manager with link groups `a` (1000 bytes, `/atlas` only) and `b`
    /// (500 bytes, everybody), both fresh.
    fn setup(config: SpaceManagerConfig) -> (TempDir, SpaceManager) {
        let dir = tempdir().unwrap();
        let mgr = SpaceManager::open_with_clock(dir.path().join("db"), config, || {
            Timestamp::from_millis(1_000_000)
        })
        .unwrap();
        rw_tx(mgr.pool(), |tx| {
            for (id, name, free, group) in [(1_u64, "a", 1000_u64, "/atlas"), (2, "b", 500, "*")] {
                tx.execute(
                    sql!(
                        "
                        INSERT INTO link_group(
                            id, name, free_space_bytes, reserved_space_bytes, last_update_time,
                            online_allowed, nearline_allowed, replica_allowed, output_allowed,
                            custodial_allowed)
                        VALUES (?1, ?2, ?3, 0, 1000000, 1, 1, 1, 1, 1)
                        "
                    ),
                    params![Unsigned(id), name, Unsigned(free)],
                )?;
                tx.execute(
                    sql!("INSERT INTO link_group_vo VALUES (?1, ?2, '*')"),
                    params![Unsigned(id), group],
                )?;
            }
            Ok::<_, Error>(())
        })
        .unwrap();
        (dir, mgr)
    }

    fn reserve(mgr: &SpaceManager, fqan: &str, size: u64) -> Result<SpaceToken, Error> {
        mgr.reserve(&ReserveRequest {
            subject: Subject::from_fqan(fqan).unwrap(),
            size,
            access_latency: None,
            retention_policy: None,
            lifetime: Lifetime::Finite(Duration::from_secs(3600)),
            description: Some("test".into()),
        })
    }

    fn use_file(mgr: &SpaceManager, token: SpaceToken, path: &str, size: u64) -> Result<FileId, Error> {
        mgr.use_space(&UseRequest {
            token,
            owner: VoOwner::default(),
            size,
            lifetime: Lifetime::Infinite,
            path: path.into(),
            pnfs_id: Some(format!("pnfs{}", path)),
        })
    }

    #[test]
    fn reserve_prefers_most_available() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let t = reserve(&mgr, "/atlas/Role=production", 100).unwrap();
        let space = mgr.get_space(t).unwrap();
        assert_eq!(space.link_group_id().value(), 1);
        assert_eq!(space.vo_group().as_deref(), Some("/atlas"));
        assert_eq!(space.vo_role().as_deref(), Some("production"));

        // /cms may only use `b`.
        let t = reserve(&mgr, "/cms", 100).unwrap();
        assert_eq!(mgr.get_space(t).unwrap().link_group_id().value(), 2);
        // Only `a` fits, but /cms may not use it.
        assert!(matches!(reserve(&mgr, "/cms", 450), Err(Error::Authorization(_))));
        assert!(matches!(reserve(&mgr, "/cms", 2000), Err(Error::NoFreeSpace(_))));
    }

    #[test]
    fn stale_link_groups_are_skipped() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        mgr.advance_watermark(Timestamp::from_millis(2_000_000));
        assert!(matches!(
            reserve(&mgr, "/atlas", 1),
            Err(Error::NoFreeSpace(_))
        ));
        // The watermark never goes back.
        mgr.advance_watermark(Timestamp::from_millis(0));
        assert_eq!(mgr.watermark(), Timestamp::from_millis(2_000_000));
    }

    #[test]
    fn disabled() {
        let (_dir, mgr) = setup(SpaceManagerConfig::builder().enabled(false).build().unwrap());
        assert!(matches!(reserve(&mgr, "/atlas", 1), Err(Error::Disabled)));
        assert!(matches!(mgr.list_link_groups(), Err(Error::Disabled)));
    }

    #[test]
    fn use_caps_lifetime_and_matches_owner() {
        let (_dir, mgr) = setup(
            SpaceManagerConfig::builder()
                .match_vo_group_and_role(true)
                .build()
                .unwrap(),
        );
        let t = reserve(&mgr, "/atlas/Role=production", 100).unwrap();
        let e = use_file(&mgr, t, "/f", 10).unwrap_err();
        assert!(matches!(e, Error::Authorization(_)));

        let id = mgr
            .use_space(&UseRequest {
                token: t,
                owner: VoOwner::new(Some("/atlas"), Some("production")),
                size: 10,
                lifetime: Lifetime::Infinite,
                path: "/f".into(),
                pnfs_id: None,
            })
            .unwrap();
        let f = mgr.get_file(id).unwrap();
        assert_eq!(f.lifetime(), Lifetime::Finite(Duration::from_secs(3600)));
        assert_eq!(f.state(), FileState::Reserved);
    }

    #[test]
    fn cancel_use() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let t = reserve(&mgr, "/atlas", 100).unwrap();
        use_file(&mgr, t, "/f", 40).unwrap();
        assert_eq!(mgr.get_space(t).unwrap().allocated(), 40);
        mgr.cancel_use(t, "/f").unwrap();
        assert_eq!(mgr.get_space(t).unwrap().allocated(), 0);
        // Nothing left to cancel.
        mgr.cancel_use(t, "/f").unwrap();
        assert!(matches!(
            mgr.cancel_use(SpaceToken::new(999_999), "/f"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn transfer_events() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let t = reserve(&mgr, "/atlas", 100).unwrap();
        let id = use_file(&mgr, t, "/f", 40).unwrap();

        mgr.transfer_started("pnfs/f", true).unwrap();
        assert_eq!(mgr.get_file(id).unwrap().state(), FileState::Transferring);
        mgr.transfer_finished("pnfs/f", 50, true).unwrap();
        let f = mgr.get_file(id).unwrap();
        assert_eq!((f.state(), f.size()), (FileState::Stored, 50));
        let s = mgr.get_space(t).unwrap();
        assert_eq!((s.used(), s.allocated()), (50, 0));

        // Defaults are NEARLINE/CUSTODIAL.
        mgr.file_flushed("pnfs/f").unwrap();
        assert_eq!(mgr.get_file(id).unwrap().state(), FileState::Flushed);
        assert_eq!(mgr.get_space(t).unwrap().used(), 0);

        mgr.file_removed("pnfs/f").unwrap();
        assert!(matches!(mgr.get_file(id), Err(Error::NotFound { .. })));

        // Unknown files are ignored.
        mgr.transfer_started("nobody", true).unwrap();
        mgr.file_removed("nobody").unwrap();
    }

    #[test]
    fn failed_transfer_forgets_identity() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let t = reserve(&mgr, "/atlas", 100).unwrap();
        let id = use_file(&mgr, t, "/f", 40).unwrap();
        mgr.transfer_started("pnfs/f", false).unwrap();
        let f = mgr.get_file(id).unwrap();
        assert_eq!((f.state(), f.pnfs_id().as_deref()), (FileState::Reserved, None));

        mgr.select_pool(Some(t), "/f", "0000ABCD").unwrap();
        assert_eq!(mgr.get_file(id).unwrap().pnfs_id().as_deref(), Some("0000ABCD"));
        assert_eq!(
            mgr.get_file_space_tokens(&FileQuery::PnfsId("0000ABCD".into()))
                .unwrap(),
            vec![t]
        );
    }

    #[test]
    fn removed_file_kept_as_deleted() {
        let (_dir, mgr) = setup(
            SpaceManagerConfig::builder()
                .return_removed_space_to_reservation(false)
                .build()
                .unwrap(),
        );
        let t = reserve(&mgr, "/atlas", 100).unwrap();
        let id = use_file(&mgr, t, "/f", 40).unwrap();
        mgr.file_removed("pnfs/f").unwrap();
        let f = mgr.get_file(id).unwrap();
        assert!(f.deleted());
        assert_eq!(mgr.get_space(t).unwrap().allocated(), 40);
    }

    #[test]
    fn stored_records_deleted() {
        let (_dir, mgr) = setup(
            SpaceManagerConfig::builder()
                .delete_stored_file_record(true)
                .build()
                .unwrap(),
        );
        let t = mgr
            .reserve(&ReserveRequest {
                subject: Subject::from_fqan("/atlas").unwrap(),
                size: 100,
                access_latency: Some(AccessLatency::Online),
                retention_policy: Some(RetentionPolicy::Replica),
                lifetime: Lifetime::Infinite,
                description: None,
            })
            .unwrap();
        let id = use_file(&mgr, t, "/f", 40).unwrap();
        mgr.transfer_finished("pnfs/f", 40, true).unwrap();
        assert!(mgr.get_file(id).is_err());
        let s = mgr.get_space(t).unwrap();
        assert_eq!((s.used(), s.allocated()), (0, 0));
    }

    #[test]
    fn extend_lifetime() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let t = reserve(&mgr, "/atlas", 100).unwrap();
        let hour = Duration::from_secs(3600);

        mgr.extend_lifetime(t, Lifetime::Finite(hour / 2)).unwrap();
        assert_eq!(mgr.get_space(t).unwrap().lifetime(), Lifetime::Finite(hour));
        mgr.extend_lifetime(t, Lifetime::Finite(2 * hour)).unwrap();
        // Creation and now coincide under the fixed clock.
        assert_eq!(mgr.get_space(t).unwrap().lifetime(), Lifetime::Finite(2 * hour));
        mgr.extend_lifetime(t, Lifetime::Infinite).unwrap();
        assert_eq!(mgr.get_space(t).unwrap().lifetime(), Lifetime::Infinite);

        mgr.release(t, None).unwrap();
        assert!(matches!(
            mgr.extend_lifetime(t, Lifetime::Infinite),
            Err(Error::SpaceReleased(_))
        ));
    }

    #[test]
    fn queries() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let a = reserve(&mgr, "/atlas/Role=production", 100).unwrap();
        let b = reserve(&mgr, "/cms", 100).unwrap();

        let tokens = mgr
            .get_space_tokens(&SpaceTokenQuery::Owner(Subject::from_fqan("/cms").unwrap()))
            .unwrap();
        assert_eq!(tokens, vec![b]);
        let tokens = mgr
            .get_space_tokens(&SpaceTokenQuery::Description("test".into()))
            .unwrap();
        assert_eq!(tokens, vec![a, b]);

        let meta = mgr.get_space_metadata(&[b, SpaceToken::new(999_999), a]).unwrap();
        assert_eq!(meta[0].as_ref().map(|s| s.id()), Some(b));
        assert!(meta[1].is_none());
        assert_eq!(meta[2].as_ref().map(|s| s.id()), Some(a));

        let in_a = mgr
            .list_space_reservations(&SpaceFilter {
                link_group: Some("a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(in_a.len(), 1);
        assert_eq!(in_a[0].id(), a);

        mgr.release(b, None).unwrap();
        let invalid = mgr.list_invalid_spaces(&InvalidSpaceQuery::default()).unwrap();
        assert_eq!(invalid.len(), 1);
        let expired_only = mgr
            .list_invalid_spaces(&InvalidSpaceQuery {
                expired: true,
                released: false,
                limit: 10,
            })
            .unwrap();
        assert!(expired_only.is_empty());

        let groups = mgr.list_link_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].reserved_space(), 100);
        assert_eq!(groups[1].reserved_space(), 0);
    }

    #[test]
    fn admin_operations() {
        let (_dir, mgr) = setup(SpaceManagerConfig::default());
        let t = mgr
            .admin_reserve(&AdminReserveRequest {
                link_group: "b".into(),
                owner: VoOwner::new(Some("/dteam"), None),
                size: 200,
                access_latency: None,
                retention_policy: None,
                lifetime: Lifetime::Infinite,
                description: None,
            })
            .unwrap();
        let id = use_file(&mgr, t, "/f", 40).unwrap();
        assert!(matches!(
            mgr.delete_reservation(t, false),
            Err(Error::InvalidStateTransition(_))
        ));
        mgr.remove_file(id).unwrap();

        mgr.force_expire(t).unwrap();
        assert_eq!(mgr.get_space(t).unwrap().state(), SpaceState::Expired);
        assert!(matches!(mgr.force_expire(t), Err(Error::InvalidStateTransition(_))));
        mgr.delete_reservation(t, false).unwrap();
        assert!(mgr.get_space(t).is_err());

        assert_eq!(mgr.fix_reserved_space().unwrap(), 0);
        assert_eq!(mgr.fix_space_usage().unwrap(), 0);
    }
}
