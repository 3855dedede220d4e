//! Periodic import of link group capacity.
//!
//! A [`Refresher`] pulls the current free space and storage-class flags of
//! every link group from a [`CapacityFeed`], together with the allow-lists
//! from the [`AuthorizationFile`], and writes them to the database.  Once a
//! pass has completed, the manager's watermark moves to the time the pass
//! started; link groups the feed stopped reporting fall behind it and are no
//! longer offered to new reservations.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{named_params, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::accounting::{find_link_group_by_name, lock_link_group};
use crate::auth::VoRule;
use crate::authfile::{AuthorizationFile, AuthorizationRules};
use crate::database::{read_tx, rw_tx, sql, Unsigned};
use crate::err::Error;
use crate::manager::SpaceManager;
use crate::types::{LinkGroupFlags, LinkGroupId, Timestamp};

/// What the capacity feed says about one link group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct LinkGroupReport {
    /// Name of the link group.
    pub name: String,
    /// Free bytes.
    pub available: u64,
    /// Storage classes accepted.
    #[serde(flatten)]
    pub flags: LinkGroupFlags,
}

/// A failure to read the capacity feed.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum FeedError {
    /// The feed could not be reached.
    #[error("capacity feed unavailable: {0}")]
    Unavailable(String),
    /// The feed answered with something unusable.
    #[error("malformed capacity report: {0}")]
    Malformed(String),
}

/// A source of link group capacity, typically the pool manager.
#[async_trait]
pub trait CapacityFeed: Send + Sync {
    /// Return a report for every link group that currently exists.
    async fn link_groups(&self) -> Result<Vec<LinkGroupReport>, FeedError>;
}

/// A [`CapacityFeed`] returning whatever it was last told to.
#[derive(Debug)]
pub struct StaticCapacityFeed {
    /// The next answer.
    answer: Mutex<Result<Vec<LinkGroupReport>, FeedError>>,
}

impl StaticCapacityFeed {
    /// Create a feed reporting `reports`.
    pub fn new(reports: Vec<LinkGroupReport>) -> Self {
        StaticCapacityFeed {
            answer: Mutex::new(Ok(reports)),
        }
    }

    /// Report `reports` from now on.
    pub fn set_reports(&self, reports: Vec<LinkGroupReport>) {
        *self.answer.lock().unwrap_or_else(PoisonError::into_inner) = Ok(reports);
    }

    /// Fail with `error` from now on.
    pub fn set_failure(&self, error: FeedError) {
        *self.answer.lock().unwrap_or_else(PoisonError::into_inner) = Err(error);
    }
}

#[async_trait]
impl CapacityFeed for StaticCapacityFeed {
    async fn link_groups(&self) -> Result<Vec<LinkGroupReport>, FeedError> {
        self.answer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The outcome of one refresher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct RefreshReport {
    /// Link groups seen for the first time.
    pub created: usize,
    /// Known link groups updated.
    pub updated: usize,
    /// Link groups that could not be written.
    pub failed: usize,
}

/// Keeps the link groups of a [`SpaceManager`] in line with a
/// [`CapacityFeed`].
pub struct Refresher {
    /// The manager whose database gets updated.
    manager: Arc<SpaceManager>,
    /// Where capacity comes from.
    feed: Arc<dyn CapacityFeed>,
    /// Where allow-lists come from; without one, stored allow-lists are
    /// left alone.
    authorization: Option<Arc<AuthorizationFile>>,
}

impl Refresher {
    /// Create a refresher reading the authorization file named in the
    /// manager's configuration.
    pub fn new(manager: Arc<SpaceManager>, feed: Arc<dyn CapacityFeed>) -> Self {
        let authorization = manager
            .config()
            .link_group_authorization_file()
            .as_ref()
            .map(|path| Arc::new(AuthorizationFile::new(path)));
        Refresher {
            manager,
            feed,
            authorization,
        }
    }

    /// Run one pass.
    ///
    /// Fails only if the feed cannot be read, in which case nothing is
    /// written and the watermark stays put.  Link groups that cannot be
    /// written are logged and counted, and will be stale until a later pass
    /// succeeds for them.
    pub async fn refresh_once(&self) -> Result<RefreshReport, Error> {
        self.manager.ensure_enabled()?;
        let started = self.manager.now();
        let reports = self
            .feed
            .link_groups()
            .await
            .map_err(Error::CapacityFeed)?;

        let manager = Arc::clone(&self.manager);
        let authorization = self.authorization.clone();
        let report = tokio::task::spawn_blocking(move || {
            let rules = authorization.and_then(|file| match file.rules() {
                Ok(rules) => Some(rules),
                Err(e) => {
                    warn!(error = %e, "link group authorization unavailable; keeping stored allow-lists");
                    None
                }
            });
            apply_reports(&manager, &reports, rules.as_deref(), started)
        })
        .await
        .map_err(|e| Error::Bug(format!("link group refresh panicked: {}", e)))?;

        self.manager.advance_watermark(started);
        debug!(?report, watermark = %started, "refreshed link groups");
        Ok(report)
    }

    /// Refresh every configured period until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.manager.config().update_link_groups_period();
        info!(period = %humantime::format_duration(period), "link group refresher started");
        tokio::pin!(shutdown);
        loop {
            if let Err(e) = self.refresh_once().await {
                warn!(error = %e, "link group refresh failed");
            }
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(period) => {}
            }
        }
        info!("link group refresher stopped");
    }
}

/// Write every report, logging and counting the failures.
fn apply_reports(
    manager: &SpaceManager,
    reports: &[LinkGroupReport],
    rules: Option<&AuthorizationRules>,
    now: Timestamp,
) -> RefreshReport {
    let mut outcome = RefreshReport::default();
    for report in reports {
        match apply_report(manager, report, rules, now) {
            Ok(true) => outcome.created += 1,
            Ok(false) => outcome.updated += 1,
            Err(e) => {
                warn!(link_group = %report.name, error = %e, "failed to update link group");
                outcome.failed += 1;
            }
        }
    }
    outcome
}

/// Write one report.  Returns true if the link group is new.
fn apply_report(
    manager: &SpaceManager,
    report: &LinkGroupReport,
    rules: Option<&AuthorizationRules>,
    now: Timestamp,
) -> Result<bool, Error> {
    let known = read_tx(manager.pool(), |tx| find_link_group_by_name(tx, &report.name))?;
    // Ids come from the token allocator, which cannot run inside the write
    // transaction below.
    let fresh_id = match known {
        Some(_) => None,
        None => Some(LinkGroupId::new(manager.next_id()?)),
    };

    rw_tx(manager.pool(), |tx| {
        // A NULL id only happens if the group was deleted since we looked;
        // SQLite then picks an unused rowid.
        let mut stmt = tx.prepare_cached(sql!(
            "
            INSERT INTO link_group(
                id, name, free_space_bytes, reserved_space_bytes, last_update_time,
                online_allowed, nearline_allowed, replica_allowed, output_allowed,
                custodial_allowed)
            VALUES (
                :id, :name, :free, 0, :now,
                :online, :nearline, :replica, :output, :custodial)
            ON CONFLICT(name) DO UPDATE SET
                free_space_bytes = excluded.free_space_bytes,
                last_update_time = excluded.last_update_time,
                online_allowed = excluded.online_allowed,
                nearline_allowed = excluded.nearline_allowed,
                replica_allowed = excluded.replica_allowed,
                output_allowed = excluded.output_allowed,
                custodial_allowed = excluded.custodial_allowed
            "
        ))?;
        stmt.execute(named_params! {
            ":id": fresh_id,
            ":name": report.name,
            ":free": Unsigned(report.available),
            ":now": now,
            ":online": report.flags.online_allowed,
            ":nearline": report.flags.nearline_allowed,
            ":replica": report.flags.replica_allowed,
            ":output": report.flags.output_allowed,
            ":custodial": report.flags.custodial_allowed,
        })?;

        if let Some(rules) = rules {
            let lg = find_link_group_by_name(tx, &report.name)?
                .ok_or_else(|| Error::no_such_link_group(&report.name))?;
            let wanted = rules.get(&report.name).map_or(&[][..], Vec::as_slice);
            reconcile_vo_rules(tx, lg.id(), wanted)?;
        }
        Ok(known.is_none())
    })
}

/// Make the stored allow-list of link group `id` equal to `wanted`.
fn reconcile_vo_rules(tx: &Transaction<'_>, id: LinkGroupId, wanted: &[VoRule]) -> Result<(), Error> {
    let lg = lock_link_group(tx, id)?;
    let stored: BTreeSet<&VoRule> = lg.vo_rules().iter().collect();
    let wanted: BTreeSet<&VoRule> = wanted.iter().collect();

    let mut insert = tx.prepare_cached(sql!(
        "
        INSERT OR IGNORE INTO link_group_vo(link_group_id, vo_group, vo_role)
        VALUES (:id, :group, :role)
        "
    ))?;
    for rule in wanted.difference(&stored) {
        insert.execute(named_params! {
            ":id": id,
            ":group": rule.group.as_stored(),
            ":role": rule.role.as_stored(),
        })?;
        debug!(link_group = %lg.name(), %rule, "allowing");
    }

    let mut delete = tx.prepare_cached(sql!(
        "
        DELETE FROM link_group_vo
        WHERE link_group_id = :id AND vo_group = :group AND vo_role = :role
        "
    ))?;
    for rule in stored.difference(&wanted) {
        delete.execute(named_params! {
            ":id": id,
            ":group": rule.group.as_stored(),
            ":role": rule.role.as_stored(),
        })?;
        debug!(link_group = %lg.name(), %rule, "no longer allowing");
    }
    Ok(())
}
