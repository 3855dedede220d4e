//! Choosing link groups for a new reservation.

use rusqlite::{named_params, Transaction};

use crate::accounting::signed;
use crate::database::{link_group_from_row, load_vo_rules, sql};
use crate::err::Error;
use crate::types::{AccessLatency, LinkGroup, RetentionPolicy, Timestamp};

/// What a new reservation needs from its link group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlacementRequest {
    /// Requested size in bytes.
    pub(crate) size: u64,
    /// Requested access latency.
    pub(crate) access_latency: AccessLatency,
    /// Requested retention policy.
    pub(crate) retention_policy: RetentionPolicy,
}

/// Return the link groups that can hold `req`, most available space first.
///
/// A link group qualifies if it accepts the storage class, was updated by
/// the refresher pass that ended at `watermark` (or later), and has at least
/// `req.size` bytes of free space that is not already reserved.  The
/// allow-lists are loaded but not checked; the caller decides which of the
/// candidates it is authorized for.
pub(crate) fn candidates(
    tx: &Transaction<'_>,
    req: &PlacementRequest,
    watermark: Timestamp,
) -> Result<Vec<LinkGroup>, Error> {
    let mut stmt = tx.prepare_cached(sql!(
        "
        SELECT * FROM link_group
        WHERE (CASE :latency
                 WHEN 'ONLINE' THEN online_allowed
                 ELSE nearline_allowed
               END) = 1
          AND (CASE :policy
                 WHEN 'REPLICA' THEN replica_allowed
                 WHEN 'OUTPUT' THEN output_allowed
                 ELSE custodial_allowed
               END) = 1
          AND last_update_time >= :watermark
          AND free_space_bytes - reserved_space_bytes >= :size
        ORDER BY free_space_bytes - reserved_space_bytes DESC, id
        "
    ))?;
    let mut groups = stmt
        .query_map(
            named_params! {
                ":latency": req.access_latency,
                ":policy": req.retention_policy,
                ":watermark": watermark,
                ":size": signed(req.size)?,
            },
            link_group_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    for lg in &mut groups {
        load_vo_rules(tx, lg)?;
    }
    Ok(groups)
}
