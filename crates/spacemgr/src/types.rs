//! The data model: link groups, space reservations and the files placed in
//! them.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use getset::{CopyGetters, Getters};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::auth::VoRule;
use crate::err::Error;

/// Define an identifier newtype stored as an SQLite `INTEGER`.
macro_rules! define_id {
    { $(#[$meta:meta])* $name:ident } => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw identifier.
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Return the raw identifier.
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                let v = i64::try_from(self.0)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                Ok(ToSqlOutput::from(v))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let v = i64::column_result(value)?;
                u64::try_from(v)
                    .map(Self)
                    .map_err(|_| FromSqlError::OutOfRange(v))
            }
        }
    };
}

define_id! {
    /// The identifier of a space reservation, handed out to clients as
    /// their "space token".
    SpaceToken
}

define_id! {
    /// The identifier of a [`SpaceFile`].
    FileId
}

define_id! {
    /// The identifier of a [`LinkGroup`].
    LinkGroupId
}

/// Define an enum stored as SQLite `TEXT` using its strum representation.
macro_rules! sql_text_enum {
    { $name:ident } => {
        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                let s: &'static str = self.into();
                Ok(ToSqlOutput::from(s))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// The state of a space reservation.
///
/// [`Expired`](SpaceState::Expired) and [`Released`](SpaceState::Released)
/// are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::exhaustive_enums)]
pub enum SpaceState {
    /// Active; its unused bytes are held in the link group.
    Reserved,
    /// Given back by its owner.
    Released,
    /// Its lifetime ran out.
    Expired,
}
sql_text_enum!(SpaceState);

impl SpaceState {
    /// Return true if no transition out of this state is permitted.
    pub fn is_final(self) -> bool {
        !matches!(self, SpaceState::Reserved)
    }
}

/// The state of a file placed in a reservation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::exhaustive_enums)]
pub enum FileState {
    /// Space is set aside, no data has arrived yet.
    Reserved,
    /// Data is being written.
    Transferring,
    /// Data is on disk.
    Stored,
    /// Data went to tape and no longer counts against the reservation.
    Flushed,
}
sql_text_enum!(FileState);

impl FileState {
    /// Return true for the states whose bytes are counted as allocated.
    pub fn is_transient(self) -> bool {
        matches!(self, FileState::Reserved | FileState::Transferring)
    }

    /// Return true if a file may move from `self` to `to`.
    ///
    /// Staying in the same state is always allowed.
    pub fn can_become(self, to: FileState) -> bool {
        use FileState::*;
        self == to
            || matches!(
                (self, to),
                (Reserved, Transferring | Stored | Flushed)
                    | (Transferring, Reserved | Stored | Flushed)
                    | (Stored, Flushed)
            )
    }
}

/// How quickly data must be accessible.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[allow(clippy::exhaustive_enums)]
pub enum AccessLatency {
    /// Always on disk.
    Online,
    /// May need to be staged from tape.
    Nearline,
}
sql_text_enum!(AccessLatency);

/// How safely data must be kept.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[allow(clippy::exhaustive_enums)]
pub enum RetentionPolicy {
    /// Kept on tape.
    Custodial,
    /// Output of a job; may be lost.
    Output,
    /// Disk only.
    Replica,
}
sql_text_enum!(RetentionPolicy);

/// A point in time, in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Wrap a number of milliseconds since the epoch.
    pub const fn from_millis(ms: i64) -> Self {
        Timestamp(ms)
    }

    /// Return the milliseconds since the epoch.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Return the current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Return this timestamp moved forward by `d`, saturating.
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration_millis(d)))
    }

    /// Return the time elapsed from `earlier` to `self`, or zero if
    /// `earlier` is later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        u64::try_from(self.0.saturating_sub(earlier.0))
            .map(Duration::from_millis)
            .unwrap_or_default()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(duration_millis(d)),
            Err(e) => Timestamp(-duration_millis(e.duration())),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = UNIX_EPOCH + Duration::from_millis(self.0.max(0).unsigned_abs());
        write!(f, "{}", humantime::format_rfc3339_millis(t))
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Timestamp)
    }
}

/// Convert `d` to whole milliseconds, saturating at `i64::MAX`.
fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// How long a reservation or file lives after its creation.
///
/// Stored and transmitted as milliseconds, with `-1` meaning infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
#[allow(clippy::exhaustive_enums)]
pub enum Lifetime {
    /// Never expires.
    Infinite,
    /// Expires this long after creation.
    Finite(Duration),
}

impl Lifetime {
    /// Return the instant at which something created at `created` expires.
    pub fn expiry(self, created: Timestamp) -> Option<Timestamp> {
        match self {
            Lifetime::Infinite => None,
            Lifetime::Finite(d) => Some(created.saturating_add(d)),
        }
    }

    /// Return true if something created at `created` is expired at `now`.
    pub fn is_expired(self, created: Timestamp, now: Timestamp) -> bool {
        self.expiry(created).is_some_and(|end| end < now)
    }
}

impl From<i64> for Lifetime {
    fn from(ms: i64) -> Self {
        match u64::try_from(ms) {
            Ok(ms) => Lifetime::Finite(Duration::from_millis(ms)),
            Err(_) => Lifetime::Infinite,
        }
    }
}

impl From<Lifetime> for i64 {
    fn from(l: Lifetime) -> i64 {
        match l {
            Lifetime::Infinite => -1,
            Lifetime::Finite(d) => duration_millis(d),
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifetime::Infinite => write!(f, "infinite"),
            Lifetime::Finite(d) => write!(f, "{}", humantime::format_duration(*d)),
        }
    }
}

impl ToSql for Lifetime {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(*self)))
    }
}

impl FromSql for Lifetime {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Lifetime::from)
    }
}

/// The five storage-class flags of a link group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
#[allow(clippy::struct_excessive_bools)]
pub struct LinkGroupFlags {
    /// Accepts ONLINE reservations.
    #[serde(default)]
    pub online_allowed: bool,
    /// Accepts NEARLINE reservations.
    #[serde(default)]
    pub nearline_allowed: bool,
    /// Accepts REPLICA reservations.
    #[serde(default)]
    pub replica_allowed: bool,
    /// Accepts OUTPUT reservations.
    #[serde(default)]
    pub output_allowed: bool,
    /// Accepts CUSTODIAL reservations.
    #[serde(default)]
    pub custodial_allowed: bool,
}

impl LinkGroupFlags {
    /// Return flags with everything allowed.
    pub fn all() -> Self {
        LinkGroupFlags {
            online_allowed: true,
            nearline_allowed: true,
            replica_allowed: true,
            output_allowed: true,
            custodial_allowed: true,
        }
    }

    /// Return true if a reservation of this storage class may be placed here.
    pub fn allows(&self, latency: AccessLatency, policy: RetentionPolicy) -> bool {
        let latency_ok = match latency {
            AccessLatency::Online => self.online_allowed,
            AccessLatency::Nearline => self.nearline_allowed,
        };
        let policy_ok = match policy {
            RetentionPolicy::Replica => self.replica_allowed,
            RetentionPolicy::Output => self.output_allowed,
            RetentionPolicy::Custodial => self.custodial_allowed,
        };
        latency_ok && policy_ok
    }
}

/// A named pool of storage capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct LinkGroup {
    /// Identifier.
    #[getset(get_copy = "pub")]
    pub(crate) id: LinkGroupId,
    /// Unique name, as reported by the capacity feed.
    #[getset(get = "pub")]
    pub(crate) name: String,
    /// Raw capacity reported by the capacity feed.
    #[getset(get_copy = "pub")]
    pub(crate) free_space: u64,
    /// Sum of the unused portions of all RESERVED reservations in this group.
    #[getset(get_copy = "pub")]
    pub(crate) reserved_space: u64,
    /// When the refresher last updated this group.
    #[getset(get_copy = "pub")]
    pub(crate) last_update_time: Timestamp,
    /// Storage classes accepted here.
    #[getset(get_copy = "pub")]
    pub(crate) flags: LinkGroupFlags,
    /// Who may reserve here.
    #[getset(get = "pub")]
    pub(crate) vo_rules: Vec<VoRule>,
}

impl LinkGroup {
    /// Return the bytes that can still be reserved.
    ///
    /// Negative if the feed reported less free space than is already
    /// promised to reservations.
    pub fn available_space(&self) -> i128 {
        i128::from(self.free_space) - i128::from(self.reserved_space)
    }
}

/// A space reservation, identified by its [`SpaceToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct Space {
    /// The token.
    #[getset(get_copy = "pub")]
    pub(crate) id: SpaceToken,
    /// The owning link group.
    #[getset(get_copy = "pub")]
    pub(crate) link_group_id: LinkGroupId,
    /// Owning VO group; `None` means unrestricted.
    #[getset(get = "pub")]
    pub(crate) vo_group: Option<String>,
    /// Owning VO role; `None` means unrestricted.
    #[getset(get = "pub")]
    pub(crate) vo_role: Option<String>,
    /// Retention policy.
    #[getset(get_copy = "pub")]
    pub(crate) retention_policy: RetentionPolicy,
    /// Access latency.
    #[getset(get_copy = "pub")]
    pub(crate) access_latency: AccessLatency,
    /// Total bytes granted.
    #[getset(get_copy = "pub")]
    pub(crate) size: u64,
    /// Creation time.
    #[getset(get_copy = "pub")]
    pub(crate) creation_time: Timestamp,
    /// Lifetime counted from `creation_time`.
    #[getset(get_copy = "pub")]
    pub(crate) lifetime: Lifetime,
    /// Free-form description supplied by the owner.
    #[getset(get = "pub")]
    pub(crate) description: Option<String>,
    /// State.
    #[getset(get_copy = "pub")]
    pub(crate) state: SpaceState,
    /// Bytes of files that are on disk.
    #[getset(get_copy = "pub")]
    pub(crate) used: u64,
    /// Bytes of files that are still arriving.
    #[getset(get_copy = "pub")]
    pub(crate) allocated: u64,
}

impl Space {
    /// Return the bytes neither used nor allocated.
    pub fn available(&self) -> u64 {
        self.size.saturating_sub(self.used.saturating_add(self.allocated))
    }

    /// Return true if the lifetime of this reservation has run out at `now`,
    /// regardless of whether the sweeper has marked it yet.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.state == SpaceState::Expired || self.lifetime.is_expired(self.creation_time, now)
    }

    /// Return the lifetime left at `now`, or `None` if infinite.
    pub fn remaining_lifetime(&self, now: Timestamp) -> Option<Duration> {
        self.lifetime
            .expiry(self.creation_time)
            .map(|end| end.saturating_since(now))
    }

    /// Fail unless this reservation can take new files at `now`.
    pub(crate) fn ensure_usable(&self, now: Timestamp) -> Result<(), Error> {
        match self.state {
            SpaceState::Released => Err(Error::SpaceReleased(self.id)),
            SpaceState::Expired => Err(Error::SpaceExpired(self.id)),
            SpaceState::Reserved if self.is_expired_at(now) => Err(Error::SpaceExpired(self.id)),
            SpaceState::Reserved => Ok(()),
        }
    }
}

/// One file's claim against a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct SpaceFile {
    /// Identifier.
    #[getset(get_copy = "pub")]
    pub(crate) id: FileId,
    /// The reservation the file counts against.
    #[getset(get_copy = "pub")]
    pub(crate) space_id: SpaceToken,
    /// VO group of the writer.
    #[getset(get = "pub")]
    pub(crate) vo_group: Option<String>,
    /// VO role of the writer.
    #[getset(get = "pub")]
    pub(crate) vo_role: Option<String>,
    /// Size in bytes.
    #[getset(get_copy = "pub")]
    pub(crate) size: u64,
    /// Creation time.
    #[getset(get_copy = "pub")]
    pub(crate) creation_time: Timestamp,
    /// Lifetime of the transient states.
    #[getset(get_copy = "pub")]
    pub(crate) lifetime: Lifetime,
    /// Namespace path.
    #[getset(get = "pub")]
    pub(crate) path: Option<String>,
    /// Namespace identity, unset until the file is created in the namespace.
    #[getset(get = "pub")]
    pub(crate) pnfs_id: Option<String>,
    /// State.
    #[getset(get_copy = "pub")]
    pub(crate) state: FileState,
    /// The file was deleted from the namespace.
    #[getset(get_copy = "pub")]
    pub(crate) deleted: bool,
}

impl SpaceFile {
    /// Return true if this file sat in a transient state past its lifetime.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.state.is_transient() && self.lifetime.is_expired(self.creation_time, now)
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
    use super::*;

    #[test]
    fn file_transitions() {
        use FileState::*;
        assert!(Reserved.can_become(Transferring));
        assert!(Reserved.can_become(Stored));
        assert!(Transferring.can_become(Reserved));
        assert!(Stored.can_become(Flushed));
        assert!(Flushed.can_become(Flushed));
        assert!(!Flushed.can_become(Stored));
        assert!(!Stored.can_become(Reserved));
        assert!(!Stored.can_become(Transferring));
    }

    #[test]
    fn lifetime() {
        let created = Timestamp::from_millis(1_000);
        let l = Lifetime::Finite(Duration::from_secs(1));
        assert_eq!(l.expiry(created), Some(Timestamp::from_millis(2_000)));
        assert!(!l.is_expired(created, Timestamp::from_millis(2_000)));
        assert!(l.is_expired(created, Timestamp::from_millis(2_001)));
        assert!(!Lifetime::Infinite.is_expired(created, Timestamp::from_millis(i64::MAX)));

        assert_eq!(Lifetime::from(-1), Lifetime::Infinite);
        assert_eq!(i64::from(Lifetime::from(3_600_000)), 3_600_000);
        assert_eq!(serde_json::to_string(&Lifetime::Infinite).unwrap(), "-1");
    }

    #[test]
    fn flags() {
        let f = LinkGroupFlags {
            nearline_allowed: true,
            custodial_allowed: true,
            ..Default::default()
        };
        assert!(f.allows(AccessLatency::Nearline, RetentionPolicy::Custodial));
        assert!(!f.allows(AccessLatency::Online, RetentionPolicy::Custodial));
        assert!(!f.allows(AccessLatency::Nearline, RetentionPolicy::Replica));
    }

    #[test]
    fn enum_text() {
        assert_eq!(SpaceState::Released.to_string(), "RELEASED");
        assert_eq!("nearline".parse::<AccessLatency>().unwrap(), AccessLatency::Nearline);
        assert_eq!(FileState::Transferring.to_string(), "TRANSFERRING");
        assert!(SpaceState::Expired.is_final());
        assert!(!SpaceState::Reserved.is_final());
    }
}
