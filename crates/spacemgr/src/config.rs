//! Configuration for the space manager.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::err::ConfigBuildError;
use crate::types::{AccessLatency, RetentionPolicy};

/// Configuration of a [`SpaceManager`](crate::SpaceManager) and its
/// background tasks.
///
/// This type is immutable once constructed.  To build one, use
/// [`SpaceManagerConfigBuilder`], or deserialize the builder.
#[derive(Debug, Clone, Builder, Eq, PartialEq, Getters, CopyGetters)]
#[builder(build_fn(private, name = "build_unvalidated", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct SpaceManagerConfig {
    /// If false, every request fails with [`Error::Disabled`](crate::Error::Disabled).
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    enabled: bool,

    /// How often the sweeper looks for expired reservations and files.
    #[builder(default = "default_period()")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    #[getset(get_copy = "pub")]
    expire_space_reservations_period: Duration,

    /// How often the refresher pulls link-group capacity.
    #[builder(default = "default_period()")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    #[getset(get_copy = "pub")]
    update_link_groups_period: Duration,

    /// Whether the sweeper removes files stuck in a transient state past
    /// their lifetime.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    cleanup_expired_space_files: bool,

    /// Delete the file record once a file is stored, instead of keeping it
    /// in STORED state.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    delete_stored_file_record: bool,

    /// Give the bytes of a flushed file back to its reservation.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    return_flushed_space_to_reservation: bool,

    /// Give the bytes of a removed file back to its reservation.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    return_removed_space_to_reservation: bool,

    /// Require the VO group and role given to `use` to equal the owner of
    /// the reservation.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    match_vo_group_and_role: bool,

    /// Create an implicit reservation for writes that arrive without one.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    reserve_space_for_non_srm_transfers: bool,

    /// Access latency of requests that do not name one.
    #[builder(default = "AccessLatency::Nearline")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    default_access_latency: AccessLatency,

    /// Retention policy of requests that do not name one.
    #[builder(default = "RetentionPolicy::Custodial")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    default_retention_policy: RetentionPolicy,

    /// Lifetime of implicit reservations.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    #[getset(get_copy = "pub")]
    implicit_reservation_lifetime: Duration,

    /// The file listing which VO may reserve in which link group.
    #[builder(default, setter(into, strip_option))]
    #[builder_field_attr(serde(default))]
    #[getset(get = "pub")]
    link_group_authorization_file: Option<PathBuf>,

    /// How long a write waits for the database lock.
    #[builder(default = "Duration::from_secs(1)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    #[getset(get_copy = "pub")]
    busy_timeout: Duration,

    /// How many times claiming a block of tokens is attempted.
    #[builder(default = "4")]
    #[builder_field_attr(serde(default))]
    #[getset(get_copy = "pub")]
    token_claim_attempts: u32,
}

/// Default period of the background tasks.
fn default_period() -> Duration {
    Duration::from_secs(3 * 60)
}

impl SpaceManagerConfig {
    /// Return a new [`SpaceManagerConfigBuilder`].
    pub fn builder() -> SpaceManagerConfigBuilder {
        SpaceManagerConfigBuilder::default()
    }
}

impl Default for SpaceManagerConfig {
    fn default() -> Self {
        SpaceManagerConfigBuilder::default()
            .build()
            .expect("unusable hardwired defaults")
    }
}

impl SpaceManagerConfigBuilder {
    /// Build the [`SpaceManagerConfig`].
    pub fn build(&self) -> Result<SpaceManagerConfig, ConfigBuildError> {
        let config = self.build_unvalidated()?;

        for (field, value) in [
            (
                "expire_space_reservations_period",
                config.expire_space_reservations_period,
            ),
            ("update_link_groups_period", config.update_link_groups_period),
            (
                "implicit_reservation_lifetime",
                config.implicit_reservation_lifetime,
            ),
        ] {
            if value.is_zero() {
                return Err(ConfigBuildError::Invalid {
                    field: field.into(),
                    problem: "must not be zero".into(),
                });
            }
        }
        if config.token_claim_attempts == 0 {
            return Err(ConfigBuildError::Invalid {
                field: "token_claim_attempts".into(),
                problem: "must be at least 1".into(),
            });
        }
        if config.delete_stored_file_record && !config.return_removed_space_to_reservation {
            return Err(ConfigBuildError::Inconsistent {
                fields: vec![
                    "delete_stored_file_record".into(),
                    "return_removed_space_to_reservation".into(),
                ],
                problem: "deleting stored file records always returns their space".into(),
            });
        }

        Ok(config)
    }
}
