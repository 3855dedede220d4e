#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod accounting;
mod auth;
mod authfile;
mod config;
mod database;
mod err;
mod manager;
mod msg;
mod placement;
mod refresher;
mod sweeper;
mod token;
mod types;

pub use auth::{Subject, VoIdentity, VoMatch, VoOwner, VoRule};
pub use authfile::{parse_authorization_file, AuthorizationFile, AuthorizationRules};
pub use config::{SpaceManagerConfig, SpaceManagerConfigBuilder};
pub use err::{ConfigBuildError, DatabaseError, Error, ErrorKind};
pub use manager::{
    AdminReserveRequest, FileQuery, InvalidSpaceQuery, RemoveFilesQuery, ReserveAndUseRequest,
    ReserveRequest, SpaceFilter, SpaceManager, SpaceTokenQuery, SpaceUpdate, UseRequest,
};
pub use msg::{Envelope, Reply, Request, Response};
pub use refresher::{
    CapacityFeed, FeedError, LinkGroupReport, RefreshReport, Refresher, StaticCapacityFeed,
};
pub use sweeper::{run_sweeper, SweepReport};
pub use types::{
    AccessLatency, FileId, FileState, Lifetime, LinkGroup, LinkGroupFlags, LinkGroupId,
    RetentionPolicy, Space, SpaceFile, SpaceState, SpaceToken, Timestamp,
};
