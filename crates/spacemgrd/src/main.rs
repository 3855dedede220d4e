//! Daemon and administrative command line for `spacemgr`.
//!
//! `spacemgrd run` opens the accounting database and runs the two
//! background tasks: the sweeper, which expires reservations whose
//! lifetime ran out, and the refresher, which imports link group capacity
//! from a capacity file and allow-lists from the authorization file.  With
//! `--serve-stdin` it also answers JSON requests, one per line.
//!
//! Every other subcommand performs one administrative operation against the
//! same database and exits; several processes may use the database at once.
//! Run `spacemgrd help` for the list.
//!
//! # Configuration
//!
//! The configuration file is TOML, `/etc/spacemgr/spacemgr.toml` unless
//! `-c` says otherwise:
//!
//! ```toml
//! [spacemgr]
//! expire_space_reservations_period = "3 min"
//! link_group_authorization_file = "/etc/spacemgr/LinkGroupAuthorization.conf"
//!
//! [storage]
//! database = "/var/lib/spacemgr/spacemgr.db"
//!
//! [logging]
//! console = "info"
//!
//! [capacity]
//! file = "/etc/spacemgr/link-groups.toml"
//! ```

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
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::result_large_err)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

// These are allowed in this crate only.
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

mod cfg;
mod feed;
mod logging;
mod subcommands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use spacemgr::SpaceManager;

use cfg::DaemonConfig;
use subcommands::{admin, run, Command};

/// Where the configuration is read from by default.
const DEFAULT_CONFIG: &str = "/etc/spacemgr/spacemgr.toml";

/// Space reservation accounting for grid storage.
#[derive(Parser, Debug)]
#[command(name = "spacemgrd", version, author = "The spacemgr developers")]
struct Cli {
    /// Specify which config file to read.
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override the log level (usually one of 'trace', 'debug', 'info', 'warn', 'error').
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// What to do.
    #[command(subcommand)]
    command: Command,
}

/// Run spacemgrd with the command line `cli`.
fn main_main(cli: Cli) -> Result<()> {
    let config = DaemonConfig::load(&cli.config)?;
    logging::setup_logging(&config.logging, cli.log_level.as_deref())?;

    let engine = config.spacemgr()?;
    let manager = SpaceManager::open(&config.storage.database, engine).with_context(|| {
        format!(
            "Unable to open the database at {}",
            config.storage.database.display()
        )
    })?;
    let manager = Arc::new(manager);
    let mgr = &*manager;

    match cli.command {
        Command::Run { serve_stdin } => run::run(&config, manager, serve_stdin),
        Command::Ls(args) => admin::ls(mgr, args),
        Command::LsLinkGroups => admin::ls_link_groups(mgr),
        Command::LsFiles { token } => admin::ls_files(mgr, token),
        Command::LsFileSpaceTokens(args) => admin::ls_file_space_tokens(mgr, args),
        Command::LsInvalid(args) => admin::ls_invalid(mgr, &args),
        Command::Reserve(args) => admin::reserve(mgr, args),
        Command::Release { token } => Ok(mgr.release(token, None)?),
        Command::UpdateSpaceReservation(args) => admin::update(mgr, args),
        Command::ExtendLifetime { token, lifetime } => {
            admin::extend_lifetime(mgr, token, lifetime)
        }
        Command::RemoveFile { id } => admin::remove_file(mgr, id),
        Command::RemoveFilesFromSpace(args) => admin::remove_files(mgr, &args),
        Command::DeleteReservation { token, force } => {
            Ok(mgr.delete_reservation(token, force)?)
        }
        Command::Expire => admin::expire(mgr),
        Command::UpdateLinkGroups => admin::update_link_groups(&config, Arc::clone(&manager)),
        Command::FixReservedSpace => admin::fix_reserved_space(mgr),
        Command::FixSpaceUsage => admin::fix_space_usage(mgr),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = main_main(cli) {
        eprintln!("spacemgrd: error: {:#}", e);
        std::process::exit(1);
    }
}
