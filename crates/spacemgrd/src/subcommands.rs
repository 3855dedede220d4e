//! spacemgrd CLI subcommands.

pub(crate) mod admin;
pub(crate) mod run;

use clap::Subcommand;
use spacemgr::{FileId, Lifetime, SpaceToken};

use admin::{
    parse_lifetime, FileSpaceTokensArgs, InvalidArgs, LsArgs, RemoveFilesArgs, ReserveArgs,
    UpdateArgs,
};

/// Everything spacemgrd can be asked to do.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Run the daemon: expire reservations and refresh link groups
    /// periodically until interrupted.
    Run {
        /// Also answer JSON requests, one per line, read from stdin.
        #[arg(long)]
        serve_stdin: bool,
    },
    /// List space reservations.
    Ls(LsArgs),
    /// List link groups with their allow-lists and available space.
    LsLinkGroups,
    /// List the files of a reservation.
    LsFiles {
        /// The reservation.
        token: SpaceToken,
    },
    /// List the reservations holding some file.
    LsFileSpaceTokens(FileSpaceTokensArgs),
    /// List expired or released reservations, newest first.
    LsInvalid(InvalidArgs),
    /// Reserve space in a link group, without authorization checks.
    Reserve(ReserveArgs),
    /// Release a reservation, without authorization checks.
    Release {
        /// The reservation.
        token: SpaceToken,
    },
    /// Change the size, lifetime or description of a reservation.
    UpdateSpaceReservation(UpdateArgs),
    /// Make a reservation live at least this much longer from now.
    ExtendLifetime {
        /// The reservation.
        token: SpaceToken,
        /// The wanted remaining lifetime, or "infinite".
        #[arg(value_parser = parse_lifetime)]
        lifetime: Lifetime,
    },
    /// Remove one file placement, returning its bytes.
    RemoveFile {
        /// The file.
        id: FileId,
    },
    /// Remove the expired files of a reservation.
    RemoveFilesFromSpace(RemoveFilesArgs),
    /// Delete a reservation.
    DeleteReservation {
        /// The reservation.
        token: SpaceToken,
        /// Remove its files first instead of refusing.
        #[arg(long)]
        force: bool,
    },
    /// Run one expiry sweep now.
    Expire,
    /// Refresh link groups from the capacity file now.
    UpdateLinkGroups,
    /// Recompute the reserved space of every link group.
    FixReservedSpace,
    /// Recompute the used and allocated bytes of every reservation.
    FixSpaceUsage,
}
