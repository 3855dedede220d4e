//! The administrative subcommands.
//!
//! Each one runs a single library operation against the shared database
//! and prints the outcome on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use spacemgr::{
    AccessLatency, AdminReserveRequest, FileId, FileQuery, FileState, InvalidSpaceQuery, Lifetime,
    LinkGroup, Refresher, RemoveFilesQuery, RetentionPolicy, Space, SpaceFile, SpaceFilter,
    SpaceManager, SpaceState, SpaceToken, SpaceUpdate, VoOwner,
};

use crate::cfg::DaemonConfig;
use crate::feed::FileCapacityFeed;

/// Parse a lifetime given on the command line: `infinite`, `-1`, or a
/// duration such as `3days 12h`.
pub(crate) fn parse_lifetime(s: &str) -> Result<Lifetime, String> {
    match s.trim() {
        "infinite" | "-1" => Ok(Lifetime::Infinite),
        s => humantime::parse_duration(s)
            .map(Lifetime::Finite)
            .map_err(|e| format!("{} (expected a duration or \"infinite\")", e)),
    }
}

/// Arguments of `ls`.
#[derive(Debug, Clone, Args)]
pub(crate) struct LsArgs {
    /// Only reservations in this state (RESERVED, RELEASED or EXPIRED).
    #[arg(long)]
    state: Option<SpaceState>,
    /// Only reservations in the link group of this name.
    #[arg(long = "lg")]
    link_group: Option<String>,
    /// Only reservations owned by this VO group.
    #[arg(long)]
    group: Option<String>,
    /// Only reservations owned by this VO role.
    #[arg(long)]
    role: Option<String>,
    /// Only reservations with this description.
    #[arg(long)]
    description: Option<String>,
    /// Show at most this many reservations.
    #[arg(long)]
    limit: Option<usize>,
}

/// Arguments of `ls-file-space-tokens`.
#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub(crate) struct FileSpaceTokensArgs {
    /// Look files up by namespace identity.
    #[arg(long)]
    pnfsid: Option<String>,
    /// Look files up by path.
    #[arg(long)]
    path: Option<String>,
}

/// Arguments of `ls-invalid`.
#[derive(Debug, Clone, Args)]
pub(crate) struct InvalidArgs {
    /// List expired reservations.
    #[arg(short = 'e', long)]
    expired: bool,
    /// List released reservations.
    #[arg(short = 'r', long)]
    released: bool,
    /// Show at most this many reservations, newest first.
    #[arg(default_value_t = 1000)]
    limit: usize,
}

/// Arguments of `reserve`.
#[derive(Debug, Clone, Args)]
pub(crate) struct ReserveArgs {
    /// Name of the link group to reserve in.
    #[arg(long = "lg")]
    link_group: String,
    /// Size in bytes.
    #[arg(long)]
    size: u64,
    /// Lifetime, or "infinite".
    #[arg(long, value_parser = parse_lifetime, default_value = "infinite")]
    lifetime: Lifetime,
    /// Owning VO group; unrestricted if absent.
    #[arg(long)]
    group: Option<String>,
    /// Owning VO role; unrestricted if absent.
    #[arg(long)]
    role: Option<String>,
    /// Access latency (ONLINE or NEARLINE).
    #[arg(long = "al")]
    access_latency: Option<AccessLatency>,
    /// Retention policy (REPLICA, OUTPUT or CUSTODIAL).
    #[arg(long = "rp")]
    retention_policy: Option<RetentionPolicy>,
    /// Description.
    #[arg(long)]
    description: Option<String>,
}

/// Arguments of `update-space-reservation`.
#[derive(Debug, Clone, Args)]
pub(crate) struct UpdateArgs {
    /// The reservation.
    token: SpaceToken,
    /// New size in bytes.
    #[arg(long)]
    size: Option<u64>,
    /// New lifetime, counted from the creation time.
    #[arg(long, value_parser = parse_lifetime)]
    lifetime: Option<Lifetime>,
    /// New description.
    #[arg(long)]
    description: Option<String>,
}

/// Arguments of `remove-files-from-space`.
#[derive(Debug, Clone, Args)]
pub(crate) struct RemoveFilesArgs {
    /// The reservation.
    token: SpaceToken,
    /// Remove expired RESERVED files.
    #[arg(short = 'r')]
    reserved: bool,
    /// Remove expired TRANSFERRING files.
    #[arg(short = 't')]
    transferring: bool,
    /// Remove expired STORED files.
    #[arg(short = 's')]
    stored: bool,
    /// Remove expired FLUSHED files.
    #[arg(short = 'f')]
    flushed: bool,
}

/// Print a reservation on one line.
fn print_space(space: &Space) {
    println!(
        "{} {} lg:{} group:{} role:{} {}/{} size:{} used:{} allocated:{} created:{} lifetime:{} desc:{}",
        space.id(),
        space.state(),
        space.link_group_id(),
        space.vo_group().as_deref().unwrap_or("*"),
        space.vo_role().as_deref().unwrap_or("*"),
        space.retention_policy(),
        space.access_latency(),
        space.size(),
        space.used(),
        space.allocated(),
        space.creation_time(),
        space.lifetime(),
        space.description().as_deref().unwrap_or(""),
    );
}

/// Print a link group and its allow-list.
fn print_link_group(lg: &LinkGroup) {
    let flags = lg.flags();
    let classes: Vec<&str> = [
        (flags.online_allowed, "online"),
        (flags.nearline_allowed, "nearline"),
        (flags.replica_allowed, "replica"),
        (flags.output_allowed, "output"),
        (flags.custodial_allowed, "custodial"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    println!(
        "{} {} free:{} reserved:{} available:{} updated:{} [{}]",
        lg.id(),
        lg.name(),
        lg.free_space(),
        lg.reserved_space(),
        lg.available_space(),
        lg.last_update_time(),
        classes.join(","),
    );
    for rule in lg.vo_rules() {
        println!("    {}", rule);
    }
}

/// Print a file placement on one line.
fn print_file(file: &SpaceFile) {
    println!(
        "{} space:{} {} size:{} created:{} lifetime:{} pnfsid:{} path:{}{}",
        file.id(),
        file.space_id(),
        file.state(),
        file.size(),
        file.creation_time(),
        file.lifetime(),
        file.pnfs_id().as_deref().unwrap_or("-"),
        file.path().as_deref().unwrap_or("-"),
        if file.deleted() { " (deleted)" } else { "" },
    );
}

/// Run `ls`.
pub(crate) fn ls(mgr: &SpaceManager, args: LsArgs) -> Result<()> {
    let filter = SpaceFilter {
        state: args.state,
        link_group: args.link_group,
        vo_group: args.group,
        vo_role: args.role,
        description: args.description,
        limit: args.limit,
    };
    let spaces = mgr.list_space_reservations(&filter)?;
    spaces.iter().for_each(print_space);
    println!("{} reservations.", spaces.len());
    Ok(())
}

/// Run `ls-link-groups`.
pub(crate) fn ls_link_groups(mgr: &SpaceManager) -> Result<()> {
    mgr.list_link_groups()?.iter().for_each(print_link_group);
    Ok(())
}

/// Run `ls-files`.
pub(crate) fn ls_files(mgr: &SpaceManager, token: SpaceToken) -> Result<()> {
    mgr.list_files(token)?.iter().for_each(print_file);
    Ok(())
}

/// Run `ls-file-space-tokens`.
pub(crate) fn ls_file_space_tokens(mgr: &SpaceManager, args: FileSpaceTokensArgs) -> Result<()> {
    let query = match (args.pnfsid, args.path) {
        (Some(id), _) => FileQuery::PnfsId(id),
        (None, Some(path)) => FileQuery::Path(path),
        (None, None) => return Err(anyhow!("either --pnfsid or --path is required")),
    };
    for token in mgr.get_file_space_tokens(&query)? {
        println!("{}", token);
    }
    Ok(())
}

/// Run `ls-invalid`.
pub(crate) fn ls_invalid(mgr: &SpaceManager, args: &InvalidArgs) -> Result<()> {
    // Neither flag means both.
    let both = !args.expired && !args.released;
    let query = InvalidSpaceQuery {
        expired: args.expired || both,
        released: args.released || both,
        limit: args.limit,
    };
    mgr.list_invalid_spaces(&query)?.iter().for_each(print_space);
    Ok(())
}

/// Run `reserve`.
pub(crate) fn reserve(mgr: &SpaceManager, args: ReserveArgs) -> Result<()> {
    let token = mgr.admin_reserve(&AdminReserveRequest {
        link_group: args.link_group,
        owner: VoOwner {
            group: args.group,
            role: args.role,
        },
        size: args.size,
        access_latency: args.access_latency,
        retention_policy: args.retention_policy,
        lifetime: args.lifetime,
        description: args.description,
    })?;
    println!("{}", token);
    Ok(())
}

/// Run `update-space-reservation`.
pub(crate) fn update(mgr: &SpaceManager, args: UpdateArgs) -> Result<()> {
    let update = SpaceUpdate {
        size: args.size,
        lifetime: args.lifetime,
        description: args.description,
        ..Default::default()
    };
    let space = mgr.update_reservation(args.token, &update, None)?;
    print_space(&space);
    Ok(())
}

/// Run `remove-files-from-space`.
pub(crate) fn remove_files(mgr: &SpaceManager, args: &RemoveFilesArgs) -> Result<()> {
    let states = [
        (args.reserved, FileState::Reserved),
        (args.transferring, FileState::Transferring),
        (args.stored, FileState::Stored),
        (args.flushed, FileState::Flushed),
    ]
    .into_iter()
    .filter_map(|(on, state)| on.then_some(state))
    .collect();
    let removed = mgr.remove_expired_files(&RemoveFilesQuery {
        token: args.token,
        states,
    })?;
    println!("Removed {} files.", removed);
    Ok(())
}

/// Run `remove-file`.
pub(crate) fn remove_file(mgr: &SpaceManager, id: FileId) -> Result<()> {
    mgr.remove_file(id)?;
    Ok(())
}

/// Run `expire`: one sweep, now.
pub(crate) fn expire(mgr: &SpaceManager) -> Result<()> {
    let report = mgr.expire_once()?;
    println!(
        "Expired {} reservations, removed {} files, {} failures.",
        report.spaces_expired, report.files_removed, report.failures
    );
    Ok(())
}

/// Run `update-link-groups`: one refresher pass, now.
pub(crate) fn update_link_groups(config: &DaemonConfig, mgr: Arc<SpaceManager>) -> Result<()> {
    let path = config
        .capacity
        .file
        .as_ref()
        .context("No capacity file configured ([capacity] file)")?;
    let refresher = Refresher::new(mgr, Arc::new(FileCapacityFeed::new(path)));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Unable to start the async runtime")?;
    let report = runtime.block_on(refresher.refresh_once())?;
    println!(
        "Created {} link groups, updated {}, {} failures.",
        report.created, report.updated, report.failed
    );
    Ok(())
}

/// Run `fix-reserved-space`.
pub(crate) fn fix_reserved_space(mgr: &SpaceManager) -> Result<()> {
    let fixed = mgr.fix_reserved_space()?;
    println!("Corrected the reserved space of {} link groups.", fixed);
    Ok(())
}

/// Run `fix-space-usage`.
pub(crate) fn fix_space_usage(mgr: &SpaceManager) -> Result<()> {
    let fixed = mgr.fix_space_usage()?;
    println!("Corrected the usage of {} reservations.", fixed);
    Ok(())
}

/// Run `extend-lifetime`.
pub(crate) fn extend_lifetime(
    mgr: &SpaceManager,
    token: SpaceToken,
    lifetime: Lifetime,
) -> Result<()> {
    mgr.extend_lifetime(token, lifetime)?;
    let space = mgr.get_space(token)?;
    match space.remaining_lifetime(mgr.now()) {
        Some(left) => println!(
            "{} expires in {}.",
            token,
            humantime::format_duration(Duration::from_secs(left.as_secs()))
        ),
        None => println!("{} never expires.", token),
    }
    Ok(())
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
    fn lifetimes() {
        assert_eq!(parse_lifetime("infinite").unwrap(), Lifetime::Infinite);
        assert_eq!(parse_lifetime("-1").unwrap(), Lifetime::Infinite);
        assert_eq!(
            parse_lifetime("1h 30m").unwrap(),
            Lifetime::Finite(Duration::from_secs(5400))
        );
        assert!(parse_lifetime("soon").is_err());
    }
}
