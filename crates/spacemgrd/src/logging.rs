//! Configure tracing subscribers for spacemgrd.

use std::io::IsTerminal as _;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry};

use crate::cfg::LoggingConfig;

/// Filter used when neither the command line nor the configuration names one.
const DEFAULT_FILTER: &str = "info";

/// As [`Targets::from_str`], but wrapped in an [`anyhow::Result`].
fn filt_from_str_verbose(s: &str, source: &str) -> Result<Targets> {
    Targets::from_str(s).with_context(|| format!("in {}", source))
}

/// Pick the console filter: the command line wins over the configuration.
fn console_filter(config: &LoggingConfig, cli: Option<&str>) -> Result<Targets> {
    match (cli, config.console.as_deref()) {
        (Some(s), _) => filt_from_str_verbose(s, "--log-level command line parameter"),
        (None, Some(s)) if !s.is_empty() => filt_from_str_verbose(s, "logging.console"),
        _ => filt_from_str_verbose(DEFAULT_FILTER, "default filter"),
    }
}

/// Install a global subscriber writing to stderr.
pub(crate) fn setup_logging(config: &LoggingConfig, cli: Option<&str>) -> Result<()> {
    let filter = console_filter(config, cli)?;
    let layer = fmt::Layer::default()
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .with_filter(filter);
    registry()
        .with(layer)
        .try_init()
        .context("Unable to install the log subscriber")
}
