//! The daemon's configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use spacemgr::{SpaceManagerConfig, SpaceManagerConfigBuilder};

/// Everything `spacemgrd` reads from its TOML file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct DaemonConfig {
    /// Settings of the accounting engine itself.
    #[serde(default)]
    spacemgr: SpaceManagerConfigBuilder,

    /// Where the database lives.
    pub(crate) storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub(crate) logging: LoggingConfig,

    /// Where link group capacity comes from.
    #[serde(default)]
    pub(crate) capacity: CapacityConfig,
}

/// Configuration for where information is stored on disk.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct StorageConfig {
    /// The SQLite database file, shared by every process of this service.
    pub(crate) database: PathBuf,
}

/// Structure to hold our logging configuration options.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoggingConfig {
    /// Filtering directives for the console, as described at
    /// <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#impl-FromStr>
    ///
    /// You can override this setting with the -l, --log-level command line parameter.
    ///
    /// Example: "info,spacemgr=debug"
    pub(crate) console: Option<String>,
}

/// Configuration of the capacity feed.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct CapacityConfig {
    /// A TOML file listing the link groups, re-read on every refresh.
    ///
    /// Without one, the refresher does not run and link groups go stale.
    pub(crate) file: Option<PathBuf>,
}

impl DaemonConfig {
    /// Parse a configuration from TOML text.
    pub(crate) fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("malformed configuration")
    }

    /// Read and parse the configuration file at `path`.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Can't read configuration file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Return the validated engine configuration.
    pub(crate) fn spacemgr(&self) -> Result<SpaceManagerConfig> {
        self.spacemgr
            .build()
            .context("invalid [spacemgr] configuration")
    }
}
