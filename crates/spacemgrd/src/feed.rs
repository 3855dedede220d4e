//! A capacity feed backed by a TOML file.
//!
//! The file lists one `[[link_group]]` table per link group:
//!
//! ```toml
//! [[link_group]]
//! name = "atlas-disk"
//! available = 50000000000000
//! online_allowed = true
//! replica_allowed = true
//! ```
//!
//! Omitted flags are false.  The file is re-read on every refresh, so an
//! operator (or a script exporting the pool manager's view) can rewrite it
//! at any time.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use spacemgr::{CapacityFeed, FeedError, LinkGroupReport};

/// The contents of a capacity file.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct CapacityFile {
    /// Every link group.
    #[serde(default)]
    link_group: Vec<LinkGroupReport>,
}

/// Reports whatever the capacity file currently says.
#[derive(Debug, Clone)]
pub(crate) struct FileCapacityFeed {
    /// The file.
    path: PathBuf,
}

impl FileCapacityFeed {
    /// Create a feed reading `path`.
    pub(crate) fn new(path: impl AsRef<Path>) -> Self {
        FileCapacityFeed {
            path: path.as_ref().to_owned(),
        }
    }
}

/// Parse the text of a capacity file.
fn parse(text: &str) -> Result<Vec<LinkGroupReport>, FeedError> {
    let file: CapacityFile =
        toml::from_str(text).map_err(|e| FeedError::Malformed(e.to_string()))?;
    Ok(file.link_group)
}

#[async_trait]
impl CapacityFeed for FileCapacityFeed {
    async fn link_groups(&self) -> Result<Vec<LinkGroupReport>, FeedError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FeedError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        parse(&text)
    }
}
