//! The link group authorization file.
//!
//! The file lists, for each link group, the FQAN patterns allowed to
//! reserve in it:
//!
//! ```text
//! # comments start with '#'
//! LinkGroup atlas-lg
//! /atlas/Role=production
//! /atlas/higgs
//!
//! LinkGroup open-lg
//! */Role=*
//! ```
//!
//! A record starts with a `LinkGroup <name>` line and ends at the next blank
//! line (or the next `LinkGroup` line).  A pattern without `/Role=` matches
//! any role.  A link group listed twice gets the union of its records.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::auth::VoRule;
use crate::err::Error;

/// The keyword starting a record.
const LINK_GROUP_KEYWORD: &str = "LinkGroup";

/// Allow-lists by link group name.
pub type AuthorizationRules = HashMap<String, Vec<VoRule>>;

/// Parse the content of an authorization file.
pub fn parse_authorization_file(text: &str) -> Result<AuthorizationRules, Error> {
    let mut rules = AuthorizationRules::new();
    let mut current: Option<String> = None;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            current = None;
            continue;
        }

        let mut words = line.split_whitespace();
        if words.next() == Some(LINK_GROUP_KEYWORD) {
            let name = match (words.next(), words.next()) {
                (Some(name), None) => name,
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "line {}: expected `{} <name>`",
                        lineno + 1,
                        LINK_GROUP_KEYWORD
                    )))
                }
            };
            rules.entry(name.to_owned()).or_default();
            current = Some(name.to_owned());
            continue;
        }

        let Some(name) = &current else {
            return Err(Error::InvalidArgument(format!(
                "line {}: FQAN outside of a {} record",
                lineno + 1,
                LINK_GROUP_KEYWORD
            )));
        };
        let rule: VoRule = line.parse().map_err(|e| {
            Error::InvalidArgument(format!("line {}: {}", lineno + 1, e))
        })?;
        let entry = rules.entry(name.clone()).or_default();
        if !entry.contains(&rule) {
            entry.push(rule);
        }
    }
    Ok(rules)
}

/// A parsed authorization file, together with the modification time it was
/// read at.
#[derive(Debug)]
struct Snapshot {
    /// Modification time of the file when it was read.
    mtime: SystemTime,
    /// What it contained.
    rules: Arc<AuthorizationRules>,
}

/// An authorization file on disk, re-read whenever it changes.
#[derive(Debug)]
pub struct AuthorizationFile {
    /// Where the file lives.
    path: PathBuf,
    /// The last successfully parsed content.
    cache: Mutex<Option<Snapshot>>,
}

impl AuthorizationFile {
    /// Create a handle for the file at `path`.  Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AuthorizationFile {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Return the path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the current rules, re-reading the file if its modification
    /// time changed since the last read.
    ///
    /// If the file cannot be read or parsed but an earlier version was, the
    /// earlier rules are kept and a warning is logged.
    pub fn rules(&self) -> Result<Arc<AuthorizationRules>, Error> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mtime = fs::metadata(&self.path).and_then(|m| m.modified());

        if let (Ok(mtime), Some(snapshot)) = (&mtime, cache.as_ref()) {
            if *mtime == snapshot.mtime {
                return Ok(Arc::clone(&snapshot.rules));
            }
        }

        let loaded = mtime
            .map_err(|e| self.io_error(&e))
            .and_then(|mtime| {
                let text = fs::read_to_string(&self.path).map_err(|e| self.io_error(&e))?;
                Ok((mtime, parse_authorization_file(&text)?))
            });
        match (loaded, cache.as_ref()) {
            (Ok((mtime, rules)), _) => {
                info!(path = %self.path.display(), link_groups = rules.len(), "loaded link group authorization file");
                let rules = Arc::new(rules);
                *cache = Some(Snapshot {
                    mtime,
                    rules: Arc::clone(&rules),
                });
                Ok(rules)
            }
            (Err(e), Some(snapshot)) => {
                warn!(path = %self.path.display(), error = %e, "keeping previous link group authorization");
                Ok(Arc::clone(&snapshot.rules))
            }
            (Err(e), None) => {
                debug!(path = %self.path.display(), error = %e, "no usable link group authorization");
                Err(e)
            }
        }
    }

    /// Describe an I/O failure on the file.
    fn io_error(&self, e: &std::io::Error) -> Error {
        Error::InvalidArgument(format!("cannot read {}: {}", self.path.display(), e))
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
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::auth::VoMatch;

    const SAMPLE: &str = "
# production first
LinkGroup atlas-lg
/atlas/Role=production
/atlas/higgs   # any role

LinkGroup open-lg
*/Role=*

LinkGroup atlas-lg
/atlas/Role=production
/atlas/Role=pilot
";

    #[test]
    fn parse() {
        let rules = parse_authorization_file(SAMPLE).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules["atlas-lg"],
            vec![
                VoRule::from_stored("/atlas", "production"),
                VoRule {
                    group: VoMatch::Exact("/atlas/higgs".into()),
                    role: VoMatch::Any,
                },
                VoRule::from_stored("/atlas", "pilot"),
            ]
        );
        assert_eq!(rules["open-lg"], vec![VoRule::any()]);
    }

    #[test]
    fn parse_errors() {
        assert!(parse_authorization_file("/atlas/Role=x\n").is_err());
        assert!(parse_authorization_file("LinkGroup\n").is_err());
        assert!(parse_authorization_file("LinkGroup a b\n").is_err());
        assert!(parse_authorization_file("LinkGroup a\n/atlas/Role=\n").is_err());
        // An empty record is fine: nobody may reserve there.
        let rules = parse_authorization_file("LinkGroup a\n").unwrap();
        assert!(rules["a"].is_empty());
    }

    #[test]
    fn reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LinkGroupAuthorization.conf");
        let file = AuthorizationFile::new(&path);
        assert!(file.rules().is_err());

        fs::write(&path, "LinkGroup a\n*/Role=*\n").unwrap();
        assert_eq!(file.rules().unwrap()["a"], vec![VoRule::any()]);

        // A broken file keeps the previous content.
        fs::write(&path, "/atlas\n").unwrap();
        bump_mtime(&path, 10);
        assert_eq!(file.rules().unwrap()["a"], vec![VoRule::any()]);

        fs::write(&path, "LinkGroup b\n/cms\n").unwrap();
        bump_mtime(&path, 20);
        let rules = file.rules().unwrap();
        assert!(!rules.contains_key("a"));
        assert_eq!(rules["b"].len(), 1);
    }

    /// Move the modification time of `path` forward, so that a rewrite
    /// within the timestamp granularity is still noticed.
    fn bump_mtime(path: &Path, secs: u64) {
        let f = fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }
}
