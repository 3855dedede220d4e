//! Request and reply messages.
//!
//! Remote callers talk to a [`SpaceManager`] by sending an [`Envelope`]; the
//! manager answers with a [`Reply`] if the envelope asks for one.  Failures
//! travel as an [`ErrorKind`] plus a human-readable message.  Transfer
//! notifications usually arrive without asking for a reply.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::Subject;
use crate::err::{Error, ErrorKind};
use crate::manager::{
    FileQuery, ReserveAndUseRequest, ReserveRequest, SpaceFilter, SpaceManager, SpaceTokenQuery,
    SpaceUpdate, UseRequest,
};
use crate::types::{FileId, Lifetime, LinkGroup, Space, SpaceToken};

/// A request, with the note whether the sender waits for an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct Envelope {
    /// Whether a [`Reply`] is expected.
    #[serde(default = "reply_by_default")]
    pub reply_required: bool,
    /// The request.
    pub request: Request,
}

/// Default of [`Envelope::reply_required`].
fn reply_by_default() -> bool {
    true
}

/// Everything a remote caller may ask for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Request {
    /// Reserve space.
    Reserve(ReserveRequest),
    /// Place a file in a reservation.
    Use(UseRequest),
    /// Withdraw an unfinished file placement.
    CancelUse {
        /// The reservation.
        token: SpaceToken,
        /// Path of the file.
        path: String,
    },
    /// Release a reservation.
    Release {
        /// The reservation.
        token: SpaceToken,
        /// Who asks; `None` for an administrative release.
        #[serde(default)]
        subject: Option<Subject>,
    },
    /// Make a reservation live at least this much longer.
    ExtendLifetime {
        /// The reservation.
        token: SpaceToken,
        /// The wanted remaining lifetime.
        lifetime: Lifetime,
    },
    /// Change a reservation.
    UpdateReservation {
        /// The reservation.
        token: SpaceToken,
        /// Who asks; `None` for an administrative change.
        #[serde(default)]
        subject: Option<Subject>,
        /// The changes.
        update: SpaceUpdate,
    },
    /// Look up space tokens.
    GetSpaceTokens(SpaceTokenQuery),
    /// Look up the reservations holding some files.
    GetFileSpaceTokens(FileQuery),
    /// Return the reservations for a list of tokens.
    GetSpaceMetaData {
        /// The tokens.
        tokens: Vec<SpaceToken>,
    },
    /// Return every link group.
    ListLinkGroups,
    /// Return the reservations matching a filter.
    ListSpaceReservations(SpaceFilter),
    /// A transfer started.
    TransferStarted {
        /// The file.
        pnfs_id: String,
        /// Whether the mover started.
        success: bool,
    },
    /// A transfer ended.
    TransferFinished {
        /// The file.
        pnfs_id: String,
        /// The final size.
        size: u64,
        /// Whether the file was written.
        success: bool,
    },
    /// A file was written to tape.
    FileFlushed {
        /// The file.
        pnfs_id: String,
    },
    /// Files were deleted from the namespace.
    FilesRemoved {
        /// The files.
        pnfs_ids: Vec<String>,
    },
    /// A pool was chosen for a write.
    SelectPool {
        /// The reservation named by the client, if any.
        #[serde(default)]
        token: Option<SpaceToken>,
        /// Path of the file.
        path: String,
        /// The file.
        pnfs_id: String,
    },
    /// A write arrived without a reservation.
    ReserveAndUse(ReserveAndUseRequest),
}

/// A successful answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Response {
    /// The request had no result beyond succeeding.
    Done,
    /// A new reservation.
    Token(SpaceToken),
    /// A new file placement.
    File(FileId),
    /// A new implicit reservation and the file placed in it.
    ReservedAndUsed {
        /// The reservation.
        token: SpaceToken,
        /// The file.
        file: FileId,
    },
    /// A reservation.
    Space(Space),
    /// Space tokens.
    Tokens(Vec<SpaceToken>),
    /// Reservations by token; `None` for unknown tokens.
    SpaceMetaData(Vec<Option<Space>>),
    /// Link groups.
    LinkGroups(Vec<LinkGroup>),
    /// Reservations.
    Spaces(Vec<Space>),
}

/// The answer to an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(clippy::exhaustive_enums)]
pub enum Reply {
    /// The request succeeded.
    Ok(Response),
    /// The request failed.
    Failed {
        /// What kind of failure.
        kind: ErrorKind,
        /// A description.
        message: String,
    },
}

impl From<Result<Response, Error>> for Reply {
    fn from(res: Result<Response, Error>) -> Self {
        match res {
            Ok(r) => Reply::Ok(r),
            Err(e) => Reply::Failed {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

impl SpaceManager {
    /// Serve one request.
    ///
    /// Returns `None` if the envelope does not ask for a reply; failures are
    /// then only logged.
    pub fn handle(&self, envelope: Envelope) -> Option<Reply> {
        let res = self.dispatch(envelope.request);
        if let Err(e) = &res {
            if e.is_retriable() || matches!(e, Error::Bug(_)) {
                warn!(error = %e, "request failed");
            } else {
                debug!(error = %e, "request refused");
            }
        }
        envelope.reply_required.then(|| res.into())
    }

    /// Run the operation for `request`.
    fn dispatch(&self, request: Request) -> Result<Response, Error> {
        use Request as R;
        Ok(match request {
            R::Reserve(req) => Response::Token(self.reserve(&req)?),
            R::Use(req) => Response::File(self.use_space(&req)?),
            R::CancelUse { token, path } => {
                self.cancel_use(token, &path)?;
                Response::Done
            }
            R::Release { token, subject } => {
                self.release(token, subject.as_ref())?;
                Response::Done
            }
            R::ExtendLifetime { token, lifetime } => {
                self.extend_lifetime(token, lifetime)?;
                Response::Done
            }
            R::UpdateReservation {
                token,
                subject,
                update,
            } => Response::Space(self.update_reservation(token, &update, subject.as_ref())?),
            R::GetSpaceTokens(query) => Response::Tokens(self.get_space_tokens(&query)?),
            R::GetFileSpaceTokens(query) => Response::Tokens(self.get_file_space_tokens(&query)?),
            R::GetSpaceMetaData { tokens } => {
                Response::SpaceMetaData(self.get_space_metadata(&tokens)?)
            }
            R::ListLinkGroups => Response::LinkGroups(self.list_link_groups()?),
            R::ListSpaceReservations(filter) => {
                Response::Spaces(self.list_space_reservations(&filter)?)
            }
            R::TransferStarted { pnfs_id, success } => {
                self.transfer_started(&pnfs_id, success)?;
                Response::Done
            }
            R::TransferFinished {
                pnfs_id,
                size,
                success,
            } => {
                self.transfer_finished(&pnfs_id, size, success)?;
                Response::Done
            }
            R::FileFlushed { pnfs_id } => {
                self.file_flushed(&pnfs_id)?;
                Response::Done
            }
            R::FilesRemoved { pnfs_ids } => {
                for pnfs_id in &pnfs_ids {
                    self.file_removed(pnfs_id)?;
                }
                Response::Done
            }
            R::SelectPool {
                token,
                path,
                pnfs_id,
            } => {
                self.select_pool(token, &path, &pnfs_id)?;
                Response::Done
            }
            R::ReserveAndUse(req) => {
                let (token, file) = self.reserve_and_use(&req)?;
                Response::ReservedAndUsed { token, file }
            }
        })
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
    use tempfile::tempdir;

    use super::*;
    use crate::config::SpaceManagerConfig;

    #[test]
    fn wire_format() {
        let env: Envelope = serde_json::from_str(
            r#"{
                "request": {
                    "type": "release",
                    "body": { "token": 17, "subject": { "primary": { "group": "/atlas", "role": null } } }
                }
            }"#,
        )
        .unwrap();
        assert!(env.reply_required);
        assert_eq!(
            env.request,
            Request::Release {
                token: SpaceToken::new(17),
                subject: Some(Subject::from_fqan("/atlas").unwrap()),
            }
        );

        let reply = Reply::from(Err::<Response, _>(Error::no_such_space(SpaceToken::new(17))));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({
                "failed": { "kind": "not_found", "message": "space reservation 17 not found" }
            })
        );
    }

    #[test]
    fn handle() {
        let dir = tempdir().unwrap();
        let mgr = SpaceManager::open(dir.path().join("db"), SpaceManagerConfig::default()).unwrap();

        let reply = mgr.handle(Envelope {
            reply_required: true,
            request: Request::ListLinkGroups,
        });
        assert_eq!(reply, Some(Reply::Ok(Response::LinkGroups(vec![]))));

        let reply = mgr.handle(Envelope {
            reply_required: true,
            request: Request::CancelUse {
                token: SpaceToken::new(5),
                path: "/f".into(),
            },
        });
        assert!(matches!(
            reply,
            Some(Reply::Failed {
                kind: ErrorKind::NotFound,
                ..
            })
        ));

        // Notifications about unknown files are accepted silently.
        let reply = mgr.handle(Envelope {
            reply_required: false,
            request: Request::FilesRemoved {
                pnfs_ids: vec!["0000ABCD".into()],
            },
        });
        assert_eq!(reply, None);
    }
}
