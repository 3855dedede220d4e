//! Error types for `spacemgr`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error while interacting with the database.
///
/// Every function that touches the store returns this error (or wraps it in
/// [`Error::Persistence`]).  Whenever one of these is produced inside a write
/// transaction, the transaction has been rolled back.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DatabaseError {
    /// A low-level SQLite error has occurred.
    ///
    /// This covers lock timeouts (`SQLITE_BUSY` after the busy timeout has
    /// elapsed), constraint violations, I/O failures and everything else
    /// outlined in the SQLite and [`rusqlite`] documentation.
    #[error("low-level rusqlite error: {0}")]
    LowLevel(#[from] rusqlite::Error),

    /// The database can be accessed, but its content implies a schema
    /// version we do not support.
    ///
    /// An unrecognized schema is not the same as no schema: in the latter
    /// case we initialize the database, whereas here we fail early in order
    /// to not corrupt an existing one.
    #[error("incompatible schema version: {version}")]
    IncompatibleSchema {
        /// The incompatible schema version found in the database.
        version: String,
    },

    /// Obtaining a connection from the [`r2d2`] pool has failed.
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A stored value cannot be represented in our data model.
    #[error("corrupt database content: {what}")]
    Corrupt {
        /// What was wrong.
        what: String,
    },
}

/// An error returned by a space manager operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No link group or reservation has sufficient available capacity.
    #[error("no free space: {0}")]
    NoFreeSpace(String),

    /// The reservation is expired, or its lifetime has run out.
    #[error("space reservation {0} has expired")]
    SpaceExpired(crate::SpaceToken),

    /// The reservation was released.
    #[error("space reservation {0} was released")]
    SpaceReleased(crate::SpaceToken),

    /// The caller's VO identity does not match the allow-list or owner of the
    /// target.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A token, file or link group does not exist.
    #[error("{what} {key} not found")]
    NotFound {
        /// What kind of object we looked for.
        what: &'static str,
        /// The key we looked it up by.
        key: String,
    },

    /// The operation would violate a state machine or a size floor.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// A transient file with the same path is already placed in the
    /// reservation.
    #[error("a transient file {path:?} already exists in space reservation {token}")]
    Duplicate {
        /// The reservation.
        token: crate::SpaceToken,
        /// The path of the file.
        path: String,
    },

    /// A request parameter is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The space manager is switched off by configuration.
    #[error("space manager is disabled")]
    Disabled,

    /// The capacity feed could not be read.
    #[error("capacity feed failed")]
    CapacityFeed(#[source] crate::FeedError),

    /// The underlying transaction failed and was rolled back.
    #[error("persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    /// An internal invariant was broken.
    ///
    /// This is produced when a capacity counter would under- or overflow,
    /// which can only happen if the stored counters already disagree with
    /// each other.
    #[error("internal error: {0}")]
    Bug(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(DatabaseError::LowLevel(e))
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::Persistence(DatabaseError::Pool(e))
    }
}

impl Error {
    /// Return the [`ErrorKind`] to report to a remote caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoFreeSpace(_) => ErrorKind::NoFreeSpace,
            Error::SpaceExpired(_) => ErrorKind::SpaceExpired,
            Error::SpaceReleased(_) => ErrorKind::SpaceReleased,
            Error::Authorization(_) => ErrorKind::Authorization,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidStateTransition(_) => ErrorKind::InvalidStateTransition,
            Error::Duplicate { .. } | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Disabled => ErrorKind::Disabled,
            Error::CapacityFeed(_) => ErrorKind::Unavailable,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::Bug(_) => ErrorKind::Internal,
        }
    }

    /// Return true if retrying the same call may succeed.
    ///
    /// Only persistence and capacity feed failures qualify; everything else is a verdict on the
    /// request itself.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::CapacityFeed(_))
    }

    /// Construct a [`Error::NotFound`] for a space reservation.
    pub(crate) fn no_such_space(token: crate::SpaceToken) -> Self {
        Error::NotFound {
            what: "space reservation",
            key: token.to_string(),
        }
    }

    /// Construct a [`Error::NotFound`] for a file.
    pub(crate) fn no_such_file(key: impl ToString) -> Self {
        Error::NotFound {
            what: "file",
            key: key.to_string(),
        }
    }

    /// Construct a [`Error::NotFound`] for a link group.
    pub(crate) fn no_such_link_group(key: impl ToString) -> Self {
        Error::NotFound {
            what: "link group",
            key: key.to_string(),
        }
    }
}

/// The broad category of an [`Error`], as reported on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::NoFreeSpace`].
    NoFreeSpace,
    /// See [`Error::SpaceExpired`].
    SpaceExpired,
    /// See [`Error::SpaceReleased`].
    SpaceReleased,
    /// See [`Error::Authorization`].
    Authorization,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::InvalidStateTransition`].
    InvalidStateTransition,
    /// See [`Error::InvalidArgument`] and [`Error::Duplicate`].
    InvalidArgument,
    /// See [`Error::Disabled`].
    Disabled,
    /// See [`Error::CapacityFeed`].
    Unavailable,
    /// See [`Error::Persistence`].
    Persistence,
    /// See [`Error::Bug`].
    Internal,
}

/// An error related to an option passed via a configuration builder.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
    /// A single field had a value that proved to be unusable.
    #[error("Value of {field} was incorrect: {problem}")]
    Invalid {
        /// The name of the invalid field
        field: String,
        /// A description of the problem.
        problem: String,
    },
    /// Multiple fields are inconsistent.
    #[error("Fields {fields:?} are inconsistent: {problem}")]
    Inconsistent {
        /// The names of the inconsistent fields
        fields: Vec<String>,
        /// The problem that makes them inconsistent
        problem: String,
    },
}

impl From<derive_builder::UninitializedFieldError> for ConfigBuildError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        ConfigBuildError::MissingField {
            field: val.field_name().to_string(),
        }
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
    use super::*;
    use crate::SpaceToken;

    #[test]
    fn kinds() {
        assert_eq!(
            Error::SpaceReleased(SpaceToken::new(4)).kind(),
            ErrorKind::SpaceReleased
        );
        assert_eq!(Error::no_such_space(SpaceToken::new(4)).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::no_such_space(SpaceToken::new(4)).to_string(),
            "space reservation 4 not found"
        );
        assert_eq!(ErrorKind::NoFreeSpace.to_string(), "no_free_space");
    }

    #[test]
    fn retriable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(Error::from(busy).is_retriable());
        assert!(!Error::Disabled.is_retriable());
        assert!(!Error::NoFreeSpace("full".into()).is_retriable());
    }
}
