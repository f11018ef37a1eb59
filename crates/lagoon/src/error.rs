use derive_more::Display;
use lagoon_core::{ErrorClass, ErrorOrigin as CoreErrorOrigin, InternalError};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

///
/// Error
/// Public error type. `kind` renders as the stable string prefix callers
/// match on (`fk-missing`, `not-found`, ...); `message` carries context.
///

#[derive(Clone, Debug, Deserialize, Serialize, ThisError)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub origin: ErrorOrigin,
    pub message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin,
            message: message.into(),
        }
    }

    /// True when the rendered error starts with the given stable prefix.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.kind.to_string() == prefix
    }
}

///
/// ErrorKind
/// Public error taxonomy with stable string prefixes.
///

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    #[display("schema-invalid")]
    SchemaInvalid,
    #[display("fk-missing")]
    FkMissing,
    #[display("fk-restrict")]
    FkRestrict,
    #[display("not-found")]
    NotFound,
    #[display("relation-conflict")]
    RelationConflict,
    #[display("unknown-index")]
    UnknownIndex,
    #[display("unknown-event")]
    UnknownEvent,
    #[display("range-invalid")]
    RangeInvalid,
    #[display("store-error")]
    Store,
    #[display("internal")]
    Internal,
}

///
/// ErrorOrigin
/// Public origin taxonomy naming the engine component that raised the
/// error.
///

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum ErrorOrigin {
    #[display("adapter")]
    Adapter,
    #[display("capability")]
    Capability,
    #[display("cursor")]
    Cursor,
    #[display("database")]
    Database,
    #[display("facade")]
    Facade,
    #[display("foreign_key")]
    ForeignKey,
    #[display("range")]
    Range,
    #[display("relation")]
    Relation,
    #[display("schema")]
    Schema,
    #[display("selector")]
    Selector,
    #[display("tabs")]
    Tabs,
    #[display("task")]
    Task,
}

impl From<ErrorClass> for ErrorKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::SchemaInvalid => Self::SchemaInvalid,
            ErrorClass::FkMissing => Self::FkMissing,
            ErrorClass::FkRestrict => Self::FkRestrict,
            ErrorClass::NotFound => Self::NotFound,
            ErrorClass::RelationConflict => Self::RelationConflict,
            ErrorClass::UnknownIndex => Self::UnknownIndex,
            ErrorClass::UnknownEvent => Self::UnknownEvent,
            ErrorClass::RangeInvalid => Self::RangeInvalid,
            ErrorClass::Store => Self::Store,
            ErrorClass::Internal => Self::Internal,
        }
    }
}

impl From<ErrorKind> for ErrorClass {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::SchemaInvalid => Self::SchemaInvalid,
            ErrorKind::FkMissing => Self::FkMissing,
            ErrorKind::FkRestrict => Self::FkRestrict,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::RelationConflict => Self::RelationConflict,
            ErrorKind::UnknownIndex => Self::UnknownIndex,
            ErrorKind::UnknownEvent => Self::UnknownEvent,
            ErrorKind::RangeInvalid => Self::RangeInvalid,
            ErrorKind::Store => Self::Store,
            ErrorKind::Internal => Self::Internal,
        }
    }
}

impl From<CoreErrorOrigin> for ErrorOrigin {
    fn from(origin: CoreErrorOrigin) -> Self {
        match origin {
            CoreErrorOrigin::Adapter => Self::Adapter,
            CoreErrorOrigin::Capability => Self::Capability,
            CoreErrorOrigin::Cursor => Self::Cursor,
            CoreErrorOrigin::Database => Self::Database,
            CoreErrorOrigin::Facade => Self::Facade,
            CoreErrorOrigin::ForeignKey => Self::ForeignKey,
            CoreErrorOrigin::Range => Self::Range,
            CoreErrorOrigin::Relation => Self::Relation,
            CoreErrorOrigin::Schema => Self::Schema,
            CoreErrorOrigin::Selector => Self::Selector,
            CoreErrorOrigin::Tabs => Self::Tabs,
            CoreErrorOrigin::Task => Self::Task,
        }
    }
}

impl From<ErrorOrigin> for CoreErrorOrigin {
    fn from(origin: ErrorOrigin) -> Self {
        match origin {
            ErrorOrigin::Adapter => Self::Adapter,
            ErrorOrigin::Capability => Self::Capability,
            ErrorOrigin::Cursor => Self::Cursor,
            ErrorOrigin::Database => Self::Database,
            ErrorOrigin::Facade => Self::Facade,
            ErrorOrigin::ForeignKey => Self::ForeignKey,
            ErrorOrigin::Range => Self::Range,
            ErrorOrigin::Relation => Self::Relation,
            ErrorOrigin::Schema => Self::Schema,
            ErrorOrigin::Selector => Self::Selector,
            ErrorOrigin::Tabs => Self::Tabs,
            ErrorOrigin::Task => Self::Task,
        }
    }
}

impl From<InternalError> for Error {
    fn from(err: InternalError) -> Self {
        Self {
            kind: err.class.into(),
            origin: err.origin.into(),
            message: err.message,
        }
    }
}

impl From<Error> for InternalError {
    fn from(err: Error) -> Self {
        Self::new(err.kind.into(), err.origin.into(), err.message)
    }
}
