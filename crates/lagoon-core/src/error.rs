use std::fmt;
use thiserror::Error as ThisError;

///
/// InternalError
/// Structured runtime error with a stable internal classification.
/// The `class` label is the stable string prefix callers may match on.
///

#[derive(Clone, Debug, ThisError)]
#[error("{class}: {message}")]
pub struct InternalError {
    pub class: ErrorClass,
    pub origin: ErrorOrigin,
    pub message: String,
}

impl InternalError {
    pub fn new(class: ErrorClass, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            class,
            origin,
            message: message.into(),
        }
    }

    /// Raw failure from the store capability, wrapped with its message as cause.
    pub fn store(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Store, origin, message)
    }

    pub fn not_found(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, origin, message)
    }

    /// Engine bug surfaced as an error rather than a panic.
    pub fn internal(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, origin, message)
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.class, ErrorClass::NotFound)
    }

    #[must_use]
    pub fn display_with_origin(&self) -> String {
        format!("{}:{}: {}", self.origin, self.class, self.message)
    }
}

///
/// ErrorClass
/// Internal error taxonomy. Display labels are the stable prefixes
/// exposed to callers for programmatic recognition.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    SchemaInvalid,
    FkMissing,
    FkRestrict,
    NotFound,
    RelationConflict,
    UnknownIndex,
    UnknownEvent,
    RangeInvalid,
    Store,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SchemaInvalid => "schema-invalid",
            Self::FkMissing => "fk-missing",
            Self::FkRestrict => "fk-restrict",
            Self::NotFound => "not-found",
            Self::RelationConflict => "relation-conflict",
            Self::UnknownIndex => "unknown-index",
            Self::UnknownEvent => "unknown-event",
            Self::RangeInvalid => "range-invalid",
            Self::Store => "store-error",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Internal origin taxonomy naming the engine component that raised
/// the error. Not a stable API; may change without notice.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Adapter,
    Capability,
    Cursor,
    Database,
    Facade,
    ForeignKey,
    Range,
    Relation,
    Schema,
    Selector,
    Tabs,
    Task,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Adapter => "adapter",
            Self::Capability => "capability",
            Self::Cursor => "cursor",
            Self::Database => "database",
            Self::Facade => "facade",
            Self::ForeignKey => "foreign_key",
            Self::Range => "range",
            Self::Relation => "relation",
            Self::Schema => "schema",
            Self::Selector => "selector",
            Self::Tabs => "tabs",
            Self::Task => "task",
        };
        write!(f, "{label}")
    }
}
