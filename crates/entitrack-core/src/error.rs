//! Error types for entitrack operations.

use crate::key::EntityKey;
use std::fmt;

/// The primary error type for all entitrack operations.
///
/// Every variant is fatal to the operation that raised it: no state is
/// changed before an error is returned.
#[derive(Debug)]
pub enum Error {
    /// Entity is already owned by a different session
    Ownership(OwnershipError),
    /// A different live instance already occupies this key in the session
    DuplicateIdentity { key: EntityKey },
    /// Entity is not present in the session's map
    UnknownEntity {
        key: EntityKey,
        operation: &'static str,
    },
    /// Cached related object disagrees with the stored foreign key
    StaleReference(StaleReferenceError),
    /// Relationship read that needs a session, on an entity that has none
    Detached {
        table: &'static str,
        relationship: String,
    },
    /// Operation is not allowed in the entity's current lifecycle state
    InvalidState {
        key: EntityKey,
        state: &'static str,
        operation: &'static str,
    },
    /// Structural collection edit other than add/remove/move
    UnsupportedEdit {
        collection: String,
        edit: &'static str,
    },
    /// Session has been closed
    SessionClosed { session: uuid::Uuid },
    /// Storage backend failure
    Storage(StorageError),
    /// Schema descriptor errors
    Schema(SchemaError),
    /// Type conversion errors
    Type(TypeError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct OwnershipError {
    pub key: EntityKey,
    pub table: &'static str,
    /// Session that currently owns the entity
    pub owner: uuid::Uuid,
    /// Session that tried to attach it
    pub requested_by: uuid::Uuid,
}

#[derive(Debug)]
pub struct StaleReferenceError {
    pub table: &'static str,
    pub relationship: String,
    /// Key held in the foreign-key column
    pub stored: Option<EntityKey>,
    /// Key of the cached object
    pub cached: EntityKey,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub sql: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Statement could not be understood by the backend
    Syntax,
    /// Table or column not found
    NotFound,
    /// Constraint violation
    Constraint,
    /// Transaction misuse (nested begin, commit without begin)
    Transaction,
    /// Write rejected by the backend
    Write,
    /// Other backend error
    Backend,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table not registered
    TableNotFound,
    /// Column or navigation not found
    ColumnNotFound,
    /// Table registered twice
    DuplicateTable,
    /// Invalid descriptor
    Invalid,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

impl Error {
    /// Build a storage error with no SQL attached.
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind,
            message: message.into(),
            sql: None,
            source: None,
        })
    }

    /// Build a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Build a type error for a named column.
    pub fn column_type(
        column: impl Into<String>,
        expected: &'static str,
        actual: impl Into<String>,
    ) -> Self {
        Error::Type(TypeError {
            expected,
            actual: actual.into(),
            column: Some(column.into()),
            rust_type: None,
        })
    }

    /// Is this a storage backend failure?
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Does this error indicate internal relationship inconsistency?
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, Error::StaleReference(_) | Error::DuplicateIdentity { .. })
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Storage(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl StorageError {
    /// Attach the offending statement.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Ownership(e) => write!(f, "Ownership conflict: {}", e),
            Error::DuplicateIdentity { key } => write!(
                f,
                "Duplicate identity: another instance of {} is already tracked",
                key
            ),
            Error::UnknownEntity { key, operation } => {
                write!(f, "Unknown entity {} in {}", key, operation)
            }
            Error::StaleReference(e) => write!(f, "Stale reference: {}", e),
            Error::Detached {
                table,
                relationship,
            } => write!(
                f,
                "Relationship '{}.{}' needs a session but the entity is detached",
                table, relationship
            ),
            Error::InvalidState {
                key,
                state,
                operation,
            } => write!(f, "Cannot {} entity {} in state {}", operation, key, state),
            Error::UnsupportedEdit { collection, edit } => write!(
                f,
                "Unsupported edit '{}' on collection '{}': only add, remove and move are allowed",
                edit, collection
            ),
            Error::SessionClosed { session } => write!(f, "Session {} is closed", session),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for OwnershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} belongs to session {}, not {}",
            self.table, self.key, self.owner, self.requested_by
        )
    }
}

impl fmt::Display for StaleReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stored {
            Some(stored) => write!(
                f,
                "{}.{} caches {} but stores {}",
                self.table, self.relationship, self.cached, stored
            ),
            None => write!(
                f,
                "{}.{} caches {} but stores NULL",
                self.table, self.relationship, self.cached
            ),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} (in `{}`)", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<OwnershipError> for Error {
    fn from(err: OwnershipError) -> Self {
        Error::Ownership(err)
    }
}

impl From<StaleReferenceError> for Error {
    fn from(err: StaleReferenceError) -> Self {
        Error::StaleReference(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for entitrack operations.
pub type Result<T> = std::result::Result<T, Error>;
