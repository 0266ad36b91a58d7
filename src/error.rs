//! Error taxonomy for storage and synchronization.

use crate::document::Operation;

/// The two ways a create can collide with an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AlreadyExistsReason {
    /// A document with the same id exists.
    #[strum(serialize = "id")]
    Id,
    /// The slug is taken by a different document.
    #[strum(serialize = "slug")]
    Slug,
}

/// Two writers raced on the same operation index.
///
/// Carries the operation that is already committed in storage and the one
/// that was rejected, so the caller can inspect both sides of the race.
#[derive(Debug, Clone)]
pub struct ConflictOperationError {
    pub document_id: String,
    pub existing_operation: Operation,
    pub new_operation: Operation,
}

impl std::fmt::Display for ConflictOperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "conflicting operation on document {} at index {} ({}/{})",
            self.document_id,
            self.new_operation.index,
            self.new_operation.scope,
            self.new_operation.branch
        )
    }
}

impl std::error::Error for ConflictOperationError {}

/// Error returned by [`crate::store::DocumentStorage`] operations.
///
/// Validation and not-found variants are terminal for the caller; conflicts
/// are a business-logic signal and are never retried anywhere in the stack.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No document with this id (or slug) exists.
    #[error("document not found: {0}")]
    NotFound(String),
    /// A document with this id or slug already exists.
    #[error("document {id} already exists ({reason})")]
    AlreadyExists {
        id: String,
        reason: AlreadyExistsReason,
    },
    /// The document id is not in the accepted format.
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),
    /// The slug is not in the accepted format.
    #[error("invalid slug: {0:?}")]
    InvalidSlug(String),
    /// An operation index is already occupied.
    #[error(transparent)]
    Conflict(#[from] ConflictOperationError),
    /// An appended operation does not continue the log.
    #[error("operation at index {index} does not follow revision {revision} of {document_id} (skip {skip})")]
    InvalidOperationIndex {
        document_id: String,
        index: u64,
        skip: u64,
        revision: u64,
    },
    /// The call was cancelled before completing.
    #[error("operation aborted")]
    Aborted,
    /// A parent/child association is not allowed.
    #[error("invalid association of {child} with {parent}: {reason}")]
    InvalidAssociation {
        parent: String,
        child: String,
        reason: AssociationErrorReason,
    },
    /// The transaction retry budget was exhausted.
    #[error("transaction retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    /// Any other backend failure (I/O, encoding, database).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Why `add_child` rejected an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AssociationErrorReason {
    #[strum(serialize = "a document cannot contain itself")]
    SelfReference,
    #[strum(serialize = "the child already contains the parent")]
    Cycle,
}

impl StorageError {
    /// True for the variants the caller is expected to handle as a normal
    /// outcome rather than an infrastructure fault.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }

    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StorageError::Backend(err.into())
    }
}

/// Error from a document model reducer.
#[derive(Debug, thiserror::Error)]
pub enum ReducerError {
    #[error("unknown action type: {0}")]
    UnknownAction(String),
    #[error("invalid input for {action}: {message}")]
    InvalidInput { action: String, message: String },
    #[error("document type {0} is not registered")]
    UnknownDocumentType(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
