use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error as ThisError;
use ulid::Ulid;

#[non_exhaustive]
#[derive(Clone, Debug, ThisError)]
pub(crate) enum BlockwardenError {
    #[error("io error")]
    IoError(#[from] Arc<std::io::Error>),

    #[error("object store error")]
    ObjectStoreError(#[from] Arc<object_store::Error>),

    #[error("json error")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("invalid block ranges: {0}")]
    InvalidBlockRanges(String),

    #[error("block {block_id} with time range {min_time}:{max_time} is outside the largest expected range {range_start}:{range_end}")]
    BlockOutsideRange {
        block_id: Ulid,
        min_time: i64,
        max_time: i64,
        range_start: i64,
        range_end: i64,
    },

    #[error("block {block_id} is not compatible with job {job_key}. reason=`{reason}`")]
    IncompatibleBlock {
        block_id: Ulid,
        job_key: String,
        reason: String,
    },

    #[error("split job found while splitting is disabled. job_key=`{0}`")]
    UnexpectedSplitJob(String),

    #[error("bucket index not found. tenant=`{0}`")]
    IndexNotFound(String),

    #[error("bucket index corrupted. tenant=`{0}`")]
    IndexCorrupted(String),

    #[error("block meta not found. block_id=`{0}`")]
    BlockMetaNotFound(Ulid),

    #[error("block meta corrupted. block_id=`{0}`")]
    BlockMetaCorrupted(Ulid),

    #[error("marker not found. path=`{0}`")]
    MarkerNotFound(String),

    #[error("ring unavailable: {0}")]
    RingUnavailable(String),

    #[error("operation canceled")]
    Canceled,

    #[error("failed to delete {0} blocks")]
    DeleteBlocksFailed(usize),

    #[error("tenant deletion mark missing. tenant=`{0}`")]
    TenantDeletionMarkMissing(String),

    #[error("failed to compact {0} tenants")]
    CompactTenantsFailed(usize),

    #[error("unknown configuration file format. path=`{0}`")]
    UnknownConfigurationFormat(PathBuf),

    #[error("invalid configuration format")]
    InvalidConfigurationFormat(#[from] Box<figment::Error>),

    #[error("invalid jobs order `{0}`")]
    InvalidJobsOrder(String),

    #[error("invalid shard id `{0}`")]
    InvalidShardId(String),
}

impl BlockwardenError {
    pub(crate) fn is_canceled(&self) -> bool {
        matches!(self, BlockwardenError::Canceled)
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlockwardenError::ObjectStoreError(err)
                if matches!(err.as_ref(), object_store::Error::NotFound { .. })
        )
    }
}

impl From<std::io::Error> for BlockwardenError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

impl From<object_store::Error> for BlockwardenError {
    fn from(value: object_store::Error) -> Self {
        Self::ObjectStoreError(Arc::new(value))
    }
}

impl From<serde_json::Error> for BlockwardenError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Kind of public error returned by blockwarden.
///
/// Callers generally only need to tell apart configuration mistakes
/// ([ErrorKind::Invalid]), transient storage or ring problems that the next
/// cycle will retry ([ErrorKind::Unavailable]), and orderly shutdown
/// ([ErrorKind::Canceled]).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An invalid configuration or argument. The caller must fix it and retry.
    Invalid,

    /// A storage or membership service is unavailable. Retry on the next cycle.
    Unavailable,

    /// Persisted data is in an unexpected state: an unreadable index, marker or
    /// block meta. Usually repaired by the next index rebuild.
    Data,

    /// The operation was canceled. Not a failure.
    Canceled,

    /// A planning invariant was violated. Indicates a bug.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Invalid => write!(f, "Invalid error"),
            ErrorKind::Unavailable => write!(f, "Unavailable error"),
            ErrorKind::Data => write!(f, "Data error"),
            ErrorKind::Canceled => write!(f, "Canceled"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Public error returned by blockwarden.
#[non_exhaustive]
#[derive(Debug)]
pub struct Error {
    msg: String,
    kind: ErrorKind,
    source: Option<BoxError>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    pub fn invalid(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Invalid,
            source: None,
        }
    }

    pub fn unavailable(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Unavailable,
            source: None,
        }
    }

    pub fn data(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Data,
            source: None,
        }
    }

    pub fn canceled(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Canceled,
            source: None,
        }
    }

    pub fn internal(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Internal,
            source: None,
        }
    }

    /// Adds a source to the error.
    pub fn with_source(mut self, source: BoxError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the error signals an orderly shutdown rather than a failure.
    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

impl From<BlockwardenError> for Error {
    fn from(err: BlockwardenError) -> Self {
        let msg = err.to_string();
        match err {
            BlockwardenError::Canceled => Error::canceled(msg),

            // Unavailable errors
            BlockwardenError::IoError(err) => Error::unavailable(msg).with_source(Box::new(err)),
            BlockwardenError::ObjectStoreError(err) => {
                Error::unavailable(msg).with_source(Box::new(err))
            }
            BlockwardenError::RingUnavailable(_) => Error::unavailable(msg),
            BlockwardenError::DeleteBlocksFailed(_) => Error::unavailable(msg),
            BlockwardenError::CompactTenantsFailed(_) => Error::unavailable(msg),

            // Invalid errors
            BlockwardenError::InvalidBlockRanges(_) => Error::invalid(msg),
            BlockwardenError::UnknownConfigurationFormat(_) => Error::invalid(msg),
            BlockwardenError::InvalidConfigurationFormat(err) => {
                Error::invalid(msg).with_source(Box::new(err))
            }
            BlockwardenError::InvalidJobsOrder(_) => Error::invalid(msg),

            // Data errors
            BlockwardenError::Json(err) => Error::data(msg).with_source(Box::new(err)),
            BlockwardenError::IndexNotFound(_) => Error::data(msg),
            BlockwardenError::IndexCorrupted(_) => Error::data(msg),
            BlockwardenError::BlockMetaNotFound(_) => Error::data(msg),
            BlockwardenError::BlockMetaCorrupted(_) => Error::data(msg),
            BlockwardenError::MarkerNotFound(_) => Error::data(msg),
            BlockwardenError::TenantDeletionMarkMissing(_) => Error::data(msg),
            BlockwardenError::InvalidShardId(_) => Error::data(msg),

            // Internal errors
            BlockwardenError::BlockOutsideRange { .. } => Error::internal(msg),
            BlockwardenError::IncompatibleBlock { .. } => Error::internal(msg),
            BlockwardenError::UnexpectedSplitJob(_) => Error::internal(msg),
        }
    }
}
