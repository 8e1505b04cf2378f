use std::sync::Arc;
use std::time::Duration;

use crate::model::Op;

/// Represents a result type for operations in the stratum core.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// stratum-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the stratum core.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The evaluation request failed validation before any layer was consulted.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// A published snapshot is internally inconsistent. This should never happen for snapshots
    /// produced by the snapshot builder.
    #[error("snapshot corrupted: vid {vid} produced by layer ranges is missing from the variant index")]
    SnapshotCorrupted { vid: i64 },

    /// An entity failed validation while a snapshot was being built.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The authoritative store failed. Transient by assumption; callers retry.
    #[error("storage error: {0}")]
    Storage(Arc<dyn std::error::Error + Send + Sync>),

    /// An entity reload did not complete within the configured timeout.
    #[error("entity reload timed out after {0:?}")]
    ReloadTimeout(Duration),

    /// Invalid configuration knob value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The subscriber registry is at `max_subscribers` capacity.
    #[error("subscriber limit reached")]
    TooManySubscribers,

    /// No subscriber is registered under the given id.
    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(String),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Wrap an arbitrary store failure into [`Error::Storage`].
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Storage(Arc::new(err))
    }

    /// Whether the change-log entry that produced this error must be retried rather than
    /// consumed. The poller does not advance `last_id` past such entries.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::ReloadTimeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// An entity was rejected while building a snapshot.
///
/// Load errors never fail the snapshot as a whole: the offending layer or experiment is omitted
/// (logged and counted) and the rest of the configuration keeps serving.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LoadError {
    /// A bucket range with `start >= end`.
    #[error("invalid range: start {start} must be less than end {end}")]
    InvalidRange { start: u32, end: u32 },

    /// A bucket range extending past the slot space.
    #[error("invalid range: end {end} exceeds the {total} bucket slots")]
    RangeOutOfBounds { end: u32, total: u32 },

    /// Two ranges of the same layer cover a common bucket.
    #[error("overlapping ranges: [{first_start}, {first_end}) overlaps [{second_start}, {second_end})")]
    OverlappingRanges {
        first_start: u32,
        first_end: u32,
        second_start: u32,
        second_end: u32,
    },

    /// `and`/`or` rule node without children.
    #[error("{node} node must have at least one child")]
    EmptyChildren { node: &'static str },

    /// A rule references a field with no declared type.
    #[error("field \"{field}\" is not declared in the field-type map")]
    UndeclaredField { field: String },

    /// A field condition carries no values.
    #[error("field \"{field}\" condition has no values")]
    EmptyValues { field: String },

    /// An operator that expects exactly one value got a different count.
    #[error("operator {op:?} on field \"{field}\" requires exactly one value, got {count}")]
    ValueArity { field: String, op: Op, count: usize },

    /// A rule value that does not coerce to the field's declared type.
    #[error("value for field \"{field}\" does not match its declared type")]
    ValueType { field: String },

    /// An operator applied to a field type that does not support it, e.g. `like` on an int.
    #[error("operator {op:?} is not supported for field \"{field}\"")]
    UnsupportedOperator { field: String, op: Op },

    /// Variant parameters must be JSON objects to participate in the deep merge.
    #[error("variant {vid} parameters must be a JSON object")]
    ParamsNotObject { vid: i64 },

    /// Two experiments claim the same eid.
    #[error("duplicate experiment eid {0}")]
    DuplicateEid(i64),

    /// A vid claimed by more than one experiment, or by ranges of more than one layer.
    #[error("vid {vid} is already claimed by another {owner}")]
    DuplicateVid { vid: i64, owner: &'static str },

    /// A layer range references a vid that no experiment defines.
    #[error("range references unknown vid {vid}")]
    UnknownVid { vid: i64 },
}

/// A rule failed to evaluate against a request context.
///
/// Rule errors are not fatal: the merger treats the affected experiment as a non-match, records a
/// counter, and keeps going with the remaining layers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    /// The context does not carry the referenced field.
    #[error("context is missing field \"{0}\"")]
    MissingField(String),

    /// The referenced field has no declared type.
    #[error("field \"{0}\" has no declared type")]
    UndeclaredField(String),

    /// The context (or rule) value does not coerce to the field's declared type.
    #[error("field \"{0}\" value does not coerce to its declared type")]
    TypeMismatch(String),

    /// The operator cannot be applied as written (wrong arity, unsupported field type).
    #[error("operator {op:?} is malformed for field \"{field}\"")]
    MalformedOperator { field: String, op: Op },
}
