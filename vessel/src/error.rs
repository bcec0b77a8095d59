//! Runtime errors and script-visible exceptions

use std::fmt;

use thiserror::Error;

/// Runtime result type
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised by the core containers, futures and workers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("index out of bounds: {index} (length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("mismatching array types: {expected} and {found}")]
    MismatchedArrayTypes { expected: String, found: String },

    #[error("too large array size: {requested} elements")]
    TooLargeArraySize { requested: usize },

    #[error("array was modified while sorting")]
    ModifiedWhileSorting,

    #[error("malformed initializer list: {0}")]
    MalformedInitList(String),

    #[error("incompatible type: cannot use {found} as {expected}")]
    IncompatibleType { expected: String, found: String },

    #[error("copy of {0} failed")]
    CopyFailed(String),

    #[error("type '{type_name}' has multiple matching '{method}' methods")]
    AmbiguousMethod { type_name: String, method: String },

    #[error("type '{0}' has no opCmp or opEquals method")]
    NoComparison(String),

    #[error("invalid template instance: {0}")]
    InvalidTemplate(String),

    #[error("type '{0}' is already registered")]
    DuplicateType(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no execution context available")]
    NoContext,

    #[error("invalid engine settings: {0}")]
    InvalidSettings(&'static str),

    #[error("promise already fulfilled")]
    AlreadyFulfilled,

    #[error("cannot join a thread from itself")]
    SelfJoin,

    #[error("thread is already running")]
    AlreadyRunning,

    #[error("thread is not suspended")]
    NotSuspended,

    #[error("script exception {0}")]
    Script(ScriptException),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    Bounds,
    Type,
    Resource,
    Protocol,
    Script,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Bounds => "bounds",
            ErrorCategory::Type => "type",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Script => "script",
        }
    }
}

impl RuntimeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::IndexOutOfBounds { .. }
            | RuntimeError::MismatchedArrayTypes { .. }
            | RuntimeError::TooLargeArraySize { .. }
            | RuntimeError::ModifiedWhileSorting
            | RuntimeError::MalformedInitList(_) => ErrorCategory::Bounds,
            RuntimeError::IncompatibleType { .. }
            | RuntimeError::CopyFailed(_)
            | RuntimeError::AmbiguousMethod { .. }
            | RuntimeError::NoComparison(_)
            | RuntimeError::InvalidTemplate(_)
            | RuntimeError::DuplicateType(_) => ErrorCategory::Type,
            RuntimeError::OutOfMemory
            | RuntimeError::NoContext
            | RuntimeError::InvalidSettings(_) => ErrorCategory::Resource,
            RuntimeError::AlreadyFulfilled
            | RuntimeError::SelfJoin
            | RuntimeError::AlreadyRunning
            | RuntimeError::NotSuspended => ErrorCategory::Protocol,
            RuntimeError::Script(_) => ErrorCategory::Script,
        }
    }
}

/// An exception as a script observes it: a `type:message` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    pub type_name: String,
    pub message: String,
}

impl ScriptException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.message)
    }
}

impl std::error::Error for ScriptException {}

impl From<RuntimeError> for ScriptException {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Script(exception) => exception,
            other => Self::new(other.category().as_str(), other.to_string()),
        }
    }
}

impl From<ScriptException> for RuntimeError {
    fn from(exception: ScriptException) -> Self {
        RuntimeError::Script(exception)
    }
}
