//! Error types for AFF4 operations

use thiserror::Error;

/// Broad classification of a failure
///
/// Callers that only need to know *what kind* of thing went wrong (for
/// instance to decide whether to retry, or whether a volume is simply not
/// an archive) match on this instead of the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic runtime failure
    Runtime,
    /// Underlying I/O failure
    Io,
    /// Malformed input or bad argument
    InvalidParameter,
    /// Resolver or cache lookup miss
    KeyNotFound,
    /// Allocation failure
    OutOfMemory,
    /// Recoverable anomaly
    Warning,
}

#[derive(Error, Debug)]
pub enum Aff4Error {
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a valid archive: {0}")]
    InvalidArchive(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Resolver store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Aff4Error>,
    },
}

impl Aff4Error {
    /// Classify this error
    ///
    /// Context wrappers are transparent: the kind of the innermost error wins.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Aff4Error::Runtime(_) | Aff4Error::Unsupported(_) | Aff4Error::Store(_) => {
                ErrorKind::Runtime
            }
            Aff4Error::Io(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                ErrorKind::OutOfMemory
            }
            Aff4Error::Io(_) => ErrorKind::Io,
            Aff4Error::InvalidArchive(_)
            | Aff4Error::InvalidParameter(_)
            | Aff4Error::TypeMismatch { .. }
            | Aff4Error::Compression(_)
            | Aff4Error::Json(_)
            | Aff4Error::Config(_) => ErrorKind::InvalidParameter,
            Aff4Error::NotFound(_) => ErrorKind::KeyNotFound,
            Aff4Error::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error of a context chain
    pub fn root(&self) -> &Aff4Error {
        match self {
            Aff4Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn closed(what: &str) -> Self {
        Aff4Error::Runtime(format!("{} used after close", what))
    }
}

pub type Result<T> = std::result::Result<T, Aff4Error>;

/// Attach context to a failing result
///
/// Each call wraps the previous error, so the rendered message reads as a
/// trace from the outermost operation down to the original cause.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Aff4Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| Aff4Error::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Aff4Error::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}
