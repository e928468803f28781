use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the underlying storage backend implementation.
///
/// Backends translate their own error types into one of these kinds exactly
/// once, at the driver boundary. Everything above the driver only ever
/// branches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The requested path does not exist.
    ///
    /// **Retryable:** No - the path doesn't exist.
    /// **Caller action:** Frequently expected. Treat as a missing resource.
    NotFound,

    /// The destination of a move is already occupied.
    ///
    /// **Retryable:** No - the destination stays occupied.
    /// **Caller action:** For content-addressed paths, the existing value is
    /// the one that was about to be written.
    AlreadyExists,

    /// Any other backend failure (disk, network, permissions, bad offsets).
    ///
    /// **Retryable:** Maybe - depends on whether the failure is transient.
    /// **Caller action:** Propagate, or retry the whole operation.
    Io,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::AlreadyExists => write!(f, "already exists"),
            StorageErrorKind::Io => write!(f, "I/O error"),
        }
    }
}

impl From<io::ErrorKind> for StorageErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            _ => StorageErrorKind::Io,
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Only populated when `RUST_BACKTRACE` asks for it.
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with context and diagnostic capabilities.
///
/// This error type provides:
/// - **Semantic categorization** via [`StorageErrorKind`]
/// - **Operation context** (path, engine)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Backtrace** and **span trace** capture
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// fn read_link() -> Result<(), StorageError> {
///     let result = std::fs::File::open("missing.txt");
///
///     match result {
///         Err(err) => Err(StorageError::builder("local", StorageErrorKind::NotFound, err)
///             .path("repositories/library/ubuntu/_layers/link")
///             .build()),
///         Ok(_) => Ok(()),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use [`StorageError::builder`].
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a storage error with full context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// An error for a move whose destination `path` is occupied.
    pub fn already_exists(engine: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::builder(
            engine,
            StorageErrorKind::AlreadyExists,
            io::Error::new(io::ErrorKind::AlreadyExists, format!("{path} already exists")),
        )
        .path(path)
        .build()
    }

    /// A not-found error for `path`, produced by `engine`.
    pub fn not_found(engine: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::builder(
            engine,
            StorageErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, format!("Path not found: {path}")),
        )
        .path(path)
        .build()
    }

    /// Translate an [`io::Error`] into a storage error, keeping not-found
    /// distinguishable from every other failure.
    pub fn from_io(engine: &'static str, path: impl Into<String>, error: io::Error) -> Self {
        Self::builder(engine, error.kind().into(), error)
            .path(path)
            .build()
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// This is useful with `.map_err()` for simple error conversion.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("file.txt")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Whether this is a [`StorageErrorKind::NotFound`] error.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Whether this is a [`StorageErrorKind::AlreadyExists`] error.
    pub fn is_already_exists(&self) -> bool {
        self.kind == StorageErrorKind::AlreadyExists
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the file path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} storage: {}", self.engine, self.kind)?;
        if let Some(path) = &self.path {
            write!(f, " at {path}")?;
        }
        if let Some(context) = &self.context {
            write!(f, " during {context}")?;
        }
        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the file path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
