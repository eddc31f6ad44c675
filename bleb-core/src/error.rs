use std::fmt;

/// Error taxonomy for the repository format. Every fallible operation in this
/// crate resolves to one of these kinds; human-readable detail rides along in
/// the `String` payload rather than being reconstructed from the kind alone.
#[derive(Debug, thiserror::Error)]
pub enum BlebError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation not allowed: {0}")]
    NotAllowed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),

    #[error("repository corruption: {0}")]
    RepositoryCorruption(String),

    #[error("not a bleb repository")]
    NotABlebRepository,

    #[error("not enough memory to hold object: {0}")]
    NotEnoughMemory(String),

    #[error("unsupported format: {0}")]
    NotSupported(String),
}

impl BlebError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlebError::Internal(_) => ErrorKind::Internal,
            BlebError::NotAllowed(_) => ErrorKind::NotAllowed,
            BlebError::ReadFailed(_) => ErrorKind::ReadFailed,
            BlebError::WriteFailed(_) => ErrorKind::WriteFailed,
            BlebError::UnexpectedEof(_) => ErrorKind::UnexpectedEof,
            BlebError::RepositoryCorruption(_) => ErrorKind::RepositoryCorruption,
            BlebError::NotABlebRepository => ErrorKind::NotABlebRepository,
            BlebError::NotEnoughMemory(_) => ErrorKind::NotEnoughMemory,
            BlebError::NotSupported(_) => ErrorKind::NotSupported,
        }
    }

    pub(crate) fn corruption(hint: impl Into<String>) -> Self {
        let hint = hint.into();
        log::debug!("repository corruption detected: {hint}");
        BlebError::RepositoryCorruption(hint)
    }

    pub(crate) fn unexpected_eof(hint: impl Into<String>) -> Self {
        let hint = hint.into();
        log::debug!("unexpected end of span chain: {hint}");
        BlebError::UnexpectedEof(hint)
    }
}

/// Bare tag form of [`BlebError`], exposed to callers (and the CLI's exit
/// code mapping) who only care which bucket an error fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Internal,
    NotAllowed,
    ReadFailed,
    WriteFailed,
    UnexpectedEof,
    RepositoryCorruption,
    NotABlebRepository,
    NotEnoughMemory,
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::NotAllowed => "NotAllowed",
            ErrorKind::ReadFailed => "ReadFailed",
            ErrorKind::WriteFailed => "WriteFailed",
            ErrorKind::UnexpectedEof => "UnexpectedEOF",
            ErrorKind::RepositoryCorruption => "RepositoryCorruption",
            ErrorKind::NotABlebRepository => "NotABlebRepository",
            ErrorKind::NotEnoughMemory => "NotEnoughMemory",
            ErrorKind::NotSupported => "NotSupported",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, BlebError>;
