use std::error::Error;
use std::io::{self, ErrorKind};

use http::StatusCode;

use crate::davpath::ParseError;
use crate::fs::FsError;
use crate::ls::DavLock;

/// Errors returned by the lock manager and the lock storage backends.
#[derive(Debug)]
pub enum LockError {
    /// A new lock would conflict with these existing locks.
    Conflict(Vec<DavLock>),
    /// A write is blocked by these locks, whose tokens were not submitted.
    Locked(Vec<DavLock>),
    /// The token is unknown or has expired.
    NotFound,
    /// The principal is not allowed to touch this lock.
    Forbidden,
    /// Refresh of a token that does not belong to the request path.
    PreconditionFailed,
    /// Syntax error in an `If:`, `Lock-Token:` or `Timeout:` header.
    MalformedHeader,
    /// The resource path could not be canonicalized.
    InvalidPath,
    /// A freshly generated token was already in use.
    DuplicateToken,
    /// The storage backend failed (disk full, cache unreachable, ...).
    StorageUnavailable(io::Error),
}

pub type LockResult<T> = Result<T, LockError>;

impl Error for LockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LockError::StorageUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LockError::Conflict(locks) => write!(f, "conflicts with {} existing lock(s)", locks.len()),
            LockError::Locked(locks) => write!(f, "resource is locked by {} lock(s)", locks.len()),
            LockError::NotFound => write!(f, "lock not found"),
            LockError::Forbidden => write!(f, "lock is owned by another principal"),
            LockError::PreconditionFailed => write!(f, "lock token does not match the resource"),
            LockError::MalformedHeader => write!(f, "malformed header"),
            LockError::InvalidPath => write!(f, "invalid path"),
            LockError::DuplicateToken => write!(f, "duplicate lock token"),
            LockError::StorageUnavailable(e) => write!(f, "lock storage unavailable: {}", e),
        }
    }
}

impl From<io::Error> for LockError {
    fn from(e: io::Error) -> Self {
        LockError::StorageUnavailable(e)
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::StorageUnavailable(io::Error::new(ErrorKind::InvalidData, e))
    }
}

impl From<ParseError> for LockError {
    fn from(_: ParseError) -> Self {
        LockError::InvalidPath
    }
}

impl LockError {
    /// The locks that caused a `Conflict` or `Locked` error.
    pub fn locks(&self) -> &[DavLock] {
        match self {
            LockError::Conflict(l) | LockError::Locked(l) => l,
            _ => &[],
        }
    }
}

#[derive(Debug)]
pub(crate) enum DavError {
    XmlReadError,  // error reading/parsing xml
    XmlParseError, // error interpreting xml
    XmlWriteError, // error generating xml
    InvalidPath,   // error parsing path
    IllegalPath,   // path not valid here
    ForbiddenPath, // too many dotdots
    UnknownDavMethod,
    Lock(LockError),
    Status(StatusCode),
    StatusClose(StatusCode),
    FsError(FsError),
    IoError(io::Error),
}

pub(crate) type DavResult<T> = Result<T, DavError>;

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::Lock(e) => Some(e),
            DavError::FsError(e) => Some(e),
            DavError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for DavError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DavError::XmlReadError => write!(f, "XML parse error"),
            DavError::XmlWriteError => write!(f, "XML generate error"),
            DavError::IoError(_) => write!(f, "I/O error"),
            DavError::Lock(e) => write!(f, "{}", e),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<LockError> for DavError {
    fn from(e: LockError) -> Self {
        DavError::Lock(e)
    }
}

impl From<FsError> for DavError {
    fn from(e: FsError) -> Self {
        DavError::FsError(e)
    }
}

impl From<ParseError> for DavError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidPath => DavError::InvalidPath,
            ParseError::IllegalPath => DavError::IllegalPath,
            ParseError::ForbiddenPath => DavError::ForbiddenPath,
        }
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(e: StatusCode) -> Self {
        DavError::Status(e)
    }
}

fn ioerror_to_status(ioerror: &io::Error) -> StatusCode {
    match ioerror.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

pub(crate) fn fserror_to_status(e: &FsError) -> StatusCode {
    match e {
        FsError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        FsError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
        FsError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        FsError::NotFound => StatusCode::NOT_FOUND,
        FsError::Forbidden => StatusCode::FORBIDDEN,
        FsError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
    }
}

pub(crate) fn lockerror_to_status(e: &LockError) -> StatusCode {
    match e {
        LockError::Conflict(_) | LockError::Locked(_) => StatusCode::LOCKED,
        LockError::NotFound => StatusCode::CONFLICT,
        LockError::Forbidden => StatusCode::FORBIDDEN,
        LockError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        LockError::MalformedHeader | LockError::InvalidPath => StatusCode::BAD_REQUEST,
        LockError::DuplicateToken => StatusCode::INTERNAL_SERVER_ERROR,
        LockError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::XmlWriteError => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::IllegalPath => StatusCode::BAD_GATEWAY,
            DavError::ForbiddenPath => StatusCode::FORBIDDEN,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Lock(e) => lockerror_to_status(e),
            DavError::IoError(e) => ioerror_to_status(e),
            DavError::FsError(e) => fserror_to_status(e),
            DavError::Status(e) => *e,
            DavError::StatusClose(e) => *e,
        }
    }

    pub(crate) fn must_close(&self) -> bool {
        !matches!(self, DavError::Status(_) | DavError::Lock(_) | DavError::FsError(_))
    }
}
