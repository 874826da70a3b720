use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Coarse classification of a [`ConvError`], used by callers that only care about the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Internal,
    ResourceExhausted,
    Unimplemented,
}

/// Failure surfaced by the convolution dispatcher.
///
/// Every stage (descriptor construction, runner build, argument decoding, scratch
/// allocation, device invocation) reports through this type; nothing is retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
}

impl ConvError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ConvError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ConvError::Internal {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        ConvError::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        ConvError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            ConvError::Internal { .. } => ErrorKind::Internal,
            ConvError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            ConvError::Unimplemented { .. } => ErrorKind::Unimplemented,
        }
    }

    /// Prefixes the message with the name of the stage that failed.
    pub fn context(self, stage: &str) -> Self {
        match self {
            ConvError::InvalidArgument { message } => ConvError::InvalidArgument {
                message: format!("{stage}: {message}"),
            },
            ConvError::Internal { message } => ConvError::Internal {
                message: format!("{stage}: {message}"),
            },
            ConvError::ResourceExhausted { message } => ConvError::ResourceExhausted {
                message: format!("{stage}: {message}"),
            },
            ConvError::Unimplemented { op, reason } => ConvError::Unimplemented {
                op,
                reason: format!("{stage}: {reason}"),
            },
        }
    }
}

/// Convenience alias for results returned by dispatcher routines.
pub type ConvResult<T> = Result<T, ConvError>;

pub(crate) fn lock_named<'a, T>(mutex: &'a Mutex<T>, name: &str) -> ConvResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ConvError::internal(format!("{name} mutex poisoned")))
}

pub(crate) fn read_named<'a, T>(
    lock: &'a RwLock<T>,
    name: &str,
) -> ConvResult<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| ConvError::internal(format!("{name} lock poisoned")))
}

pub(crate) fn write_named<'a, T>(
    lock: &'a RwLock<T>,
    name: &str,
) -> ConvResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| ConvError::internal(format!("{name} lock poisoned")))
}
