use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single request. All but [`VirtError::Channel`] are
/// answered with an `error` line and the server keeps going.
#[derive(Debug, Error)]
pub enum VirtError {
    #[error("unknown command {0}")]
    UnknownVerb(String),
    #[error("{verb} takes {expected} arguments, got {got}")]
    Arity {
        verb: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("testbed is not open")]
    NotOpen,
    #[error("testbed is already open")]
    AlreadyOpen,
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("protocol channel failed: {0}")]
    Channel(#[source] io::Error),
}

impl VirtError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| VirtError::Io { op, path, source }
    }
}
