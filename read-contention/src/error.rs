use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// shm_open / ftruncate / mmap / munmap / shm_unlink failed.
    #[error("{op} on shared memory {name:?} failed: {source}")]
    Shm {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("fork for task {index} failed: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("pipe for reader {index} failed: {source}")]
    Pipe {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("waitpid on pid {pid} failed: {source}")]
    Wait {
        pid: libc::pid_t,
        #[source]
        source: io::Error,
    },

    #[error("kill({pid}, {signal}) failed: {source}")]
    Signal {
        pid: libc::pid_t,
        signal: libc::c_int,
        #[source]
        source: io::Error,
    },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn shm(op: &'static str, name: &str) -> Self {
        Error::Shm {
            op,
            name: name.to_string(),
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}
