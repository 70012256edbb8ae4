//! Supervisor socket activation.
//!
//! The supervisor passes already-bound listening sockets starting at file
//! descriptor 3 (`LISTEN_FDS` convention). Each descriptor index is handed
//! out at most once so exactly one owner ever wraps a given descriptor.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::os::fd::{FromRawFd, RawFd};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// First inherited descriptor.
pub const LISTEN_FDS_START: RawFd = 3;

/// Errors acquiring an inherited listening socket.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("descriptor index {index} out of range (supervisor passed {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("descriptor index {0} already taken")]
    AlreadyTaken(usize),

    #[error("descriptor {fd} is not a usable listening socket: {source}")]
    InvalidSocket {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// The set of listening sockets inherited from the supervisor.
#[derive(Debug)]
pub struct InheritedListeners {
    taken: Vec<bool>,
}

impl InheritedListeners {
    /// Describe `count` descriptors passed by the supervisor.
    pub fn from_supervisor(count: usize) -> Self {
        Self {
            taken: vec![false; count],
        }
    }

    /// Number of inherited descriptors.
    pub fn len(&self) -> usize {
        self.taken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }

    /// Take ownership of the listening socket at `index`.
    ///
    /// Must be called from within the tokio runtime.
    pub fn take(&mut self, index: usize) -> Result<TcpListener, ActivationError> {
        let count = self.taken.len();
        let slot = self
            .taken
            .get_mut(index)
            .ok_or(ActivationError::OutOfRange { index, count })?;
        if *slot {
            return Err(ActivationError::AlreadyTaken(index));
        }
        *slot = true;

        let fd = LISTEN_FDS_START + index as RawFd;
        // SAFETY: the supervisor guarantees descriptors 3..3+count are open
        // listening sockets owned by this process, and the `taken` slot
        // guarantees this descriptor is wrapped only once.
        let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };

        let invalid = |source| ActivationError::InvalidSocket { fd, source };
        let local_addr = std_listener.local_addr().map_err(invalid)?;
        std_listener.set_nonblocking(true).map_err(invalid)?;
        let listener = TcpListener::from_std(std_listener).map_err(invalid)?;

        info!(fd, index, local_addr = %local_addr, "Inherited listener acquired");
        Ok(listener)
    }
}
