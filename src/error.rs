//! Error types for the capture pipeline

use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open device {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The device stopped mid-frame (or hit EOF). Frame boundaries can't be
    /// recovered after this, so the session is over.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("device is not open")]
    NotOpen,

    #[error("invalid serial number {0:?}: need at least 4 ASCII characters")]
    InvalidSerial(String),

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("capture thread exited before reporting startup")]
    WorkerLost,
}

pub type Result<T> = std::result::Result<T, Error>;
