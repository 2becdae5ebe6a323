//! Error type for the job subsystem.
//!
//! Nothing in here is fatal to the host: spawn failures surface as values,
//! runtime child failures end up in the job's exit code, and lock poisoning
//! is absorbed at the call sites with conservative no-ops.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures the subsystem reports to its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating one of the child's stdio pipes failed.
    #[error("error creating {0} pipe: {1}")]
    Pipe(&'static str, #[source] io::Error),

    /// The requested working directory does not exist or cannot be entered.
    #[error("working directory {} is not traversable", .0.display())]
    BadWorkingDir(PathBuf),

    /// The OS refused to start the child process.
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    /// The worker thread could not be created.
    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// The error-pump thread could not be created.
    #[error("failed to start error pump: {0}")]
    PumpSpawn(#[source] io::Error),

    /// The pump wake event could not be allocated.
    #[error("failed to allocate wake event: {0}")]
    Event(#[source] io::Error),

    /// Waiting for a child process failed.
    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}
