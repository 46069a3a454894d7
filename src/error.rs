//! Error types surfaced at the public API boundary.

use std::path::PathBuf;

use thiserror::Error;

use crate::handle::BackendKind;

/// An error produced by the scheduler façade.
///
/// Adapter-internal plumbing (process I/O, UTF-8 decoding, malformed
/// subprocess output) is carried as [`anyhow::Error`] and attached to the
/// appropriate variant here, the same split `wdl-engine`'s backends use
/// between `anyhow::Result` internally and a typed `Error` enum at the crate
/// boundary.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A configuration document could not be parsed, or named an invalid
    /// value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An explicitly requested backend failed its availability probe.
    #[error("backend `{backend}` was requested but its prerequisite is unavailable: {prerequisite}")]
    Detection {
        /// The backend that was requested.
        backend: BackendKind,
        /// A description of the missing prerequisite.
        prerequisite: String,
    },

    /// No backend in the priority list was available.
    ///
    /// This should not occur in practice when `local` is present in the
    /// priority list, since `local`'s probe always succeeds.
    #[error("no backend in the priority list `{0:?}` is available")]
    NoBackendAvailable(Vec<BackendKind>),

    /// Submission of a job to the backend failed.
    #[error("failed to submit job `{name}` to backend `{backend}`: {source:#}")]
    Submission {
        /// The backend the submission was attempted against.
        backend: BackendKind,
        /// The job name that failed to submit.
        name: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// A [`crate::handle::JobHandle`] created by one backend was passed to an
    /// operation belonging to a different backend.
    #[error("job handle `{handle}` belongs to backend `{expected}`, not the active backend `{found}`")]
    MismatchedBackend {
        /// The opaque identifier of the mismatched handle.
        handle: String,
        /// The backend the handle actually belongs to.
        expected: BackendKind,
        /// The backend that attempted to use it.
        found: BackendKind,
    },

    /// A filesystem operation (typically creating the log directory) failed.
    #[error("I/O error accessing `{path}`: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A convenience alias for results returned by this crate's public API.
pub type Result<T> = std::result::Result<T, SchedulerError>;
