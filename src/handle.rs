//! Backend identity and the opaque job identifier it tags.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Identifies one of the five supported workload manager backends.
///
/// Exactly one [`BackendKind`] is active per process (see
/// [`crate::registry::detect`]); a [`JobHandle`] created under one kind is
/// never meaningful to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SLURM (`sbatch`/`squeue`/`sacct`).
    Slurm,
    /// SGE/OGS (`qsub`).
    Sge,
    /// LSF (`bsub`).
    Lsf,
    /// GNU `parallel`, fanning work out across local processes.
    Parallel,
    /// Fully sequential local execution; the terminal fallback.
    Local,
}

impl BackendKind {
    /// All backend kinds, in the default priority order.
    pub const DEFAULT_PRIORITY: [BackendKind; 5] = [
        BackendKind::Slurm,
        BackendKind::Sge,
        BackendKind::Lsf,
        BackendKind::Parallel,
        BackendKind::Local,
    ];

    /// The lowercase name used in configuration files and CLI flags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slurm => "slurm",
            Self::Sge => "sge",
            Self::Lsf => "lsf",
            Self::Parallel => "parallel",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{s}", s = self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slurm" => Ok(Self::Slurm),
            "sge" | "ogs" => Ok(Self::Sge),
            "lsf" => Ok(Self::Lsf),
            "parallel" => Ok(Self::Parallel),
            "local" => Ok(Self::Local),
            other => Err(format!("unrecognized backend name `{other}`")),
        }
    }
}

/// An opaque job identifier returned by a submission call.
///
/// The identifier's *interpretation* depends on the backend that produced
/// it: a cluster job number for `slurm`/`sge`/`lsf`, an OS process id for
/// `parallel`, or the sentinel `"0"` for `local` (where submission already
/// completed synchronously). The backend tag is carried alongside the raw
/// identifier so that handing a handle to the wrong backend's `wait` is a
/// detectable programming error rather than a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    backend: BackendKind,
    raw: String,
}

impl JobHandle {
    /// Constructs a handle tagged with the backend that produced it.
    pub fn new(backend: BackendKind, raw: impl Into<String>) -> Self {
        Self {
            backend,
            raw: raw.into(),
        }
    }

    /// Constructs the `local` backend's synchronous-completion sentinel.
    pub fn local_sentinel() -> Self {
        Self::new(BackendKind::Local, "0")
    }

    /// The backend that produced this handle.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// The raw, backend-specific identifier.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{raw}", raw = self.raw)
    }
}

/// An ordered sequence of [`JobHandle`]s returned by an array submission.
///
/// Handles appear in the iteration order of the parameter list that
/// produced them (outer-major for the 2-D case).
pub type JobSet = Vec<JobHandle>;
