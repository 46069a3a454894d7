//! Backend adapters: the only components that know backend-specific command
//! names, flag syntax, and identifier-extraction rules.
//!
//! Each workload manager is a struct implementing [`BackendAdapter`], the
//! same shape `wdl-engine::backend::TaskExecutionBackend` uses for its own
//! `local`/`docker`/`tes`/`*_apptainer` family: a tagged sum of adapters
//! behind a trait object, rather than the shell source's dynamic sourcing of
//! `<backend>.sh` files.

mod local;
mod lsf;
mod parallel;
mod sge;
mod slurm;

pub use local::LocalBackend;
pub use lsf::LsfBackend;
pub use parallel::ParallelBackend;
pub use sge::SgeBackend;
pub use slurm::SlurmBackend;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::BackendKind;
use crate::handle::JobHandle;
use crate::handle::JobSet;
use crate::logdir::LogDirectory;
use crate::resource::ResourceRequest;

/// Everything a submission call needs that isn't backend-specific.
#[derive(Debug, Clone)]
pub struct SubmitSpec {
    /// The job name, before any prefix the backend applies.
    pub name: String,
    /// The executable script to run.
    pub script: PathBuf,
    /// Ordered string arguments passed to the script.
    pub args: Vec<String>,
    /// The compiled resource request for this submission's stage.
    pub request: ResourceRequest,
    /// The shared log directory, already guaranteed to exist.
    pub log_dir: LogDirectory,
    /// The job-name prefix from [`crate::config::SchedulerConfig`].
    pub job_prefix: String,
}

impl SubmitSpec {
    /// The backend-facing job name: `<prefix>_<name>`, or just `<name>` if
    /// no prefix is configured.
    pub fn job_name(&self) -> String {
        if self.job_prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{prefix}_{name}", prefix = self.job_prefix, name = self.name)
        }
    }
}

/// The capability set every backend adapter implements.
///
/// Detection (`probe`) and the resource-independent queries (`slots`,
/// `in_managed_job`) are synchronous, since they only inspect the process
/// environment and `PATH`. The operations that talk to an external command
/// are `async`, spawning and awaiting subprocesses through
/// `tokio::process::Command` the way the reference backends do.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// This adapter's backend identity.
    fn kind(&self) -> BackendKind;

    /// Probes whether this backend's prerequisites are satisfied.
    ///
    /// Returns `Ok(())` if available, or `Err(<prerequisite description>)`
    /// naming what's missing.
    fn probe(&self) -> Result<(), String>;

    /// Submits a single job asynchronously, returning as soon as the job is
    /// accepted by the backend (not when it completes).
    async fn submit(&self, spec: &SubmitSpec) -> Result<JobHandle, SchedulerError>;

    /// Submits a single job and blocks until it terminates, returning its
    /// exit status to the extent the backend supports this.
    async fn submit_sync(&self, spec: &SubmitSpec) -> Result<i32, SchedulerError>;

    /// Submits one job per value in `values`, substituting each as the
    /// script's trailing positional argument. Returns handles in
    /// `values`'s iteration order.
    async fn submit_array_single(
        &self,
        spec: &SubmitSpec,
        values: &[String],
    ) -> Result<JobSet, SchedulerError>;

    /// Submits the Cartesian product of `outer` and `inner`, outer-major:
    /// all inner values for the first outer value, then the second, etc.
    async fn submit_array_double(
        &self,
        spec: &SubmitSpec,
        outer: &[String],
        inner: &[String],
    ) -> Result<JobSet, SchedulerError>;

    /// Blocks until every handle in `handles` has reached a terminal state.
    ///
    /// Every handle must belong to this adapter's [`BackendKind`]; callers
    /// (see [`crate::facade::Scheduler::wait`]) are responsible for
    /// rejecting mismatched handles before calling this.
    async fn wait(&self, handles: &[JobHandle]) -> Result<(), SchedulerError>;

    /// The number of cores available to the current execution context.
    fn slots(&self) -> u64;

    /// True if the current process is executing inside a job allocated by
    /// this backend.
    fn in_managed_job(&self) -> bool;
}

/// Constructs the adapter for `kind`, sharing `env` and the host's detected
/// core count.
pub fn create_adapter(kind: BackendKind, env: Arc<ProcessEnv>) -> Arc<dyn BackendAdapter> {
    match kind {
        BackendKind::Slurm => Arc::new(SlurmBackend::new(env)),
        BackendKind::Sge => Arc::new(SgeBackend::new(env)),
        BackendKind::Lsf => Arc::new(LsfBackend::new(env)),
        BackendKind::Parallel => Arc::new(ParallelBackend::new(env)),
        BackendKind::Local => Arc::new(LocalBackend::new(env)),
    }
}

/// Ensures `name` is safe to splice into a job name: workload managers
/// generally reject whitespace and some punctuation in job names, so
/// non-alphanumeric characters are replaced with `_`.
pub(crate) fn sanitize_name_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Joins `dir` and `file` for a log file path.
pub(crate) fn log_path(dir: &Path, file: impl AsRef<Path>) -> PathBuf {
    dir.join(file)
}

/// Shared realisation of a 1-D array submission for the three cluster
/// adapters: emit one submission per value, appending it as the script's
/// trailing positional argument, and collect the resulting handles in
/// iteration order.
pub(crate) async fn submit_each_value(
    adapter: &(dyn BackendAdapter + '_),
    spec: &SubmitSpec,
    values: &[String],
) -> Result<JobSet, SchedulerError> {
    let mut handles = Vec::with_capacity(values.len());
    for value in values {
        let mut per_value = spec.clone();
        per_value.name = format!("{name}_{value}", name = spec.name, value = sanitize_name_component(value));
        per_value.args.push(value.clone());
        handles.push(adapter.submit(&per_value).await?);
    }
    Ok(handles)
}

/// Shared realisation of a 2-D Cartesian-product array submission for the
/// three cluster adapters: outer-major iteration over `submit_each_value`.
///
/// `itertools::iproduct!` expresses the outer-major nesting the spec
/// requires (§4.4: all inner values for the first outer value, then the
/// second, ...) without a hand-rolled nested loop.
pub(crate) async fn submit_each_pair(
    adapter: &(dyn BackendAdapter + '_),
    spec: &SubmitSpec,
    outer: &[String],
    inner: &[String],
) -> Result<JobSet, SchedulerError> {
    let mut handles = Vec::with_capacity(outer.len() * inner.len());
    for (o, i) in itertools::iproduct!(outer, inner) {
        let mut per_pair = spec.clone();
        per_pair.name = format!(
            "{name}_{o}_{i}",
            name = spec.name,
            o = sanitize_name_component(o),
            i = sanitize_name_component(i)
        );
        per_pair.args.push(o.clone());
        per_pair.args.push(i.clone());
        handles.push(adapter.submit(&per_pair).await?);
    }
    Ok(handles)
}
