//! The public façade: the uniform submission and wait interface the rest of
//! a pipeline is written against, independent of which backend is active.

use std::path::Path;
use std::sync::Arc;

use crate::backend::BackendAdapter;
use crate::backend::SubmitSpec;
use crate::config::SchedulerConfig;
use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::JobHandle;
use crate::handle::JobSet;
use crate::logdir::LogDirectory;
use crate::registry;
use crate::resource::ResourceRequest;

/// A scheduler bound to one detected (or explicitly selected) backend.
///
/// Constructed once per pipeline run; every submission call derives its
/// resource request from the stage index given, so the same `Scheduler`
/// serves every stage of a multi-stage pipeline.
pub struct Scheduler {
    adapter: Arc<dyn BackendAdapter>,
    config: SchedulerConfig,
    log_dir: LogDirectory,
}

impl Scheduler {
    /// Detects the active backend per `config` and prepares the shared log
    /// directory.
    pub fn new(config: SchedulerConfig, env: Arc<ProcessEnv>) -> Result<Self, SchedulerError> {
        let adapter = registry::detect(&config, env)?;
        let log_dir = LogDirectory::new(config.work_dir.as_deref());
        log_dir.ensure()?;
        Ok(Self { adapter, config, log_dir })
    }

    /// The backend this scheduler resolved to.
    pub fn backend(&self) -> crate::handle::BackendKind {
        self.adapter.kind()
    }

    /// Builds the [`SubmitSpec`] for a single job at `stage`.
    fn spec(&self, stage: u32, name: &str, script: &Path, args: Vec<String>) -> SubmitSpec {
        SubmitSpec {
            name: name.to_string(),
            script: script.to_path_buf(),
            args,
            request: ResourceRequest::for_stage(&self.config, self.adapter.kind(), stage),
            log_dir: self.log_dir.clone(),
            job_prefix: self.config.job_prefix.clone(),
        }
    }

    /// Submits a single job asynchronously.
    pub async fn submit(
        &self,
        stage: u32,
        name: &str,
        script: &Path,
        args: Vec<String>,
    ) -> Result<JobHandle, SchedulerError> {
        self.adapter.submit(&self.spec(stage, name, script, args)).await
    }

    /// Submits a single job and blocks until it terminates.
    pub async fn submit_sync(
        &self,
        stage: u32,
        name: &str,
        script: &Path,
        args: Vec<String>,
    ) -> Result<i32, SchedulerError> {
        self.adapter.submit_sync(&self.spec(stage, name, script, args)).await
    }

    /// Submits one job per value in `values`.
    pub async fn submit_array_single(
        &self,
        stage: u32,
        name: &str,
        script: &Path,
        args: Vec<String>,
        values: &[String],
    ) -> Result<JobSet, SchedulerError> {
        self.adapter
            .submit_array_single(&self.spec(stage, name, script, args), values)
            .await
    }

    /// Submits the outer-major Cartesian product of `outer` and `inner`.
    pub async fn submit_array_double(
        &self,
        stage: u32,
        name: &str,
        script: &Path,
        args: Vec<String>,
        outer: &[String],
        inner: &[String],
    ) -> Result<JobSet, SchedulerError> {
        self.adapter
            .submit_array_double(&self.spec(stage, name, script, args), outer, inner)
            .await
    }

    /// Blocks until every handle in `handles` reaches a terminal state.
    ///
    /// Rejects any handle that was not produced by this scheduler's active
    /// backend, rather than silently ignoring or mis-waiting on it.
    pub async fn wait(&self, handles: &[JobHandle]) -> Result<(), SchedulerError> {
        let active = self.adapter.kind();
        for handle in handles {
            if handle.backend() != active {
                return Err(SchedulerError::MismatchedBackend {
                    handle: handle.as_str().to_string(),
                    expected: handle.backend(),
                    found: active,
                });
            }
        }
        self.adapter.wait(handles).await
    }

    /// The number of cores available to the current execution context.
    pub fn slots(&self) -> u64 {
        self.adapter.slots()
    }

    /// True if the current process is executing inside a job already
    /// allocated by the active backend.
    pub fn in_managed_job(&self) -> bool {
        self.adapter.in_managed_job()
    }
}
