//! The GNU `parallel` backend: fans work out across local processes without
//! a workload manager.
//!
//! Unlike the cluster backends, a handle here names an OS process id rather
//! than a backend-assigned job id, and nothing else in the system can wait on
//! an arbitrary PID belonging to a process this backend itself spawned.
//! `ParallelBackend` therefore keeps the spawned [`tokio::process::Child`]
//! handles around in `spawned`, keyed by pid, so a later `wait` call can find
//! and reap them.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::BackendAdapter;
use super::SubmitSpec;
use crate::compiler;
use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::BackendKind;
use crate::handle::JobHandle;
use crate::handle::JobSet;

/// The `parallel` backend.
pub struct ParallelBackend {
    env: Arc<ProcessEnv>,
    /// Children spawned by `submit`/`submit_array_*`, awaiting `wait`.
    spawned: Mutex<HashMap<u32, Child>>,
}

impl ParallelBackend {
    /// Constructs a new `parallel` backend.
    pub fn new(env: Arc<ProcessEnv>) -> Self {
        Self {
            env,
            spawned: Mutex::new(HashMap::new()),
        }
    }

    /// The `-j` slot count: the stage's requested cores, or this host's
    /// detected core count if unset.
    fn slot_count(&self, spec: &SubmitSpec) -> u64 {
        spec.request.cores.map(u64::from).unwrap_or_else(|| self.slots())
    }

    async fn spawn_tracked(
        &self,
        name: &str,
        mut command: Command,
    ) -> Result<JobHandle, SchedulerError> {
        command.env("PATH", self.env.path());
        tracing::debug!(?command, "spawning `parallel` job");

        let child = command.spawn().map_err(|e| SchedulerError::Submission {
            backend: BackendKind::Parallel,
            name: name.to_string(),
            source: anyhow::Error::new(e).context("failed to spawn `parallel`"),
        })?;

        let pid = child.id().ok_or_else(|| SchedulerError::Submission {
            backend: BackendKind::Parallel,
            name: name.to_string(),
            source: anyhow::anyhow!("spawned child process has no pid"),
        })?;

        self.spawned.lock().await.insert(pid, child);
        tracing::info!(pid, name, "submitted `parallel` job");
        Ok(JobHandle::new(BackendKind::Parallel, pid.to_string()))
    }
}

#[async_trait]
impl BackendAdapter for ParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    fn probe(&self) -> Result<(), String> {
        if self.env.has_all(&["parallel"]) {
            Ok(())
        } else {
            Err("`parallel` must be resolvable on `PATH`".to_string())
        }
    }

    async fn submit(&self, spec: &SubmitSpec) -> Result<JobHandle, SchedulerError> {
        let mut command = Command::new(&spec.script);
        command.args(&spec.args);
        command.stdin(Stdio::null());
        self.spawn_tracked(&spec.name, command).await
    }

    async fn submit_sync(&self, spec: &SubmitSpec) -> Result<i32, SchedulerError> {
        let mut command = Command::new(&spec.script);
        command.args(&spec.args).env("PATH", self.env.path());
        let status = command.status().await.map_err(|e| SchedulerError::Submission {
            backend: BackendKind::Parallel,
            name: spec.name.clone(),
            source: anyhow::Error::new(e).context("failed to spawn job"),
        })?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn submit_array_single(
        &self,
        spec: &SubmitSpec,
        values: &[String],
    ) -> Result<JobSet, SchedulerError> {
        let jobs = self.slot_count(spec);
        let mut command = Command::new("parallel");
        command
            .arg("-j")
            .arg(jobs.to_string())
            .args(compiler::compile(BackendKind::Parallel, &spec.request))
            .arg(spec.script.display().to_string())
            .args(&spec.args)
            .arg("{}")
            .arg(":::")
            .args(values)
            .stdin(Stdio::null());

        let handle = self.spawn_tracked(&spec.name, command).await?;
        Ok(vec![handle])
    }

    async fn submit_array_double(
        &self,
        spec: &SubmitSpec,
        outer: &[String],
        inner: &[String],
    ) -> Result<JobSet, SchedulerError> {
        let jobs = self.slot_count(spec);
        let mut command = Command::new("parallel");
        command
            .arg("-j")
            .arg(jobs.to_string())
            .args(compiler::compile(BackendKind::Parallel, &spec.request))
            .arg(spec.script.display().to_string())
            .args(&spec.args)
            .arg("{1}")
            .arg("{2}")
            .arg(":::")
            .args(outer)
            .arg(":::")
            .args(inner)
            .stdin(Stdio::null());

        let handle = self.spawn_tracked(&spec.name, command).await?;
        Ok(vec![handle])
    }

    async fn wait(&self, handles: &[JobHandle]) -> Result<(), SchedulerError> {
        for handle in handles {
            let pid: u32 = handle.as_str().parse().map_err(|_| SchedulerError::Submission {
                backend: BackendKind::Parallel,
                name: handle.as_str().to_string(),
                source: anyhow::anyhow!("handle is not a valid process id"),
            })?;

            let child = self.spawned.lock().await.remove(&pid);
            let Some(mut child) = child else {
                // Not tracked by this process (e.g. a handle from a prior
                // run): nothing left to reap.
                continue;
            };

            let status = child.wait().await.map_err(|e| SchedulerError::Submission {
                backend: BackendKind::Parallel,
                name: pid.to_string(),
                source: anyhow::Error::new(e).context("failed to wait on `parallel` job"),
            })?;

            if !status.success() {
                tracing::warn!(pid, ?status, "parallel job exited unsuccessfully");
            }
        }
        Ok(())
    }

    fn slots(&self) -> u64 {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.cpus().len().max(1) as u64
    }

    fn in_managed_job(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn spec(cores: Option<u32>) -> SubmitSpec {
        SubmitSpec {
            name: "true".to_string(),
            script: "true.sh".into(),
            args: Vec::new(),
            request: crate::resource::ResourceRequest {
                stage: 0,
                memory: None,
                cores,
                walltime: None,
                queue: None,
                notify: crate::resource::NotifyPolicy::None,
                notify_email: None,
                extra_opts: None,
            },
            log_dir: crate::logdir::LogDirectory::new(None),
            job_prefix: "ashs".to_string(),
        }
    }

    #[test]
    fn slot_count_uses_configured_cores() {
        let env = Arc::new(ProcessEnv::isolated("", HashMap::new()));
        let backend = ParallelBackend::new(env);
        assert_eq!(backend.slot_count(&spec(Some(6))), 6);
    }

    #[test]
    fn slot_count_falls_back_to_detected_cores() {
        let env = Arc::new(ProcessEnv::isolated("", HashMap::new()));
        let backend = ParallelBackend::new(env);
        assert_eq!(backend.slot_count(&spec(None)), backend.slots());
    }
}
