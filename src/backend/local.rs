//! The fully sequential local execution backend.
//!
//! The terminal fallback: its probe always succeeds, and every operation
//! executes inline rather than submitting to any external workload manager.
//! Every handle it returns is the synchronous-completion sentinel `"0"`.

use std::sync::Arc;

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;

use super::BackendAdapter;
use super::SubmitSpec;
use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::BackendKind;
use crate::handle::JobHandle;
use crate::handle::JobSet;

/// The local execution backend.
pub struct LocalBackend {
    env: Arc<ProcessEnv>,
}

impl LocalBackend {
    /// Constructs a new local backend.
    pub fn new(env: Arc<ProcessEnv>) -> Self {
        Self { env }
    }

    /// Runs `spec`'s script with `extra_arg` appended (if any), waiting for
    /// it to exit and returning its status code.
    async fn run(&self, spec: &SubmitSpec, extra_arg: Option<&str>) -> Result<i32, SchedulerError> {
        let mut command = Command::new(&spec.script);
        command.args(&spec.args);
        if let Some(extra) = extra_arg {
            command.arg(extra);
        }
        command.env("PATH", self.env.path());

        tracing::debug!(?command, "running job inline on the local backend");

        let output = command
            .output()
            .await
            .map_err(|e| SchedulerError::Submission {
                backend: BackendKind::Local,
                name: spec.name.clone(),
                source: anyhow::Error::new(e).context("failed to spawn local job"),
            })?;

        Ok(output.status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn probe(&self) -> Result<(), String> {
        Ok(())
    }

    async fn submit(&self, spec: &SubmitSpec) -> Result<JobHandle, SchedulerError> {
        self.run(spec, None).await?;
        Ok(JobHandle::local_sentinel())
    }

    async fn submit_sync(&self, spec: &SubmitSpec) -> Result<i32, SchedulerError> {
        self.run(spec, None).await
    }

    async fn submit_array_single(
        &self,
        spec: &SubmitSpec,
        values: &[String],
    ) -> Result<JobSet, SchedulerError> {
        for value in values {
            let code = self.run(spec, Some(value)).await?;
            if code != 0 {
                tracing::warn!(value = %value, code, "local array job exited unsuccessfully");
            }
        }
        Ok(vec![JobHandle::local_sentinel()])
    }

    async fn submit_array_double(
        &self,
        spec: &SubmitSpec,
        outer: &[String],
        inner: &[String],
    ) -> Result<JobSet, SchedulerError> {
        for o in outer {
            for i in inner {
                let mut command = Command::new(&spec.script);
                command.args(&spec.args).arg(o).arg(i);
                command.env("PATH", self.env.path());
                let output =
                    command
                        .output()
                        .await
                        .map_err(|e| SchedulerError::Submission {
                            backend: BackendKind::Local,
                            name: spec.name.clone(),
                            source: anyhow::Error::new(e).context("failed to spawn local job"),
                        })?;
                if !output.status.success() {
                    tracing::warn!(
                        outer = %o,
                        inner = %i,
                        status = ?output.status,
                        "local array job exited unsuccessfully"
                    );
                }
            }
        }
        Ok(vec![JobHandle::local_sentinel()])
    }

    async fn wait(&self, _handles: &[JobHandle]) -> Result<(), SchedulerError> {
        // Every local submission already blocked until completion; the
        // sentinel handle has nothing left to reap.
        Ok(())
    }

    fn slots(&self) -> u64 {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.cpus().len().max(1) as u64
    }

    fn in_managed_job(&self) -> bool {
        let _ = &self.env;
        false
    }
}
