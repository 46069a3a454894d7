//! The LSF backend: `bsub`.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sysinfo::System;
use tokio::process::Command;

use super::BackendAdapter;
use super::SubmitSpec;
use super::submit_each_pair;
use super::submit_each_value;
use crate::compiler;
use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::BackendKind;
use crate::handle::JobHandle;
use crate::handle::JobSet;

/// The LSF backend.
pub struct LsfBackend {
    env: Arc<ProcessEnv>,
}

impl LsfBackend {
    /// Constructs a new LSF backend.
    pub fn new(env: Arc<ProcessEnv>) -> Self {
        Self { env }
    }

    fn build_bsub_args(&self, spec: &SubmitSpec, extra: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        args.extend(extra.iter().map(|s| s.to_string()));
        args.extend(compiler::compile(BackendKind::Lsf, &spec.request));

        let job_name = spec.job_name();
        args.push("-J".to_string());
        args.push(job_name.clone());
        args.push("-o".to_string());
        args.push(
            spec.log_dir
                .path()
                .join(format!("{job_name}.out"))
                .display()
                .to_string(),
        );
        args.push("-e".to_string());
        args.push(
            spec.log_dir
                .path()
                .join(format!("{job_name}.err"))
                .display()
                .to_string(),
        );
        args.push(spec.script.display().to_string());
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Extracts the job id: the run of digits inside the first `<...>`
    /// delimiters in `bsub`'s `Job <12345> is submitted ...` message.
    fn extract_job_id(stdout: &str) -> Option<String> {
        let re = Regex::new(r"<(\d+)>").ok()?;
        re.captures(stdout).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
    }

    async fn run_bsub(&self, spec: &SubmitSpec, extra: &[&str]) -> Result<String, SchedulerError> {
        let args = self.build_bsub_args(spec, extra);
        let mut command = Command::new("bsub");
        command.args(&args).env("PATH", self.env.path());
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(?command, "submitting LSF job with `bsub`");

        let output = command.output().await.map_err(|e| {
            submission_error(&spec.name, anyhow::Error::new(e).context("failed to spawn `bsub`"))
        })?;

        if !output.status.success() {
            return Err(submission_error(
                &spec.name,
                anyhow::anyhow!(
                    "`bsub` exited with {status}: {stderr}",
                    status = output.status,
                    stderr = String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = Self::extract_job_id(&stdout).ok_or_else(|| {
            submission_error(
                &spec.name,
                anyhow::anyhow!("could not find a job identifier in `bsub` output: {stdout}"),
            )
        })?;

        tracing::info!(job_id = %id, name = %spec.name, "submitted LSF job");
        Ok(id)
    }
}

fn submission_error(name: &str, source: anyhow::Error) -> SchedulerError {
    SchedulerError::Submission {
        backend: BackendKind::Lsf,
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl BackendAdapter for LsfBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lsf
    }

    fn probe(&self) -> Result<(), String> {
        if self.env.var("LSF_BINDIR").is_none() {
            return Err("`LSF_BINDIR` must be set".to_string());
        }
        if self.env.has_all(&["bsub"]) {
            Ok(())
        } else {
            Err("`bsub` must be resolvable on `PATH`".to_string())
        }
    }

    async fn submit(&self, spec: &SubmitSpec) -> Result<JobHandle, SchedulerError> {
        let id = self.run_bsub(spec, &[]).await?;
        Ok(JobHandle::new(BackendKind::Lsf, id))
    }

    async fn submit_sync(&self, spec: &SubmitSpec) -> Result<i32, SchedulerError> {
        self.run_bsub(spec, &["-K"]).await?;
        Ok(0)
    }

    async fn submit_array_single(
        &self,
        spec: &SubmitSpec,
        values: &[String],
    ) -> Result<JobSet, SchedulerError> {
        submit_each_value(self, spec, values).await
    }

    async fn submit_array_double(
        &self,
        spec: &SubmitSpec,
        outer: &[String],
        inner: &[String],
    ) -> Result<JobSet, SchedulerError> {
        submit_each_pair(self, spec, outer, inner).await
    }

    async fn wait(&self, handles: &[JobHandle]) -> Result<(), SchedulerError> {
        if handles.is_empty() {
            return Ok(());
        }

        let dependency = handles
            .iter()
            .map(|h| format!("ended({id})", id = h.as_str()))
            .collect::<Vec<_>>()
            .join(" && ");

        let mut command = Command::new("bsub");
        command
            .args(["-K", "-w", &dependency, "-J", "wait_sentinel", "/bin/true"])
            .env("PATH", self.env.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // As with the SGE sentinel, only the blocking behaviour matters;
            // a held job's own failure is reported by the caller's own
            // polling/inspection of its handle, not by this sentinel's exit
            // status.
            .stderr(Stdio::null());

        tracing::debug!(?command, "waiting on LSF jobs via a dependent sentinel");

        let _ = command.status().await.map_err(|e| {
            submission_error("wait-sentinel", anyhow::Error::new(e).context("failed to spawn `bsub`"))
        })?;

        Ok(())
    }

    fn slots(&self) -> u64 {
        if let Some(value) = self.env.var("LSB_MAX_NUM_PROCESSORS") {
            if let Ok(n) = value.trim().parse::<u64>() {
                return n;
            }
        }
        let mut system = System::new();
        system.refresh_cpu_all();
        system.cpus().len().max(1) as u64
    }

    fn in_managed_job(&self) -> bool {
        self.env.var("LSB_JOBID").is_some()
    }
}
