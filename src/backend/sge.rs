//! The SGE/OGS backend: `qsub`.
//!
//! `qsub`'s own synchronous-wait flag (`-sync y`) blocks the submitting shell
//! for the job's entire runtime, which does not compose with awaiting many
//! jobs concurrently. Instead, `wait` submits a lightweight sentinel job that
//! depends on every handle (`-hold_jid <ids>`) and runs `qsub -sync y` on
//! *that*, so a single blocking call waits on the whole set.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sysinfo::System;
use tokio::process::Command;

use super::BackendAdapter;
use super::SubmitSpec;
use super::sanitize_name_component;
use super::submit_each_pair;
use super::submit_each_value;
use crate::compiler;
use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::BackendKind;
use crate::handle::JobHandle;
use crate::handle::JobSet;

/// The SGE/OGS backend.
pub struct SgeBackend {
    env: Arc<ProcessEnv>,
}

impl SgeBackend {
    /// Constructs a new SGE backend.
    pub fn new(env: Arc<ProcessEnv>) -> Self {
        Self { env }
    }

    fn build_qsub_args(&self, spec: &SubmitSpec, extra: &[&str]) -> Vec<String> {
        let mut args = vec!["-cwd".to_string(), "-V".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.extend(compiler::compile(BackendKind::Sge, &spec.request));

        let job_name = spec.job_name();
        args.push("-N".to_string());
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

    /// Extracts the job id from `qsub`'s stdout: either the third
    /// whitespace-delimited token of `Your job 12345 ("name") has been
    /// submitted`, or the first run of digits after `job`.
    fn extract_job_id(stdout: &str) -> Option<String> {
        let re = Regex::new(r"[Jj]ob(?:-array)?\s+(\d+)").ok()?;
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    async fn run_qsub(&self, spec: &SubmitSpec, extra: &[&str]) -> Result<String, SchedulerError> {
        let args = self.build_qsub_args(spec, extra);
        let mut command = Command::new("qsub");
        command.args(&args).env("PATH", self.env.path());
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(?command, "submitting SGE job with `qsub`");

        let output = command.output().await.map_err(|e| {
            submission_error(&spec.name, anyhow::Error::new(e).context("failed to spawn `qsub`"))
        })?;

        if !output.status.success() {
            return Err(submission_error(
                &spec.name,
                anyhow::anyhow!(
                    "`qsub` exited with {status}: {stderr}",
                    status = output.status,
                    stderr = String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = Self::extract_job_id(&stdout).ok_or_else(|| {
            submission_error(
                &spec.name,
                anyhow::anyhow!("could not find a job identifier in `qsub` output: {stdout}"),
            )
        })?;

        tracing::info!(job_id = %id, name = %spec.name, "submitted SGE job");
        Ok(id)
    }
}

fn submission_error(name: &str, source: anyhow::Error) -> SchedulerError {
    SchedulerError::Submission {
        backend: BackendKind::Sge,
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl BackendAdapter for SgeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sge
    }

    fn probe(&self) -> Result<(), String> {
        if self.env.var("SGE_ROOT").is_none() {
            return Err("`SGE_ROOT` must be set".to_string());
        }
        if self.env.has_all(&["qsub"]) {
            Ok(())
        } else {
            Err("`qsub` must be resolvable on `PATH`".to_string())
        }
    }

    async fn submit(&self, spec: &SubmitSpec) -> Result<JobHandle, SchedulerError> {
        let id = self.run_qsub(spec, &[]).await?;
        Ok(JobHandle::new(BackendKind::Sge, id))
    }

    async fn submit_sync(&self, spec: &SubmitSpec) -> Result<i32, SchedulerError> {
        self.run_qsub(spec, &["-sync", "y"]).await?;
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

        let hold_ids = handles
            .iter()
            .map(|h| h.as_str().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sentinel_name = sanitize_name_component(&format!(
            "wait_{id}",
            id = handles.first().map(|h| h.as_str()).unwrap_or_default()
        ));

        let mut command = Command::new("qsub");
        command
            .args([
                "-cwd",
                "-V",
                "-sync",
                "y",
                "-hold_jid",
                &hold_ids,
                "-N",
                &sentinel_name,
                "-b",
                "y",
                "/bin/true",
            ])
            .env("PATH", self.env.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // The sentinel's own exit status is not meaningful: it only
            // exists to block until every held job finishes, so its stderr
            // (and a non-zero exit if a held job fails) is discarded.
            .stderr(Stdio::null());

        tracing::debug!(?command, "waiting on SGE jobs via a held sentinel");

        let _ = command.status().await.map_err(|e| {
            submission_error("wait-sentinel", anyhow::Error::new(e).context("failed to spawn `qsub`"))
        })?;

        Ok(())
    }

    fn slots(&self) -> u64 {
        if let Some(value) = self.env.var("NSLOTS") {
            if let Ok(n) = value.trim().parse::<u64>() {
                return n;
            }
        }
        let mut system = System::new();
        system.refresh_cpu_all();
        system.cpus().len().max(1) as u64
    }

    fn in_managed_job(&self) -> bool {
        self.env.var("JOB_ID").is_some()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn extracts_job_id_from_standard_message() {
        let stdout = "Your job 12345 (\"ashs_true\") has been submitted\n";
        assert_eq!(SgeBackend::extract_job_id(stdout).as_deref(), Some("12345"));
    }

    #[test]
    fn extracts_job_id_from_array_message() {
        let stdout = "Your job-array 987.1-3:1 (\"ashs_true\") has been submitted\n";
        assert_eq!(SgeBackend::extract_job_id(stdout).as_deref(), Some("987"));
    }

    #[test]
    fn qsub_args_include_cwd_and_export() {
        let env = Arc::new(ProcessEnv::isolated("", std::collections::HashMap::new()));
        let backend = SgeBackend::new(env);
        let spec = SubmitSpec {
            name: "true".to_string(),
            script: "true.sh".into(),
            args: Vec::new(),
            request: crate::resource::ResourceRequest {
                stage: 0,
                memory: None,
                cores: None,
                walltime: None,
                queue: None,
                notify: crate::resource::NotifyPolicy::None,
                notify_email: None,
                extra_opts: None,
            },
            log_dir: crate::logdir::LogDirectory::new(None),
            job_prefix: "ashs".to_string(),
        };
        let args = backend.build_qsub_args(&spec, &[]);
        assert_eq!(args[0], "-cwd");
        assert_eq!(args[1], "-V");
        assert!(args.contains(&"true.sh".to_string()));
    }
}
