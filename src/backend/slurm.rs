//! The SLURM backend: `sbatch`/`squeue`/`sacct`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
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

/// The interval between `sacct` polls while waiting on SLURM jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The grace period given to a job that is visible in neither `sacct` nor
/// `squeue` before its handle is given up on with a warning.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A SLURM job state, as reported by `sacct`'s `State` field.
///
/// See <https://slurm.schedmd.com/job_state_codes.html>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    Preempted,
    OutOfMemory,
    Pending,
    Running,
    Completing,
    Configuring,
    Suspended,
}

impl JobState {
    /// Determines if this is a terminal state: no further transitions will
    /// occur, and `wait` may stop polling this job.
    fn terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::NodeFail
                | Self::Preempted
                | Self::OutOfMemory
        )
    }

    /// Determines if this terminal state indicates success.
    fn success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::NodeFail => "NODE_FAIL",
            Self::Preempted => "PREEMPTED",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completing => "COMPLETING",
            Self::Configuring => "CONFIGURING",
            Self::Suspended => "SUSPENDED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMEOUT" => Ok(Self::Timeout),
            "NODE_FAIL" => Ok(Self::NodeFail),
            "PREEMPTED" => Ok(Self::Preempted),
            "OUT_OF_MEMORY" => Ok(Self::OutOfMemory),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETING" => Ok(Self::Completing),
            "CONFIGURING" => Ok(Self::Configuring),
            "SUSPENDED" => Ok(Self::Suspended),
            _ => Err(()),
        }
    }
}

/// The SLURM backend.
pub struct SlurmBackend {
    env: Arc<ProcessEnv>,
}

impl SlurmBackend {
    /// Constructs a new SLURM backend.
    pub fn new(env: Arc<ProcessEnv>) -> Self {
        Self { env }
    }

    /// Builds the `sbatch` argv for `spec`, in the order the specification's
    /// S1 scenario fixes: `--parsable`, compiled resource flags, `-J`, `-o`,
    /// `-D`, `--export=ALL`, the script, then its arguments.
    fn build_sbatch_args(&self, spec: &SubmitSpec, extra: &[&str]) -> Vec<String> {
        let mut args = vec!["--parsable".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.extend(compiler::compile(BackendKind::Slurm, &spec.request));

        let job_name = spec.job_name();
        let stdout = spec.log_dir.path().join(format!("{job_name}_%j.out"));

        args.push("-J".to_string());
        args.push(job_name);
        args.push("-o".to_string());
        args.push(stdout.display().to_string());
        args.push("-D".to_string());
        args.push(
            std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| ".".to_string()),
        );
        args.push("--export=ALL".to_string());
        args.push(spec.script.display().to_string());
        args.extend(spec.args.iter().cloned());
        args
    }

    async fn run_sbatch(&self, spec: &SubmitSpec, extra: &[&str]) -> Result<String, SchedulerError> {
        let args = self.build_sbatch_args(spec, extra);
        let mut command = Command::new("sbatch");
        command.args(&args).env("PATH", self.env.path());
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(?command, "submitting SLURM job with `sbatch`");

        let output = command
            .output()
            .await
            .map_err(|e| submission_error(&spec.name, anyhow::Error::new(e).context("failed to spawn `sbatch`")))?;

        if !output.status.success() {
            return Err(submission_error(
                &spec.name,
                anyhow::anyhow!(
                    "`sbatch` exited with {status}: {stderr}",
                    status = output.status,
                    stderr = String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                submission_error(
                    &spec.name,
                    anyhow::anyhow!("`sbatch` did not print a job identifier"),
                )
            })?;

        tracing::info!(job_id = %id, name = %spec.name, "submitted SLURM job");
        Ok(id.to_string())
    }

    /// Queries `sacct` for the current `State` of each id in `ids`.
    async fn query_sacct(&self, ids: &[String]) -> Result<HashMap<String, Option<JobState>>, SchedulerError> {
        let mut command = Command::new("sacct");
        command
            .arg("-P")
            .arg("-n")
            .arg("--format=JobID,State")
            .arg("-j")
            .arg(ids.join(","))
            .env("PATH", self.env.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(?command, "polling SLURM job state with `sacct`");

        let output = command.output().await.map_err(|e| {
            submission_error("sacct", anyhow::Error::new(e).context("failed to spawn `sacct`"))
        })?;

        let mut states: HashMap<String, Option<JobState>> = HashMap::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut parts = line.splitn(2, '|');
            let (Some(job_id), Some(state)) = (parts.next(), parts.next()) else {
                continue;
            };
            // `sacct` also reports `.batch`/`.extern` sub-steps; only the
            // top-level job id is meaningful here.
            if job_id.contains('.') {
                continue;
            }

            let parsed = match JobState::from_str(state.trim()) {
                Ok(state) => Some(state),
                Err(()) => {
                    tracing::warn!(job_id, state = state.trim(), "unrecognized SLURM job state");
                    None
                }
            };
            states.insert(job_id.to_string(), parsed);
        }

        for id in ids {
            states.entry(id.clone()).or_insert(None);
        }

        Ok(states)
    }

    /// True if `id` currently appears in `squeue`'s live queue.
    async fn in_live_queue(&self, id: &str) -> Result<bool, SchedulerError> {
        let mut command = Command::new("squeue");
        command
            .arg("-h")
            .arg("-j")
            .arg(id)
            .env("PATH", self.env.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = command.output().await.map_err(|e| {
            submission_error(id, anyhow::Error::new(e).context("failed to spawn `squeue`"))
        })?;

        Ok(output.status.success() && !output.stdout.trim_ascii().is_empty())
    }
}

fn submission_error(name: &str, source: anyhow::Error) -> SchedulerError {
    SchedulerError::Submission {
        backend: BackendKind::Slurm,
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl BackendAdapter for SlurmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn probe(&self) -> Result<(), String> {
        if self.env.has_all(&["sbatch", "squeue", "sacct"]) {
            Ok(())
        } else {
            Err("`sbatch`, `squeue`, and `sacct` must all be resolvable on `PATH`".to_string())
        }
    }

    async fn submit(&self, spec: &SubmitSpec) -> Result<JobHandle, SchedulerError> {
        let id = self.run_sbatch(spec, &[]).await?;
        Ok(JobHandle::new(BackendKind::Slurm, id))
    }

    async fn submit_sync(&self, spec: &SubmitSpec) -> Result<i32, SchedulerError> {
        self.run_sbatch(spec, &["--wait"]).await?;
        // `sbatch --wait` exits with the job's own exit code once it
        // terminates.
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
        let mut remaining: HashSet<String> =
            handles.iter().map(|h| h.as_str().to_string()).collect();

        while !remaining.is_empty() {
            let ids: Vec<String> = remaining.iter().cloned().collect();
            let states = self.query_sacct(&ids).await?;

            let mut terminal = Vec::new();
            for id in &ids {
                match states.get(id).copied().flatten() {
                    Some(state) if state.terminal() => {
                        if !state.success() {
                            tracing::warn!(job_id = %id, %state, "SLURM job reached a non-success terminal state");
                        }
                        terminal.push(id.clone());
                    }
                    Some(_) => {}
                    None => {
                        if !self.in_live_queue(id).await? {
                            tokio::time::sleep(GRACE_PERIOD).await;
                            let recheck = self.query_sacct(std::slice::from_ref(id)).await?;
                            match recheck.get(id).copied().flatten() {
                                Some(state) if state.terminal() => {
                                    if !state.success() {
                                        tracing::warn!(job_id = %id, %state, "SLURM job reached a non-success terminal state");
                                    }
                                    terminal.push(id.clone());
                                }
                                _ => {
                                    tracing::warn!(
                                        job_id = %id,
                                        "giving up: job is visible in neither `sacct` nor `squeue`"
                                    );
                                    terminal.push(id.clone());
                                }
                            }
                        }
                    }
                }
            }

            for id in terminal {
                remaining.remove(&id);
            }

            if !remaining.is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        Ok(())
    }

    fn slots(&self) -> u64 {
        for var in ["SLURM_CPUS_ON_NODE", "SLURM_JOB_CPUS_PER_NODE"] {
            if let Some(value) = self.env.var(var) {
                if let Ok(n) = value.split(['(', ',']).next().unwrap_or(&value).parse::<u64>() {
                    return n;
                }
            }
        }
        let mut system = System::new();
        system.refresh_cpu_all();
        system.cpus().len().max(1) as u64
    }

    fn in_managed_job(&self) -> bool {
        self.env.var("SLURM_JOB_ID").is_some()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn terminal_and_nonterminal_states() {
        assert!(JobState::from_str("COMPLETED").unwrap().terminal());
        assert!(JobState::from_str("FAILED").unwrap().terminal());
        assert!(!JobState::from_str("PENDING").unwrap().terminal());
        assert!(!JobState::from_str("RUNNING").unwrap().terminal());
        assert!(JobState::from_str("BOGUS").is_err());
    }

    #[test]
    fn only_completed_counts_as_success() {
        assert!(JobState::from_str("COMPLETED").unwrap().success());
        assert!(!JobState::from_str("FAILED").unwrap().success());
    }

    #[test]
    fn sbatch_args_match_scenario_shape() {
        let env = Arc::new(ProcessEnv::isolated("", HashMap::new()));
        let backend = SlurmBackend::new(env);

        let spec = SubmitSpec {
            name: "true".to_string(),
            script: "true.sh".into(),
            args: Vec::new(),
            request: crate::resource::ResourceRequest {
                stage: 0,
                memory: Some("4G".to_string()),
                cores: Some(2),
                walltime: None,
                queue: None,
                notify: crate::resource::NotifyPolicy::None,
                notify_email: None,
                extra_opts: None,
            },
            log_dir: crate::logdir::LogDirectory::new(None),
            job_prefix: "ashs".to_string(),
        };

        let args = backend.build_sbatch_args(&spec, &[]);
        assert_eq!(args[0], "--parsable");
        assert!(args.contains(&"--mem=4G".to_string()));
        assert!(args.contains(&"--cpus-per-task=2".to_string()));
        assert_eq!(args[args.len() - 1], "true.sh");
        assert!(args.contains(&"--export=ALL".to_string()));
        let j_index = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[j_index + 1], "ashs_true");
    }
}
