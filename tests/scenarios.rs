//! End-to-end scenarios exercising the public API against mocked backend
//! binaries, the way a real SLURM/SGE/LSF/`parallel` installation would
//! respond, without requiring one to be present on the test host.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batch_scheduler::BackendKind;
use batch_scheduler::SchedulerConfig;
use batch_scheduler::backend::BackendAdapter;
use batch_scheduler::config::BackendSelector;
use batch_scheduler::env::ProcessEnv;
use batch_scheduler::facade::Scheduler;
use pretty_assertions::assert_eq;

/// Writes an executable shell script named `name` into `dir`, and returns
/// `dir`'s path for use as a `PATH` entry.
fn mock_bin(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
}

/// An isolated `PATH` containing only the mocked binaries in `dir`.
fn isolated_env(dir: &Path) -> Arc<ProcessEnv> {
    Arc::new(ProcessEnv::isolated(dir.display().to_string(), HashMap::new()))
}

/// An isolated `PATH` plus the root/bin-dir variable an SGE or LSF probe
/// requires in addition to the binary itself being resolvable.
fn isolated_env_with(dir: &Path, var: &str) -> Arc<ProcessEnv> {
    let mut overrides = HashMap::new();
    overrides.insert(var.to_string(), dir.display().to_string());
    Arc::new(ProcessEnv::isolated(dir.display().to_string(), overrides))
}

fn config(selector: BackendSelector, work_dir: &Path) -> SchedulerConfig {
    SchedulerConfig {
        backend_selector: selector,
        work_dir: Some(work_dir.to_path_buf()),
        ..Default::default()
    }
}

#[tokio::test]
async fn s1_slurm_trivial_job() {
    let bindir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();

    // Records the full invocation so the test can assert on flag shape, and
    // always reports the job accepted under the mocked id.
    mock_bin(
        bindir.path(),
        "sbatch",
        &format!("echo \"$@\" >> {record}\necho 8675309", record = bindir.path().join("sbatch.calls").display()),
    );
    mock_bin(bindir.path(), "squeue", "true");
    mock_bin(bindir.path(), "sacct", "true");

    let mut cfg = config(BackendSelector::Explicit(BackendKind::Slurm), workdir.path());
    cfg.default_memory = Some("4G".to_string());
    cfg.default_cores = Some(2);

    let scheduler = Scheduler::new(cfg, isolated_env(bindir.path())).unwrap();
    let handle = scheduler
        .submit(0, "true", Path::new("true.sh"), Vec::new())
        .await
        .unwrap();

    assert_eq!(handle.as_str(), "8675309");
    assert_eq!(handle.backend(), BackendKind::Slurm);

    let recorded = fs::read_to_string(bindir.path().join("sbatch.calls")).unwrap();
    assert!(recorded.contains("--parsable"));
    assert!(recorded.contains("--mem=4G"));
    assert!(recorded.contains("--cpus-per-task=2"));
    assert!(recorded.contains("-J ashs_true"));
    assert!(recorded.contains("--export=ALL"));
    assert!(recorded.trim_end().ends_with("true.sh"));
}

#[tokio::test]
async fn s2_sge_array_submission() {
    let bindir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();

    // Each invocation appends the arguments it saw and echoes the next id in
    // sequence, mimicking `qsub`'s "Your job N (...) has been submitted".
    let counter = bindir.path().join("qsub.count");
    fs::write(&counter, "10").unwrap();
    mock_bin(
        bindir.path(),
        "qsub",
        &format!(
            "echo \"$@\" >> {record}\nn=$(($(cat {counter}) + 1))\necho $n > {counter}\necho \"Your job $n (\\\"job\\\") has been submitted\"",
            record = bindir.path().join("qsub.calls").display(),
            counter = counter.display(),
        ),
    );

    let cfg = config(BackendSelector::Explicit(BackendKind::Sge), workdir.path());
    let scheduler = Scheduler::new(cfg, isolated_env_with(bindir.path(), "SGE_ROOT")).unwrap();

    let handles = scheduler
        .submit_array_single(
            0,
            "reg",
            Path::new("run.sh"),
            vec!["extra".to_string()],
            &["L".to_string(), "R".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(handles.iter().map(|h| h.as_str()).collect::<Vec<_>>(), vec!["11", "12"]);

    let recorded = fs::read_to_string(bindir.path().join("qsub.calls")).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("-N ashs_reg_L"));
    assert!(lines[0].contains("-cwd"));
    assert!(lines[0].contains("-V"));
    assert!(lines[0].trim_end().ends_with("extra L"));
    assert!(lines[1].contains("-N ashs_reg_R"));
    assert!(lines[1].trim_end().ends_with("extra R"));
}

#[tokio::test]
async fn s4_parallel_array_single_invocation() {
    let bindir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();

    mock_bin(
        bindir.path(),
        "parallel",
        &format!("echo \"$@\" >> {record}\nexit 0", record = bindir.path().join("parallel.calls").display()),
    );

    let mut cfg = config(BackendSelector::Explicit(BackendKind::Parallel), workdir.path());
    cfg.default_cores = Some(4);

    let scheduler = Scheduler::new(cfg, isolated_env(bindir.path())).unwrap();
    let handles = scheduler
        .submit_array_single(
            0,
            "seg",
            Path::new("run.sh"),
            Vec::new(),
            &["1".to_string(), "2".to_string(), "3".to_string(), "4".to_string(), "5".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(handles.len(), 1);
    scheduler.wait(&handles).await.unwrap();

    let recorded = fs::read_to_string(bindir.path().join("parallel.calls")).unwrap();
    assert_eq!(recorded.lines().count(), 1, "expected exactly one `parallel` invocation");
    assert!(recorded.contains("-j 4"));
    assert!(recorded.contains("run.sh"));
    assert!(recorded.contains(":::"));
    assert!(recorded.trim_end().ends_with("1 2 3 4 5"));
}

#[tokio::test]
async fn s5_local_fallback_runs_sequentially_and_waits_immediately() {
    let bindir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();

    let record = workdir.path().join("order.log");
    mock_bin(
        bindir.path(),
        "run.sh",
        &format!("echo \"$1\" >> {record}", record = record.display()),
    );

    let cfg = config(BackendSelector::Auto, workdir.path());
    let scheduler = Scheduler::new(cfg, isolated_env(bindir.path())).unwrap();
    assert_eq!(scheduler.backend(), BackendKind::Local);

    let handles = scheduler
        .submit_array_single(
            0,
            "x",
            &bindir.path().join("run.sh"),
            Vec::new(),
            &["a".to_string(), "b".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].as_str(), "0");

    scheduler.wait(&handles).await.unwrap();

    let order = fs::read_to_string(&record).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn s6_wait_observes_pending_running_failed_and_returns_without_error() {
    let bindir = tempfile::tempdir().unwrap();

    let counter = bindir.path().join("sacct.count");
    fs::write(&counter, "0").unwrap();
    // Successive polls report PENDING, then RUNNING, then the terminal,
    // non-success state FAILED.
    mock_bin(
        bindir.path(),
        "sacct",
        &format!(
            "n=$(($(cat {counter}) + 1))\necho $n > {counter}\ncase $n in\n  1) echo '42|PENDING' ;;\n  2) echo '42|RUNNING' ;;\n  *) echo '42|FAILED' ;;\nesac",
            counter = counter.display(),
        ),
    );
    mock_bin(bindir.path(), "squeue", "echo '42 job'");

    let adapter = batch_scheduler::backend::create_adapter(BackendKind::Slurm, isolated_env(bindir.path()));
    let handle = batch_scheduler::JobHandle::new(BackendKind::Slurm, "42");

    let waiter = tokio::spawn(async move { adapter.wait(&[handle]).await });

    // Drive the paused clock forward past both 10s poll intervals.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(11)).await;
    }

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait should have completed once the terminal state was observed")
        .unwrap()
        .unwrap();

    let polls: u32 = fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
    assert!(polls >= 3, "expected at least 3 polls to observe PENDING, RUNNING, FAILED");
}
