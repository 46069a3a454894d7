//! Translates a [`ResourceRequest`] into backend-specific argv tokens.
//!
//! The compiler is pure: given a backend tag and a request it returns a
//! `Vec<String>` of already-split argv tokens, never a single shell-quoted
//! string. This mirrors how the reference backends (`slurm_apptainer.rs`,
//! `lsf_apptainer.rs`) build up a `tokio::process::Command` argument at a
//! time rather than formatting a command line and re-splitting it, which
//! sidesteps the shell-quoting bugs a string-concatenation approach invites
//! (see `DESIGN.md`).

use crate::handle::BackendKind;
use crate::resource::NotifyPolicy;
use crate::resource::ResourceRequest;

/// Compiles `request` into the argv tokens `backend` expects, in the order
/// given by the table in the specification: memory, cores, walltime, queue,
/// notification, then verbatim extra options.
pub fn compile(backend: BackendKind, request: &ResourceRequest) -> Vec<String> {
    match backend {
        BackendKind::Slurm => compile_slurm(request),
        BackendKind::Sge => compile_sge(request),
        BackendKind::Lsf => compile_lsf(request),
        BackendKind::Parallel => compile_parallel(request),
        BackendKind::Local => Vec::new(),
    }
}

fn compile_slurm(request: &ResourceRequest) -> Vec<String> {
    let mut flags = Vec::new();

    if let Some(memory) = &request.memory {
        flags.push(format!("--mem={memory}"));
    }
    if let Some(cores) = request.cores {
        flags.push(format!("--cpus-per-task={cores}"));
    }
    if let Some(walltime) = &request.walltime {
        flags.push(format!("--time={walltime}"));
    }
    if let Some(queue) = &request.queue {
        flags.push(format!("--partition={queue}"));
    }

    match (request.notify, &request.notify_email) {
        (NotifyPolicy::All, Some(email)) => {
            flags.push(format!("--mail-user={email}"));
            flags.push("--mail-type=ALL".to_string());
        }
        (NotifyPolicy::Fail, _) => flags.push("--mail-type=FAIL".to_string()),
        (NotifyPolicy::End, _) => flags.push("--mail-type=END".to_string()),
        (NotifyPolicy::Begin, _) => flags.push("--mail-type=BEGIN".to_string()),
        _ => {}
    }

    append_extra_opts(&mut flags, request);
    flags
}

fn compile_sge(request: &ResourceRequest) -> Vec<String> {
    let mut flags = Vec::new();

    if let Some(memory) = &request.memory {
        flags.push("-l".to_string());
        flags.push(format!("h_vmem={memory}"));
    }
    if let Some(cores) = request.cores {
        flags.push("-pe".to_string());
        flags.push("smp".to_string());
        flags.push(cores.to_string());
    }
    if let Some(walltime) = &request.walltime {
        flags.push("-l".to_string());
        flags.push(format!("h_rt={walltime}"));
    }
    if let Some(queue) = &request.queue {
        flags.push("-q".to_string());
        flags.push(queue.clone());
    }

    match (request.notify, &request.notify_email) {
        (NotifyPolicy::All, Some(email)) => {
            flags.push("-M".to_string());
            flags.push(email.clone());
            flags.push("-m".to_string());
            flags.push("beas".to_string());
        }
        (NotifyPolicy::Fail, _) => {
            flags.push("-m".to_string());
            flags.push("a".to_string());
        }
        (NotifyPolicy::End, _) => {
            flags.push("-m".to_string());
            flags.push("e".to_string());
        }
        (NotifyPolicy::Begin, _) => {
            flags.push("-m".to_string());
            flags.push("b".to_string());
        }
        _ => {}
    }

    append_extra_opts(&mut flags, request);
    flags
}

fn compile_lsf(request: &ResourceRequest) -> Vec<String> {
    let mut flags = Vec::new();

    if let Some(memory) = &request.memory {
        flags.push("-R".to_string());
        flags.push(format!("rusage[mem={}]", memory_to_megabytes(memory)));
    }
    if let Some(cores) = request.cores {
        flags.push("-n".to_string());
        flags.push(cores.to_string());
    }
    if let Some(walltime) = &request.walltime {
        flags.push("-W".to_string());
        flags.push(hours_and_minutes(walltime));
    }
    if let Some(queue) = &request.queue {
        flags.push("-q".to_string());
        flags.push(queue.clone());
    }

    match (request.notify, &request.notify_email) {
        (NotifyPolicy::All, Some(email)) => {
            flags.push("-u".to_string());
            flags.push(email.clone());
            flags.push("-N".to_string());
        }
        (NotifyPolicy::Fail, _) | (NotifyPolicy::End, _) => flags.push("-N".to_string()),
        _ => {}
    }

    append_extra_opts(&mut flags, request);
    flags
}

/// `parallel` has no wire format for memory, walltime, or queue, so only
/// `extra_opts` is compiled here. The `-j` slot count (which does translate
/// `request.cores`, defaulting to the host's detected core count) is
/// synthesized directly by [`crate::backend::ParallelBackend`] instead, since
/// the fallback needs runtime core detection this pure function doesn't have
/// access to.
fn compile_parallel(request: &ResourceRequest) -> Vec<String> {
    let mut flags = Vec::new();
    if let Some(opts) = &request.extra_opts {
        flags.extend(opts.split_whitespace().map(str::to_string));
    }
    flags
}

fn append_extra_opts(flags: &mut Vec<String>, request: &ResourceRequest) {
    if let Some(opts) = &request.extra_opts {
        flags.extend(opts.split_whitespace().map(str::to_string));
    }
}

/// Converts a memory value with a `G`/`M` suffix (or no suffix) into
/// megabytes.
///
/// Preserves the original shell implementation's `${memory%G}000`
/// conversion (multiply by 1000, not 1024) for wire compatibility with
/// existing LSF deployments, documented as Open Question (1) in the
/// specification's design notes.
pub fn memory_to_megabytes(memory: &str) -> String {
    if let Some(value) = memory.strip_suffix(['G', 'g']) {
        return format!("{value}000");
    }
    if let Some(value) = memory.strip_suffix(['M', 'm']) {
        return value.to_string();
    }
    memory.to_string()
}

/// Takes the first two colon-separated components of an `H:M:S` walltime,
/// yielding the `H:M` form LSF's `-W` flag expects.
pub fn hours_and_minutes(walltime: &str) -> String {
    let mut parts = walltime.splitn(3, ':');
    match (parts.next(), parts.next()) {
        (Some(h), Some(m)) => format!("{h}:{m}"),
        _ => walltime.to_string(),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request() -> ResourceRequest {
        ResourceRequest {
            stage: 0,
            memory: None,
            cores: None,
            walltime: None,
            queue: None,
            notify: NotifyPolicy::None,
            notify_email: None,
            extra_opts: None,
        }
    }

    #[test]
    fn slurm_trivial_job() {
        let req = ResourceRequest {
            memory: Some("4G".to_string()),
            cores: Some(2),
            ..request()
        };
        assert_eq!(
            compile(BackendKind::Slurm, &req),
            vec!["--mem=4G", "--cpus-per-task=2"]
        );
    }

    #[test]
    fn lsf_memory_and_time_conversion() {
        let req = ResourceRequest {
            memory: Some("8G".to_string()),
            walltime: Some("4:00:00".to_string()),
            ..request()
        };
        let flags = compile(BackendKind::Lsf, &req);
        assert_eq!(flags, vec!["-R", "rusage[mem=8000]", "-W", "4:00"]);
    }

    #[test]
    fn sge_queue_and_notify_fail() {
        let req = ResourceRequest {
            queue: Some("short.q".to_string()),
            notify: NotifyPolicy::Fail,
            ..request()
        };
        assert_eq!(
            compile(BackendKind::Sge, &req),
            vec!["-q", "short.q", "-m", "a"]
        );
    }

    #[test]
    fn empty_fields_emit_no_flags() {
        assert!(compile(BackendKind::Slurm, &request()).is_empty());
        assert!(compile(BackendKind::Sge, &request()).is_empty());
        assert!(compile(BackendKind::Lsf, &request()).is_empty());
    }

    #[test]
    fn parallel_and_local_ignore_resources_but_parallel_keeps_extra_opts() {
        let req = ResourceRequest {
            memory: Some("4G".to_string()),
            cores: Some(4),
            extra_opts: Some("--bar".to_string()),
            ..request()
        };
        assert_eq!(compile(BackendKind::Parallel, &req), vec!["--bar"]);
        assert!(compile(BackendKind::Local, &req).is_empty());
    }

    #[test]
    fn extra_opts_appended_verbatim_suffix() {
        let req = ResourceRequest {
            memory: Some("4G".to_string()),
            extra_opts: Some("--exclusive --constraint=avx2".to_string()),
            ..request()
        };
        assert_eq!(
            compile(BackendKind::Slurm, &req),
            vec!["--mem=4G", "--exclusive", "--constraint=avx2"]
        );
    }

    #[test]
    fn all_notification_policies_slurm() {
        for (policy, expected) in [
            (NotifyPolicy::Fail, vec!["--mail-type=FAIL".to_string()]),
            (NotifyPolicy::End, vec!["--mail-type=END".to_string()]),
            (NotifyPolicy::Begin, vec!["--mail-type=BEGIN".to_string()]),
        ] {
            let req = ResourceRequest {
                notify: policy,
                ..request()
            };
            assert_eq!(compile(BackendKind::Slurm, &req), expected);
        }
    }
}
