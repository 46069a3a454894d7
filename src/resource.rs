//! The generic resource request the compiler translates into backend flags.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::handle::BackendKind;

/// An opt-in notification filter applied to job completion e-mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPolicy {
    /// No notification requested.
    #[default]
    None,
    /// Notify at the start, end, and on failure of the job.
    All,
    /// Notify only when the job fails.
    Fail,
    /// Notify when the job ends, regardless of outcome.
    End,
    /// Notify when the job begins running.
    Begin,
}

impl fmt::Display for NotifyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::All => "all",
            Self::Fail => "fail",
            Self::End => "end",
            Self::Begin => "begin",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NotifyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "all" => Ok(Self::All),
            "fail" => Ok(Self::Fail),
            "end" => Ok(Self::End),
            "begin" => Ok(Self::Begin),
            other => Err(format!("unrecognized notification policy `{other}`")),
        }
    }
}

/// A stage's resource request, derived from [`SchedulerConfig`] plus a stage
/// index.
///
/// This is ephemeral: it is recomputed for every submission rather than
/// cached, since per-stage overrides shadow the defaults and the active
/// backend determines which fields the compiler consults.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// The stage this request was derived for.
    pub stage: u32,
    /// Memory with a unit suffix (`4G`, `512M`), or `None` if unset.
    pub memory: Option<String>,
    /// Requested core count, or `None` if unset.
    pub cores: Option<u32>,
    /// Walltime as `H:M:S` (or a backend-native string), or `None` if unset.
    pub walltime: Option<String>,
    /// Queue/partition name, or `None` if unset.
    pub queue: Option<String>,
    /// The notification policy in effect for this request.
    pub notify: NotifyPolicy,
    /// The notification e-mail address, if one is configured.
    pub notify_email: Option<String>,
    /// Verbatim extra options for the active backend, appended as-is.
    pub extra_opts: Option<String>,
}

impl ResourceRequest {
    /// Derives a resource request for `stage` under `backend`, applying
    /// stage-override precedence over the configured defaults.
    pub fn for_stage(config: &SchedulerConfig, backend: BackendKind, stage: u32) -> Self {
        let over = config.stage_override(stage);

        let memory = over
            .and_then(|o| o.memory.clone())
            .or_else(|| config.default_memory.clone());
        let cores = over.and_then(|o| o.cores).or(config.default_cores);
        let walltime = over
            .and_then(|o| o.time.clone())
            .or_else(|| config.default_time.clone());

        Self {
            stage,
            memory,
            cores,
            walltime,
            queue: config.default_queue.clone(),
            notify: config.notify_events,
            notify_email: config.notify_email.clone(),
            extra_opts: config.extra_opts.get(backend.as_str()).cloned(),
        }
    }
}
