//! Configuration loading: search path resolution, the legacy environment
//! bridge, and validation.
//!
//! The on-disk format is TOML, read and written the same way
//! `sprocket::config::Config` round-trips through `toml::from_str`/
//! `toml::to_string`. Every field carries `#[serde(default)]` rather than
//! `deny_unknown_fields`, since this document may be shared with unrelated
//! pipeline concerns and unrecognized keys must be ignored rather than
//! rejected.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::SchedulerError;
use crate::handle::BackendKind;
use crate::resource::NotifyPolicy;

/// The default configuration file name searched for at each location in
/// [`SchedulerConfig::load`]'s search path.
pub const CONFIG_FILE_NAME: &str = "batch-scheduler.toml";

/// The default job-name prefix applied to every submission.
fn default_job_prefix() -> String {
    "ashs".to_string()
}

fn default_priority() -> Vec<BackendKind> {
    BackendKind::DEFAULT_PRIORITY.to_vec()
}

/// Explicit backend selection, or automatic detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelector {
    /// Probe the priority list in order and use the first available backend.
    #[default]
    Auto,
    /// Use exactly this backend, failing to start if its probe fails.
    Explicit(BackendKind),
}

impl Serialize for BackendSelector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Explicit(kind) => serializer.serialize_str(kind.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for BackendSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<BackendKind>()
            .map(Self::Explicit)
            .map_err(serde::de::Error::custom)
    }
}

/// A per-stage resource override.
///
/// Corresponds to the legacy `stage_<N>_memory`/`stage_<N>_cores`/
/// `stage_<N>_time` keys, realised here as a `[stage.N]` TOML table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    /// Overrides `default_memory` for this stage.
    pub memory: Option<String>,
    /// Overrides `default_cores` for this stage.
    pub cores: Option<u32>,
    /// Overrides `default_time` for this stage.
    pub time: Option<String>,
}

/// The scheduler's resolved configuration.
///
/// Constructed once at pipeline start by [`SchedulerConfig::load`] and
/// treated as immutable thereafter; every submission derives a
/// [`crate::resource::ResourceRequest`] from it plus a stage index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// `auto`, or an explicit backend name.
    pub backend_selector: BackendSelector,
    /// Detection order, most-preferred first.
    #[serde(default = "default_priority")]
    pub priority: Vec<BackendKind>,
    /// Default memory applied when a stage override is absent.
    pub default_memory: Option<String>,
    /// Default core count applied when a stage override is absent.
    pub default_cores: Option<u32>,
    /// Default walltime applied when a stage override is absent.
    pub default_time: Option<String>,
    /// Default queue/partition name.
    pub default_queue: Option<String>,
    /// Per-stage overrides, keyed by the stage index as a decimal string.
    ///
    /// Kept string-keyed (rather than `HashMap<u32, _>`) so that
    /// [`SchedulerConfig::validate`] can name a malformed, non-integer stage
    /// key in its diagnostic instead of failing opaquely during
    /// deserialization.
    pub stage: HashMap<String, StageOverride>,
    /// Verbatim extra options appended to the named backend's flag list,
    /// keyed by the backend's lowercase name (e.g. `slurm`).
    pub extra_opts: HashMap<String, String>,
    /// The job-name prefix used by every submission.
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    /// The notification e-mail address, if notifications are enabled.
    pub notify_email: Option<String>,
    /// The notification event filter.
    pub notify_events: NotifyPolicy,
    /// The pipeline's working directory, used to derive the log directory
    /// and as a config search location.
    pub work_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend_selector: BackendSelector::default(),
            priority: default_priority(),
            default_memory: None,
            default_cores: None,
            default_time: None,
            default_queue: None,
            stage: HashMap::new(),
            extra_opts: HashMap::new(),
            job_prefix: default_job_prefix(),
            notify_email: None,
            notify_events: NotifyPolicy::default(),
            work_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Resolves a configuration from the first existing source in the
    /// search path, merging in the legacy environment bridge afterwards.
    ///
    /// Search order (first hit wins, no merging across sources):
    /// 1. `explicit_override`, if given by the caller.
    /// 2. `./batch-scheduler.toml`.
    /// 3. `<work>/batch-scheduler.toml`.
    /// 4. `<home>/.batch-scheduler.toml`.
    /// 5. `<install_root>/batch-scheduler.toml`.
    ///
    /// If none of these exist, the defaults are used.
    pub fn load(
        explicit_override: Option<&Path>,
        work_dir: Option<&Path>,
        install_root: Option<&Path>,
    ) -> Result<Self, SchedulerError> {
        let candidates: Vec<PathBuf> = std::iter::empty()
            .chain(explicit_override.map(Path::to_path_buf))
            .chain(std::iter::once(PathBuf::from(CONFIG_FILE_NAME)))
            .chain(work_dir.map(|w| w.join(CONFIG_FILE_NAME)))
            .chain(dirs::home_dir().map(|h| h.join(format!(".{CONFIG_FILE_NAME}"))))
            .chain(install_root.map(|r| r.join(CONFIG_FILE_NAME)))
            .collect();

        let mut config = match candidates.into_iter().find(|p| p.is_file()) {
            Some(path) => Self::read_config(&path)?,
            None => Self::default(),
        };

        config.apply_legacy_env_bridge(|k| std::env::var(k).ok());
        if config.work_dir.is_none() {
            config.work_dir = work_dir.map(Path::to_path_buf);
        }
        config.work_dir = config.work_dir.map(|p| expand_tilde(&p));
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration document from `path`.
    pub fn read_config(path: &Path) -> Result<Self, SchedulerError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchedulerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| SchedulerError::Config(format!("{path}: {e}", path = path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes this configuration as TOML to `path`.
    pub fn write_config(&self, path: &Path) -> Result<(), SchedulerError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| SchedulerError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, text).map_err(|source| SchedulerError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies the legacy `USE_SLURM`/`USE_QSUB`/`USE_LSF`/`USE_PARALLEL`
    /// environment bridge.
    ///
    /// These force the backend selector, overriding the configuration file
    /// (but not an explicit caller argument to [`crate::registry::detect`],
    /// which is applied after this). `lookup` is injected so tests can
    /// supply a fake environment without mutating the real process
    /// environment.
    pub fn apply_legacy_env_bridge(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        const FLAGS: [(&str, BackendKind); 4] = [
            ("USE_SLURM", BackendKind::Slurm),
            ("USE_QSUB", BackendKind::Sge),
            ("USE_LSF", BackendKind::Lsf),
            ("USE_PARALLEL", BackendKind::Parallel),
        ];

        for (var, kind) in FLAGS {
            if let Some(value) = lookup(var) {
                if is_truthy(&value) {
                    self.backend_selector = BackendSelector::Explicit(kind);
                }
            }
        }
    }

    /// Looks up the override for `stage`, if one is configured.
    pub fn stage_override(&self, stage: u32) -> Option<&StageOverride> {
        self.stage.get(&stage.to_string())
    }

    /// Validates the configuration, returning a diagnostic naming the
    /// offending key on failure.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for key in self.stage.keys() {
            key.parse::<u32>().map_err(|_| {
                SchedulerError::Config(format!(
                    "`stage.{key}` is not a valid non-negative integer stage index"
                ))
            })?;
        }

        for memory in self
            .default_memory
            .iter()
            .chain(self.stage.values().filter_map(|o| o.memory.as_ref()))
        {
            validate_memory(memory)?;
        }

        for time in self
            .default_time
            .iter()
            .chain(self.stage.values().filter_map(|o| o.time.as_ref()))
        {
            validate_walltime(time)?;
        }

        Ok(())
    }
}

/// Expands a leading `~` in a configured path the same way
/// `sprocket`/`wdl-engine` expand a user-supplied source path, so a
/// `work_dir` written as `~/pipeline-runs` in the configuration file resolves
/// against the invoking user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// Parses a boolean-ish environment variable value the way shell scripts
/// typically treat one: any of `1`/`true`/`yes`/`on` (case-insensitively) is
/// truthy, everything else (including unset/empty) is not.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Validates that `memory` is a non-negative integer followed by `G` or `M`
/// (or no suffix at all).
///
/// The digit check enforces the spec's stricter grammar (integer only, no
/// decimals); `bytesize` then confirms the value parses to a sane byte count
/// the same way `wdl-engine`'s own resource-limit fields validate a
/// unit-suffixed size, rather than hand-rolling the suffix-to-bytes math here.
fn validate_memory(memory: &str) -> Result<(), SchedulerError> {
    let digits = memory.trim_end_matches(['G', 'M', 'g', 'm']);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(SchedulerError::Config(format!(
            "`{memory}` is not a valid memory value (expected an integer with an optional `G`/`M` suffix)"
        )));
    }

    let si_suffixed = if memory.ends_with(['G', 'g']) {
        format!("{digits}GB")
    } else if memory.ends_with(['M', 'm']) {
        format!("{digits}MB")
    } else {
        format!("{digits}B")
    };
    si_suffixed
        .parse::<bytesize::ByteSize>()
        .map(|_| ())
        .map_err(|e| SchedulerError::Config(format!("`{memory}` is not a valid memory value: {e}")))
}

/// Validates that `time` is shaped `H:M:S`.
fn validate_walltime(time: &str) -> Result<(), SchedulerError> {
    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() != 3 || !parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        return Err(SchedulerError::Config(format!(
            "`{time}` is not a valid walltime (expected `H:M:S`)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_when_no_source_exists() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            SchedulerConfig::load(None, Some(dir.path()), Some(Path::new("/nonexistent")))
                .unwrap();
        assert_eq!(config.backend_selector, BackendSelector::Auto);
        assert_eq!(config.priority, BackendKind::DEFAULT_PRIORITY.to_vec());
        assert_eq!(config.job_prefix, "ashs");
    }

    #[test]
    fn stage_override_precedence() {
        let mut config = SchedulerConfig {
            default_memory: Some("8G".to_string()),
            ..Default::default()
        };
        config
            .stage
            .insert("2".to_string(), StageOverride {
                memory: Some("16G".to_string()),
                ..Default::default()
            });

        let stage1 = ResourceRequestMemory::of(&config, 1);
        let stage2 = ResourceRequestMemory::of(&config, 2);
        assert_eq!(stage1, Some("8G".to_string()));
        assert_eq!(stage2, Some("16G".to_string()));
    }

    /// Test-only helper mirroring `ResourceRequest::for_stage`'s memory
    /// precedence without depending on `BackendKind` plumbing.
    struct ResourceRequestMemory;
    impl ResourceRequestMemory {
        fn of(config: &SchedulerConfig, stage: u32) -> Option<String> {
            config
                .stage_override(stage)
                .and_then(|o| o.memory.clone())
                .or_else(|| config.default_memory.clone())
        }
    }

    #[test]
    fn rejects_non_integer_stage_key() {
        let mut config = SchedulerConfig::default();
        config.stage.insert("two".to_string(), StageOverride::default());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SchedulerError::Config(msg) if msg.contains("stage.two")));
    }

    #[test]
    fn rejects_malformed_memory() {
        let config = SchedulerConfig {
            default_memory: Some("8GB".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_memory_with_g_and_m_suffixes_and_bare_integers() {
        for memory in ["8G", "512M", "1024"] {
            let config = SchedulerConfig {
                default_memory: Some(memory.to_string()),
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "expected `{memory}` to be valid");
        }
    }

    #[test]
    fn expands_leading_tilde_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "work_dir = \"~/pipeline-runs\"\n").unwrap();

        let config = SchedulerConfig::load(Some(&path), None, None).unwrap();
        assert!(!config.work_dir.unwrap().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn legacy_env_bridge_forces_selector() {
        let mut config = SchedulerConfig::default();
        config.apply_legacy_env_bridge(|k| if k == "USE_LSF" { Some("1".to_string()) } else { None });
        assert_eq!(config.backend_selector, BackendSelector::Explicit(BackendKind::Lsf));
    }

    #[test]
    fn legacy_env_bridge_ignores_falsy_values() {
        let mut config = SchedulerConfig::default();
        config.apply_legacy_env_bridge(|k| if k == "USE_SLURM" { Some("0".to_string()) } else { None });
        assert_eq!(config.backend_selector, BackendSelector::Auto);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = SchedulerConfig {
            default_memory: Some("4G".to_string()),
            default_cores: Some(2),
            ..Default::default()
        };
        config
            .extra_opts
            .insert("slurm".to_string(), "--exclusive".to_string());

        config.write_config(&path).unwrap();
        let reloaded = SchedulerConfig::read_config(&path).unwrap();

        assert_eq!(reloaded.default_memory, config.default_memory);
        assert_eq!(reloaded.default_cores, config.default_cores);
        assert_eq!(
            reloaded.extra_opts.get("slurm"),
            Some(&"--exclusive".to_string())
        );
    }
}
