//! A process environment view that can be overridden for tests.
//!
//! Backend detection and job submission both need to resolve binaries on
//! `PATH` and read a handful of scheduler-specific environment variables.
//! Rather than mutating the real process environment from tests (unsafe
//! under concurrent test execution), adapters are handed a [`ProcessEnv`]
//! whose `PATH` and variable overrides are injected explicitly; production
//! code constructs one from the real environment via [`ProcessEnv::current`].

use std::collections::HashMap;
use std::path::PathBuf;

/// A view of `PATH` plus a handful of overridable environment variables.
#[derive(Debug, Clone)]
pub struct ProcessEnv {
    /// The `PATH` value used both for `which`-style resolution and for the
    /// spawned child processes' own `PATH`.
    path: String,
    /// Variable overrides consulted before falling back to the real process
    /// environment (unless `hermetic` is set).
    overrides: HashMap<String, String>,
    /// When true, `var` never falls back to the real process environment;
    /// only `overrides` is consulted. Set by [`ProcessEnv::isolated`] so
    /// tests are immune to whatever scheduler-specific variables happen to
    /// be set in the environment actually running the test suite.
    hermetic: bool,
}

impl ProcessEnv {
    /// Builds a view from the real process environment.
    pub fn current() -> Self {
        Self {
            path: std::env::var("PATH").unwrap_or_default(),
            overrides: HashMap::new(),
            hermetic: false,
        }
    }

    /// Builds a view for tests: an explicit `PATH` plus a set of variable
    /// overrides, with no fallback to the real environment.
    pub fn isolated(path: impl Into<String>, overrides: HashMap<String, String>) -> Self {
        Self {
            path: path.into(),
            overrides,
            hermetic: true,
        }
    }

    /// The `PATH` value this view resolves binaries against.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Looks up `key`, consulting overrides first, then (unless this view is
    /// hermetic) the real process environment.
    pub fn var(&self, key: &str) -> Option<String> {
        self.overrides.get(key).cloned().or_else(|| {
            if self.hermetic {
                None
            } else {
                std::env::var(key).ok()
            }
        })
    }

    /// Resolves `binary` against this view's `PATH`.
    pub fn which(&self, binary: &str) -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        which::which_in(binary, Some(self.path.clone()), cwd).ok()
    }

    /// True if every one of `binaries` resolves on this view's `PATH`.
    pub fn has_all(&self, binaries: &[&str]) -> bool {
        binaries.iter().all(|b| self.which(b).is_some())
    }
}
