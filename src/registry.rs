//! Backend detection: turning a [`BackendSelector`] into an active
//! [`BackendAdapter`].

use std::sync::Arc;

use crate::backend::BackendAdapter;
use crate::backend::create_adapter;
use crate::config::BackendSelector;
use crate::config::SchedulerConfig;
use crate::env::ProcessEnv;
use crate::error::SchedulerError;
use crate::handle::BackendKind;

/// Resolves the active backend for `config`, probing adapters until one is
/// available.
///
/// - [`BackendSelector::Explicit`] probes only the named backend; a failed
///   probe is a hard error naming the missing prerequisite, never a silent
///   fall-through to another backend.
/// - [`BackendSelector::Auto`] walks `config.priority` in order and returns
///   the first adapter whose probe succeeds. `local`'s probe always
///   succeeds, so as long as it appears in the priority list detection
///   cannot fail; [`SchedulerError::NoBackendAvailable`] is reserved for a
///   priority list that omits it.
pub fn detect(config: &SchedulerConfig, env: Arc<ProcessEnv>) -> Result<Arc<dyn BackendAdapter>, SchedulerError> {
    match config.backend_selector {
        BackendSelector::Explicit(kind) => detect_explicit(kind, env),
        BackendSelector::Auto => detect_auto(&config.priority, env),
    }
}

fn detect_explicit(kind: BackendKind, env: Arc<ProcessEnv>) -> Result<Arc<dyn BackendAdapter>, SchedulerError> {
    let adapter = create_adapter(kind, env);
    match adapter.probe() {
        Ok(()) => {
            tracing::info!(backend = %kind, "using explicitly selected backend");
            Ok(adapter)
        }
        Err(prerequisite) => Err(SchedulerError::Detection { backend: kind, prerequisite }),
    }
}

fn detect_auto(priority: &[BackendKind], env: Arc<ProcessEnv>) -> Result<Arc<dyn BackendAdapter>, SchedulerError> {
    for &kind in priority {
        let adapter = create_adapter(kind, Arc::clone(&env));
        match adapter.probe() {
            Ok(()) => {
                tracing::info!(backend = %kind, "detected backend");
                return Ok(adapter);
            }
            Err(prerequisite) => {
                tracing::debug!(backend = %kind, %prerequisite, "backend unavailable");
            }
        }
    }
    Err(SchedulerError::NoBackendAvailable(priority.to_vec()))
}
