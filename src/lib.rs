//! A uniform submission and wait façade over SLURM, SGE/OGS, LSF, GNU
//! `parallel`, and fully sequential local execution.
//!
//! Callers never talk to a backend directly: [`facade::Scheduler`] detects
//! (or is told) which backend is active, and every submission and wait call
//! goes through it. See [`registry::detect`] for backend selection and
//! [`compiler`] for how a [`resource::ResourceRequest`] becomes backend flags.

pub mod backend;
pub mod compiler;
pub mod config;
pub mod env;
pub mod error;
pub mod facade;
pub mod handle;
pub mod logdir;
pub mod registry;
pub mod resource;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use facade::Scheduler;
pub use handle::BackendKind;
pub use handle::JobHandle;
pub use handle::JobSet;
