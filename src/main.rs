//! The `batch-scheduler` command line entry point.
//!
//! Resolves the active backend for the current environment and configuration,
//! reporting the outcome the way a pipeline driver wrapping this crate would:
//! a detected/forced backend name on success, or a diagnostic on the standard
//! error stream and a non-zero exit code on failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use batch_scheduler::BackendKind;
use batch_scheduler::SchedulerConfig;
use batch_scheduler::config::BackendSelector;
use batch_scheduler::env::ProcessEnv;
use batch_scheduler::registry;
use clap::Parser;
use clap_verbosity_flag::Verbosity;

/// Detects the active batch scheduling backend and reports it.
#[derive(Parser)]
#[clap(name = "batch-scheduler", version, propagate_version = true)]
struct App {
    /// Force the SLURM backend.
    #[arg(short = 'S', long, conflicts_with_all = ["sge", "lsf", "parallel"])]
    slurm: bool,

    /// Force the SGE/OGS backend.
    #[arg(short = 'Q', long, conflicts_with_all = ["slurm", "lsf", "parallel"])]
    sge: bool,

    /// Force the LSF backend.
    #[arg(short = 'l', long, conflicts_with_all = ["slurm", "sge", "parallel"])]
    lsf: bool,

    /// Force the GNU `parallel` backend.
    #[arg(short = 'P', long, conflicts_with_all = ["slurm", "sge", "lsf"])]
    parallel: bool,

    /// Path to a configuration file, overriding the default search path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// The verbosity flags.
    #[command(flatten)]
    verbose: Verbosity,
}

impl App {
    /// The backend forced by a single-letter flag, if any.
    fn forced_backend(&self) -> Option<BackendKind> {
        if self.slurm {
            Some(BackendKind::Slurm)
        } else if self.sge {
            Some(BackendKind::Sge)
        } else if self.lsf {
            Some(BackendKind::Lsf)
        } else if self.parallel {
            Some(BackendKind::Parallel)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let app = App::parse();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(app.verbose.tracing_level_filter())
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("a global tracing subscriber was already installed");
    }

    match run(app).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(app: App) -> anyhow::Result<()> {
    let work_dir = std::env::current_dir().ok();
    let install_root = dirs::data_local_dir();

    let mut config = SchedulerConfig::load(app.config.as_deref(), work_dir.as_deref(), install_root.as_deref())?;

    if let Some(forced) = app.forced_backend() {
        config.backend_selector = BackendSelector::Explicit(forced);
    }

    let env = Arc::new(ProcessEnv::current());
    let adapter = registry::detect(&config, env)?;

    println!("{backend}", backend = adapter.kind());
    Ok(())
}
