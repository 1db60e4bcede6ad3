//! Mend - a self-healing debugging engine
//!
//! Runs a project's test suite, parses failures, and escalates each one
//! through learned fixes, syntactic quick-fixes, and model-generated
//! patches, validating and rolling back as it goes.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mend::config::{self, Config};
use mend::executor::PytestExecutor;
use mend::oracle::HttpPatchOracle;
use mend::report::Reporter;
use mend::session::Controller;
use mend::tracker::PatchTracker;
use mend::vault;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "mend",
    about = "Self-healing debugging engine",
    long_about = "Runs your test suite, parses failures, and repairs them with\n\
                  learned fixes, syntactic quick-fixes, and model-generated patches.\n\
                  Everything is backed up before mutation and rolled back on failure.",
    version
)]
struct Args {
    /// Path to the project (defaults to current directory)
    #[arg(long, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a full debugging session
    Debug {
        /// Restrict the initial test run to one file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show recent patch attempts
    Logs,
    /// Restore files from leftover session backups
    Rollback,
    /// Show daily debugging performance
    Performance,
    /// Show import-fix statistics
    FixImports,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .compact()
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let is_usage_error = err.use_stderr();
            let _ = err.print();
            // Help and version land on stdout and are not usage errors.
            std::process::exit(if is_usage_error { 3 } else { 0 });
        }
    };

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(2);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let project_root = args
        .project
        .canonicalize()
        .unwrap_or_else(|_| args.project.clone());
    let config = Config::load(&project_root);
    let data_dir = config::data_dir(&project_root);

    match args.command {
        Cmd::Debug { file } => {
            if !mend::executor::has_test_suite(&project_root) {
                tracing::warn!(
                    "no tests/ directory or Python project markers found; \
                     pytest may collect nothing"
                );
            }
            let executor = PytestExecutor::new(
                project_root.clone(),
                Duration::from_secs(config.executor_timeout_secs),
            );
            let providers = HttpPatchOracle::chain_from_env(
                &config.oracle_primary_model,
                &config.oracle_secondary_model,
            );
            if providers.is_empty() {
                tracing::warn!(
                    "no oracle configured (set OPENROUTER_API_KEY); \
                     using learned and pattern fixes only"
                );
            }
            let mut controller = Controller::new(
                project_root,
                config,
                Box::new(executor),
                providers,
                None,
                file,
            );
            let outcome = controller.run_session()?;
            print!("{}", Reporter::load(&data_dir).summary());
            Ok(outcome.exit_code())
        }
        Cmd::Logs => {
            let tracker = PatchTracker::load(&data_dir);
            let attempts = tracker.recent_attempts(20);
            if attempts.is_empty() {
                println!("No debugging attempts recorded yet.");
            }
            for (sig, outcome) in attempts {
                println!(
                    "{}  {}  {}  {}  {}",
                    outcome.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    sig.short(),
                    outcome.provenance.name(),
                    outcome.status.name(),
                    outcome.reason.as_deref().unwrap_or("-"),
                );
            }
            Ok(0)
        }
        Cmd::Rollback => {
            let restored = vault::restore_leftover_sessions(&data_dir)?;
            if restored == 0 {
                println!("No leftover session backups to restore.");
            } else {
                println!("Restored {} file(s) from session backups.", restored);
            }
            Ok(0)
        }
        Cmd::Performance => {
            let tracker = PatchTracker::load(&data_dir);
            if tracker.performance().is_empty() {
                println!("No performance data available yet.");
            }
            for (date, stats) in tracker.performance().iter().rev() {
                println!(
                    "{}  total fixes: {}  success rate: {:.2}%  {}",
                    date, stats.total_fixes, stats.success_rate, stats.feedback_summary
                );
            }
            Ok(0)
        }
        Cmd::FixImports => {
            let tracker = PatchTracker::load(&data_dir);
            if tracker.import_fix_stats().is_empty() {
                println!("No import fixes recorded.");
            }
            for (module, stats) in tracker.import_fix_stats() {
                println!(
                    "{}  fixed: {}  failed: {}",
                    module, stats.fixed, stats.failed
                );
            }
            Ok(0)
        }
    }
}
