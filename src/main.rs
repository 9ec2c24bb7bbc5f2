//! binderflow: energy and DVFS analysis of binder-linked Android traces.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use binderflow::{analyze, Capture, Config, EnergyProfile, EventReader, ProcessTree, PsSnapshot};

#[derive(Parser)]
#[command(name = "binderflow")]
#[command(about = "Energy and DVFS analysis of binder-linked Android traces")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace and print the JSON report
    Analyze {
        /// Capture file describing the device and the relevant PIDs
        #[arg(short, long)]
        capture: PathBuf,

        /// Event stream, one JSON event per line
        #[arg(short, long)]
        events: PathBuf,

        /// Energy profile (defaults to the built-in Odroid XU3 model)
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Timeline bucket width in milliseconds
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
    },

    /// Build a capture skeleton from a saved `ps -T` listing
    Classify {
        /// Output of `busybox ps -T`
        #[arg(long)]
        ps: PathBuf,

        /// Process name of the application under test
        #[arg(short, long)]
        app: String,
    },

    /// Write the compiled per-core utilization tables as JSON
    DumpUtil {
        #[arg(short, long)]
        capture: PathBuf,

        #[arg(short, long)]
        events: PathBuf,

        /// Directory receiving one `core<N>.json` per core
        #[arg(short, long)]
        out_dir: PathBuf,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_config(capture: &Capture, profile: Option<&Path>, interval_ms: u64) -> Result<Config> {
    let profile = match profile {
        Some(path) => EnergyProfile::from_json(path)?,
        None => EnergyProfile::default(),
    };
    let config = Config {
        timeline_interval_us: interval_ms * 1000,
        profile,
        initial: capture.initial.clone(),
        ..Config::default()
    };
    config.validate()?;
    Ok(config)
}

fn run_analyze(
    capture: &Path,
    events: &Path,
    profile: Option<&Path>,
    interval_ms: u64,
) -> Result<()> {
    let capture = Capture::load(capture)?;
    let config = build_config(&capture, profile, interval_ms)?;
    if !capture.application.is_empty() {
        info!(
            "Analyzing {} (governor: {})",
            capture.application, capture.governor
        );
    }

    let reader = EventReader::open(events)?;
    let report = analyze(&config, Box::new(capture.pids), reader)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_classify(ps: &Path, app: &str) -> Result<()> {
    let snapshot = PsSnapshot::load(ps)?;
    let pids = snapshot.classify(app)?;
    let capture = Capture {
        application: app.to_string(),
        pids,
        ..Capture::default()
    };
    println!("{}", serde_json::to_string_pretty(&capture)?);
    Ok(())
}

fn run_dump_util(capture: &Path, events: &Path, out_dir: &Path) -> Result<()> {
    let capture = Capture::load(capture)?;
    let config = build_config(&capture, None, 50)?;

    let mut tree = ProcessTree::new(&config, Box::new(capture.pids));
    for event in EventReader::open(events)? {
        tree.handle(&event?)?;
    }
    let graph = tree.finish(config.compile_threads)?;
    if graph.metrics.time_range().is_none() {
        bail!("No events in {}", events.display());
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    for table in graph.metrics.cores() {
        let path = out_dir.join(format!("core{}.json", table.core()));
        table.compiled().save(&path)?;
    }
    info!(
        "Wrote {} utilization tables to {}",
        graph.metrics.cores().len(),
        out_dir.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    match cli.command {
        Commands::Analyze {
            capture,
            events,
            profile,
            interval_ms,
        } => run_analyze(&capture, &events, profile.as_deref(), interval_ms),
        Commands::Classify { ps, app } => run_classify(&ps, &app),
        Commands::DumpUtil {
            capture,
            events,
            out_dir,
        } => run_dump_util(&capture, &events, &out_dir),
    }
}
