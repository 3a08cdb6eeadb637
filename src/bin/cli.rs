//! regwatch CLI
//!
//! Local execution entry point for the monitoring engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use regwatch::{
    config::{ConfigWatcher, load_config_or_default},
    error::{AppError, Result},
    models::{Config, DigestCadence, JobOutcome, RecordFilter, SeverityTier},
    pipeline::{Engine, EngineBuilder},
    utils::log as report,
};
use tokio_util::sync::CancellationToken;

/// regwatch - Regulatory Change Monitor
#[derive(Parser, Debug)]
#[command(
    name = "regwatch",
    version,
    about = "Monitors regulatory sources for changes and notifies interested parties"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "regwatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DigestArg {
    Daily,
    Weekly,
}

impl From<DigestArg> for DigestCadence {
    fn from(arg: DigestArg) -> Self {
        match arg {
            DigestArg::Daily => DigestCadence::Daily,
            DigestArg::Weekly => DigestCadence::Weekly,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,

    /// Run one cycle for a source now and wait for it
    Trigger {
        /// Source id
        source: String,
    },

    /// Validate the configuration file
    Validate,

    /// List registered sources and their health
    Sources,

    /// Re-enable a source disabled by the circuit breaker
    Enable {
        /// Source id
        source: String,
    },

    /// Show recorded changes, or raw audit entries with --audit
    History {
        /// Only this source
        #[arg(long)]
        source: Option<String>,

        /// Minimum severity tier (e.g. HIGH)
        #[arg(long)]
        min_severity: Option<String>,

        /// Most recent N entries
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Show audit entries instead of changes
        #[arg(long)]
        audit: bool,
    },

    /// Deliver queued digests now
    FlushDigest {
        #[arg(value_enum, default_value = "daily")]
        cadence: DigestArg,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, default_level: &str) {
    let level = if verbose { "debug" } else { default_level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

async fn build_engine(config: Config) -> Result<Engine> {
    EngineBuilder::new(config).build().await
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    report::set_quiet(cli.quiet);

    let config = load_config_or_default(&cli.config)?;
    init_logging(cli.verbose, &config.logging.level);
    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Run => {
            report::header("regwatch scheduler");
            let engine = build_engine(config).await?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Interrupt received, shutting down");
                    signal.cancel();
                }
            });

            let watcher = cli.config.exists().then(|| ConfigWatcher::new(&cli.config));
            engine.run(shutdown, watcher).await;
            report::success("Scheduler stopped");
        }

        Command::Trigger { source } => {
            let engine = build_engine(config).await?;
            let job = engine.scheduler().trigger_now(&source).await?.wait().await?;
            engine.scheduler().shutdown().await;

            report::summary(
                &format!("Job {}", job.id),
                &[
                    ("Source", job.source_id.clone()),
                    ("Outcome", job.outcome.as_str().to_string()),
                    ("Items", job.items_processed.to_string()),
                    ("Error", job.error.clone().unwrap_or_else(|| "-".into())),
                ],
            );
            if job.outcome == JobOutcome::Failed {
                report::error(&format!("Cycle for '{}' failed", job.source_id));
            }
        }

        Command::Validate => {
            report::info("Validating configuration...");
            config.validate()?;
            report::success(&format!(
                "Config OK ({} sources, {} recipients, {} parsers)",
                config.sources.len(),
                config.recipients.len(),
                config.parsers.len()
            ));
        }

        Command::Sources => {
            let engine = build_engine(config).await?;
            report::header("Sources");
            for source in engine.store().list_sources().await? {
                let status = match (source.enabled, source.needs_review) {
                    (true, _) => "enabled",
                    (false, true) => "disabled (needs review)",
                    (false, false) => "disabled",
                };
                report::info(&format!("{} [{}] {}", source.id, status, source.target));
                report::sub_item(&format!(
                    "cadence: {}, parser: {}, consecutive failures: {}",
                    source.cadence.expression(),
                    source.parser,
                    source.consecutive_failures
                ));
            }
        }

        Command::Enable { source } => {
            let engine = build_engine(config).await?;
            let enabled = engine.scheduler().enable_source(&source).await?;
            report::success(&format!("Source '{}' re-enabled", enabled.id));
        }

        Command::History {
            source,
            min_severity,
            limit,
            audit,
        } => {
            let min_severity = match min_severity {
                Some(tier) => Some(SeverityTier::parse(&tier).ok_or_else(|| {
                    AppError::validation(format!("unknown severity tier '{tier}'"))
                })?),
                None => None,
            };
            let filter = RecordFilter {
                source_id: source,
                min_severity,
                limit: Some(limit),
                ..RecordFilter::default()
            };

            let engine = build_engine(config).await?;
            let trail = engine.trail();
            if audit {
                report::header("Audit trail");
                for entry in trail.entries(&filter).await? {
                    report::info(&format!(
                        "#{} {} {} {}",
                        entry.sequence,
                        entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.source_id.as_deref().unwrap_or("-"),
                        entry.event.kind()
                    ));
                }
            } else {
                report::header("Changes");
                for view in trail.changes(&filter).await? {
                    let change = &view.change;
                    let tier = view
                        .assessment
                        .as_ref()
                        .map_or("UNASSESSED", |a| a.tier.as_str());
                    report::info(&format!(
                        "{} {} {} [{}]",
                        change.detected_at.format("%Y-%m-%d %H:%M:%S"),
                        change.source_id,
                        change.change_type.as_str(),
                        tier
                    ));
                    for line in change.diff_summary.lines().take(5) {
                        report::sub_item(line);
                    }
                }
            }
        }

        Command::FlushDigest { cadence } => {
            let engine = build_engine(config).await?;
            let flushed = engine.scheduler().flush_digests(cadence.into()).await;
            report::summary(
                "Digest flush",
                &[
                    ("Deliveries", flushed.deliveries.to_string()),
                    ("Sent", flushed.sent.to_string()),
                    ("Failed", flushed.failed.to_string()),
                    ("Requeued", flushed.requeued.to_string()),
                ],
            );
        }
    }

    Ok(())
}
