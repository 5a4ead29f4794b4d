use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::bounded;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use motion_watch::database::{ClassificationView, ComputationView, ResultStore, SqliteStore};
use motion_watch::ingest::ingest_directory;
use motion_watch::media::FfmpegSource;
use motion_watch::ml::InferenceEngine;
use motion_watch::orchestrator::{analyze_event, PipelineContext, TaskOutcome, Worker};
use motion_watch::queue::{Broker, SqliteBroker, Task, ALL_QUEUES, QUEUE_PREDICTION, QUEUE_WRITE_IMAGE};
use motion_watch::utils::config::{Settings, DEFAULT_CONFIG_FILE};
use motion_watch::vision::find_moving_objects;

#[derive(Parser, Debug)]
#[command(author, version, about = "Significant-frame extraction and classification for motion events", long_about = None)]
struct Args {
    /// KEY=VALUE settings file.
    #[arg(short, long, env = "WATCHER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue significant-frame analysis for the named events.
    Enqueue {
        #[arg(required = true)]
        events: Vec<String>,
    },
    /// Run jobs until Ctrl-C.
    Worker {
        /// Queues to poll, in order. Defaults to all of them.
        #[arg(short, long)]
        queue: Vec<String>,
    },
    /// List dead-lettered jobs and the jobs they block.
    Failed {
        /// Delete them, together with their blocked dependents.
        #[arg(long)]
        purge: bool,
    },
    /// Give every dead-lettered job a fresh set of attempts.
    RequeueFailed,
    /// Analyze one event in this process, then run its follow-up jobs.
    Single { event: String },
    /// Print the moving-object boxes of a video as JSON.
    Motion {
        video: PathBuf,
        /// Leave out frames without motion.
        #[arg(long)]
        motion_only: bool,
    },
    /// Print the recorded computations and classifications of an event.
    Results { event: String },
    /// Register Kerberos event metadata found under a directory and queue analysis.
    Ingest { dir: PathBuf },
}

fn build_context(settings: Settings) -> Result<PipelineContext> {
    let store = SqliteStore::open(&settings.db_path)
        .with_context(|| format!("Failed to open database {}", settings.db_path))?;
    let broker = SqliteBroker::open(&settings.db_path)
        .with_context(|| format!("Failed to open job queue {}", settings.db_path))?
        .with_lease(settings.job_lease);
    let source = FfmpegSource::with_ffmpeg(&settings.ffmpeg_bin);

    let model = settings.still_model_file.clone();
    let labels = settings.still_labels_file.clone();
    let mut ctx = PipelineContext::new(settings, Box::new(store), Box::new(broker), Box::new(source));

    // Jobs that need the classifier fail and retry without it; everything else still runs.
    match (model, labels) {
        (Some(model), Some(labels)) => match InferenceEngine::new(&model, &labels) {
            Ok(engine) => ctx = ctx.with_classifier(Box::new(engine)),
            Err(e) => error!("Failed to initialize still classifier (check model paths): {:#}", e),
        },
        _ => warn!("STILL_MODEL_FILE/STILL_LABELS_FILE not set; classification jobs will fail"),
    }
    Ok(ctx)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load_from(&args.config)?;

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::new(settings.filter_directive(rust_log.as_deref())?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.config.exists() {
        info!("Loaded settings from {:?}", args.config);
    } else {
        info!("No settings file at {:?}; using defaults", args.config);
    }

    let mut ctx = build_context(settings)?;
    run_command(&mut ctx, args.command)
}

fn run_command(ctx: &mut PipelineContext, command: Command) -> Result<()> {
    match command {
        Command::Enqueue { events } => {
            for event in events {
                let task = Task::analyze(event);
                let id = ctx.broker.enqueue(task.queue(), &task, task.default_policy(), None, None)?;
                println!("{}\t{}", id, task.event_name());
            }
        }
        Command::Worker { queue } => {
            let queues = if queue.is_empty() {
                ALL_QUEUES.iter().map(|q| q.to_string()).collect()
            } else {
                queue
            };

            let (shutdown_tx, shutdown_rx) = bounded(1);
            ctrlc::set_handler(move || {
                let _ = shutdown_tx.try_send(());
            })
            .context("Failed to install Ctrl-C handler")?;

            Worker::new(queues).run(ctx, shutdown_rx)?;
        }
        Command::Failed { purge } => {
            ctx.broker.reclaim_expired()?;
            for job in ctx.broker.dead_letters(None)? {
                let blocked = ctx.broker.blocked_by(job.id)?;
                println!(
                    "{}\t{}\t{}\t{}\tattempts={}\tblocking={}\t{}",
                    job.id,
                    job.queue,
                    job.task.method_name(),
                    job.task.event_name(),
                    job.attempts,
                    blocked.len(),
                    job.last_error.as_deref().unwrap_or("")
                );
                if purge {
                    let removed = ctx.broker.purge(job.id)?;
                    info!("Purged job {} and {} dependent(s)", job.id, removed.saturating_sub(1));
                }
            }
        }
        Command::RequeueFailed => {
            ctx.broker.reclaim_expired()?;
            let dead = ctx.broker.dead_letters(None)?;
            for job in &dead {
                ctx.broker.requeue(job.id)?;
            }
            println!("Requeued {} job(s)", dead.len());
        }
        Command::Single { event } => {
            match analyze_event(ctx, &event) {
                TaskOutcome::AlreadyComputed => println!("{}: already computed", event),
                TaskOutcome::Computed(record) => {
                    print_json(&serde_json::to_value(ComputationView::from(&record))?)?
                }
                TaskOutcome::Failed(e) => return Err(e).with_context(|| format!("Analysis of {} failed", event)),
            }
            let followups = Worker::new(vec![QUEUE_WRITE_IMAGE.to_string(), QUEUE_PREDICTION.to_string()]);
            let executed = followups.drain(ctx)?;
            info!("Ran {} follow-up job(s) for {}", executed, event);
        }
        Command::Results { event } => {
            let computations: Vec<ComputationView> = ctx
                .store
                .computations_for(&event)?
                .iter()
                .map(ComputationView::from)
                .collect();
            let classifications: Vec<ClassificationView> = ctx
                .store
                .classifications_for(&event)?
                .iter()
                .map(ClassificationView::from)
                .collect();
            print_json(&json!({
                "event_id": event,
                "computations": computations,
                "classifications": classifications,
            }))?;
        }
        Command::Ingest { dir } => {
            let report = ingest_directory(ctx, &dir, true)?;
            println!(
                "{} file(s): {} registered, {} enqueued, {} skipped",
                report.files, report.registered, report.enqueued, report.skipped
            );
        }
        Command::Motion { video, motion_only } => {
            let config = ctx.settings.detector_config();
            let mut boxes = find_moving_objects(ctx.source.as_ref(), &video, config)?;
            if motion_only {
                boxes.retain(|_, frame_boxes| !frame_boxes.is_empty());
            }
            print_json(&serde_json::to_value(&boxes)?)?;
        }
    }
    Ok(())
}
