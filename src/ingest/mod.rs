pub mod kerberos;
pub mod scanner;

use std::path::Path;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::database::ResultStore;
use crate::media::mimetype::{is_video, sniff_mimetype};
use crate::orchestrator::PipelineContext;
use crate::queue::{Broker, Task};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub files: usize,
    pub registered: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

/// Registers every event described under `root` and enqueues analysis for the ones not yet done.
pub fn ingest_directory(ctx: &mut PipelineContext, root: &Path, show_progress: bool) -> Result<IngestReport> {
    let files = scanner::scan_directory(root)?;
    let progress = if show_progress {
        let bar = ProgressBar::new(files.len() as u64);
        bar.set_style(ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
        )?);
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut report = IngestReport {
        files: files.len(),
        ..IngestReport::default()
    };
    let analyze_method = Task::analyze("").method_name();

    for path in &files {
        progress.inc(1);
        let event = match kerberos::read_event_file(path) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping {:?}: {:#}", path, e);
                report.skipped += 1;
                continue;
            }
        };

        let video = event.file_path(&ctx.settings.local_data_dir);
        if video.exists() && !is_video(&video) {
            let mime = sniff_mimetype(&video).ok().flatten().unwrap_or("unknown type");
            warn!("Skipping {}: {:?} is {}, not a video", event.event_name, video, mime);
            report.skipped += 1;
            continue;
        }

        progress.set_message(event.event_name.clone());
        ctx.store.register_event(&event)?;
        report.registered += 1;

        if ctx.store.find_successful(&event.event_name, analyze_method)?.is_none() {
            let task = Task::analyze(event.event_name.as_str());
            ctx.broker.enqueue(task.queue(), &task, task.default_policy(), None, None)?;
            report.enqueued += 1;
        }
    }

    progress.finish_and_clear();
    info!(
        "Ingested {:?}: {} files, {} events registered, {} analyses enqueued, {} skipped",
        root, report.files, report.registered, report.enqueued, report.skipped
    );
    Ok(report)
}
