use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::database::{
    Classification, ComputationRecord, EventObservation, RecordOutcome, ResultStore,
};
use crate::error::{PipelineError, Result};
use crate::media::{decode_with_retry, probe_with_retry, FrameSource};
use crate::ml::Classifier;
use crate::now_s;
use crate::orchestrator::PipelineContext;
use crate::queue::{Broker, Job, JobId, JobStatus, Task};
use crate::vision::SignificantFrameSelector;

pub const STILL_MODEL_DECIDER: &str = "still_model";

/// How a handler finished. "Already done" is a success, not an error.
#[derive(Debug)]
pub enum TaskOutcome {
    AlreadyComputed,
    Computed(ComputationRecord),
    Failed(PipelineError),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, TaskOutcome::Failed(_))
    }
}

/// The per-clip result of significant-frame analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignificantFrameResult {
    pub event_id: String,
    pub frame_index: Option<usize>,
    pub frame_count: usize,
    pub duration: f64,
    pub computed_at: i64,
    pub success: bool,
    pub error: Option<String>,
}

impl SignificantFrameResult {
    /// The opaque metadata stored with the computation record.
    pub fn metadata(&self) -> serde_json::Value {
        match &self.error {
            Some(error) => json!({ "error": error }),
            None => json!({
                "most_significant_frame": self.frame_index,
                "number_of_frames": self.frame_count,
                "duration": self.duration,
            }),
        }
    }
}

/// Output of a successful handler before it is written to the ledger.
struct Completed {
    result: serde_json::Value,
    result_file: Option<String>,
    result_file_location: Option<String>,
}

fn host_info() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{} ({}/{})", host, std::env::consts::OS, std::env::consts::ARCH)
}

fn ledger_entry(
    event_name: &str,
    method_name: &str,
    started_at: i64,
    timer: Instant,
    outcome: &Result<Completed>,
) -> ComputationRecord {
    let (success, result, result_file, result_file_location) = match outcome {
        Ok(done) => (
            true,
            done.result.clone(),
            done.result_file.clone(),
            done.result_file_location.clone(),
        ),
        Err(e) => (false, json!({ "error": e.to_string() }), None, None),
    };
    ComputationRecord {
        id: None,
        event_name: event_name.to_string(),
        method_name: method_name.to_string(),
        computed_at: started_at,
        elapsed_seconds: timer.elapsed().as_secs_f64(),
        host_info: host_info(),
        success,
        result,
        result_file,
        result_file_location,
    }
}

/// Writes the outcome of one executed step to the ledger and turns it into a TaskOutcome.
fn record_outcome(
    ctx: &mut PipelineContext,
    event_name: &str,
    method_name: &str,
    started_at: i64,
    timer: Instant,
    outcome: Result<Completed>,
) -> TaskOutcome {
    let mut record = ledger_entry(event_name, method_name, started_at, timer, &outcome);
    let stored = ctx.store.record_computation(&record);

    match (outcome, stored) {
        (Err(e), stored) => {
            if let Err(store_err) = stored {
                error!("Could not record failed {} for {}: {}", method_name, event_name, store_err);
            }
            TaskOutcome::Failed(e)
        }
        (Ok(_), Ok(RecordOutcome::Inserted(id))) => {
            record.id = Some(id);
            TaskOutcome::Computed(record)
        }
        (Ok(_), Ok(RecordOutcome::Duplicate)) => TaskOutcome::AlreadyComputed,
        (Ok(_), Err(e)) => TaskOutcome::Failed(e),
    }
}

/// `{BASE_DIR}/{video_location}/{event_name}_f{frame_index}.jpg`
pub fn still_path(base_dir: &Path, event: &EventObservation, frame_index: usize) -> PathBuf {
    base_dir
        .join(&event.video_location)
        .join(format!("{}_f{}.jpg", event.event_name, frame_index))
}

/// Where to read the event's clip: the local file, or the public URL when the file is gone.
fn video_locator(ctx: &PipelineContext, event: &EventObservation) -> Result<PathBuf> {
    let local = event.file_path(&ctx.settings.local_data_dir);
    if local.exists() {
        return Ok(local);
    }
    match &ctx.settings.public_video_url {
        Some(base) => {
            let url = event.video_url(base);
            info!("{:?} not found locally; reading {}", local, url);
            Ok(PathBuf::from(url))
        }
        None => Err(PipelineError::MediaUnavailable {
            path: local,
            reason: "file does not exist".to_string(),
        }),
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(buf)
}

/// Selection plus the encoded still, before anything is enqueued.
struct Analysis {
    event: EventObservation,
    result: SignificantFrameResult,
    jpeg: Vec<u8>,
}

fn find_significant_frame(ctx: &PipelineContext, event_name: &str, started_at: i64) -> Result<Analysis> {
    let event = ctx
        .store
        .event_by_name(event_name)?
        .ok_or_else(|| PipelineError::EventNotFound(event_name.to_string()))?;

    let locator = video_locator(ctx, &event)?;
    let settings = &ctx.settings;
    let info = probe_with_retry(
        ctx.source.as_ref(),
        &locator,
        settings.probe_attempts,
        settings.probe_retry_delay,
    )?;
    let clip = decode_with_retry(
        ctx.source.as_ref(),
        &locator,
        &info,
        settings.probe_attempts,
        settings.probe_retry_delay,
    )?;

    let selection = SignificantFrameSelector::new(settings.selector_config()).select(&clip)?;
    let frame = clip
        .frames
        .get(selection.frame_index)
        .ok_or_else(|| PipelineError::Decode(format!("frame {} missing", selection.frame_index)))?;
    let jpeg = encode_jpeg(&frame.image, settings.jpeg_quality)?;

    info!(
        "{}: significant frame {} of {} (score {})",
        event_name,
        selection.frame_index,
        selection.frame_count,
        selection.peak_score()
    );

    Ok(Analysis {
        result: SignificantFrameResult {
            event_id: event.event_name.clone(),
            frame_index: Some(selection.frame_index),
            frame_count: selection.frame_count,
            duration: clip.info.duration,
            computed_at: started_at,
            success: true,
            error: None,
        },
        event,
        jpeg,
    })
}

/// Enqueues write-image and, behind it, classification. Returns both job ids.
fn enqueue_followups(ctx: &mut PipelineContext, analysis: Analysis, image_path: &Path) -> Result<(JobId, JobId)> {
    let frame_index = analysis.result.frame_index.unwrap_or(0);
    let image_path = image_path.to_string_lossy().into_owned();

    let write = Task::WriteImage {
        event_name: analysis.event.event_name.clone(),
        frame_index,
        image_path: image_path.clone(),
    };
    let write_id = ctx.broker.enqueue(
        write.queue(),
        &write,
        write.default_policy(),
        None,
        Some(&analysis.jpeg),
    )?;

    let classify = Task::ClassifyFrame {
        event_name: analysis.event.event_name,
        image_path,
    };
    let classify_id = ctx.broker.enqueue(
        classify.queue(),
        &classify,
        classify.default_policy(),
        Some(write_id),
        None,
    )?;
    Ok((write_id, classify_id))
}

/// Significant-frame analysis for one event, skipped when it already succeeded.
pub fn analyze_event(ctx: &mut PipelineContext, event_name: &str) -> TaskOutcome {
    let method = Task::analyze(event_name).method_name();
    match ctx.store.find_successful(event_name, method) {
        Ok(Some(_)) => {
            info!("{} already has a successful {}; skipping", event_name, method);
            return TaskOutcome::AlreadyComputed;
        }
        Ok(None) => {}
        Err(e) => return TaskOutcome::Failed(e),
    }

    let started_at = now_s();
    let timer = Instant::now();

    let analysis = match find_significant_frame(ctx, event_name, started_at) {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!("Significant frame for {} failed: {}", event_name, e);
            return record_outcome(ctx, event_name, method, started_at, timer, Err(e));
        }
    };

    let frame_index = analysis.result.frame_index.unwrap_or(0);
    let image_path = still_path(&ctx.settings.base_dir, &analysis.event, frame_index);
    let completed = Completed {
        result: analysis.result.metadata(),
        result_file: image_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned()),
        result_file_location: image_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned()),
    };

    let (write_id, classify_id) = match enqueue_followups(ctx, analysis, &image_path) {
        Ok(ids) => ids,
        Err(e) => return record_outcome(ctx, event_name, method, started_at, timer, Err(e)),
    };

    let outcome = record_outcome(ctx, event_name, method, started_at, timer, Ok(completed));
    match &outcome {
        TaskOutcome::Computed(_) => {}
        // A concurrent delivery won the ledger insert and owns the follow-up work.
        TaskOutcome::AlreadyComputed => {
            cancel_followups(ctx, [classify_id, write_id]);
            info!("{}: duplicate analysis discarded", event_name);
        }
        // No ledger row: a rerun must not find this run's stills waiting behind it.
        TaskOutcome::Failed(e) => {
            cancel_followups(ctx, [classify_id, write_id]);
            warn!("{}: analysis not recorded ({}); follow-up jobs cancelled", event_name, e);
        }
    }
    outcome
}

fn cancel_followups(ctx: &mut PipelineContext, ids: [JobId; 2]) {
    for id in ids {
        if let Err(e) = ctx.broker.cancel(id) {
            warn!("Could not cancel follow-up job {}: {}", id, e);
        }
    }
}

fn write_still(job: &Job, image_path: &str, frame_index: usize) -> Result<Completed> {
    let bytes = job.attachment.as_deref().ok_or_else(|| {
        PipelineError::InvalidInput(format!("write job {} carries no image", job.id))
    })?;
    let path = Path::new(image_path);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, bytes)?;
    info!("Wrote {} bytes to {:?}", bytes.len(), path);

    Ok(Completed {
        result: json!({ "frame_index": frame_index, "bytes": bytes.len() }),
        result_file: path.file_name().map(|f| f.to_string_lossy().into_owned()),
        result_file_location: path.parent().map(|p| p.to_string_lossy().into_owned()),
    })
}

fn classify_still(ctx: &mut PipelineContext, event_name: &str, image_path: &str) -> Result<Completed> {
    let classifier = ctx
        .classifier
        .as_ref()
        .ok_or_else(|| PipelineError::Classifier("no still model configured".into()))?;
    let prediction = classifier.classify(Path::new(image_path))?;

    ctx.store.add_classification(&Classification {
        event_name: event_name.to_string(),
        label: prediction.label.clone(),
        confidence: Some(prediction.confidence),
        decider: STILL_MODEL_DECIDER.to_string(),
        decided_at: now_s(),
    })?;
    info!("{}: {} ({:.3})", event_name, prediction.label, prediction.confidence);

    Ok(Completed {
        result: serde_json::to_value(&prediction)?,
        result_file: None,
        result_file_location: None,
    })
}

/// Dispatches a claimed job to its handler.
pub fn execute(ctx: &mut PipelineContext, job: &Job) -> TaskOutcome {
    let method = job.task.method_name();
    match &job.task {
        Task::AnalyzeEvent { event_name } => analyze_event(ctx, event_name),
        Task::WriteImage {
            event_name,
            frame_index,
            image_path,
        } => {
            let (started_at, timer) = (now_s(), Instant::now());
            let done = write_still(job, image_path, *frame_index);
            record_outcome(ctx, event_name, method, started_at, timer, done)
        }
        Task::ClassifyFrame {
            event_name,
            image_path,
        } => {
            let (started_at, timer) = (now_s(), Instant::now());
            let done = classify_still(ctx, event_name, image_path);
            record_outcome(ctx, event_name, method, started_at, timer, done)
        }
    }
}

/// Claims and runs at most one job from `queue`, then acks or fails it.
/// Returns the job's new status, or None when nothing was dispatchable.
pub fn run_once(ctx: &mut PipelineContext, queue: &str) -> Result<Option<(JobId, JobStatus)>> {
    let Some(job) = ctx.broker.poll(queue)? else {
        return Ok(None);
    };
    info!(
        "Dispatching job {} ({}) for {}, attempt {}/{}",
        job.id,
        job.task.method_name(),
        job.task.event_name(),
        job.attempts,
        job.policy.max_attempts
    );

    let status = match execute(ctx, &job) {
        TaskOutcome::AlreadyComputed | TaskOutcome::Computed(_) => {
            ctx.broker.ack(job.id)?;
            JobStatus::Succeeded
        }
        TaskOutcome::Failed(e) => {
            let status = ctx.broker.fail(job.id, &e.to_string())?;
            if status == JobStatus::DeadLettered {
                for blocked in ctx.broker.blocked_by(job.id)? {
                    let err = PipelineError::DependencyFailed {
                        job_id: blocked.id,
                        parent: job.id,
                    };
                    warn!("{} ({} for {})", err, blocked.task.method_name(), blocked.task.event_name());
                }
            }
            status
        }
    };
    Ok(Some((job.id, status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use crate::media::{Clip, ClipInfo};
    use crate::ml::Prediction;
    use crate::orchestrator::Worker;
    use crate::queue::{RetryPolicy, SqliteBroker, ALL_QUEUES};
    use crate::utils::Settings;
    use image::Rgb;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    fn synthetic_clip() -> Clip {
        let images = (0..10)
            .map(|i| {
                let mut img = RgbImage::from_pixel(200, 200, Rgb([10, 10, 10]));
                if i == 7 {
                    for y in 100..150 {
                        for x in 100..150 {
                            img.put_pixel(x, y, Rgb([255, 255, 255]));
                        }
                    }
                }
                img
            })
            .collect();
        Clip::from_images(images, 10.0).unwrap()
    }

    /// Serves the synthetic clip for any locator, after the scripted transient failures.
    struct ScriptedSource {
        clip: Clip,
        probe_failures: Cell<u32>,
        decode_failures: Cell<u32>,
        seen: Rc<RefCell<Vec<PathBuf>>>,
    }

    impl ScriptedSource {
        fn new(seen: Rc<RefCell<Vec<PathBuf>>>, probe_failures: u32, decode_failures: u32) -> Self {
            Self {
                clip: synthetic_clip(),
                probe_failures: Cell::new(probe_failures),
                decode_failures: Cell::new(decode_failures),
                seen,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn probe(&self, locator: &Path) -> Result<ClipInfo> {
            self.seen.borrow_mut().push(locator.to_path_buf());
            if self.probe_failures.get() > 0 {
                self.probe_failures.set(self.probe_failures.get() - 1);
                return Err(PipelineError::MediaProbe {
                    path: locator.to_path_buf(),
                    attempts: 1,
                    reason: "truncated moov atom".into(),
                });
            }
            Ok(self.clip.info.clone())
        }

        fn decode(&self, _locator: &Path, _info: &ClipInfo) -> Result<Clip> {
            if self.decode_failures.get() > 0 {
                self.decode_failures.set(self.decode_failures.get() - 1);
                return Err(PipelineError::Decode("ffmpeg exited with exit status: 183".into()));
            }
            Ok(self.clip.clone())
        }
    }

    struct StubClassifier;

    impl Classifier for StubClassifier {
        fn classify(&self, image_path: &Path) -> Result<Prediction> {
            image::open(image_path)?;
            Ok(Prediction {
                label: "person".into(),
                confidence: 0.9,
            })
        }
    }

    #[derive(Clone, Copy)]
    enum Quirk {
        /// Never sees earlier successes, like a duplicate delivery racing the first one.
        Racy,
        /// Rejects every successful analysis insert, like a full disk.
        LedgerDown,
    }

    struct QuirkyStore(SqliteStore, Quirk);

    impl ResultStore for QuirkyStore {
        fn register_event(&mut self, event: &EventObservation) -> Result<i64> {
            self.0.register_event(event)
        }
        fn event_by_name(&self, name: &str) -> Result<Option<EventObservation>> {
            self.0.event_by_name(name)
        }
        fn latest_event(&self) -> Result<Option<EventObservation>> {
            self.0.latest_event()
        }
        fn find_successful(&self, event: &str, method: &str) -> Result<Option<ComputationRecord>> {
            match self.1 {
                Quirk::Racy => Ok(None),
                Quirk::LedgerDown => self.0.find_successful(event, method),
            }
        }
        fn record_computation(&mut self, record: &ComputationRecord) -> Result<RecordOutcome> {
            if let Quirk::LedgerDown = self.1 {
                if record.success && record.method_name == "significant_frame" {
                    return Err(PipelineError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "disk I/O error",
                    )));
                }
            }
            self.0.record_computation(record)
        }
        fn computations_for(&self, event_name: &str) -> Result<Vec<ComputationRecord>> {
            self.0.computations_for(event_name)
        }
        fn add_classification(&mut self, c: &Classification) -> Result<i64> {
            self.0.add_classification(c)
        }
        fn classifications_for(&self, event_name: &str) -> Result<Vec<Classification>> {
            self.0.classifications_for(event_name)
        }
    }

    struct Harness {
        ctx: PipelineContext,
        seen: Rc<RefCell<Vec<PathBuf>>>,
        _dir: tempfile::TempDir,
    }

    fn event(name: &str) -> EventObservation {
        EventObservation {
            id: None,
            event_name: name.into(),
            video_file: format!("{}.mp4", name),
            video_location: "front".into(),
            scene_name: "front".into(),
            capture_time: 1_700_000_000,
        }
    }

    fn harness_with(store: Box<dyn ResultStore>, settings: impl FnOnce(&mut Settings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings {
            local_data_dir: dir.path().join("videos"),
            base_dir: dir.path().join("stills"),
            probe_retry_delay: Duration::ZERO,
            ..Settings::default()
        };
        settings(&mut s);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let source = ScriptedSource::new(seen.clone(), 0, 0);
        let ctx = PipelineContext::new(
            s,
            store,
            Box::new(SqliteBroker::in_memory().unwrap()),
            Box::new(source),
        )
        .with_classifier(Box::new(StubClassifier));
        Harness { ctx, seen, _dir: dir }
    }

    fn harness() -> Harness {
        harness_with(Box::new(SqliteStore::in_memory().unwrap()), |_| {})
    }

    /// Registers the event and puts an (empty) video file where it is expected.
    fn add_event(ctx: &mut PipelineContext, name: &str) {
        let e = event(name);
        let path = e.file_path(&ctx.settings.local_data_dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        ctx.store.register_event(&e).unwrap();
    }

    fn enqueue_analyze(ctx: &mut PipelineContext, name: &str) -> JobId {
        let task = Task::analyze(name);
        ctx.broker
            .enqueue(task.queue(), &task, task.default_policy(), None, None)
            .unwrap()
    }

    fn successes(ctx: &PipelineContext, event: &str, method: &str) -> usize {
        ctx.store
            .computations_for(event)
            .unwrap()
            .iter()
            .filter(|c| c.method_name == method && c.success)
            .count()
    }

    fn drain(ctx: &mut PipelineContext) -> usize {
        Worker::new(ALL_QUEUES.iter().map(|q| q.to_string()).collect())
            .drain(ctx)
            .unwrap()
    }

    #[test]
    fn analysis_writes_still_and_classifies_it() {
        let mut h = harness();
        add_event(&mut h.ctx, "e1");
        let id = enqueue_analyze(&mut h.ctx, "e1");

        assert_eq!(drain(&mut h.ctx), 3);
        assert_eq!(h.ctx.broker.get(id).unwrap().unwrap().status, JobStatus::Succeeded);

        let records = h.ctx.store.computations_for("e1").unwrap();
        let analysis = records
            .iter()
            .find(|c| c.method_name == "significant_frame")
            .unwrap();
        assert_eq!(analysis.result["most_significant_frame"], 7);
        assert_eq!(analysis.result["number_of_frames"], 10);

        let still = still_path(&h.ctx.settings.base_dir, &event("e1"), 7);
        assert_eq!(analysis.result_path(), Some(still.clone()));
        assert!(image::open(&still).is_ok());

        assert_eq!(successes(&h.ctx, "e1", "write_image"), 1);
        let labels = h.ctx.store.classifications_for("e1").unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label, "person");
        assert_eq!(labels[0].decider, STILL_MODEL_DECIDER);
    }

    #[test]
    fn second_analyze_request_is_a_no_op() {
        let mut h = harness();
        add_event(&mut h.ctx, "e1");
        enqueue_analyze(&mut h.ctx, "e1");
        drain(&mut h.ctx);

        let again = enqueue_analyze(&mut h.ctx, "e1");
        // Only the analyze job runs; nothing new is enqueued behind it.
        assert_eq!(drain(&mut h.ctx), 1);
        assert_eq!(h.ctx.broker.get(again).unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(successes(&h.ctx, "e1", "significant_frame"), 1);
        assert_eq!(h.ctx.store.classifications_for("e1").unwrap().len(), 1);
    }

    #[test]
    fn racing_duplicate_is_skipped_at_insert_and_its_jobs_cancelled() {
        let store = QuirkyStore(SqliteStore::in_memory().unwrap(), Quirk::Racy);
        let mut h = harness_with(Box::new(store), |_| {});
        add_event(&mut h.ctx, "e1");

        assert!(matches!(analyze_event(&mut h.ctx, "e1"), TaskOutcome::Computed(_)));
        // Jobs 1 and 2 are the first run's write and classify.
        assert!(matches!(analyze_event(&mut h.ctx, "e1"), TaskOutcome::AlreadyComputed));
        assert!(h.ctx.broker.get(3).unwrap().is_none());
        assert!(h.ctx.broker.get(4).unwrap().is_none());
        assert_eq!(successes(&h.ctx, "e1", "significant_frame"), 1);
    }

    #[test]
    fn unrecorded_analysis_leaves_no_follow_up_work() {
        let store = QuirkyStore(SqliteStore::in_memory().unwrap(), Quirk::LedgerDown);
        let mut h = harness_with(Box::new(store), |_| {});
        add_event(&mut h.ctx, "e1");
        let id = enqueue_analyze(&mut h.ctx, "e1");

        assert_eq!(run_once(&mut h.ctx, "event_video").unwrap(), Some((id, JobStatus::DeadLettered)));
        // Jobs 2 and 3 were the write and classify enqueued before the insert failed.
        assert!(h.ctx.broker.get(2).unwrap().is_none());
        assert!(h.ctx.broker.get(3).unwrap().is_none());
        assert!(h.ctx.broker.poll("write_image").unwrap().is_none());
        assert!(h.ctx.broker.poll("prediction").unwrap().is_none());
        assert_eq!(successes(&h.ctx, "e1", "significant_frame"), 0);
    }

    #[test]
    fn decode_hiccup_is_retried_in_place() {
        let mut h = harness();
        add_event(&mut h.ctx, "e1");
        h.ctx.source = Box::new(ScriptedSource::new(h.seen.clone(), 0, 1));
        let id = enqueue_analyze(&mut h.ctx, "e1");

        assert_eq!(run_once(&mut h.ctx, "event_video").unwrap(), Some((id, JobStatus::Succeeded)));
        assert_eq!(successes(&h.ctx, "e1", "significant_frame"), 1);
    }

    #[test]
    fn dead_lettered_write_blocks_classification() {
        let mut h = harness();
        // A file where the stills directory should be makes every write fail.
        fs::create_dir_all(h.ctx.settings.base_dir.parent().unwrap()).unwrap();
        fs::write(&h.ctx.settings.base_dir, b"not a directory").unwrap();

        let image_path = still_path(&h.ctx.settings.base_dir, &event("e1"), 7)
            .to_string_lossy()
            .into_owned();
        let write = Task::WriteImage {
            event_name: "e1".into(),
            frame_index: 7,
            image_path: image_path.clone(),
        };
        let classify = Task::ClassifyFrame {
            event_name: "e1".into(),
            image_path,
        };
        let write_id = h
            .ctx
            .broker
            .enqueue(write.queue(), &write, RetryPolicy::new(2, Duration::ZERO), None, Some(&b"jpeg"[..]))
            .unwrap();
        let classify_id = h
            .ctx
            .broker
            .enqueue(classify.queue(), &classify, classify.default_policy(), Some(write_id), None)
            .unwrap();

        assert_eq!(drain(&mut h.ctx), 2);
        let write_job = h.ctx.broker.get(write_id).unwrap().unwrap();
        assert_eq!(write_job.status, JobStatus::DeadLettered);
        assert_eq!(write_job.attempts, 2);

        let classify_job = h.ctx.broker.get(classify_id).unwrap().unwrap();
        assert_eq!(classify_job.status, JobStatus::Queued);
        assert_eq!(classify_job.attempts, 0);
        assert!(h.ctx.store.classifications_for("e1").unwrap().is_empty());

        let failures = h.ctx.store.computations_for("e1").unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|c| !c.success && c.method_name == "write_image"));
    }

    #[test]
    fn missing_video_is_recorded_and_dead_lettered() {
        let mut h = harness();
        h.ctx.store.register_event(&event("gone")).unwrap();
        let id = enqueue_analyze(&mut h.ctx, "gone");

        assert_eq!(run_once(&mut h.ctx, "event_video").unwrap(), Some((id, JobStatus::DeadLettered)));
        assert!(h.seen.borrow().is_empty());

        let records = h.ctx.store.computations_for("gone").unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        let error = records[0].result["error"].as_str().unwrap();
        assert!(error.contains("media unavailable"));

        assert!(h.ctx.broker.poll("write_image").unwrap().is_none());
        assert_eq!(h.ctx.broker.dead_letters(Some("event_video")).unwrap().len(), 1);
    }

    #[test]
    fn missing_local_video_falls_back_to_public_url() {
        let mut h = harness_with(Box::new(SqliteStore::in_memory().unwrap()), |s| {
            s.public_video_url = Some("https://cam.example/videos/".into());
        });
        h.ctx.store.register_event(&event("e2")).unwrap();

        assert!(analyze_event(&mut h.ctx, "e2").is_success());
        assert_eq!(
            h.seen.borrow()[0],
            PathBuf::from("https://cam.example/videos/front/e2.mp4")
        );
    }

    #[test]
    fn unknown_event_fails() {
        let mut h = harness();
        match analyze_event(&mut h.ctx, "nobody") {
            TaskOutcome::Failed(PipelineError::EventNotFound(name)) => assert_eq!(name, "nobody"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn transient_probe_failures_are_absorbed() {
        let mut h = harness();
        add_event(&mut h.ctx, "e1");
        h.ctx.source = Box::new(ScriptedSource::new(h.seen.clone(), 2, 0));

        assert!(matches!(analyze_event(&mut h.ctx, "e1"), TaskOutcome::Computed(_)));
        assert_eq!(h.seen.borrow().len(), 3);
    }

    #[test]
    fn failed_metadata_carries_only_the_error() {
        let result = SignificantFrameResult {
            event_id: "e".into(),
            frame_index: None,
            frame_count: 0,
            duration: 0.0,
            computed_at: 0,
            success: false,
            error: Some("boom".into()),
        };
        assert_eq!(result.metadata(), json!({ "error": "boom" }));
    }
}
