use std::collections::BTreeMap;
use std::path::Path;

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::media::{Frame, FrameSource};
use crate::vision::background::{BackgroundModel, RefreshPolicy, DEFAULT_BACKGROUND_FRAMES};
use crate::vision::boxes::{merge_boxes, BoundingBox};
use crate::vision::contours::contour_rects;
use crate::vision::morph::{abs_diff_gray, motion_mask, DEFAULT_KERNEL_SIZE, DEFAULT_THRESHOLD};

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub background_frames: usize,
    pub kernel_size: u32,
    pub threshold: u8,
    /// Rectangles smaller than this (px²) are noise.
    pub min_area: u64,
    /// Rectangles reaching into this many rows from the top touch the timestamp overlay.
    pub top_margin: u32,
    pub refresh: RefreshPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            background_frames: DEFAULT_BACKGROUND_FRAMES,
            kernel_size: DEFAULT_KERNEL_SIZE,
            threshold: DEFAULT_THRESHOLD,
            min_area: 120,
            top_margin: 20,
            refresh: RefreshPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionObservation {
    pub frame_index: usize,
    pub boxes: Vec<BoundingBox>,
    pub motion_in_progress: bool,
}

pub struct MotionDetector {
    config: DetectorConfig,
    background: BackgroundModel,
}

impl MotionDetector {
    /// Builds the background from `initial`, which should be the first K frames of the clip.
    pub fn new(config: DetectorConfig, initial: Vec<Frame>) -> Result<Self> {
        let now = initial.last().map(|f| f.timestamp).unwrap_or_default();
        let images = initial.into_iter().map(|f| f.image).collect();
        let background =
            BackgroundModel::from_frames(images, config.background_frames, config.refresh, now)?;
        Ok(Self { config, background })
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    /// Candidate boxes for `image` against the current background, filtered and merged.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        if image.dimensions() != self.background.dimensions() {
            return Err(PipelineError::InvalidInput(format!(
                "frame is {:?}, background is {:?}",
                image.dimensions(),
                self.background.dimensions()
            )));
        }

        let diff = abs_diff_gray(image, self.background.background());
        let mask = motion_mask(&diff, self.config.kernel_size, self.config.threshold);

        let candidates: Vec<BoundingBox> = contour_rects(&mask)
            .into_iter()
            .filter(|b| b.area() >= self.config.min_area)
            .filter(|b| b.y >= self.config.top_margin)
            .collect();

        Ok(merge_boxes(&candidates))
    }

    /// Detects motion in `frame`, then hands the frame to the background model.
    pub fn process(&mut self, frame: Frame) -> Result<MotionObservation> {
        let boxes = self.detect(&frame.image)?;
        let motion_in_progress = !boxes.is_empty();
        if self
            .background
            .observe(frame.image, motion_in_progress, frame.timestamp)
        {
            debug!("Frame {}: background refreshed", frame.index);
        }

        Ok(MotionObservation {
            frame_index: frame.index,
            boxes,
            motion_in_progress,
        })
    }
}

/// Runs the detector over a whole clip: background from the first K frames, then every later
/// frame is analyzed in order.
pub fn find_moving_objects(
    source: &dyn FrameSource,
    locator: &Path,
    config: DetectorConfig,
) -> Result<BTreeMap<usize, Vec<BoundingBox>>> {
    let info = source.probe(locator)?;
    let clip = source.decode(locator, &info)?;

    let mut frames = clip.frames.into_iter();
    let initial: Vec<Frame> = frames.by_ref().take(config.background_frames.max(1)).collect();
    let mut detector = MotionDetector::new(config, initial)?;

    let mut results = BTreeMap::new();
    for frame in frames {
        let obs = detector.process(frame)?;
        results.insert(obs.frame_index, obs.boxes);
    }

    info!(
        "Analyzed {} frames of {:?}, {} with motion",
        results.len(),
        locator,
        results.values().filter(|b| !b.is_empty()).count()
    );
    Ok(results)
}
