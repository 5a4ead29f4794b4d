use std::path::Path;
use std::thread;
use std::time::Duration;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};

/// A decoded RGB frame and its position within the clip.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub timestamp: Duration,
    pub image: RgbImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: usize,
    /// Seconds.
    pub duration: f64,
    pub frame_rate: Option<f64>,
}

impl ClipInfo {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Seconds between frames, from the frame rate or the average over the clip.
    pub fn frame_interval(&self) -> Duration {
        let secs = match self.frame_rate {
            Some(fps) if fps.is_finite() && fps > 0.0 => 1.0 / fps,
            _ if self.frame_count > 0 && self.duration.is_finite() && self.duration > 0.0 => {
                self.duration / self.frame_count as f64
            }
            _ => 0.0,
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

/// A fully decoded clip.
#[derive(Debug, Clone)]
pub struct Clip {
    pub info: ClipInfo,
    pub frames: Vec<Frame>,
}

impl Clip {
    /// Builds a clip from in-memory images; all images must share the first one's size.
    pub fn from_images(images: Vec<RgbImage>, frame_rate: f64) -> Result<Self> {
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(PipelineError::InvalidInput(format!(
                "frame rate must be positive, got {}",
                frame_rate
            )));
        }
        let first = images
            .first()
            .ok_or_else(|| PipelineError::InvalidInput("clip has no frames".into()))?;
        let (width, height) = first.dimensions();
        if images.iter().any(|img| img.dimensions() != (width, height)) {
            return Err(PipelineError::InvalidInput(
                "clip frames differ in size".into(),
            ));
        }

        let info = ClipInfo {
            width,
            height,
            frame_count: images.len(),
            duration: images.len() as f64 / frame_rate,
            frame_rate: Some(frame_rate),
        };
        let interval = info.frame_interval();
        let frames = images
            .into_iter()
            .enumerate()
            .map(|(index, image)| Frame {
                index,
                timestamp: interval * index as u32,
                image,
            })
            .collect();

        Ok(Self { info, frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Decodes a clip from a local path or a URL.
pub trait FrameSource {
    fn probe(&self, locator: &Path) -> Result<ClipInfo>;

    fn decode(&self, locator: &Path, info: &ClipInfo) -> Result<Clip>;
}

pub fn is_remote(locator: &Path) -> bool {
    locator
        .to_str()
        .map(|s| s.starts_with("http://") || s.starts_with("https://"))
        .unwrap_or(false)
}

/// Runs `op` up to `attempts` times while it fails with a retryable error.
fn retry_in_place<T>(
    what: &str,
    locator: &Path,
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        tried += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && tried < attempts => {
                warn!("{} of {:?} failed (attempt {}/{}): {}", what, locator, tried, attempts, e);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(PipelineError::MediaProbe { path, reason, .. }) => {
                return Err(PipelineError::MediaProbe {
                    path,
                    attempts: tried,
                    reason,
                })
            }
            Err(e) => return Err(e),
        }
    }
}

/// Probes `locator`, retrying transient probe failures up to `attempts` tries in total.
/// `MediaUnavailable` and every other error are returned immediately.
pub fn probe_with_retry(
    source: &dyn FrameSource,
    locator: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<ClipInfo> {
    retry_in_place("Probe", locator, attempts, delay, || source.probe(locator))
}

/// Decodes `locator`, retrying decode hiccups the same way.
pub fn decode_with_retry(
    source: &dyn FrameSource,
    locator: &Path,
    info: &ClipInfo,
    attempts: u32,
    delay: Duration,
) -> Result<Clip> {
    retry_in_place("Decode", locator, attempts, delay, || source.decode(locator, info))
}
