use std::collections::VecDeque;
use std::time::Duration;

use image::RgbImage;
use tracing::debug;

use crate::error::{PipelineError, Result};

pub const DEFAULT_BACKGROUND_FRAMES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Refresh after this long if the scene is quiet.
    pub idle_after: Duration,
    /// Refresh after this long no matter what.
    pub max_age: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(10),
            max_age: Duration::from_secs(45),
        }
    }
}

impl RefreshPolicy {
    pub fn is_due(&self, since_refresh: Duration, motion_in_progress: bool) -> bool {
        (!motion_in_progress && since_refresh > self.idle_after) || since_refresh > self.max_age
    }
}

/// Pixelwise median. An even count averages the two middle samples, rounding down.
pub fn median_frame<'a, I>(frames: I) -> Option<RgbImage>
where
    I: IntoIterator<Item = &'a RgbImage>,
{
    let frames: Vec<&RgbImage> = frames.into_iter().collect();
    let first = frames.first()?;
    let (width, height) = first.dimensions();
    if frames.iter().any(|f| f.dimensions() != (width, height)) {
        return None;
    }

    let n = frames.len();
    let mut samples = vec![0u8; n];
    let mut out = vec![0u8; first.as_raw().len()];
    for (i, value) in out.iter_mut().enumerate() {
        for (sample, frame) in samples.iter_mut().zip(&frames) {
            *sample = frame.as_raw()[i];
        }
        samples.sort_unstable();
        *value = if n % 2 == 1 {
            samples[n / 2]
        } else {
            ((samples[n / 2 - 1] as u16 + samples[n / 2] as u16) / 2) as u8
        };
    }
    RgbImage::from_raw(width, height, out)
}

/// Rolling estimate of the static scene, built from the last `capacity` frames.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    capacity: usize,
    policy: RefreshPolicy,
    ring: VecDeque<RgbImage>,
    background: RgbImage,
    refreshed_at: Duration,
    refresh_count: u64,
}

impl BackgroundModel {
    /// Seeds the model with the median of `initial`; `initial` also fills the ring buffer.
    pub fn from_frames(
        initial: Vec<RgbImage>,
        capacity: usize,
        policy: RefreshPolicy,
        now: Duration,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidInput(
                "background ring buffer needs at least one frame".into(),
            ));
        }
        let background = median_frame(&initial).ok_or_else(|| {
            PipelineError::InvalidInput(
                "background needs at least one frame, all the same size".into(),
            )
        })?;

        let mut ring: VecDeque<RgbImage> = initial.into();
        while ring.len() > capacity {
            ring.pop_front();
        }

        Ok(Self {
            capacity,
            policy,
            ring,
            background,
            refreshed_at: now,
            refresh_count: 0,
        })
    }

    pub fn background(&self) -> &RgbImage {
        &self.background
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.background.dimensions()
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    pub fn refreshed_at(&self) -> Duration {
        self.refreshed_at
    }

    /// Caches `frame` and rebuilds the background if the refresh policy says so.
    /// Returns whether a refresh happened.
    pub fn observe(&mut self, frame: RgbImage, motion_in_progress: bool, now: Duration) -> bool {
        self.ring.push_back(frame);
        while self.ring.len() > self.capacity {
            self.ring.pop_front();
        }

        let since = now.saturating_sub(self.refreshed_at);
        if !self.policy.is_due(since, motion_in_progress) {
            return false;
        }

        match median_frame(&self.ring) {
            Some(bg) => {
                self.background = bg;
                self.refreshed_at = now;
                self.refresh_count += 1;
                debug!(
                    "Background refreshed at {:?} (motion: {}, age: {:?})",
                    now, motion_in_progress, since
                );
                true
            }
            None => false,
        }
    }
}
