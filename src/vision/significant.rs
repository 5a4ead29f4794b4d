use image::GrayImage;
use ndarray::{Array, Array3, Array4, ArrayView2, Axis, Dimension};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::media::{Clip, Frame};
use crate::vision::morph::{count_foreground, motion_mask, DEFAULT_KERNEL_SIZE, DEFAULT_THRESHOLD};

pub const DEFAULT_BASELINE_FRAMES: usize = 5;
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Maps `values` linearly onto 0..=255. Empty input comes back empty; constant input (or input
/// with NaNs) maps to zeros instead of dividing by zero.
pub fn rescale<D: Dimension>(values: &Array<f32, D>) -> Array<u8, D> {
    match value_range(values.iter().copied()) {
        Some((min, max)) => rescale_with(values, min, max),
        None => Array::zeros(values.raw_dim()),
    }
}

fn value_range(values: impl Iterator<Item = f32>) -> Option<(f32, f32)> {
    let (min, max) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    (min.is_finite() && max.is_finite()).then_some((min, max))
}

fn rescale_with<D: Dimension>(values: &Array<f32, D>, min: f32, max: f32) -> Array<u8, D> {
    let span = max - min;
    if !(span > 0.0) {
        return Array::zeros(values.raw_dim());
    }
    values.mapv(|v| (((v - min) / span) * 255.0).round().clamp(0.0, 255.0) as u8)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub baseline_frames: usize,
    pub chunk_size: usize,
    pub kernel_size: u32,
    pub threshold: u8,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            baseline_frames: DEFAULT_BASELINE_FRAMES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            kernel_size: DEFAULT_KERNEL_SIZE,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub frame_index: usize,
    pub frame_count: usize,
    /// Thresholded pixel count per scored frame, starting at `first_scored`.
    pub scores: Vec<u64>,
    pub first_scored: usize,
}

impl Selection {
    pub fn peak_score(&self) -> u64 {
        self.scores.iter().copied().max().unwrap_or(0)
    }
}

pub struct SignificantFrameSelector {
    config: SelectorConfig,
}

impl SignificantFrameSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Index of the frame with the most motion relative to the average of the opening frames.
    ///
    /// Frames are scored in chunks of `chunk_size`. Distances are rescaled against the range of
    /// the whole clip, so the chunk size never changes the answer; the first pass over the chunks
    /// only collects that range.
    pub fn select(&self, clip: &Clip) -> Result<Selection> {
        let frames = &clip.frames;
        if frames.is_empty() {
            return Err(PipelineError::InvalidInput("clip has no frames".into()));
        }
        let (width, height) = frames[0].image.dimensions();
        if frames.iter().any(|f| f.image.dimensions() != (width, height)) {
            return Err(PipelineError::InvalidInput("clip frames differ in size".into()));
        }

        let baseline_len = self.config.baseline_frames.clamp(1, frames.len());
        let baseline = average(&frames[..baseline_len], width, height);
        // Short clips have nothing left after the baseline; score them all.
        let first_scored = if frames.len() > baseline_len {
            baseline_len
        } else {
            0
        };
        let scored = &frames[first_scored..];
        let chunk_size = self.config.chunk_size.max(1);

        let mut range: Option<(f32, f32)> = None;
        for chunk in scored.chunks(chunk_size) {
            let norms = distance_norms(chunk, &baseline, width, height);
            if let Some((lo, hi)) = value_range(norms.iter().copied()) {
                range = Some(match range {
                    Some((min, max)) => (min.min(lo), max.max(hi)),
                    None => (lo, hi),
                });
            }
        }
        let (min, max) = range.unwrap_or((0.0, 0.0));

        let mut scores = Vec::with_capacity(scored.len());
        for chunk in scored.chunks(chunk_size) {
            let norms = distance_norms(chunk, &baseline, width, height);
            let rescaled = rescale_with(&norms, min, max);
            for plane in rescaled.axis_iter(Axis(0)) {
                let mask = motion_mask(
                    &to_gray(plane, width, height),
                    self.config.kernel_size,
                    self.config.threshold,
                );
                scores.push(count_foreground(&mask));
            }
        }

        // First maximum wins ties.
        let (best, _) = scores
            .iter()
            .enumerate()
            .fold((0, 0u64), |(bi, bs), (i, &s)| if s > bs { (i, s) } else { (bi, bs) });

        debug!(
            "Scored {} frames in chunks of {}; peak {} at frame {}",
            scores.len(),
            chunk_size,
            scores.get(best).copied().unwrap_or(0),
            first_scored + best
        );

        Ok(Selection {
            frame_index: first_scored + best,
            frame_count: frames.len(),
            scores,
            first_scored,
        })
    }
}

fn to_array(frames: &[Frame], width: u32, height: u32) -> Array4<f32> {
    let (h, w) = (height as usize, width as usize);
    let data: Vec<f32> = frames
        .iter()
        .flat_map(|f| f.image.as_raw().iter().map(|&v| v as f32))
        .collect();
    Array4::from_shape_vec((frames.len(), h, w, 3), data)
        .unwrap_or_else(|_| Array4::zeros((frames.len(), h, w, 3)))
}

/// Mean frame as (height, width, channel).
fn average(frames: &[Frame], width: u32, height: u32) -> Array3<f32> {
    to_array(frames, width, height)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array3::zeros((height as usize, width as usize, 3)))
}

/// Per-pixel Euclidean norm of the per-channel L1 distance to the baseline: (frames, h, w).
fn distance_norms(chunk: &[Frame], baseline: &Array3<f32>, width: u32, height: u32) -> Array3<f32> {
    let dist = (&to_array(chunk, width, height) - baseline).mapv(f32::abs);
    dist.mapv(|v| v * v).sum_axis(Axis(3)).mapv(f32::sqrt)
}

fn to_gray(plane: ArrayView2<u8>, width: u32, height: u32) -> GrayImage {
    let data: Vec<u8> = plane.iter().copied().collect();
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::{arr1, Array1, Array2};

    fn dark() -> RgbImage {
        RgbImage::from_pixel(200, 200, Rgb([10, 10, 10]))
    }

    fn synthetic_clip() -> Clip {
        let images = (0..10)
            .map(|i| {
                let mut img = dark();
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

    fn selector(chunk_size: usize) -> SignificantFrameSelector {
        SignificantFrameSelector::new(SelectorConfig {
            chunk_size,
            ..SelectorConfig::default()
        })
    }

    #[test]
    fn rescale_spans_full_range() {
        let out = rescale(&arr1(&[2.0f32, 4.0, 6.0]));
        assert_eq!(out, arr1(&[0u8, 128, 255]));
    }

    #[test]
    fn rescale_handles_empty_and_constant_input() {
        let empty = rescale(&Array1::<f32>::zeros(0));
        assert!(empty.is_empty());
        let flat = rescale(&Array2::<f32>::from_elem((3, 3), 7.5));
        assert!(flat.iter().all(|&v| v == 0));
    }

    #[test]
    fn rescale_is_idempotent() {
        let x = arr1(&[0.3f32, 17.0, 99.9, 42.0, -5.0, 63.1]);
        let once = rescale(&x);
        let twice = rescale(&once.mapv(f32::from));
        assert_eq!(once, twice);
        assert!(once.iter().any(|&v| v == 0) && once.iter().any(|&v| v == 255));
    }

    #[test]
    fn bright_square_frame_is_selected() {
        let selection = selector(DEFAULT_CHUNK_SIZE).select(&synthetic_clip()).unwrap();
        assert_eq!(selection.frame_index, 7);
        assert_eq!(selection.frame_count, 10);
        assert_eq!(selection.first_scored, 5);
        assert_eq!(selection.peak_score(), 2500);
    }

    #[test]
    fn chunk_size_does_not_change_selection() {
        let clip = synthetic_clip();
        let whole = selector(100).select(&clip).unwrap();
        for chunk in [1, 2, 3] {
            let chunked = selector(chunk).select(&clip).unwrap();
            assert_eq!(chunked.frame_index, whole.frame_index);
            assert_eq!(chunked.scores, whole.scores);
        }
    }

    #[test]
    fn chunking_is_stable_with_uneven_motion() {
        // Two moving squares of different sizes in different chunks.
        let images = (0..12)
            .map(|i| {
                let mut img = RgbImage::from_pixel(64, 64, Rgb([20, 20, 20]));
                let side = match i {
                    6 => 12,
                    10 => 20,
                    _ => 0,
                };
                for y in 30..30 + side {
                    for x in 30..30 + side {
                        img.put_pixel(x, y, Rgb([200, 180, 160]));
                    }
                }
                img
            })
            .collect();
        let clip = Clip::from_images(images, 5.0).unwrap();
        let small = selector(2).select(&clip).unwrap();
        let large = selector(50).select(&clip).unwrap();
        assert_eq!(small.frame_index, 10);
        assert_eq!(small.frame_index, large.frame_index);
    }

    #[test]
    fn still_clip_picks_first_scored_frame() {
        let clip = Clip::from_images(vec![dark(); 8], 10.0).unwrap();
        let selection = selector(3).select(&clip).unwrap();
        assert_eq!(selection.frame_index, 5);
        assert_eq!(selection.peak_score(), 0);
    }

    #[test]
    fn short_clip_scores_every_frame() {
        let mut images = vec![dark(); 3];
        images[2].put_pixel(0, 0, Rgb([255, 255, 255]));
        let clip = Clip::from_images(images, 10.0).unwrap();
        let selection = selector(10).select(&clip).unwrap();
        assert_eq!(selection.first_scored, 0);
        assert_eq!(selection.scores.len(), 3);
    }
}
