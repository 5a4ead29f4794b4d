use image::{GrayImage, RgbImage};
use imageproc::morphology::{grayscale_dilate, grayscale_erode, Mask};

pub const DEFAULT_KERNEL_SIZE: u32 = 7;
pub const DEFAULT_THRESHOLD: u8 = 128;

/// Luma weights scaled by 1000.
const LUMA_R: u32 = 299;
const LUMA_G: u32 = 587;
const LUMA_B: u32 = 114;

pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B + 500) / 1000) as u8
}

/// Per-channel absolute difference collapsed to one intensity channel.
pub fn abs_diff_gray(frame: &RgbImage, background: &RgbImage) -> GrayImage {
    debug_assert_eq!(frame.dimensions(), background.dimensions());
    let (width, height) = frame.dimensions();
    let data = frame
        .as_raw()
        .chunks_exact(3)
        .zip(background.as_raw().chunks_exact(3))
        .map(|(p, q)| luma(p[0].abs_diff(q[0]), p[1].abs_diff(q[1]), p[2].abs_diff(q[2])))
        .collect();
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

fn square(size: u32) -> Mask {
    Mask::square((size / 2).min(u8::MAX as u32) as u8)
}

/// Grayscale dilation with a `size`x`size` square. Pixels outside the image are ignored.
pub fn dilate(src: &GrayImage, size: u32) -> GrayImage {
    if size <= 1 {
        return src.clone();
    }
    grayscale_dilate(src, &square(size))
}

pub fn erode(src: &GrayImage, size: u32) -> GrayImage {
    if size <= 1 {
        return src.clone();
    }
    grayscale_erode(src, &square(size))
}

/// Morphological close (dilate then erode). Even sizes round up to the next odd square.
pub fn close(src: &GrayImage, size: u32) -> GrayImage {
    erode(&dilate(src, size), size)
}

/// 255 where the value is strictly above `thresh`, 0 elsewhere.
pub fn threshold(src: &GrayImage, thresh: u8) -> GrayImage {
    let mut out = src.clone();
    for p in out.iter_mut() {
        *p = if *p > thresh { 255 } else { 0 };
    }
    out
}

/// Close then binarize: the mask both the detector and the selector count on.
pub fn motion_mask(intensity: &GrayImage, kernel_size: u32, thresh: u8) -> GrayImage {
    threshold(&close(intensity, kernel_size), thresh)
}

pub fn count_foreground(mask: &GrayImage) -> u64 {
    mask.iter().filter(|&&p| p > 0).count() as u64
}
