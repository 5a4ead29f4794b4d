use ndarray::{Array, Array4};
use image::{DynamicImage, GenericImageView};

pub const INPUT_SIZE: u32 = 224;

// ImageNet statistics; the still model was fine-tuned from an ImageNet backbone.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize to 224x224 and lay out as normalized NCHW.
pub fn normalize_for_classifier(image: &DynamicImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let resized = image.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Lanczos3);
    let mut array = Array::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            array[[0, c, y as usize, x as usize]] = (v - MEAN[c]) / STD[c];
        }
    }

    array
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// Index and probability of the most likely class.
pub fn top_class(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
}
