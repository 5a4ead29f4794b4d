use image::{imageops, GrayImage};
use imageproc::contours::{find_contours, Contour};

use crate::vision::boxes::BoundingBox;

/// Border points are in padded coordinates, one pixel right of and below the mask's.
fn bounding_rect(contour: &Contour<u32>) -> Option<BoundingBox> {
    let points = &contour.points;
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    Some(BoundingBox::new(
        min_x.saturating_sub(1),
        min_y.saturating_sub(1),
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}

/// Bounding rectangles of every border in a binary mask (non-zero is foreground): outer
/// borders of blobs plus the hole borders inside them.
pub fn contour_rects(mask: &GrayImage) -> Vec<BoundingBox> {
    if mask.width() == 0 || mask.height() == 0 {
        return Vec::new();
    }
    // A background frame around the mask gives blobs on the image edge a closed border.
    let mut padded = GrayImage::new(mask.width() + 2, mask.height() + 2);
    imageops::replace(&mut padded, mask, 1, 1);

    find_contours::<u32>(&padded)
        .iter()
        .filter_map(bounding_rect)
        .collect()
}
