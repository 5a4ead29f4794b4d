use serde::{Deserialize, Serialize};

/// Axis-aligned box anchored at its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Converts a center-anchored box, clamping at the image origin.
    pub fn from_center(cx: u32, cy: u32, width: u32, height: u32) -> Self {
        Self {
            x: cx.saturating_sub(width / 2),
            y: cy.saturating_sub(height / 2),
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Closed-interval intersection on both axes, so touching boxes overlap.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        let (left, right) = if self.x <= other.x {
            (self, other)
        } else {
            (other, self)
        };
        if right.x > left.right() {
            return false;
        }

        let (a, b) = (self, other);
        (a.y <= b.y && b.y <= a.bottom())
            || (a.y <= b.bottom() && b.bottom() <= a.bottom())
            || (b.y <= a.y && a.y <= b.bottom())
            || (b.y <= a.bottom() && a.bottom() <= b.bottom())
    }

    /// Smallest box enclosing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BoundingBox {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// One left-to-right sweep: each head box absorbs every later box it overlaps, restarting the
/// scan after each absorption.
fn merge_pass(mut boxes: Vec<BoundingBox>) -> Vec<BoundingBox> {
    boxes.sort_by_key(|b| (b.x, b.y, b.width, b.height));

    let mut remaining: std::collections::VecDeque<BoundingBox> = boxes.into();
    let mut merged = Vec::with_capacity(remaining.len());
    while let Some(mut current) = remaining.pop_front() {
        let mut i = 0;
        while i < remaining.len() {
            if current.overlaps(&remaining[i]) {
                if let Some(absorbed) = remaining.remove(i) {
                    current = current.union(&absorbed);
                }
                i = 0;
            } else {
                i += 1;
            }
        }
        merged.push(current);
    }
    merged
}

/// Merges overlapping boxes into a pairwise disjoint set.
///
/// A grown box can reach one emitted earlier in the same sweep, so sweeps repeat until one
/// makes no merge. Every input box ends up inside exactly one output box, and merging the
/// output again returns it unchanged.
pub fn merge_boxes(boxes: &[BoundingBox]) -> Vec<BoundingBox> {
    let mut current = boxes.to_vec();
    if current.len() <= 1 {
        return current;
    }
    loop {
        let before = current.len();
        current = merge_pass(current);
        if current.len() == before {
            return current;
        }
    }
}
