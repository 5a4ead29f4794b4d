pub mod background;
pub mod boxes;
pub mod contours;
pub mod detector;
pub mod morph;
pub mod significant;

pub use background::{median_frame, BackgroundModel, RefreshPolicy};
pub use boxes::{merge_boxes, BoundingBox};
pub use detector::{find_moving_objects, DetectorConfig, MotionDetector, MotionObservation};
pub use significant::{rescale, Selection, SelectorConfig, SignificantFrameSelector};
