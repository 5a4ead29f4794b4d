pub mod ffmpeg;
pub mod frame;
pub mod mimetype;

pub use ffmpeg::FfmpegSource;
pub use frame::{decode_with_retry, is_remote, probe_with_retry, Clip, ClipInfo, Frame, FrameSource};
