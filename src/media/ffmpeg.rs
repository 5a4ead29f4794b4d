use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use image::RgbImage;
use serde::Deserialize;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::media::frame::{is_remote, Clip, ClipInfo, Frame, FrameSource};

/// Decodes clips by shelling out to `ffprobe` and `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
    duration: Option<String>,
    r_frame_rate: Option<String>,
}

impl FfmpegSource {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Uses `ffmpeg_bin` and the `ffprobe` installed next to it.
    pub fn with_ffmpeg(ffmpeg_bin: &str) -> Self {
        let ffprobe_bin = match Path::new(ffmpeg_bin).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                dir.join("ffprobe").to_string_lossy().into_owned()
            }
            _ => "ffprobe".to_string(),
        };
        Self::new(ffmpeg_bin, ffprobe_bin)
    }
}

/// Storage problems are reported before any subprocess runs so they never look like encoding
/// problems.
fn ensure_readable(locator: &Path) -> Result<()> {
    if is_remote(locator) {
        return Ok(());
    }
    File::open(locator)
        .map(|_| ())
        .map_err(|e| PipelineError::MediaUnavailable {
            path: locator.to_path_buf(),
            reason: e.to_string(),
        })
}

fn probe_error(locator: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::MediaProbe {
        path: locator.to_path_buf(),
        attempts: 1,
        reason: reason.into(),
    }
}

/// "30000/1001" -> 29.97
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some(num / den)
}

fn parse_probe(locator: &Path, raw: &[u8]) -> Result<ClipInfo> {
    let parsed: ProbeOutput = serde_json::from_slice(raw)
        .map_err(|e| probe_error(locator, format!("unparseable ffprobe output: {}", e)))?;

    let stream = parsed
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| probe_error(locator, "no video stream"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(probe_error(locator, "video stream has no dimensions")),
    };

    // Fragmented recordings often omit nb_frames; decode() fills it in.
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(0);
    let duration = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(ClipInfo {
        width,
        height,
        frame_count,
        duration,
        frame_rate: stream.r_frame_rate.as_deref().and_then(parse_rate),
    })
}

/// Splits raw rgb24 output into frames. A trailing partial frame is dropped.
fn split_frames(info: &ClipInfo, buffer: Vec<u8>) -> Result<Clip> {
    let frame_bytes = info.frame_bytes();
    if frame_bytes == 0 {
        return Err(PipelineError::Decode("zero-sized frames".into()));
    }

    let mut info = info.clone();
    let interval = info.frame_interval();
    let mut frames = Vec::with_capacity(buffer.len() / frame_bytes);
    for (index, chunk) in buffer.chunks_exact(frame_bytes).enumerate() {
        let image = RgbImage::from_raw(info.width, info.height, chunk.to_vec())
            .ok_or_else(|| PipelineError::Decode(format!("frame {} has wrong size", index)))?;
        frames.push(Frame {
            index,
            timestamp: interval * index as u32,
            image,
        });
    }

    if frames.is_empty() {
        return Err(PipelineError::Decode("ffmpeg produced no frames".into()));
    }
    if info.frame_count != frames.len() {
        debug!(
            "Probed {} frames, decoded {}; using decoded count",
            info.frame_count,
            frames.len()
        );
        info.frame_count = frames.len();
    }

    Ok(Clip { info, frames })
}

/// Reads the child's output to the end. On a read error the child is killed and reaped.
fn read_output(child: &mut Child, mut output: impl Read, capacity: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(capacity);
    if let Err(e) = output.read_to_end(&mut buffer) {
        drop(output);
        if let Err(kill_err) = child.kill() {
            debug!("Failed to kill ffmpeg: {}", kill_err);
        }
        child.wait()?;
        return Err(PipelineError::Decode(format!("reading ffmpeg output failed: {}", e)));
    }
    Ok(buffer)
}

impl FrameSource for FfmpegSource {
    fn probe(&self, locator: &Path) -> Result<ClipInfo> {
        ensure_readable(locator)?;

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=codec_type,width,height,nb_frames,duration,r_frame_rate")
            .arg("-of")
            .arg("json")
            .arg(locator)
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| probe_error(locator, format!("failed to spawn ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(probe_error(
                locator,
                format!("ffprobe exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        parse_probe(locator, &output.stdout)
    }

    fn decode(&self, locator: &Path, info: &ClipInfo) -> Result<Clip> {
        ensure_readable(locator)?;

        // -f rawvideo -pix_fmt rgb24 gives packed HWC frames at the native size.
        let mut child = Command::new(&self.ffmpeg_bin)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(locator)
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PipelineError::Decode(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Decode("failed to open ffmpeg stdout".into()))?;
        let buffer = read_output(&mut child, stdout, info.frame_bytes() * info.frame_count)?;

        let status = child.wait()?;
        if !status.success() {
            return Err(PipelineError::Decode(format!(
                "ffmpeg exited with {}",
                status
            )));
        }

        split_frames(info, buffer)
    }
}
