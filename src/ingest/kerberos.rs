use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::database::EventObservation;

/// The fields we use from a Kerberos.io event line.
#[derive(Debug, Deserialize)]
struct KerberosEvent {
    #[serde(rename = "pathToVideo")]
    path_to_video: String,
    #[serde(rename = "instanceName")]
    instance_name: String,
    timestamp: serde_json::Value,
}

fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Builds an event observation from one metadata line. The event is named after the video's stem.
pub fn parse_event(line: &str) -> Result<EventObservation> {
    let raw: KerberosEvent = serde_json::from_str(line).context("Malformed event metadata")?;
    let video = Path::new(&raw.path_to_video);

    let event_name = video
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("pathToVideo {:?} has no file name", raw.path_to_video))?
        .to_string();
    let video_file = video
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    // Only relative directories are meaningful under the data root.
    let video_location = match video.parent() {
        Some(dir) if video.is_relative() => dir.to_string_lossy().into_owned(),
        _ => String::new(),
    };
    let capture_time = parse_timestamp(&raw.timestamp)
        .ok_or_else(|| anyhow!("Invalid timestamp {} for {}", raw.timestamp, event_name))?;

    Ok(EventObservation {
        id: None,
        event_name,
        video_file,
        video_location,
        scene_name: raw.instance_name,
        capture_time,
    })
}

/// Kerberos appends one line per event; the first line describes it.
pub fn read_event_file(path: &Path) -> Result<EventObservation> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let line = BufReader::new(file)
        .lines()
        .next()
        .ok_or_else(|| anyhow!("{:?} is empty", path))??;
    parse_event(&line).with_context(|| format!("In {:?}", path))
}
