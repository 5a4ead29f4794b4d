use std::fs::File;
use std::io::{Write, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, Context, anyhow};
use tracing::debug;

use crate::queue::DEFAULT_LEASE;
use crate::vision::{DetectorConfig, RefreshPolicy, SelectorConfig};

pub const DEFAULT_CONFIG_FILE: &str = "watcher.env";

/// Every key this file understands. Environment variables with the same names override it.
const KEYS: [&str; 18] = [
    "LOCAL_DATA_DIR",
    "BASE_DIR",
    "DB_PATH",
    "PUBLIC_VIDEO_URL",
    "MAX_FRAMES_PER_CHUNK",
    "BASELINE_FRAMES",
    "BACKGROUND_FRAMES",
    "MIN_BOX_AREA",
    "TOP_MARGIN",
    "PROBE_ATTEMPTS",
    "PROBE_RETRY_DELAY_MS",
    "POLL_INTERVAL_MS",
    "JOB_LEASE_SECS",
    "STILL_MODEL_FILE",
    "STILL_LABELS_FILE",
    "LOG_LEVEL",
    "JPEG_QUALITY",
    "FFMPEG_BIN",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub local_data_dir: PathBuf,
    pub base_dir: PathBuf,
    pub db_path: String,
    pub public_video_url: Option<String>,
    pub max_frames_per_chunk: usize,
    pub baseline_frames: usize,
    pub background_frames: usize,
    pub min_box_area: u64,
    pub top_margin: u32,
    pub probe_attempts: u32,
    pub probe_retry_delay: Duration,
    pub poll_interval: Duration,
    pub job_lease: Duration,
    pub still_model_file: Option<PathBuf>,
    pub still_labels_file: Option<PathBuf>,
    pub log_level: String,
    pub jpeg_quality: u8,
    pub ffmpeg_bin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_data_dir: PathBuf::from("data"),
            base_dir: PathBuf::from("data"),
            db_path: "watcher.sqlite3".to_string(),
            public_video_url: None,
            max_frames_per_chunk: 50,
            baseline_frames: 5,
            background_frames: 6,
            min_box_area: 120,
            top_margin: 20,
            probe_attempts: 3,
            probe_retry_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1000),
            job_lease: DEFAULT_LEASE,
            still_model_file: None,
            still_labels_file: None,
            log_level: "INFO".to_string(),
            jpeg_quality: 85,
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Settings {
    /// Main entry point: `path` if it exists (defaults otherwise), then the environment on top.
    /// Runs before logging is set up, so it logs nothing itself.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let reader = BufReader::new(file);

        let mut settings = Self::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("{:?} line {}: expected KEY=VALUE", path, lineno + 1))?;
            settings
                .set(key.trim(), value.trim())
                .with_context(|| format!("{:?} line {}", path, lineno + 1))?;
        }
        Ok(settings)
    }

    /// Applies every known key that `lookup` returns a value for.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in KEYS {
            if let Some(value) = lookup(key) {
                self.set(key, value.trim())?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "LOCAL_DATA_DIR" => self.local_data_dir = PathBuf::from(value),
            "BASE_DIR" => self.base_dir = PathBuf::from(value),
            "DB_PATH" => self.db_path = value.to_string(),
            "PUBLIC_VIDEO_URL" => self.public_video_url = optional(value),
            "MAX_FRAMES_PER_CHUNK" => self.max_frames_per_chunk = parse(key, value)?,
            "BASELINE_FRAMES" => self.baseline_frames = parse(key, value)?,
            "BACKGROUND_FRAMES" => self.background_frames = parse(key, value)?,
            "MIN_BOX_AREA" => self.min_box_area = parse(key, value)?,
            "TOP_MARGIN" => self.top_margin = parse(key, value)?,
            "PROBE_ATTEMPTS" => self.probe_attempts = parse(key, value)?,
            "PROBE_RETRY_DELAY_MS" => {
                self.probe_retry_delay = Duration::from_millis(parse(key, value)?)
            }
            "POLL_INTERVAL_MS" => self.poll_interval = Duration::from_millis(parse(key, value)?),
            "JOB_LEASE_SECS" => self.job_lease = Duration::from_secs(parse(key, value)?),
            "STILL_MODEL_FILE" => self.still_model_file = optional(value).map(PathBuf::from),
            "STILL_LABELS_FILE" => self.still_labels_file = optional(value).map(PathBuf::from),
            "LOG_LEVEL" => self.log_level = value.to_uppercase(),
            "JPEG_QUALITY" => self.jpeg_quality = parse(key, value)?,
            "FFMPEG_BIN" => self.ffmpeg_bin = value.to_string(),
            _ => debug!("Ignoring unknown setting {}", key),
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        writeln!(file, "LOCAL_DATA_DIR={}", self.local_data_dir.display())?;
        writeln!(file, "BASE_DIR={}", self.base_dir.display())?;
        writeln!(file, "DB_PATH={}", self.db_path)?;
        writeln!(file, "PUBLIC_VIDEO_URL={}", self.public_video_url.as_deref().unwrap_or(""))?;
        writeln!(file, "MAX_FRAMES_PER_CHUNK={}", self.max_frames_per_chunk)?;
        writeln!(file, "BASELINE_FRAMES={}", self.baseline_frames)?;
        writeln!(file, "BACKGROUND_FRAMES={}", self.background_frames)?;
        writeln!(file, "MIN_BOX_AREA={}", self.min_box_area)?;
        writeln!(file, "TOP_MARGIN={}", self.top_margin)?;
        writeln!(file, "PROBE_ATTEMPTS={}", self.probe_attempts)?;
        writeln!(file, "PROBE_RETRY_DELAY_MS={}", self.probe_retry_delay.as_millis())?;
        writeln!(file, "POLL_INTERVAL_MS={}", self.poll_interval.as_millis())?;
        writeln!(file, "JOB_LEASE_SECS={}", self.job_lease.as_secs())?;
        let model = self.still_model_file.as_ref().map(|p| p.display().to_string());
        writeln!(file, "STILL_MODEL_FILE={}", model.unwrap_or_default())?;
        let labels = self.still_labels_file.as_ref().map(|p| p.display().to_string());
        writeln!(file, "STILL_LABELS_FILE={}", labels.unwrap_or_default())?;
        writeln!(file, "LOG_LEVEL={}", self.log_level)?;
        writeln!(file, "JPEG_QUALITY={}", self.jpeg_quality)?;
        writeln!(file, "FFMPEG_BIN={}", self.ffmpeg_bin)?;
        Ok(())
    }

    /// tracing filter directive for LOG_LEVEL.
    pub fn log_filter(&self) -> Result<&'static str> {
        match self.log_level.as_str() {
            "TRACE" => Ok("trace"),
            "DEBUG" => Ok("debug"),
            "INFO" => Ok("info"),
            "WARN" | "WARNING" => Ok("warn"),
            "ERROR" | "CRITICAL" => Ok("error"),
            other => Err(anyhow!("Invalid log level {}", other)),
        }
    }

    /// The directive the subscriber starts with: `RUST_LOG` when it is set, LOG_LEVEL otherwise.
    /// LOG_LEVEL is validated either way.
    pub fn filter_directive(&self, rust_log: Option<&str>) -> Result<String> {
        let level = self.log_filter()?;
        match rust_log.map(str::trim) {
            Some(directive) if !directive.is_empty() => Ok(directive.to_string()),
            _ => Ok(level.to_string()),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            background_frames: self.background_frames.max(1),
            min_area: self.min_box_area,
            top_margin: self.top_margin,
            refresh: RefreshPolicy::default(),
            ..DetectorConfig::default()
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            baseline_frames: self.baseline_frames.max(1),
            chunk_size: self.max_frames_per_chunk.max(1),
            ..SelectorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("watcher.env");

        let settings = Settings {
            base_dir: PathBuf::from("/srv/stills"),
            max_frames_per_chunk: 80,
            still_model_file: Some(PathBuf::from("/models/still.onnx")),
            public_video_url: Some("https://cam.example/static".to_string()),
            ..Settings::default()
        };
        settings.save(&path)?;

        let content = fs::read_to_string(&path)?;
        assert!(content.contains("BASE_DIR=/srv/stills"));
        assert!(content.contains("MAX_FRAMES_PER_CHUNK=80"));

        let loaded = Settings::from_file(&path)?;
        assert_eq!(loaded, settings);
        Ok(())
    }

    #[test]
    fn test_env_overrides_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("watcher.env");
        fs::write(&path, "# comment\nPROBE_ATTEMPTS=5\nLOG_LEVEL=debug\nSOMETHING_ELSE=1\n")?;

        let mut settings = Settings::from_file(&path)?;
        assert_eq!(settings.probe_attempts, 5);

        let env: HashMap<&str, &str> = [
            ("PROBE_ATTEMPTS", "2"),
            ("DB_PATH", "/tmp/w.db"),
            ("JOB_LEASE_SECS", "120"),
        ]
        .into();
        settings.apply_overrides(|k| env.get(k).map(|v| v.to_string()))?;
        assert_eq!(settings.probe_attempts, 2);
        assert_eq!(settings.job_lease, Duration::from_secs(120));
        assert_eq!(settings.db_path, "/tmp/w.db");
        assert_eq!(settings.log_filter()?, "debug");
        Ok(())
    }

    #[test]
    fn test_bad_values_are_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("watcher.env");
        fs::write(&path, "MAX_FRAMES_PER_CHUNK=lots\n")?;
        assert!(Settings::from_file(&path).is_err());

        fs::write(&path, "no equals sign here\n")?;
        assert!(Settings::from_file(&path).is_err());

        let settings = Settings {
            log_level: "LOUD".to_string(),
            ..Settings::default()
        };
        assert!(settings.log_filter().is_err());
        Ok(())
    }

    #[test]
    fn test_rust_log_takes_precedence() -> Result<()> {
        let settings = Settings {
            log_level: "WARNING".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.filter_directive(None)?, "warn");
        assert_eq!(settings.filter_directive(Some("  "))?, "warn");
        assert_eq!(settings.filter_directive(Some("motion_watch=trace"))?, "motion_watch=trace");

        let bad = Settings {
            log_level: "LOUD".to_string(),
            ..Settings::default()
        };
        assert!(bad.filter_directive(Some("debug")).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_file_means_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = Settings::load_from(&dir.path().join("absent.env"))?;
        assert_eq!(settings.jpeg_quality, Settings::default().jpeg_quality);
        Ok(())
    }

    #[test]
    fn test_vision_configs_follow_settings() {
        let settings = Settings {
            max_frames_per_chunk: 0,
            min_box_area: 300,
            ..Settings::default()
        };
        assert_eq!(settings.selector_config().chunk_size, 1);
        assert_eq!(settings.detector_config().min_area, 300);
        assert_eq!(settings.detector_config().top_margin, 20);
    }
}
