use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::database::open_connection;
use crate::error::Result;

/// A captured motion event and where its video lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventObservation {
    pub id: Option<i64>,
    pub event_name: String,
    pub video_file: String,
    /// Directory relative to the data root.
    pub video_location: String,
    pub scene_name: String,
    /// Seconds since the epoch.
    pub capture_time: i64,
}

impl EventObservation {
    pub fn file_path(&self, data_dir: &Path) -> PathBuf {
        if self.video_location.is_empty() {
            data_dir
                .join(&self.scene_name)
                .join("capture")
                .join(&self.video_file)
        } else {
            data_dir.join(&self.video_location).join(&self.video_file)
        }
    }

    pub fn video_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.video_location.is_empty() {
            format!("{}/{}", base, self.video_file)
        } else {
            format!("{}/{}/{}", base, self.video_location, self.video_file)
        }
    }
}

/// Idempotency ledger entry and audit record for one executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationRecord {
    pub id: Option<i64>,
    pub event_name: String,
    pub method_name: String,
    pub computed_at: i64,
    pub elapsed_seconds: f64,
    pub host_info: String,
    pub success: bool,
    pub result: serde_json::Value,
    pub result_file: Option<String>,
    pub result_file_location: Option<String>,
}

impl ComputationRecord {
    pub fn result_path(&self) -> Option<PathBuf> {
        let file = self.result_file.as_ref()?;
        Some(match &self.result_file_location {
            Some(dir) => Path::new(dir).join(file),
            None => PathBuf::from(file),
        })
    }
}

/// What the API and the classification stage see of a computation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationView {
    pub event_id: String,
    pub method_name: String,
    pub computed_at: i64,
    pub elapsed_seconds: f64,
    pub success: bool,
    pub result_file: Option<String>,
    pub result_metadata: serde_json::Value,
}

impl From<&ComputationRecord> for ComputationView {
    fn from(record: &ComputationRecord) -> Self {
        Self {
            event_id: record.event_name.clone(),
            method_name: record.method_name.clone(),
            computed_at: record.computed_at,
            elapsed_seconds: record.elapsed_seconds,
            success: record.success,
            result_file: record
                .result_path()
                .map(|p| p.to_string_lossy().into_owned()),
            result_metadata: record.result.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub event_name: String,
    pub label: String,
    /// None for human labels.
    pub confidence: Option<f64>,
    pub decider: String,
    pub decided_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationView {
    pub event_id: String,
    pub label: String,
    pub confidence: Option<f64>,
    pub decider: String,
}

impl From<&Classification> for ClassificationView {
    fn from(c: &Classification) -> Self {
        Self {
            event_id: c.event_name.clone(),
            label: c.label.clone(),
            confidence: c.confidence,
            decider: c.decider.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(i64),
    /// A successful record for the same (event, method) already exists.
    Duplicate,
}

/// Durable storage for events, computations and classifications.
pub trait ResultStore {
    fn register_event(&mut self, event: &EventObservation) -> Result<i64>;

    fn event_by_name(&self, name: &str) -> Result<Option<EventObservation>>;

    fn latest_event(&self) -> Result<Option<EventObservation>>;

    fn find_successful(&self, event_name: &str, method_name: &str)
        -> Result<Option<ComputationRecord>>;

    /// Inserts `record`; a second successful record for the same pair is skipped.
    fn record_computation(&mut self, record: &ComputationRecord) -> Result<RecordOutcome>;

    fn computations_for(&self, event_name: &str) -> Result<Vec<ComputationRecord>>;

    fn add_classification(&mut self, classification: &Classification) -> Result<i64>;

    fn classifications_for(&self, event_name: &str) -> Result<Vec<Classification>>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

const EVENT_COLUMNS: &str =
    "id, event_name, video_file, video_location, scene_name, capture_time";

const COMPUTATION_COLUMNS: &str = "id, event_name, method_name, computed_at, elapsed_seconds, \
     host_info, success, result, result_file, result_file_location";

fn event_from_row(row: &Row) -> rusqlite::Result<EventObservation> {
    Ok(EventObservation {
        id: Some(row.get(0)?),
        event_name: row.get(1)?,
        video_file: row.get(2)?,
        video_location: row.get(3)?,
        scene_name: row.get(4)?,
        capture_time: row.get(5)?,
    })
}

fn computation_from_row(row: &Row) -> rusqlite::Result<ComputationRecord> {
    let raw: String = row.get(7)?;
    Ok(ComputationRecord {
        id: Some(row.get(0)?),
        event_name: row.get(1)?,
        method_name: row.get(2)?,
        computed_at: row.get(3)?,
        elapsed_seconds: row.get(4)?,
        host_info: row.get(5)?,
        success: row.get(6)?,
        // Older rows may hold free text.
        result: serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
        result_file: row.get(8)?,
        result_file_location: row.get(9)?,
    })
}

impl ResultStore for SqliteStore {
    fn register_event(&mut self, event: &EventObservation) -> Result<i64> {
        let id = self.conn.query_row(
            "INSERT INTO event_observations
                 (event_name, video_file, video_location, scene_name, capture_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(event_name) DO UPDATE SET
                 video_file=excluded.video_file,
                 video_location=excluded.video_location
             RETURNING id",
            params![
                event.event_name,
                event.video_file,
                event.video_location,
                event.scene_name,
                event.capture_time
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn event_by_name(&self, name: &str) -> Result<Option<EventObservation>> {
        let sql = format!(
            "SELECT {} FROM event_observations WHERE event_name = ?1",
            EVENT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![name], event_from_row)
            .optional()?)
    }

    fn latest_event(&self) -> Result<Option<EventObservation>> {
        let sql = format!(
            "SELECT {} FROM event_observations ORDER BY capture_time DESC, id DESC LIMIT 1",
            EVENT_COLUMNS
        );
        Ok(self.conn.query_row(&sql, [], event_from_row).optional()?)
    }

    fn find_successful(
        &self,
        event_name: &str,
        method_name: &str,
    ) -> Result<Option<ComputationRecord>> {
        let sql = format!(
            "SELECT {} FROM computations
             WHERE event_name = ?1 AND method_name = ?2 AND success = 1
             LIMIT 1",
            COMPUTATION_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![event_name, method_name], computation_from_row)
            .optional()?)
    }

    fn record_computation(&mut self, record: &ComputationRecord) -> Result<RecordOutcome> {
        let changed = self.conn.execute(
            "INSERT INTO computations (event_name, method_name, computed_at, elapsed_seconds,
                 host_info, success, result, result_file, result_file_location)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT DO NOTHING",
            params![
                record.event_name,
                record.method_name,
                record.computed_at,
                record.elapsed_seconds,
                record.host_info,
                record.success,
                serde_json::to_string(&record.result)?,
                record.result_file,
                record.result_file_location
            ],
        )?;
        if changed == 0 {
            return Ok(RecordOutcome::Duplicate);
        }
        Ok(RecordOutcome::Inserted(self.conn.last_insert_rowid()))
    }

    fn computations_for(&self, event_name: &str) -> Result<Vec<ComputationRecord>> {
        let sql = format!(
            "SELECT {} FROM computations WHERE event_name = ?1 ORDER BY computed_at, id",
            COMPUTATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![event_name], computation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn add_classification(&mut self, c: &Classification) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO event_classifications (event_name, label, confidence, decider, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![c.event_name, c.label, c.confidence, c.decider, c.decided_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn classifications_for(&self, event_name: &str) -> Result<Vec<Classification>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_name, label, confidence, decider, decided_at
             FROM event_classifications WHERE event_name = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![event_name], |row| {
            Ok(Classification {
                event_name: row.get(0)?,
                label: row.get(1)?,
                confidence: row.get(2)?,
                decider: row.get(3)?,
                decided_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
