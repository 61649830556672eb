/// Access Audit Database — SQLite persistence
///
/// One append-only row per classified face. The alert flag is flipped by a
/// second UPDATE after dispatch; the two writes are not linked in a
/// transaction.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::face_recognition::FaceBox;

/// A persisted audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: Option<i64>,
    pub timestamp: DateTime<Local>,
    pub camera_name: String,
    pub camera_location: String,
    pub subject_name: Option<String>,
    pub is_authorized: bool,
    pub similarity: Option<f64>,
    pub face_box: Option<FaceBox>,
    pub alert_sent: bool,
    pub image_path: Option<String>,
    pub metadata: Value,
}

impl AccessRecord {
    /// A fresh, unsaved record stamped with the current local time.
    pub fn new(camera_name: &str, camera_location: &str, is_authorized: bool) -> Self {
        Self {
            id: None,
            timestamp: Local::now(),
            camera_name: camera_name.to_string(),
            camera_location: camera_location.to_string(),
            subject_name: None,
            is_authorized,
            similarity: None,
            face_box: None,
            alert_sent: false,
            image_path: None,
            metadata: Value::Null,
        }
    }
}

/// Write side of the audit trail, as used by the capture loop.
pub trait AccessStore {
    fn record(&self, record: &AccessRecord) -> Result<i64, StoreError>;
    fn mark_alert_sent(&self, id: i64) -> Result<(), StoreError>;
}

pub struct AccessDatabase {
    conn: Connection,
}

impl AccessDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self { conn };
        db.migrate()?;
        info!("Audit database ready at {}", path.display());
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS access_logs (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp        TEXT    NOT NULL,
                camera_name      TEXT    NOT NULL,
                camera_location  TEXT,
                subject_name     TEXT,
                is_authorized    INTEGER NOT NULL,
                similarity       REAL,
                face_box         TEXT,
                alert_sent       INTEGER NOT NULL DEFAULT 0,
                image_path       TEXT,
                metadata         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp
                ON access_logs (timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_access_logs_subject
                ON access_logs (subject_name);
            CREATE INDEX IF NOT EXISTS idx_access_logs_unauthorized
                ON access_logs (is_authorized) WHERE is_authorized = 0;
        ",
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<AccessRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM access_logs WHERE id = ?1", COLUMNS),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(RawRow::into_record).transpose()
    }

    /// Most recent records first.
    pub fn recent(
        &self,
        limit: u32,
        unauthorized_only: bool,
    ) -> Result<Vec<AccessRecord>, StoreError> {
        let sql = if unauthorized_only {
            format!(
                "SELECT {} FROM access_logs WHERE is_authorized = 0
                 ORDER BY timestamp DESC, id DESC LIMIT ?1",
                COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM access_logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
                COLUMNS
            )
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], read_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    /// Timestamp of the newest unauthorized record with an alert sent inside
    /// the trailing `window`, if any.
    pub fn last_alert_within(
        &self,
        window: Duration,
    ) -> Result<Option<DateTime<Local>>, StoreError> {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let cutoff = format_ts(&(Utc::now() - window));

        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(timestamp) FROM access_logs
             WHERE is_authorized = 0 AND alert_sent = 1 AND timestamp > ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        latest.as_deref().map(parse_ts).transpose()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM access_logs", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        info!("Audit database closed");
        Ok(())
    }
}

impl AccessStore for AccessDatabase {
    fn record(&self, record: &AccessRecord) -> Result<i64, StoreError> {
        let face_box = record
            .face_box
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = if record.metadata.is_null() {
            None
        } else {
            Some(serde_json::to_string(&record.metadata)?)
        };

        self.conn.execute(
            "INSERT INTO access_logs
             (timestamp, camera_name, camera_location, subject_name, is_authorized,
              similarity, face_box, alert_sent, image_path, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                format_ts(&record.timestamp.with_timezone(&Utc)),
                record.camera_name,
                record.camera_location,
                record.subject_name,
                record.is_authorized,
                record.similarity,
                face_box,
                record.alert_sent,
                record.image_path,
                metadata,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Access record {} written", id);
        Ok(id)
    }

    fn mark_alert_sent(&self, id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE access_logs SET alert_sent = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

const COLUMNS: &str = "id, timestamp, camera_name, camera_location, subject_name, is_authorized,
     similarity, face_box, alert_sent, image_path, metadata";

/// Row as stored; JSON columns are decoded outside the rusqlite callback.
struct RawRow {
    id: i64,
    timestamp: String,
    camera_name: String,
    camera_location: Option<String>,
    subject_name: Option<String>,
    is_authorized: bool,
    similarity: Option<f64>,
    face_box: Option<String>,
    alert_sent: bool,
    image_path: Option<String>,
    metadata: Option<String>,
}

impl RawRow {
    fn into_record(self) -> Result<AccessRecord, StoreError> {
        let face_box = self
            .face_box
            .as_deref()
            .map(|text| serde_json::from_str::<FaceBox>(text))
            .transpose()?;
        let metadata = match self.metadata.as_deref() {
            Some(text) => serde_json::from_str(text)?,
            None => Value::Null,
        };
        Ok(AccessRecord {
            id: Some(self.id),
            timestamp: parse_ts(&self.timestamp)?,
            camera_name: self.camera_name,
            camera_location: self.camera_location.unwrap_or_default(),
            subject_name: self.subject_name,
            is_authorized: self.is_authorized,
            similarity: self.similarity,
            face_box,
            alert_sent: self.alert_sent,
            image_path: self.image_path,
            metadata,
        })
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        camera_name: row.get(2)?,
        camera_location: row.get(3)?,
        subject_name: row.get(4)?,
        is_authorized: row.get::<_, i32>(5)? != 0,
        similarity: row.get(6)?,
        face_box: row.get(7)?,
        alert_sent: row.get::<_, i32>(8)? != 0,
        image_path: row.get(9)?,
        metadata: row.get(10)?,
    })
}

// Fixed-width UTC so lexical order matches time order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Local>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|source| StoreError::Timestamp {
            raw: raw.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unauthorized_record() -> AccessRecord {
        let mut rec = AccessRecord::new("Main Entrance Gate", "Building A", false);
        rec.subject_name = Some("bob".into());
        rec.similarity = Some(0.42);
        rec.face_box = Some(FaceBox::new(10, 20, 110, 140));
        rec.metadata = json!({"reason": "low_similarity"});
        rec
    }

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = AccessDatabase::open(dir.path().join("access.db")).unwrap();

        let rec = unauthorized_record();
        let id = db.record(&rec).unwrap();
        let back = db.get(id).unwrap().unwrap();

        assert_eq!(back.id, Some(id));
        assert_eq!(back.camera_name, "Main Entrance Gate");
        assert_eq!(back.camera_location, "Building A");
        assert!(!back.is_authorized);
        assert!((back.similarity.unwrap() - 0.42).abs() < 1e-9);
        assert_eq!(back.face_box, rec.face_box);
        assert_eq!(back.metadata["reason"], "low_similarity");
        assert!(!back.alert_sent);
        assert_eq!(
            back.timestamp.timestamp_micros(),
            rec.timestamp.timestamp_micros()
        );
    }

    #[test]
    fn test_mark_alert_sent_updates_in_place() {
        let db = AccessDatabase::open_in_memory().unwrap();
        let id = db.record(&unauthorized_record()).unwrap();
        db.mark_alert_sent(id).unwrap();

        let back = db.get(id).unwrap().unwrap();
        assert!(back.alert_sent);
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn test_get_missing_is_none() {
        let db = AccessDatabase::open_in_memory().unwrap();
        assert!(db.get(42).unwrap().is_none());
    }

    #[test]
    fn test_recent_filters_and_orders() {
        let db = AccessDatabase::open_in_memory().unwrap();
        let mut authorized = AccessRecord::new("cam", "loc", true);
        authorized.subject_name = Some("alice".into());
        authorized.similarity = Some(0.93);
        db.record(&authorized).unwrap();
        let last = db.record(&unauthorized_record()).unwrap();

        let all = db.recent(10, false).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, Some(last));

        let only_unauth = db.recent(10, true).unwrap();
        assert_eq!(only_unauth.len(), 1);
        assert!(!only_unauth[0].is_authorized);

        assert_eq!(db.recent(1, false).unwrap().len(), 1);
    }

    #[test]
    fn test_last_alert_within() {
        let db = AccessDatabase::open_in_memory().unwrap();
        let window = Duration::from_secs(60);
        assert!(db.last_alert_within(window).unwrap().is_none());

        let id = db.record(&unauthorized_record()).unwrap();
        assert!(db.last_alert_within(window).unwrap().is_none());

        db.mark_alert_sent(id).unwrap();
        assert!(db.last_alert_within(window).unwrap().is_some());

        let mut old = unauthorized_record();
        old.timestamp = Local::now() - chrono::Duration::minutes(10);
        old.alert_sent = true;
        let db2 = AccessDatabase::open_in_memory().unwrap();
        db2.record(&old).unwrap();
        assert!(db2.last_alert_within(window).unwrap().is_none());
    }

    #[test]
    fn test_null_json_columns() {
        let db = AccessDatabase::open_in_memory().unwrap();
        let id = db.record(&AccessRecord::new("cam", "", true)).unwrap();
        let back = db.get(id).unwrap().unwrap();
        assert!(back.face_box.is_none());
        assert!(back.metadata.is_null());
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let db = AccessDatabase::open_in_memory().unwrap();
        let id = db.record(&unauthorized_record()).unwrap();
        db.conn
            .execute(
                "UPDATE access_logs SET timestamp = 'yesterday-ish' WHERE id = ?1",
                params![id],
            )
            .unwrap();

        match db.get(id) {
            Err(StoreError::Timestamp { raw, .. }) => assert_eq!(raw, "yesterday-ish"),
            other => panic!("expected timestamp error, got {:?}", other),
        }
        assert!(db.recent(10, false).is_err());
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("access.db");
        let db = AccessDatabase::open(&path).unwrap();
        db.record(&unauthorized_record()).unwrap();
        db.close().unwrap();

        let db = AccessDatabase::open(&path).unwrap();
        assert_eq!(db.count().unwrap(), 1);
    }
}
