//! SQLite sink - store completed series summaries locally
//!
//! Table `series_summaries` is append-only: a series published twice (which
//! the dispatcher prevents) would show up as two rows, never as an update.

use super::sink::{SeriesSink, SinkError};
use super::types::{Ack, SeriesSummary};
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS series_summaries (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    series_instance_uid TEXT NOT NULL,
    study_instance_uid  TEXT NOT NULL,
    patient_name        TEXT NOT NULL,
    patient_id          TEXT NOT NULL,
    number_of_instances INTEGER NOT NULL CHECK (number_of_instances > 0),
    received_at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_series_summaries_study
    ON series_summaries (study_instance_uid);
"#;

pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open (or create) the database and ensure the schema exists
    pub fn open(db_path: &str) -> Result<Self, SinkError> {
        let conn = Connection::open(db_path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("SQLite journal mode: {}", journal_mode);
        conn.execute_batch(SCHEMA)?;

        log::info!("📊 SQLite sink ready: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// All stored summaries in insertion order
    pub fn stored_summaries(&self) -> Result<Vec<SeriesSummary>, SinkError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT study_instance_uid, patient_name, patient_id, number_of_instances, series_instance_uid
             FROM series_summaries ORDER BY id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SeriesSummary {
                parent_key: row.get(0)?,
                patient_name: row.get(1)?,
                patient_id: row.get(2)?,
                count: row.get::<_, i64>(3)? as usize,
                series_uid: row.get(4)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl SeriesSink for SqliteSink {
    async fn submit(&self, summary: &SeriesSummary) -> Result<Ack, SinkError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        conn.execute(
            r#"
            INSERT INTO series_summaries
                (series_instance_uid, study_instance_uid, patient_name, patient_id, number_of_instances, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                summary.series_uid,
                summary.parent_key,
                summary.patient_name,
                summary.patient_id,
                summary.count as i64,
                now,
            ],
        )?;

        Ok(Ack {
            status: Some(format!("stored:{}", conn.last_insert_rowid())),
        })
    }

    fn sink_type(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn summary(series: &str, count: usize) -> SeriesSummary {
        SeriesSummary {
            parent_key: "study-1".to_string(),
            patient_name: "Doe^Jane".to_string(),
            patient_id: "P07".to_string(),
            count,
            series_uid: series.to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_stores_row() {
        let temp = NamedTempFile::new().unwrap();
        let sink = SqliteSink::open(temp.path().to_str().unwrap()).unwrap();

        let ack = sink.submit(&summary("S1", 3)).await.unwrap();
        assert_eq!(ack.status.as_deref(), Some("stored:1"));

        sink.submit(&summary("S2", 1)).await.unwrap();

        let stored = sink.stored_summaries().unwrap();
        assert_eq!(stored, vec![summary("S1", 3), summary("S2", 1)]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();

        {
            let sink = SqliteSink::open(&path).unwrap();
            sink.submit(&summary("S1", 2)).await.unwrap();
        }

        let sink = SqliteSink::open(&path).unwrap();
        assert_eq!(sink.stored_summaries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_count_rejected_by_schema() {
        let temp = NamedTempFile::new().unwrap();
        let sink = SqliteSink::open(temp.path().to_str().unwrap()).unwrap();

        let err = sink.submit(&summary("S1", 0)).await.unwrap_err();
        assert!(matches!(err, SinkError::Database(_)));
    }
}
