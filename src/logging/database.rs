use rusqlite::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::time::{parse_datetime_string, to_iso8601_utc_string};
use super::types::RequestLog;
use crate::config::ApiType;
use crate::error::{GatewayError, Result};

const SELECT_COLUMNS: &str = "request_id, timestamp, api_type, client, method, path, model,
    upstream_model, provider_id, provider_name, status_code, duration_ms,
    input_tokens, output_tokens, cost, cached, error_message";

/// SQLite archive of every RequestLog, used to rebuild statistics on start-up.
#[derive(Clone)]
pub struct DatabaseLogger {
    connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = Path::new(database_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory: {}", parent.display());
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                api_type TEXT NOT NULL,
                client TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                model TEXT,
                upstream_model TEXT,
                provider_id TEXT,
                provider_name TEXT,
                status_code INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                cached INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_provider ON request_logs(provider_id);",
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn log_request(&self, log: &RequestLog) -> Result<i64> {
        let conn = self.connection.lock().await;

        conn.execute(
            "INSERT INTO request_logs (
                request_id, timestamp, api_type, client, method, path, model,
                upstream_model, provider_id, provider_name, status_code, duration_ms,
                input_tokens, output_tokens, cost, cached, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            rusqlite::params![
                &log.id,
                to_iso8601_utc_string(&log.timestamp),
                log.api_type.as_str(),
                &log.client,
                &log.method,
                &log.path,
                &log.model,
                &log.upstream_model,
                &log.provider_id,
                &log.provider_name,
                log.status,
                i64::try_from(log.duration_ms).unwrap_or(i64::MAX),
                log.input_tokens,
                log.output_tokens,
                log.cost,
                log.cached,
                &log.error_message,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Feeds every archived log to `apply` in insertion order, one row at a
    /// time. Rows that no longer parse are skipped with a warning.
    /// Returns `(replayed, skipped)`.
    pub async fn replay_into(&self, mut apply: impl FnMut(RequestLog)) -> Result<(usize, usize)> {
        let conn = self.connection.lock().await;
        let sql = format!("SELECT {} FROM request_logs ORDER BY id ASC", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_row)?;

        let (mut replayed, mut skipped) = (0, 0);
        for row in rows {
            match row.map_err(GatewayError::from).and_then(decode_row) {
                Ok(log) => {
                    apply(log);
                    replayed += 1;
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("skipping unreadable archived log: {}", e);
                }
            }
        }
        Ok((replayed, skipped))
    }
}

struct RawLog {
    log: RequestLog,
    timestamp: String,
    api_type: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawLog> {
    let duration_ms: i64 = row.get(11)?;
    Ok(RawLog {
        timestamp: row.get(1)?,
        api_type: row.get(2)?,
        log: RequestLog {
            id: row.get(0)?,
            timestamp: chrono::DateTime::<chrono::Utc>::MIN_UTC,
            api_type: ApiType::OpenaiChat,
            client: row.get(3)?,
            method: row.get(4)?,
            path: row.get(5)?,
            model: row.get(6)?,
            upstream_model: row.get(7)?,
            provider_id: row.get(8)?,
            provider_name: row.get(9)?,
            status: row.get(10)?,
            duration_ms: duration_ms.max(0) as u64,
            input_tokens: row.get(12)?,
            output_tokens: row.get(13)?,
            cost: row.get(14)?,
            cached: row.get(15)?,
            error_message: row.get(16)?,
        },
    })
}

fn decode_row(raw: RawLog) -> Result<RequestLog> {
    let RawLog {
        mut log,
        timestamp,
        api_type,
    } = raw;
    log.timestamp = parse_datetime_string(&timestamp)?;
    log.api_type = ApiType::from_str(&api_type).map_err(|e| {
        GatewayError::Config(format!("archived log {} is corrupt: {}", log.id, e))
    })?;
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn log(status: u16, provider: Option<&str>) -> RequestLog {
        let mut log = RequestLog::new(ApiType::Anthropic, "POST", "/v1/messages", "test");
        log.timestamp = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        log.status = status;
        log.provider_id = provider.map(str::to_string);
        log.duration_ms = 120;
        log.input_tokens = 11;
        log.output_tokens = 22;
        log.cost = 0.5;
        log
    }

    #[tokio::test]
    async fn archive_round_trips_in_order() {
        let db = DatabaseLogger::in_memory().unwrap();
        let first = log(500, Some("a"));
        let second = log(200, Some("b"));
        db.log_request(&first).await.unwrap();
        db.log_request(&second).await.unwrap();

        let mut replayed = Vec::new();
        let counts = db.replay_into(|log| replayed.push(log)).await.unwrap();
        assert_eq!(counts, (2, 0));
        assert_eq!(replayed, vec![first, second]);
    }

    #[tokio::test]
    async fn corrupt_rows_are_skipped_on_replay() {
        let db = DatabaseLogger::in_memory().unwrap();
        db.log_request(&log(200, Some("a"))).await.unwrap();
        {
            let conn = db.connection.lock().await;
            conn.execute(
                "INSERT INTO request_logs (request_id, timestamp, api_type, client, method, path,
                    status_code, duration_ms)
                 VALUES ('bad-time', 'yesterday', 'anthropic', 'c', 'POST', '/v1/messages', 200, 1),
                        ('bad-api', '2026-02-03T04:05:06Z', 'gopher', 'c', 'POST', '/x', 200, 1),
                        ('bad-type', '2026-02-03T04:05:06Z', 'anthropic', 'c', 'POST', '/x', 'oops', 1)",
                [],
            )
            .unwrap();
        }
        db.log_request(&log(502, Some("b"))).await.unwrap();

        let mut statuses = Vec::new();
        let counts = db.replay_into(|log| statuses.push(log.status)).await.unwrap();
        assert_eq!(counts, (2, 3));
        assert_eq!(statuses, vec![200, 502]);
    }

    #[tokio::test]
    async fn creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("gateway.db");
        let db = DatabaseLogger::new(path.to_str().unwrap()).await.unwrap();
        db.log_request(&log(503, None)).await.unwrap();
        assert!(path.exists());
    }
}
