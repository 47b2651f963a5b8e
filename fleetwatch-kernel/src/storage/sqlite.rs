/**
 * STORE SQLITE - Backend rusqlite (mode WAL) des relations server_metrics / user_activity
 *
 * - clés synthétiques INTEGER AUTOINCREMENT, timestamps en millisecondes UTC
 * - une transaction par write_collection (échantillon + utilisateurs)
 * - VACUUM après une rétention qui a supprimé des lignes
 */

use super::{PruneReport, ServerSnapshot, Store, StoreError, WriteReceipt};
use chrono::{DateTime, NaiveDateTime, Utc};
use fleetwatch_probe::{CollectionResult, ServerMetrics, UserActivity};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, Row};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Format texte des colonnes last_boot / last_login
const NAIVE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS server_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    server_name TEXT NOT NULL,
    cycle_id TEXT NOT NULL,
    architecture TEXT NOT NULL,
    operating_system TEXT NOT NULL,
    physical_cpus INTEGER,
    virtual_cpus INTEGER NOT NULL,
    ram_used TEXT,
    ram_total TEXT,
    ram_percentage REAL NOT NULL,
    disk_used TEXT,
    disk_total TEXT,
    disk_percentage REAL NOT NULL,
    cpu_load_1min REAL NOT NULL,
    cpu_load_5min REAL,
    cpu_load_15min REAL,
    last_boot TEXT,
    tcp_connections INTEGER,
    logged_users INTEGER,
    active_vnc_users INTEGER,
    active_ssh_users INTEGER
);
CREATE INDEX IF NOT EXISTS idx_server_metrics_host_ts ON server_metrics(server_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_server_metrics_ts ON server_metrics(timestamp);

CREATE TABLE IF NOT EXISTS user_activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    server_name TEXT NOT NULL,
    cycle_id TEXT NOT NULL,
    username TEXT NOT NULL,
    cpu_percent REAL NOT NULL,
    memory_percent REAL NOT NULL,
    disk_gb REAL,
    process_count INTEGER NOT NULL,
    top_process TEXT,
    last_login TEXT,
    full_name TEXT
);
CREATE INDEX IF NOT EXISTS idx_user_activity_host_ts ON user_activity(server_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_user_activity_ts ON user_activity(timestamp);
";

const SERVER_COLUMNS: &str = "server_name, timestamp, cycle_id, architecture, operating_system, \
    physical_cpus, virtual_cpus, ram_used, ram_total, ram_percentage, disk_used, disk_total, \
    disk_percentage, cpu_load_1min, cpu_load_5min, cpu_load_15min, last_boot, tcp_connections, \
    logged_users, active_vnc_users, active_ssh_users";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Ouvre (ou crée) la base et son schéma
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Fatal(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(classify)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(classify)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "storage opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(classify)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(classify)?;
        conn.execute_batch(SCHEMA).map_err(classify)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// busy / locked / I/O / disque plein -> Transient, le reste -> Fatal
pub fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::CannotOpen => StoreError::Transient(err.to_string()),
            _ => StoreError::Fatal(err.to_string()),
        },
        _ => StoreError::Fatal(err.to_string()),
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn naive_to_text(ts: Option<NaiveDateTime>) -> Option<String> {
    ts.map(|t| t.format(NAIVE_TS_FORMAT).to_string())
}

fn naive_from_text(txt: Option<String>) -> Option<NaiveDateTime> {
    txt.and_then(|t| NaiveDateTime::parse_from_str(&t, NAIVE_TS_FORMAT).ok())
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ServerSnapshot> {
    Ok(ServerSnapshot {
        host: row.get(0)?,
        collected_at: from_millis(row.get(1)?),
        cycle_id: row.get(2)?,
        metrics: ServerMetrics {
            architecture: row.get(3)?,
            operating_system: row.get(4)?,
            physical_cpus: row.get(5)?,
            virtual_cpus: row.get(6)?,
            ram_used: row.get(7)?,
            ram_total: row.get(8)?,
            ram_percentage: row.get(9)?,
            disk_used: row.get(10)?,
            disk_total: row.get(11)?,
            disk_percentage: row.get(12)?,
            cpu_load_1min: row.get(13)?,
            cpu_load_5min: row.get(14)?,
            cpu_load_15min: row.get(15)?,
            last_boot: naive_from_text(row.get(16)?),
            tcp_connections: row.get(17)?,
            logged_users: row.get(18)?,
            active_vnc_users: row.get(19)?,
            active_ssh_users: row.get(20)?,
        },
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserActivity> {
    Ok(UserActivity {
        username: row.get(0)?,
        cpu_percent: row.get(1)?,
        memory_percent: row.get(2)?,
        disk_gb: row.get(3)?,
        process_count: row.get(4)?,
        top_process: row.get(5)?,
        last_login: naive_from_text(row.get(6)?),
        full_name: row.get(7)?,
    })
}

impl Store for SqliteStore {
    fn write_collection(&self, result: &CollectionResult) -> Result<WriteReceipt, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(classify)?;
        let ts = to_millis(result.collected_at);
        let m = &result.server;

        let server_row_id = {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO server_metrics ({SERVER_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
                ))
                .map_err(classify)?;
            stmt.insert(params![
                &result.host,
                ts,
                &result.cycle_id,
                &m.architecture,
                &m.operating_system,
                m.physical_cpus,
                m.virtual_cpus,
                &m.ram_used,
                &m.ram_total,
                m.ram_percentage,
                &m.disk_used,
                &m.disk_total,
                m.disk_percentage,
                m.cpu_load_1min,
                m.cpu_load_5min,
                m.cpu_load_15min,
                naive_to_text(m.last_boot),
                m.tcp_connections,
                m.logged_users,
                m.active_vnc_users,
                m.active_ssh_users,
            ])
            .map_err(classify)?
        };

        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO user_activity (timestamp, server_name, cycle_id, username, cpu_percent, \
                     memory_percent, disk_gb, process_count, top_process, last_login, full_name) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(classify)?;
            for user in &result.users {
                stmt.execute(params![
                    ts,
                    &result.host,
                    &result.cycle_id,
                    &user.username,
                    user.cpu_percent,
                    user.memory_percent,
                    user.disk_gb,
                    user.process_count,
                    &user.top_process,
                    naive_to_text(user.last_login),
                    &user.full_name,
                ])
                .map_err(classify)?;
            }
        }

        tx.commit().map_err(classify)?;
        debug!(host = %result.host, users = result.users.len(), "collection committed");
        Ok(WriteReceipt {
            server_row_id,
            user_rows: result.users.len(),
        })
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, StoreError> {
        let mut conn = self.conn.lock();
        let cutoff_ms = to_millis(cutoff);

        let tx = conn.transaction().map_err(classify)?;
        let user_rows = tx
            .execute("DELETE FROM user_activity WHERE timestamp < ?1", params![cutoff_ms])
            .map_err(classify)?;
        let server_rows = tx
            .execute("DELETE FROM server_metrics WHERE timestamp < ?1", params![cutoff_ms])
            .map_err(classify)?;
        tx.commit().map_err(classify)?;

        let mut report = PruneReport {
            server_rows,
            user_rows,
            vacuumed: false,
        };
        // VACUUM ne peut pas tourner dans une transaction
        if report.total() > 0 {
            conn.execute_batch("VACUUM;").map_err(classify)?;
            report.vacuumed = true;
        }
        Ok(report)
    }

    fn latest_per_host(&self) -> Result<Vec<ServerSnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SERVER_COLUMNS} FROM server_metrics s
                 WHERE s.id = (SELECT id FROM server_metrics
                               WHERE server_name = s.server_name
                               ORDER BY timestamp DESC, id DESC LIMIT 1)
                 ORDER BY s.server_name ASC"
            ))
            .map_err(classify)?;
        let rows = stmt.query_map([], snapshot_from_row).map_err(classify)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(classify)
    }

    fn history(
        &self,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ServerSnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SERVER_COLUMNS} FROM server_metrics
                 WHERE server_name = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp ASC, id ASC"
            ))
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![host, to_millis(from), to_millis(to)], snapshot_from_row)
            .map_err(classify)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(classify)
    }

    fn latest_users(&self, host: &str) -> Result<Vec<UserActivity>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT username, cpu_percent, memory_percent, disk_gb, process_count,
                        top_process, last_login, full_name
                 FROM user_activity
                 WHERE server_name = ?1 AND cycle_id = (
                     SELECT cycle_id FROM server_metrics WHERE server_name = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT 1)
                 ORDER BY cpu_percent DESC, username ASC",
            )
            .map_err(classify)?;
        let rows = stmt.query_map(params![host], user_from_row).map_err(classify)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(classify)
    }

    fn last_collected(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT server_name, MAX(timestamp) FROM server_metrics GROUP BY server_name")
            .map_err(classify)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, from_millis(row.get(1)?)))
            })
            .map_err(classify)?;
        rows.collect::<rusqlite::Result<HashMap<_, _>>>()
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fleetwatch_devkit::{sample_result, sample_user};

    fn count(store: &SqliteStore, table: &str) -> i64 {
        store
            .conn
            .lock()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_write_and_read_latest() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc::now() - ChronoDuration::minutes(30);
        let t1 = t0 + ChronoDuration::minutes(15);

        store.write_collection(&sample_result("alpha", t0, "c1", 2)).unwrap();
        let receipt = store.write_collection(&sample_result("alpha", t1, "c2", 3)).unwrap();
        store.write_collection(&sample_result("beta", t0, "c1", 0)).unwrap();
        assert_eq!(receipt.user_rows, 3);

        let latest = store.latest_per_host().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].host, "alpha");
        assert_eq!(latest[0].cycle_id, "c2");
        assert_eq!(latest[0].collected_at.timestamp_millis(), t1.timestamp_millis());
        assert_eq!(latest[1].host, "beta");

        assert_eq!(store.latest_users("alpha").unwrap().len(), 3);
        assert!(store.latest_users("beta").unwrap().is_empty());
        assert!(store.latest_users("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_keeps_nulls_and_timestamps() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut result = sample_result("alpha", Utc::now(), "c1", 0);
        result.server.ram_used = None;
        result.server.cpu_load_15min = None;
        let mut user = sample_user("alice", 12.5);
        user.disk_gb = None;
        result.users.push(user.clone());
        store.write_collection(&result).unwrap();

        let latest = store.latest_per_host().unwrap();
        assert_eq!(latest[0].metrics, result.server);
        assert_eq!(store.latest_users("alpha").unwrap(), vec![user]);
    }

    #[test]
    fn test_history_window_is_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = Utc::now() - ChronoDuration::hours(3);
        for i in (0..4).rev() {
            let ts = base + ChronoDuration::hours(i);
            store
                .write_collection(&sample_result("alpha", ts, &format!("c{i}"), 0))
                .unwrap();
        }

        let window = store
            .history("alpha", base + ChronoDuration::minutes(30), base + ChronoDuration::hours(3))
            .unwrap();
        let cycles: Vec<_> = window.iter().map(|s| s.cycle_id.as_str()).collect();
        assert_eq!(cycles, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_failed_user_insert_rolls_back_server_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute_batch("DROP TABLE user_activity;")
            .unwrap();

        let err = store
            .write_collection(&sample_result("alpha", Utc::now(), "c1", 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
        assert_eq!(count(&store, "server_metrics"), 0);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/fleet.db")).unwrap();
        let now = Utc::now();

        store
            .write_collection(&sample_result("alpha", now - ChronoDuration::days(100), "old", 2))
            .unwrap();
        store
            .write_collection(&sample_result("alpha", now - ChronoDuration::days(1), "new", 1))
            .unwrap();

        let cutoff = now - ChronoDuration::days(90);
        let first = store.prune_older_than(cutoff).unwrap();
        assert_eq!(
            first,
            PruneReport {
                server_rows: 1,
                user_rows: 2,
                vacuumed: true
            }
        );

        let second = store.prune_older_than(cutoff).unwrap();
        assert_eq!(second, PruneReport::default());
        assert_eq!(count(&store, "server_metrics"), 1);
        assert_eq!(count(&store, "user_activity"), 1);
    }

    #[test]
    fn test_last_collected_per_host() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc::now() - ChronoDuration::hours(1);
        let t1 = Utc::now();
        store.write_collection(&sample_result("alpha", t0, "c1", 0)).unwrap();
        store.write_collection(&sample_result("alpha", t1, "c2", 0)).unwrap();

        let last = store.last_collected().unwrap();
        assert_eq!(last["alpha"].timestamp_millis(), t1.timestamp_millis());
        assert!(!last.contains_key("beta"));
    }

    #[test]
    fn test_error_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(classify(busy), StoreError::Transient(_)));
        assert!(matches!(classify(constraint), StoreError::Fatal(_)));
        assert!(matches!(
            classify(rusqlite::Error::QueryReturnedNoRows),
            StoreError::Fatal(_)
        ));
    }
}
