//! SQLite database implementation for persistent storage

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::core::{InstanceId, InstanceRecord, Settings};

/// One entry of an instance's lifecycle history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceEvent {
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub details: Option<String>,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at the default location
    pub fn new() -> Result<Self> {
        Self::open(&Self::get_database_path()?)
    }

    /// Open (or create) the database file at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .context(format!("Failed to open database at {:?}", db_path))?;

        // WAL so status readers never wait on a writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        info!("Database opened at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests and throwaway registries
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the database file path
    fn get_database_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("OpenPhone");
        Ok(data_dir.join("openphone.db"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Instances table
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                slot INTEGER NOT NULL UNIQUE,
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                ports TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Monotonic counters (slot allocation)
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            -- Instance history
            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === Instances ===

    /// Save an instance record
    pub fn save_instance(&self, record: &InstanceRecord) -> Result<()> {
        let conn = self.conn()?;
        let config_json = serde_json::to_string(&record.config)?;
        let ports_json = serde_json::to_string(&record.ports)?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO instances
            (id, slot, name, config, ports, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id.to_string(),
                record.slot,
                record.name,
                config_json,
                ports_json,
                record.created_at.to_rfc3339(),
            ],
        )?;

        debug!("Instance {} saved", record.id);
        Ok(())
    }

    /// Load all instance records, ordered by slot
    pub fn load_instances(&self) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, slot, name, config, ports, created_at FROM instances ORDER BY slot",
        )?;

        let rows = stmt.query_map([], |row| {
            let id_str: String = row.get(0)?;
            let slot: u32 = row.get(1)?;
            let name: String = row.get(2)?;
            let config_json: String = row.get(3)?;
            let ports_json: String = row.get(4)?;
            let created_at_str: String = row.get(5)?;
            Ok((id_str, slot, name, config_json, ports_json, created_at_str))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id_str, slot, name, config_json, ports_json, created_at_str) = row?;

            let id: InstanceId = match id_str.parse() {
                Ok(id) => id,
                Err(e) => {
                    error!("Skipping instance with malformed id '{}': {}", id_str, e);
                    continue;
                }
            };
            let config = match serde_json::from_str(&config_json) {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to deserialize config of instance {}: {}", id, e);
                    continue;
                }
            };
            let ports = match serde_json::from_str(&ports_json) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to deserialize ports of instance {}: {}", id, e);
                    continue;
                }
            };
            let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            result.push(InstanceRecord {
                id,
                slot,
                name,
                config,
                ports,
                created_at,
            });
        }

        Ok(result)
    }

    /// Delete an instance record
    /// Remove an instance record together with its history
    pub fn delete_instance(&self, id: InstanceId) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM instances WHERE id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM instance_history WHERE instance_id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        debug!("Instance {} deleted", id);
        Ok(())
    }

    // === Slot counter ===

    /// Next unused slot index; 0 on a fresh database
    pub fn load_next_slot(&self) -> Result<u32> {
        let conn = self.conn()?;
        let value: Option<u32> = conn
            .query_row(
                "SELECT value FROM counters WHERE name = 'next_slot'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    pub fn save_next_slot(&self, next_slot: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO counters (name, value) VALUES ('next_slot', ?1)",
            params![next_slot],
        )?;
        Ok(())
    }

    // === History ===

    /// Record an instance event
    pub fn record_instance_event(
        &self,
        instance_id: InstanceId,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_id, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                instance_id.to_string(),
                event_type,
                Utc::now().to_rfc3339(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Get instance history, newest first
    pub fn get_instance_history(&self, instance_id: InstanceId) -> Result<Vec<InstanceEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM instance_history WHERE instance_id = ?1 ORDER BY id DESC"
        )?;

        let history = stmt.query_map(params![instance_id.to_string()], |row| {
            let event_type: String = row.get(0)?;
            let event_time: String = row.get(1)?;
            let details: Option<String> = row.get(2)?;
            Ok((event_type, event_time, details))
        })?;

        let mut result = Vec::new();
        for event in history {
            let (event_type, event_time, details) = event?;
            let event_time = DateTime::parse_from_rfc3339(&event_time)
                .map(|t| t.with_timezone(&Utc))
                .context("Malformed history timestamp")?;
            result.push(InstanceEvent {
                event_type,
                event_time,
                details,
            });
        }

        Ok(result)
    }

    /// Drop history older than `retention_days`; 0 keeps everything
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }

        let conn = self.conn()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(i64::from(retention_days))
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        if count > 0 {
            info!("Removed {} history event(s) older than {} days", count, retention_days);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PhoneConfig, PortLayout};

    fn database() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn record(slot: u32) -> InstanceRecord {
        InstanceRecord {
            id: InstanceId::new(),
            slot,
            name: format!("Phone {}", slot + 1),
            config: PhoneConfig::default(),
            ports: PortLayout::default().allocate(slot),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn instance_records_round_trip_in_slot_order() {
        let db = database();
        let second = record(1);
        let first = record(0);
        db.save_instance(&second).unwrap();
        db.save_instance(&first).unwrap();

        let loaded = db.load_instances().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[1].ports, second.ports);
        // RFC 3339 keeps sub-second precision
        assert_eq!(loaded[0].created_at, first.created_at);

        db.delete_instance(first.id).unwrap();
        assert_eq!(db.load_instances().unwrap(), vec![second]);
    }

    #[test]
    fn slot_counter_defaults_to_zero_and_persists() {
        let db = database();
        assert_eq!(db.load_next_slot().unwrap(), 0);
        db.save_next_slot(7).unwrap();
        db.save_next_slot(8).unwrap();
        assert_eq!(db.load_next_slot().unwrap(), 8);
    }

    #[test]
    fn settings_are_validated_on_load() {
        let db = database();
        assert!(db.load_settings().unwrap().is_none());

        let settings = Settings {
            max_cpu_cores: 0,
            boot_timeout_secs: 42,
            ..Default::default()
        };
        db.save_settings(&settings).unwrap();

        let loaded = db.load_settings().unwrap().unwrap();
        assert_eq!(loaded.boot_timeout_secs, 42);
        assert_eq!(loaded.max_cpu_cores, 1);
    }

    #[test]
    fn history_is_newest_first_and_per_instance() {
        let db = database();
        let id = InstanceId::new();
        db.record_instance_event(id, "created", None).unwrap();
        db.record_instance_event(id, "failed", Some("boom")).unwrap();
        db.record_instance_event(InstanceId::new(), "created", None)
            .unwrap();

        let history = db.get_instance_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "failed");
        assert_eq!(history[0].details.as_deref(), Some("boom"));
        assert_eq!(history[1].event_type, "created");
    }

    #[test]
    fn deleting_an_instance_drops_its_history() {
        let db = database();
        let gone = record(0);
        let kept = record(1);
        db.save_instance(&gone).unwrap();
        db.save_instance(&kept).unwrap();
        db.record_instance_event(gone.id, "created", None).unwrap();
        db.record_instance_event(kept.id, "created", None).unwrap();

        db.delete_instance(gone.id).unwrap();

        assert!(db.get_instance_history(gone.id).unwrap().is_empty());
        assert_eq!(db.get_instance_history(kept.id).unwrap().len(), 1);
        assert_eq!(db.load_instances().unwrap(), vec![kept]);
    }

    #[test]
    fn cleanup_removes_only_expired_history() {
        let db = database();
        let id = InstanceId::new();
        db.record_instance_event(id, "started", None).unwrap();
        {
            let conn = db.conn().unwrap();
            let old = (Utc::now() - chrono::TimeDelta::days(45)).to_rfc3339();
            conn.execute(
                "INSERT INTO instance_history (instance_id, event_type, event_time) VALUES (?1, 'created', ?2)",
                params![id.to_string(), old],
            )
            .unwrap();
        }

        assert_eq!(db.cleanup_history(0).unwrap(), 0);
        assert_eq!(db.get_instance_history(id).unwrap().len(), 2);

        assert_eq!(db.cleanup_history(30).unwrap(), 1);
        let history = db.get_instance_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "started");
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("openphone.db");
        {
            let db = Database::open(&path).unwrap();
            db.initialize().unwrap();
            db.save_next_slot(3).unwrap();
        }
        let db = Database::open(&path).unwrap();
        db.initialize().unwrap();
        assert_eq!(db.load_next_slot().unwrap(), 3);
    }
}
