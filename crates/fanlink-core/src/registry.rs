//! Persistent device registry backed by SQLite
//!
//! The registry is the durable record of every device the cloud inventory has
//! listed, independent of whether it is currently reachable. Each call opens
//! its own connection, so the registry can be shared freely between tasks.
//!
//! Layout: `{db_dir}/devices.sqlite3`, one `devices` table keyed by id.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::device::{DeviceId, RegistryRecord};

pub const DB_FILE: &str = "devices.sqlite3";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    model TEXT NOT NULL,
    local_credentials TEXT NOT NULL,
    last_seen TEXT NOT NULL
)
"#;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Invalid timestamp for {id}: {value}")]
    InvalidTimestamp { id: String, value: String },
    #[error("Device not found: {0}")]
    NotFound(DeviceId),
}

/// Handle on the registry database file
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    path: PathBuf,
}

impl DeviceRegistry {
    /// Open (and create if needed) the registry under `db_dir`
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let registry = Self {
            path: db_dir.join(DB_FILE),
        };
        registry.connect()?.execute_batch(SCHEMA)?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, RegistryError> {
        Ok(Connection::open(&self.path)?)
    }

    pub fn create(&self, record: &RegistryRecord) -> Result<(), RegistryError> {
        self.connect()?.execute(
            "INSERT INTO devices (id, name, model, local_credentials, last_seen) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.as_str(),
                record.name,
                record.model,
                record.local_credentials,
                record.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All records, ordered by id
    pub fn read_all(&self) -> Result<Vec<RegistryRecord>, RegistryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, model, local_credentials, last_seen FROM devices ORDER BY id",
        )?;
        let rows = stmt.query_map([], raw_row)?;

        let mut records = Vec::new();
        for row in rows {
            match row?.into_record() {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unreadable registry record"),
            }
        }
        Ok(records)
    }

    pub fn read(&self, id: &DeviceId) -> Result<Option<RegistryRecord>, RegistryError> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                "SELECT id, name, model, local_credentials, last_seen FROM devices WHERE id = ?1",
                params![id.as_str()],
                raw_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Overwrite every field of an existing record
    pub fn update(&self, record: &RegistryRecord) -> Result<(), RegistryError> {
        let changed = self.connect()?.execute(
            "UPDATE devices SET name = ?2, model = ?3, local_credentials = ?4, last_seen = ?5 WHERE id = ?1",
            params![
                record.id.as_str(),
                record.name,
                record.model,
                record.local_credentials,
                record.last_seen.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(record.id.clone()));
        }
        Ok(())
    }

    pub fn delete(&self, id: &DeviceId) -> Result<(), RegistryError> {
        let changed = self
            .connect()?
            .execute("DELETE FROM devices WHERE id = ?1", params![id.as_str()])?;
        if changed == 0 {
            return Err(RegistryError::NotFound(id.clone()));
        }
        Ok(())
    }

    pub fn ids(&self) -> Result<Vec<DeviceId>, RegistryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id FROM devices ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(DeviceId).collect())
    }
}

struct RawRecord {
    id: String,
    name: String,
    model: String,
    local_credentials: String,
    last_seen: String,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        local_credentials: row.get(3)?,
        last_seen: row.get(4)?,
    })
}

/// RFC 3339, or epoch seconds as written by older stores
fn parse_last_seen(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let epoch: f64 = value.trim().parse().ok()?;
    if !epoch.is_finite() {
        return None;
    }
    DateTime::from_timestamp(epoch.trunc() as i64, (epoch.fract() * 1e9) as u32)
}

impl RawRecord {
    fn into_record(self) -> Result<RegistryRecord, RegistryError> {
        let last_seen =
            parse_last_seen(&self.last_seen).ok_or_else(|| RegistryError::InvalidTimestamp {
                id: self.id.clone(),
                value: self.last_seen.clone(),
            })?;
        Ok(RegistryRecord {
            id: DeviceId(self.id),
            name: self.name,
            model: self.model,
            local_credentials: self.local_credentials,
            last_seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, name: &str) -> RegistryRecord {
        RegistryRecord {
            id: DeviceId::from(id),
            name: name.to_string(),
            model: "475".to_string(),
            local_credentials: r#"{"serial":"S","apPasswordHash":"h"}"#.to_string(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_create_and_read() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        assert!(dir.path().join(DB_FILE).exists());

        let rec = record("dyson-A", "Bedroom");
        registry.create(&rec).unwrap();

        let loaded = registry.read(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Bedroom");
        assert_eq!(loaded.last_seen.timestamp(), rec.last_seen.timestamp());
        assert!(registry.read(&DeviceId::from("dyson-B")).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_create_fails() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        registry.create(&record("dyson-A", "a")).unwrap();
        assert!(registry.create(&record("dyson-A", "a")).is_err());
    }

    #[test]
    fn test_update_and_delete() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        let mut rec = record("dyson-A", "Bedroom");
        registry.create(&rec).unwrap();

        rec.name = "Office".to_string();
        rec.last_seen = rec.last_seen - Duration::hours(3);
        registry.update(&rec).unwrap();
        let loaded = registry.read(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Office");
        assert_eq!(loaded.last_seen.timestamp(), rec.last_seen.timestamp());

        registry.delete(&rec.id).unwrap();
        assert!(registry.read_all().unwrap().is_empty());
        assert!(matches!(
            registry.delete(&rec.id),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(registry.update(&rec), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = DeviceRegistry::open(dir.path()).unwrap();
            registry.create(&record("dyson-B", "b")).unwrap();
            registry.create(&record("dyson-A", "a")).unwrap();
        }
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        assert_eq!(
            registry.ids().unwrap(),
            vec![DeviceId::from("dyson-A"), DeviceId::from("dyson-B")]
        );
        assert_eq!(registry.read_all().unwrap().len(), 2);
    }

    fn insert_raw(registry: &DeviceRegistry, id: &str, last_seen: &str) {
        Connection::open(registry.path())
            .unwrap()
            .execute(
                "INSERT INTO devices (id, name, model, local_credentials, last_seen) VALUES (?1, ?1, '475', '{}', ?2)",
                params![id, last_seen],
            )
            .unwrap();
    }

    #[test]
    fn test_bad_row_does_not_hide_others() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        registry.create(&record("dyson-GOOD", "good")).unwrap();
        insert_raw(&registry, "dyson-BAD", "yesterday-ish");

        let records = registry.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, DeviceId::from("dyson-GOOD"));
        assert!(matches!(
            registry.read(&DeviceId::from("dyson-BAD")),
            Err(RegistryError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_epoch_last_seen_is_accepted() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        insert_raw(&registry, "dyson-OLD", "1600000000.5");
        registry.create(&record("dyson-NEW", "new")).unwrap();

        let records = registry.read_all().unwrap();
        assert_eq!(records.len(), 2);
        let old = registry.read(&DeviceId::from("dyson-OLD")).unwrap().unwrap();
        assert_eq!(old.last_seen.timestamp(), 1_600_000_000);
    }
}
