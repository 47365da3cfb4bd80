use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use super::credential::{Credential, CredentialOrigin, HealthStatus};
use super::ledger::UsageLedger;
use super::store::{
    CredentialIncrement, CredentialStore, OriginFilter, StoreError, UsageLedgerStore,
};

const CREDENTIAL_COLUMNS: &str = "id, key_material, origin, health, validated, usage_count,
     allocation_count, last_used_at_ms, last_validated_at_ms, last_validation_error, label,
     donor_contact, created_at_ms";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt credential row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn load_allocatable(
        &self,
        origin: OriginFilter,
    ) -> Result<Vec<Credential>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Credential>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {CREDENTIAL_COLUMNS}
                 FROM credentials
                 WHERE health = 'healthy' AND (origin = 'admin' OR validated = 1)
                 ORDER BY allocation_count, created_at_ms, id"
            ))?;
            let rows = stmt.query_map([], read_row)?;

            let mut out = Vec::new();
            for row in rows {
                let credential = row_to_credential(row?)?;
                if origin.matches(credential.origin) {
                    out.push(credential);
                }
            }
            Ok(out)
        })
        .await?
    }

    pub async fn increment_credential(
        &self,
        id: &str,
        increment: CredentialIncrement,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE credentials
                 SET allocation_count = allocation_count + ?2,
                     usage_count = usage_count + ?3,
                     last_used_at_ms = ?4,
                     last_validated_at_ms = ?4,
                     last_validation_error = NULL
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    u64_to_i64(increment.allocations),
                    u64_to_i64(increment.usages),
                    u64_to_i64(increment.used_at_ms),
                ],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn update_health(
        &self,
        id: &str,
        health: HealthStatus,
        error: Option<&str>,
        at_ms: u64,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        let error = error.map(str::to_string);
        let mark_validated = health == HealthStatus::Healthy;
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE credentials
                 SET health = ?2,
                     last_validation_error = ?3,
                     last_validated_at_ms = ?4,
                     validated = CASE WHEN ?5 THEN 1 ELSE validated END
                 WHERE id = ?1",
                rusqlite::params![id, health.as_str(), error, u64_to_i64(at_ms), mark_validated],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn update_label(
        &self,
        id: &str,
        label: Option<&str>,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        let label = label.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE credentials SET label = ?2 WHERE id = ?1",
                rusqlite::params![id, label],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    /// Returns `false` without writing when the id or key material already exists.
    pub async fn insert_credential(
        &self,
        credential: &Credential,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let credential = credential.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "INSERT OR IGNORE INTO credentials (
                    id, key_material, origin, health, validated, usage_count, allocation_count,
                    last_used_at_ms, last_validated_at_ms, last_validation_error, label,
                    donor_contact, created_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    credential.id,
                    credential.key,
                    credential.origin.as_str(),
                    credential.health.as_str(),
                    credential.validated,
                    u64_to_i64(credential.usage_count),
                    u64_to_i64(credential.allocation_count),
                    credential.last_used_at_ms.map(u64_to_i64),
                    credential.last_validated_at_ms.map(u64_to_i64),
                    credential.last_validation_error,
                    credential.label,
                    credential.donor_contact,
                    u64_to_i64(credential.created_at_ms),
                ],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn load_credential_by_key(
        &self,
        key: &str,
    ) -> Result<Option<Credential>, SqliteStoreError> {
        self.load_one("key_material", key).await
    }

    pub async fn load_credential(&self, id: &str) -> Result<Option<Credential>, SqliteStoreError> {
        self.load_one("id", id).await
    }

    async fn load_one(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<Credential>, SqliteStoreError> {
        let path = self.path.clone();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Credential>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE {column} = ?1"),
                    rusqlite::params![value],
                    read_row,
                )
                .optional()?;
            row.map(row_to_credential).transpose()
        })
        .await?
    }

    pub async fn list_all_credentials(&self) -> Result<Vec<Credential>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Credential>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials ORDER BY created_at_ms, id"
            ))?;
            let rows = stmt.query_map([], read_row)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row_to_credential(row?)?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn delete_credential(&self, id: &str) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "DELETE FROM credentials WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn load_ledger(
        &self,
        instance_id: &str,
    ) -> Result<Option<UsageLedger>, SqliteStoreError> {
        let path = self.path.clone();
        let instance_id = instance_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<UsageLedger>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM usage_ledgers WHERE instance_id = ?1",
                    rusqlite::params![instance_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw
                .map(|raw| serde_json::from_str::<UsageLedger>(&raw))
                .transpose()?)
        })
        .await?
    }

    pub async fn store_ledger(&self, ledger: &UsageLedger) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let instance_id = ledger.instance_id.clone();
        let updated_at_ms = u64_to_i64(ledger.updated_at_ms);
        let value_json = serde_json::to_string(ledger)?;
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_ledgers (instance_id, value_json, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(instance_id) DO UPDATE SET
                    value_json = excluded.value_json,
                    updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![instance_id, value_json, updated_at_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_all_ledgers(&self) -> Result<Vec<UsageLedger>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageLedger>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt =
                conn.prepare("SELECT value_json FROM usage_ledgers ORDER BY instance_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut out = Vec::new();
            for row in rows {
                let raw = row?;
                out.push(serde_json::from_str(&raw)?);
            }
            Ok(out)
        })
        .await?
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn find_healthy(&self, origin: OriginFilter) -> Result<Vec<Credential>, StoreError> {
        Ok(self.load_allocatable(origin).await?)
    }

    async fn atomic_increment(
        &self,
        id: &str,
        increment: CredentialIncrement,
    ) -> Result<bool, StoreError> {
        Ok(self.increment_credential(id, increment).await?)
    }

    async fn set_health(
        &self,
        id: &str,
        health: HealthStatus,
        error: Option<&str>,
        at_ms: u64,
    ) -> Result<bool, StoreError> {
        Ok(self.update_health(id, health, error, at_ms).await?)
    }

    async fn set_label(&self, id: &str, label: Option<&str>) -> Result<bool, StoreError> {
        Ok(self.update_label(id, label).await?)
    }

    async fn insert(&self, credential: Credential) -> Result<String, StoreError> {
        if !self.insert_credential(&credential).await? {
            return Err(StoreError::Conflict { id: credential.id });
        }
        Ok(credential.id)
    }

    async fn find_by_key_material(&self, key: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.load_credential_by_key(key).await?)
    }

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.load_credential(id).await?)
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.list_all_credentials().await?)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.delete_credential(id).await?)
    }
}

#[async_trait]
impl UsageLedgerStore for SqliteStore {
    async fn find_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<UsageLedger>, StoreError> {
        Ok(self.load_ledger(instance_id).await?)
    }

    async fn upsert(&self, ledger: &UsageLedger) -> Result<(), StoreError> {
        Ok(self.store_ledger(ledger).await?)
    }

    async fn list_ledgers(&self) -> Result<Vec<UsageLedger>, StoreError> {
        Ok(self.list_all_ledgers().await?)
    }
}

struct CredentialRow {
    id: String,
    key: String,
    origin: String,
    health: String,
    validated: bool,
    usage_count: i64,
    allocation_count: i64,
    last_used_at_ms: Option<i64>,
    last_validated_at_ms: Option<i64>,
    last_validation_error: Option<String>,
    label: Option<String>,
    donor_contact: Option<String>,
    created_at_ms: i64,
}

fn read_row(row: &rusqlite::Row<'_>) -> Result<CredentialRow, rusqlite::Error> {
    Ok(CredentialRow {
        id: row.get(0)?,
        key: row.get(1)?,
        origin: row.get(2)?,
        health: row.get(3)?,
        validated: row.get(4)?,
        usage_count: row.get(5)?,
        allocation_count: row.get(6)?,
        last_used_at_ms: row.get(7)?,
        last_validated_at_ms: row.get(8)?,
        last_validation_error: row.get(9)?,
        label: row.get(10)?,
        donor_contact: row.get(11)?,
        created_at_ms: row.get(12)?,
    })
}

fn row_to_credential(row: CredentialRow) -> Result<Credential, SqliteStoreError> {
    let origin = CredentialOrigin::parse(&row.origin).ok_or_else(|| SqliteStoreError::CorruptRow {
        id: row.id.clone(),
        reason: format!("unknown origin {:?}", row.origin),
    })?;
    let health = HealthStatus::parse(&row.health).ok_or_else(|| SqliteStoreError::CorruptRow {
        id: row.id.clone(),
        reason: format!("unknown health {:?}", row.health),
    })?;
    Ok(Credential {
        id: row.id,
        key: row.key,
        origin,
        health,
        validated: row.validated,
        usage_count: i64_to_u64(row.usage_count),
        allocation_count: i64_to_u64(row.allocation_count),
        last_used_at_ms: row.last_used_at_ms.map(i64_to_u64),
        last_validated_at_ms: row.last_validated_at_ms.map(i64_to_u64),
        last_validation_error: row.last_validation_error,
        label: row.label,
        donor_contact: row.donor_contact,
        created_at_ms: i64_to_u64(row.created_at_ms),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY NOT NULL,
            key_material TEXT NOT NULL UNIQUE,
            origin TEXT NOT NULL,
            health TEXT NOT NULL,
            validated INTEGER NOT NULL DEFAULT 0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            allocation_count INTEGER NOT NULL DEFAULT 0,
            last_used_at_ms INTEGER,
            last_validated_at_ms INTEGER,
            last_validation_error TEXT,
            label TEXT,
            donor_contact TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credentials_health_allocation
            ON credentials(health, allocation_count);

        CREATE TABLE IF NOT EXISTS usage_ledgers (
            instance_id TEXT PRIMARY KEY NOT NULL,
            value_json TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
