use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use super::credential::{Credential, CredentialOrigin, HealthStatus};
use super::ledger::UsageLedger;
use super::store::{
    CredentialIncrement, CredentialStore, OriginFilter, StoreError, UsageLedgerStore,
};

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt credential record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "keypool".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_credential_ids(&self) -> String {
        format!("{}:credential_ids", self.prefix)
    }

    fn key_credential_material(&self) -> String {
        format!("{}:credential_keys", self.prefix)
    }

    fn key_credential(&self, id: &str) -> String {
        format!("{}:credential:{id}", self.prefix)
    }

    fn key_usage_ledgers(&self) -> String {
        format!("{}:usage_ledgers", self.prefix)
    }

    pub async fn load_credentials(&self) -> Result<Vec<Credential>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.key_credential_ids()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.key_credential(id));
        }
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut out = Vec::with_capacity(records.len());
        for (id, fields) in ids.iter().zip(records) {
            if fields.is_empty() {
                continue;
            }
            out.push(credential_from_fields(id, fields)?);
        }
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    pub async fn load_credential(&self, id: &str) -> Result<Option<Credential>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.key_credential(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(credential_from_fields(id, fields)?))
    }

    pub async fn load_credential_by_key(
        &self,
        key: &str,
    ) -> Result<Option<Credential>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let id: Option<String> = conn.hget(self.key_credential_material(), key).await?;
        match id {
            Some(id) => self.load_credential(&id).await,
            None => Ok(None),
        }
    }

    /// Returns `false` without writing when the id or key material already exists.
    pub async fn insert_credential(&self, credential: &Credential) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
local ids_key = KEYS[1]
local material_key = KEYS[2]
local credential_key = KEYS[3]

local id = ARGV[1]
local key = ARGV[2]

if redis.call("HEXISTS", material_key, key) == 1 or redis.call("EXISTS", credential_key) == 1 then
  return 0
end

redis.call("HSET", material_key, key, id)
redis.call("SADD", ids_key, id)
redis.call("HSET", credential_key, unpack(ARGV, 3))
return 1
"#,
        );

        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key_credential_ids())
            .key(self.key_credential_material())
            .key(self.key_credential(&credential.id))
            .arg(&credential.id)
            .arg(&credential.key);
        for (field, value) in credential_fields(credential) {
            invocation.arg(field).arg(value);
        }
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(inserted == 1)
    }

    pub async fn increment_credential(
        &self,
        id: &str,
        increment: CredentialIncrement,
    ) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
local credential_key = KEYS[1]
if redis.call("EXISTS", credential_key) == 0 then
  return 0
end

redis.call("HINCRBY", credential_key, "allocation_count", ARGV[1])
redis.call("HINCRBY", credential_key, "usage_count", ARGV[2])
redis.call("HSET", credential_key, "last_used_at_ms", ARGV[3], "last_validated_at_ms", ARGV[3])
redis.call("HDEL", credential_key, "last_validation_error")
return 1
"#,
        );

        let changed: i64 = script
            .key(self.key_credential(id))
            .arg(increment.allocations)
            .arg(increment.usages)
            .arg(increment.used_at_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    pub async fn update_health(
        &self,
        id: &str,
        health: HealthStatus,
        error: Option<&str>,
        at_ms: u64,
    ) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
local credential_key = KEYS[1]
if redis.call("EXISTS", credential_key) == 0 then
  return 0
end

redis.call("HSET", credential_key, "health", ARGV[1], "last_validated_at_ms", ARGV[2])
if ARGV[3] == "1" then
  redis.call("HSET", credential_key, "last_validation_error", ARGV[4])
else
  redis.call("HDEL", credential_key, "last_validation_error")
end
if ARGV[1] == "healthy" then
  redis.call("HSET", credential_key, "validated", "1")
end
return 1
"#,
        );

        let changed: i64 = script
            .key(self.key_credential(id))
            .arg(health.as_str())
            .arg(at_ms)
            .arg(if error.is_some() { "1" } else { "0" })
            .arg(error.unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    pub async fn update_label(
        &self,
        id: &str,
        label: Option<&str>,
    ) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
local credential_key = KEYS[1]
if redis.call("EXISTS", credential_key) == 0 then
  return 0
end

if ARGV[1] == "1" then
  redis.call("HSET", credential_key, "label", ARGV[2])
else
  redis.call("HDEL", credential_key, "label")
end
return 1
"#,
        );

        let changed: i64 = script
            .key(self.key_credential(id))
            .arg(if label.is_some() { "1" } else { "0" })
            .arg(label.unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    pub async fn delete_credential(&self, id: &str) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
local ids_key = KEYS[1]
local material_key = KEYS[2]
local credential_key = KEYS[3]

local key = redis.call("HGET", credential_key, "key")
if not key then
  return 0
end

redis.call("HDEL", material_key, key)
redis.call("SREM", ids_key, ARGV[1])
redis.call("DEL", credential_key)
return 1
"#,
        );

        let deleted: i64 = script
            .key(self.key_credential_ids())
            .key(self.key_credential_material())
            .key(self.key_credential(id))
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    pub async fn load_ledger(
        &self,
        instance_id: &str,
    ) -> Result<Option<UsageLedger>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.hget(self.key_usage_ledgers(), instance_id).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn store_ledger(&self, ledger: &UsageLedger) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(ledger)?;
        let _: () = conn
            .hset(self.key_usage_ledgers(), &ledger.instance_id, payload)
            .await?;
        Ok(())
    }

    pub async fn load_ledgers(&self) -> Result<Vec<UsageLedger>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw_map: HashMap<String, String> = conn.hgetall(self.key_usage_ledgers()).await?;
        let mut out: Vec<UsageLedger> = Vec::with_capacity(raw_map.len());
        for (_instance_id, raw) in raw_map {
            out.push(serde_json::from_str(&raw)?);
        }
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }
}

#[async_trait]
impl CredentialStore for RedisStore {
    async fn find_healthy(&self, origin: OriginFilter) -> Result<Vec<Credential>, StoreError> {
        let credentials = self.load_credentials().await?;
        Ok(credentials
            .into_iter()
            .filter(|credential| credential.is_allocatable() && origin.matches(credential.origin))
            .collect())
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
        Ok(self.load_credentials().await?)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.delete_credential(id).await?)
    }
}

#[async_trait]
impl UsageLedgerStore for RedisStore {
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
        Ok(self.load_ledgers().await?)
    }
}

fn credential_fields(credential: &Credential) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", credential.id.clone()),
        ("key", credential.key.clone()),
        ("origin", credential.origin.as_str().to_string()),
        ("health", credential.health.as_str().to_string()),
        ("validated", if credential.validated { "1" } else { "0" }.to_string()),
        ("usage_count", credential.usage_count.to_string()),
        ("allocation_count", credential.allocation_count.to_string()),
        ("created_at_ms", credential.created_at_ms.to_string()),
    ];
    let optional = [
        ("last_used_at_ms", credential.last_used_at_ms.map(|v| v.to_string())),
        (
            "last_validated_at_ms",
            credential.last_validated_at_ms.map(|v| v.to_string()),
        ),
        (
            "last_validation_error",
            credential.last_validation_error.clone(),
        ),
        ("label", credential.label.clone()),
        ("donor_contact", credential.donor_contact.clone()),
    ];
    for (field, value) in optional {
        if let Some(value) = value {
            fields.push((field, value));
        }
    }
    fields
}

fn credential_from_fields(
    id: &str,
    mut fields: HashMap<String, String>,
) -> Result<Credential, RedisStoreError> {
    let corrupt = |reason: String| RedisStoreError::CorruptRecord {
        id: id.to_string(),
        reason,
    };

    let key = fields
        .remove("key")
        .ok_or_else(|| corrupt("missing key".to_string()))?;
    let origin_raw = fields.remove("origin").unwrap_or_default();
    let origin = CredentialOrigin::parse(&origin_raw)
        .ok_or_else(|| corrupt(format!("unknown origin {origin_raw:?}")))?;
    let health_raw = fields.remove("health").unwrap_or_default();
    let health = HealthStatus::parse(&health_raw)
        .ok_or_else(|| corrupt(format!("unknown health {health_raw:?}")))?;

    let parse_u64 = |fields: &mut HashMap<String, String>, name: &str| -> Option<u64> {
        fields.remove(name).and_then(|raw| raw.parse::<u64>().ok())
    };

    Ok(Credential {
        id: id.to_string(),
        key,
        origin,
        health,
        validated: fields.remove("validated").as_deref() == Some("1"),
        usage_count: parse_u64(&mut fields, "usage_count").unwrap_or(0),
        allocation_count: parse_u64(&mut fields, "allocation_count").unwrap_or(0),
        last_used_at_ms: parse_u64(&mut fields, "last_used_at_ms"),
        last_validated_at_ms: parse_u64(&mut fields, "last_validated_at_ms"),
        last_validation_error: fields.remove("last_validation_error"),
        label: fields.remove("label"),
        donor_contact: fields.remove("donor_contact"),
        created_at_ms: parse_u64(&mut fields, "created_at_ms").unwrap_or(0),
    })
}
