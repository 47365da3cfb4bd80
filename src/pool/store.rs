use async_trait::async_trait;
use thiserror::Error;

use super::credential::{Credential, CredentialOrigin, HealthStatus};
use super::ledger::UsageLedger;

#[cfg(feature = "store-redis")]
use super::RedisStoreError;
#[cfg(feature = "store-sqlite")]
use super::SqliteStoreError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential already stored: {id}")]
    Conflict { id: String },
    #[cfg(feature = "store-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] SqliteStoreError),
    #[cfg(feature = "store-redis")]
    #[error(transparent)]
    Redis(#[from] RedisStoreError),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OriginFilter {
    #[default]
    Any,
    Only(CredentialOrigin),
}

impl OriginFilter {
    pub fn matches(&self, origin: CredentialOrigin) -> bool {
        match self {
            Self::Any => true,
            Self::Only(expected) => *expected == origin,
        }
    }
}

/// Counter bump applied by a successful allocation.
///
/// Applying it also stamps `last_used_at_ms` and `last_validated_at_ms` with
/// `used_at_ms` and clears any stored validation error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CredentialIncrement {
    pub allocations: u64,
    pub usages: u64,
    pub used_at_ms: u64,
}

impl CredentialIncrement {
    pub fn allocation(used_at_ms: u64) -> Self {
        Self {
            allocations: 1,
            usages: 1,
            used_at_ms,
        }
    }

    pub(crate) fn apply(&self, credential: &mut Credential) {
        credential.allocation_count = credential.allocation_count.saturating_add(self.allocations);
        credential.usage_count = credential.usage_count.saturating_add(self.usages);
        credential.last_used_at_ms = Some(self.used_at_ms);
        credential.last_validated_at_ms = Some(self.used_at_ms);
        credential.last_validation_error = None;
    }
}

/// Durable credential records.
///
/// Counter updates must be applied by the backend in a single targeted write
/// (never read-modify-write by the caller), so concurrent allocators cannot
/// lose increments. Mutations return `false` when the id is unknown.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Allocatable credentials: admin ones that are healthy, donated ones
    /// that are healthy and validated.
    async fn find_healthy(&self, origin: OriginFilter) -> Result<Vec<Credential>, StoreError>;

    async fn atomic_increment(
        &self,
        id: &str,
        increment: CredentialIncrement,
    ) -> Result<bool, StoreError>;

    /// A `Healthy` update also marks the credential as validated.
    async fn set_health(
        &self,
        id: &str,
        health: HealthStatus,
        error: Option<&str>,
        at_ms: u64,
    ) -> Result<bool, StoreError>;

    /// `None` clears the label.
    async fn set_label(&self, id: &str, label: Option<&str>) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the key material is already
    /// stored under either origin.
    async fn insert(&self, credential: Credential) -> Result<String, StoreError>;

    async fn find_by_key_material(&self, key: &str) -> Result<Option<Credential>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError>;

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UsageLedgerStore: Send + Sync {
    async fn find_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<UsageLedger>, StoreError>;

    async fn upsert(&self, ledger: &UsageLedger) -> Result<(), StoreError>;

    async fn list_ledgers(&self) -> Result<Vec<UsageLedger>, StoreError>;
}
