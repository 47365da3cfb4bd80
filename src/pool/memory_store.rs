use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::credential::{Credential, HealthStatus};
use super::ledger::UsageLedger;
use super::store::{
    CredentialIncrement, CredentialStore, OriginFilter, StoreError, UsageLedgerStore,
};

/// Process-local store; every mutation happens under one lock.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    credentials: Arc<Mutex<BTreeMap<String, Credential>>>,
    ledgers: Arc<Mutex<BTreeMap<String, UsageLedger>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_healthy(&self, origin: OriginFilter) -> Result<Vec<Credential>, StoreError> {
        let credentials = self.credentials.lock().await;
        Ok(credentials
            .values()
            .filter(|credential| credential.is_allocatable() && origin.matches(credential.origin))
            .cloned()
            .collect())
    }

    async fn atomic_increment(
        &self,
        id: &str,
        increment: CredentialIncrement,
    ) -> Result<bool, StoreError> {
        let mut credentials = self.credentials.lock().await;
        let Some(credential) = credentials.get_mut(id) else {
            return Ok(false);
        };
        increment.apply(credential);
        Ok(true)
    }

    async fn set_health(
        &self,
        id: &str,
        health: HealthStatus,
        error: Option<&str>,
        at_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut credentials = self.credentials.lock().await;
        let Some(credential) = credentials.get_mut(id) else {
            return Ok(false);
        };
        credential.apply_health(health, error, at_ms);
        Ok(true)
    }

    async fn set_label(&self, id: &str, label: Option<&str>) -> Result<bool, StoreError> {
        let mut credentials = self.credentials.lock().await;
        let Some(credential) = credentials.get_mut(id) else {
            return Ok(false);
        };
        credential.label = label.map(str::to_string);
        Ok(true)
    }

    async fn insert(&self, credential: Credential) -> Result<String, StoreError> {
        let mut credentials = self.credentials.lock().await;
        if credentials.contains_key(&credential.id)
            || credentials.values().any(|existing| existing.key == credential.key)
        {
            return Err(StoreError::Conflict { id: credential.id });
        }
        let id = credential.id.clone();
        credentials.insert(id.clone(), credential);
        Ok(id)
    }

    async fn find_by_key_material(&self, key: &str) -> Result<Option<Credential>, StoreError> {
        let credentials = self.credentials.lock().await;
        Ok(credentials
            .values()
            .find(|credential| credential.key == key)
            .cloned())
    }

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        let credentials = self.credentials.lock().await;
        Ok(credentials.get(id).cloned())
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let credentials = self.credentials.lock().await;
        let mut out: Vec<Credential> = credentials.values().cloned().collect();
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut credentials = self.credentials.lock().await;
        Ok(credentials.remove(id).is_some())
    }
}

#[async_trait]
impl UsageLedgerStore for MemoryStore {
    async fn find_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<UsageLedger>, StoreError> {
        let ledgers = self.ledgers.lock().await;
        Ok(ledgers.get(instance_id).cloned())
    }

    async fn upsert(&self, ledger: &UsageLedger) -> Result<(), StoreError> {
        let mut ledgers = self.ledgers.lock().await;
        ledgers.insert(ledger.instance_id.clone(), ledger.clone());
        Ok(())
    }

    async fn list_ledgers(&self) -> Result<Vec<UsageLedger>, StoreError> {
        let ledgers = self.ledgers.lock().await;
        Ok(ledgers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::credential::CredentialOrigin;

    #[tokio::test]
    async fn memory_store_rejects_duplicate_key_material() {
        let store = MemoryStore::new();
        let credential = Credential::new("AIzaSyExampleKey0001", CredentialOrigin::Admin, 1);
        store.insert(credential.clone()).await.expect("insert");

        let mut donated = credential;
        donated.origin = CredentialOrigin::Donated;
        let err = store.insert(donated).await;
        assert!(matches!(err, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn memory_store_filters_unvalidated_donations() {
        let store = MemoryStore::new();
        let admin = Credential::new("AIzaSyExampleKey0001", CredentialOrigin::Admin, 1);
        let donated = Credential::new("AIzaSyExampleKey0002", CredentialOrigin::Donated, 2);
        let donated_id = donated.id.clone();
        store.insert(admin).await.expect("insert admin");
        store.insert(donated).await.expect("insert donated");

        let healthy = store.find_healthy(OriginFilter::Any).await.expect("find");
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].origin, CredentialOrigin::Admin);

        store
            .set_health(&donated_id, HealthStatus::Healthy, None, 5)
            .await
            .expect("set health");
        let donated_only = store
            .find_healthy(OriginFilter::Only(CredentialOrigin::Donated))
            .await
            .expect("find donated");
        assert_eq!(donated_only.len(), 1);
        assert!(donated_only[0].validated);
    }

    #[tokio::test]
    async fn memory_store_increments_counters() {
        let store = MemoryStore::new();
        let mut credential = Credential::new("AIzaSyExampleKey0001", CredentialOrigin::Admin, 1);
        credential.last_validation_error = Some("stale".to_string());
        let id = store.insert(credential).await.expect("insert");

        assert!(
            store
                .atomic_increment(&id, CredentialIncrement::allocation(42))
                .await
                .expect("increment")
        );
        assert!(
            !store
                .atomic_increment("key-missing", CredentialIncrement::allocation(43))
                .await
                .expect("increment missing")
        );

        let stored = store.get(&id).await.expect("get").expect("exists");
        assert_eq!(stored.allocation_count, 1);
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.last_used_at_ms, Some(42));
        assert_eq!(stored.last_validation_error, None);
    }

    #[tokio::test]
    async fn memory_store_relabels_credentials() {
        let store = MemoryStore::new();
        let credential = Credential::new("AIzaSyExampleKey0001", CredentialOrigin::Admin, 1);
        let id = store.insert(credential).await.expect("insert");

        assert!(store.set_label(&id, Some("primary")).await.expect("label"));
        let stored = store.get(&id).await.expect("get").expect("exists");
        assert_eq!(stored.label.as_deref(), Some("primary"));

        assert!(store.set_label(&id, None).await.expect("clear"));
        let stored = store.get(&id).await.expect("get").expect("exists");
        assert_eq!(stored.label, None);

        assert!(!store.set_label("key-missing", None).await.expect("missing"));
    }
}
