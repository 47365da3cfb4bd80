use std::sync::Arc;

use tokio::sync::Mutex;

use super::Clock;
use super::ledger::{RetentionPolicy, UsageAggregate, UsageLedger};
use super::store::{StoreError, UsageLedgerStore};

/// Records allocation outcomes into this instance's [`UsageLedger`].
///
/// Writes are best-effort: store failures are logged and dropped so they
/// never fail an allocation. Ledger read-modify-write cycles are serialized
/// within the process.
pub struct UsageTelemetry {
    instance_id: String,
    store: Arc<dyn UsageLedgerStore>,
    clock: Arc<dyn Clock>,
    retention: RetentionPolicy,
    write_lock: Mutex<()>,
}

impl UsageTelemetry {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn UsageLedgerStore>,
        clock: Arc<dyn Clock>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            clock,
            retention,
            write_lock: Mutex::new(()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn record_success(&self, latency_ms: u64) {
        let retention = self.retention;
        let result = self
            .update(|ledger, now_ms| ledger.record_success(latency_ms, now_ms, retention))
            .await;
        if let Err(err) = result {
            tracing::warn!(
                instance_id = %self.instance_id,
                error = %err,
                "failed to record allocation"
            );
        }
    }

    pub async fn record_failure(&self, reason: &str) {
        let retention = self.retention;
        let result = self
            .update(|ledger, now_ms| ledger.record_failure(now_ms, retention))
            .await;
        match result {
            Ok(()) => tracing::debug!(
                instance_id = %self.instance_id,
                %reason,
                "recorded failed allocation"
            ),
            Err(err) => tracing::warn!(
                instance_id = %self.instance_id,
                error = %err,
                "failed to record failed allocation"
            ),
        }
    }

    /// This instance's ledger, zeroed if nothing was recorded yet.
    pub async fn ledger(&self) -> Result<UsageLedger, StoreError> {
        let ledger = self.store.find_by_instance_id(&self.instance_id).await?;
        Ok(ledger.unwrap_or_else(|| {
            UsageLedger::new(self.instance_id.clone(), self.clock.now_epoch_millis())
        }))
    }

    pub async fn ledgers(&self) -> Result<Vec<UsageLedger>, StoreError> {
        self.store.list_ledgers().await
    }

    pub async fn aggregate(&self) -> Result<UsageAggregate, StoreError> {
        let ledgers = self.store.list_ledgers().await?;
        Ok(UsageAggregate::from_ledgers(&ledgers))
    }

    async fn update(&self, apply: impl FnOnce(&mut UsageLedger, u64)) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let now_ms = self.clock.now_epoch_millis();
        let mut ledger = self
            .store
            .find_by_instance_id(&self.instance_id)
            .await?
            .unwrap_or_else(|| UsageLedger::new(self.instance_id.clone(), now_ms));
        apply(&mut ledger, now_ms);
        self.store.upsert(&ledger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryStore, SystemClock};

    fn telemetry(store: MemoryStore) -> UsageTelemetry {
        UsageTelemetry::new(
            "http://127.0.0.1:8080",
            Arc::new(store),
            Arc::new(SystemClock),
            RetentionPolicy::default(),
        )
    }

    #[tokio::test]
    async fn ledger_is_zeroed_before_first_event() {
        let telemetry = telemetry(MemoryStore::new());
        let ledger = telemetry.ledger().await.expect("ledger");
        assert_eq!(ledger.instance_id, "http://127.0.0.1:8080");
        assert_eq!(ledger.total_api_calls, 0);
        assert!(ledger.daily.is_empty());
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let telemetry = Arc::new(telemetry(MemoryStore::new()));
        let mut tasks = Vec::new();
        for i in 0..20u64 {
            let telemetry = telemetry.clone();
            tasks.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    telemetry.record_failure("boom").await;
                } else {
                    telemetry.record_success(i).await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let ledger = telemetry.ledger().await.expect("ledger");
        assert_eq!(ledger.total_api_calls, 20);
        assert_eq!(ledger.failed_requests, 5);
        assert_eq!(ledger.successful_requests, 15);
        assert_eq!(ledger.total_allocations, 15);
    }
}
