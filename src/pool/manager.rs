use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};

use super::allocator::{Allocation, PoolAllocator};
use super::config::PoolConfig;
use super::credential::{Credential, CredentialOrigin, HealthStatus, mask_key};
use super::ledger::{DAY_MS, UsageAggregate, UsageLedger, day_start, format_day};
use super::memory_store::MemoryStore;
use super::store::{CredentialStore, OriginFilter, StoreError, UsageLedgerStore};
use super::telemetry::UsageTelemetry;
use super::validator::{ValidationOutcome, Validator};
use super::{Clock, SystemClock};
use crate::{PoolError, Result};

const DEFAULT_REPORT_DAYS: u32 = 30;
const MAX_REPORT_DAYS: u32 = 90;
const ANONYMOUS_DONOR: &str = "anonymous";
const DEFAULT_ACTIVITY_LIMIT: usize = 20;
const MAX_ACTIVITY_LIMIT: usize = 100;
const OPERATOR_QUARANTINE_REASON: &str = "quarantined by operator";

/// Credential and ledger persistence used by a [`KeyPool`].
#[derive(Clone)]
pub struct PoolStores {
    pub credentials: Arc<dyn CredentialStore>,
    pub ledgers: Arc<dyn UsageLedgerStore>,
}

impl PoolStores {
    pub fn new(credentials: Arc<dyn CredentialStore>, ledgers: Arc<dyn UsageLedgerStore>) -> Self {
        Self {
            credentials,
            ledgers,
        }
    }

    /// One backend serving both credentials and ledgers.
    pub fn shared<S>(store: S) -> Self
    where
        S: CredentialStore + UsageLedgerStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            credentials: store.clone(),
            ledgers: store,
        }
    }

    pub fn memory() -> Self {
        Self::shared(MemoryStore::new())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationScope {
    #[default]
    All,
    Healthy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationReport {
    pub id: String,
    pub origin: CredentialOrigin,
    pub masked_key: String,
    pub status: ValidationStatus,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkValidationReport {
    pub validated: usize,
    pub healthy: usize,
    pub quarantined: usize,
    pub errors: usize,
    pub total: usize,
    pub results: Vec<ValidationReport>,
    pub validated_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddedCredential {
    pub credential: Credential,
    pub validation: ValidationOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginCounts {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    /// Healthy donations that have not passed validation yet.
    pub pending: usize,
    pub usage_count: u64,
    pub allocation_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCounts {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    pub pending: usize,
    pub admin: OriginCounts,
    pub donated: OriginCounts,
}

impl CredentialCounts {
    fn from_credentials(credentials: &[Credential]) -> Self {
        let mut out = Self::default();
        for credential in credentials {
            let bucket = match credential.origin {
                CredentialOrigin::Admin => &mut out.admin,
                CredentialOrigin::Donated => &mut out.donated,
            };
            bucket.total += 1;
            bucket.usage_count = bucket.usage_count.saturating_add(credential.usage_count);
            bucket.allocation_count = bucket
                .allocation_count
                .saturating_add(credential.allocation_count);
            if credential.health == HealthStatus::Quarantined {
                bucket.quarantined += 1;
            } else if credential.is_allocatable() {
                bucket.healthy += 1;
            } else {
                bucket.pending += 1;
            }
        }
        out.total = out.admin.total + out.donated.total;
        out.healthy = out.admin.healthy + out.donated.healthy;
        out.quarantined = out.admin.quarantined + out.donated.quarantined;
        out.pending = out.admin.pending + out.donated.pending;
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    KeyUsed,
    KeyCreated,
    KeyDonated,
}

/// One entry of the operator activity feed, derived from credential timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub credential_id: String,
    pub origin: CredentialOrigin,
    pub masked_key: String,
    pub action: String,
    pub details: String,
    pub timestamp_ms: u64,
    pub time_ago_ms: u64,
    pub time_ago: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub instance_id: String,
    pub total_allocations: u64,
    pub total_api_calls: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
}

impl InstanceStats {
    fn from_ledger(ledger: &UsageLedger) -> Self {
        Self {
            instance_id: ledger.instance_id.clone(),
            total_allocations: ledger.total_allocations,
            total_api_calls: ledger.total_api_calls,
            successful_requests: ledger.successful_requests,
            failed_requests: ledger.failed_requests,
            average_response_time_ms: ledger.average_response_time_ms,
            success_rate: ledger.success_rate(),
            last_used_at_ms: ledger.last_used_at_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub credentials: CredentialCounts,
    pub instance: InstanceStats,
    pub all_instances: UsageAggregate,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: String,
    pub day_start_ms: u64,
    pub allocations: u64,
    pub api_calls: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_api_calls: u64,
    pub total_allocations: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub admin_usage: u64,
    pub donated_usage: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageReport {
    pub days: u32,
    pub summary: UsageSummary,
    /// One entry per UTC day, oldest first, zero-filled where no bucket exists.
    pub daily: Vec<DailyUsage>,
    pub instance: InstanceStats,
}

/// The credential pool: allocation for clients, donation, and the operator
/// management/reporting surface.
#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<KeyPoolInner>,
}

struct KeyPoolInner {
    credentials: Arc<dyn CredentialStore>,
    validator: Arc<dyn Validator>,
    allocator: PoolAllocator,
    telemetry: UsageTelemetry,
    clock: Arc<dyn Clock>,
    bulk_concurrency: usize,
}

impl KeyPool {
    pub fn new(config: &PoolConfig, stores: PoolStores, validator: Arc<dyn Validator>) -> Self {
        Self::with_clock(config, stores, validator, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &PoolConfig,
        stores: PoolStores,
        validator: Arc<dyn Validator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let allocator = PoolAllocator::new(
            stores.credentials.clone(),
            validator.clone(),
            clock.clone(),
            config.allocator.max_candidates_per_call,
        );
        let telemetry = UsageTelemetry::new(
            config.instance_id(),
            stores.ledgers,
            clock.clone(),
            config.telemetry.retention(),
        );
        Self {
            inner: Arc::new(KeyPoolInner {
                credentials: stores.credentials,
                validator,
                allocator,
                telemetry,
                clock,
                bulk_concurrency: config.admin.bulk_validation_concurrency.max(1),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.inner.telemetry.instance_id()
    }

    pub fn telemetry(&self) -> &UsageTelemetry {
        &self.inner.telemetry
    }

    /// Hands out the least-loaded healthy credential and records the attempt.
    ///
    /// The work runs on its own task: if the caller goes away mid-flight, the
    /// store mutations and telemetry for this attempt still complete.
    pub async fn allocate(&self) -> Result<Allocation> {
        let pool = self.clone();
        tokio::spawn(async move { pool.allocate_and_record().await }).await?
    }

    async fn allocate_and_record(&self) -> Result<Allocation> {
        let started = Instant::now();
        match self.inner.allocator.allocate().await {
            Ok(allocation) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.inner.telemetry.record_success(latency_ms).await;
                tracing::info!(
                    credential_id = %allocation.credential.id,
                    origin = allocation.credential.origin.as_str(),
                    allocation_count = allocation.credential.allocation_count,
                    validations = allocation.validations,
                    quarantined = allocation.quarantined.len(),
                    latency_ms,
                    "credential allocated"
                );
                Ok(allocation)
            }
            Err(err) => {
                let reason = err.to_string();
                self.inner.telemetry.record_failure(&reason).await;
                tracing::warn!(%reason, "credential allocation failed");
                Err(err)
            }
        }
    }

    /// Accepts a donated key after a successful upstream validation.
    pub async fn donate(&self, key: &str, donor_contact: Option<&str>) -> Result<Credential> {
        let key = normalize_key(key)?;
        self.ensure_not_stored(&key).await?;

        let outcome = self.inner.validator.validate(&key).await;
        if !outcome.healthy {
            tracing::info!(
                credential = %mask_key(&key),
                reason = outcome.reason(),
                "donation rejected"
            );
            return Err(PoolError::ValidationFailed {
                reason: outcome.reason().to_string(),
            });
        }

        let now_ms = self.inner.clock.now_epoch_millis();
        let mut credential = Credential::new(key, CredentialOrigin::Donated, now_ms);
        credential.apply_health(HealthStatus::Healthy, None, now_ms);
        credential.donor_contact = Some(
            donor_contact
                .map(str::trim)
                .filter(|contact| !contact.is_empty())
                .unwrap_or(ANONYMOUS_DONOR)
                .to_string(),
        );

        self.insert(credential.clone()).await?;
        tracing::info!(
            credential_id = %credential.id,
            credential = %credential.masked_key(),
            "donated credential accepted"
        );
        Ok(credential)
    }

    /// Operator add: validates once and stores the key with the resulting health.
    pub async fn add_credential(
        &self,
        key: &str,
        label: Option<&str>,
        origin: CredentialOrigin,
    ) -> Result<AddedCredential> {
        let key = normalize_key(key)?;
        self.ensure_not_stored(&key).await?;

        let validation = self.inner.validator.validate(&key).await;
        let now_ms = self.inner.clock.now_epoch_millis();
        let mut credential = Credential::new(key, origin, now_ms);
        credential.label = label
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string);
        if validation.healthy {
            credential.apply_health(HealthStatus::Healthy, None, now_ms);
        } else {
            credential.apply_health(HealthStatus::Quarantined, Some(validation.reason()), now_ms);
        }

        self.insert(credential.clone()).await?;
        tracing::info!(
            credential_id = %credential.id,
            origin = origin.as_str(),
            healthy = validation.healthy,
            "credential added"
        );
        Ok(AddedCredential {
            credential,
            validation,
        })
    }

    pub async fn list_credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.inner.credentials.list_credentials().await?)
    }

    pub async fn get_credential(&self, id: &str) -> Result<Credential> {
        self.inner
            .credentials
            .get(id)
            .await?
            .ok_or_else(|| PoolError::CredentialNotFound { id: id.to_string() })
    }

    pub async fn delete_credential(&self, id: &str) -> Result<()> {
        if !self.inner.credentials.delete(id).await? {
            return Err(PoolError::CredentialNotFound { id: id.to_string() });
        }
        tracing::info!(credential_id = %id, "credential deleted");
        Ok(())
    }

    /// Operator edit of a credential's label and/or health. An empty label
    /// clears it; setting health skips upstream validation.
    pub async fn update_credential(
        &self,
        id: &str,
        label: Option<&str>,
        health: Option<HealthStatus>,
    ) -> Result<Credential> {
        if label.is_none() && health.is_none() {
            return Err(PoolError::InvalidRequest {
                reason: "nothing to update: provide label or health".to_string(),
            });
        }
        let mut credential = self.get_credential(id).await?;

        if let Some(label) = label {
            let label = Some(label.trim()).filter(|label| !label.is_empty());
            if !self.inner.credentials.set_label(id, label).await? {
                return Err(PoolError::CredentialNotFound { id: id.to_string() });
            }
            credential.label = label.map(str::to_string);
        }

        if let Some(health) = health {
            let error = match health {
                HealthStatus::Healthy => None,
                HealthStatus::Quarantined => Some(OPERATOR_QUARANTINE_REASON),
            };
            let now_ms = self.inner.clock.now_epoch_millis();
            if !self
                .inner
                .credentials
                .set_health(id, health, error, now_ms)
                .await?
            {
                return Err(PoolError::CredentialNotFound { id: id.to_string() });
            }
            credential.apply_health(health, error, now_ms);
        }

        tracing::info!(
            credential_id = %id,
            health = credential.health.as_str(),
            labelled = credential.label.is_some(),
            "credential updated"
        );
        Ok(credential)
    }

    /// Most recent credential events, newest first (default 20, clamped to 1..=100).
    pub async fn recent_activity(&self, limit: Option<usize>) -> Result<Vec<ActivityEvent>> {
        let limit = limit
            .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
            .clamp(1, MAX_ACTIVITY_LIMIT);
        let now_ms = self.inner.clock.now_epoch_millis();
        let credentials = self.inner.credentials.list_credentials().await?;

        let mut events = Vec::with_capacity(credentials.len() * 2);
        for credential in &credentials {
            let (used, created, kind) = match credential.origin {
                CredentialOrigin::Admin => {
                    let name = credential.label.as_deref().unwrap_or("admin key");
                    (
                        format!("credential used: {name}"),
                        format!("credential created: {name}"),
                        ActivityKind::KeyCreated,
                    )
                }
                CredentialOrigin::Donated => {
                    let donor = credential.donor_contact.as_deref().unwrap_or(ANONYMOUS_DONOR);
                    (
                        format!("donated credential used by {donor}"),
                        format!("credential donated by {donor}"),
                        ActivityKind::KeyDonated,
                    )
                }
            };
            if let Some(used_at_ms) = credential.last_used_at_ms {
                events.push(activity(
                    credential,
                    ActivityKind::KeyUsed,
                    used,
                    format!(
                        "{} calls, {} allocations",
                        credential.usage_count, credential.allocation_count
                    ),
                    used_at_ms,
                    now_ms,
                ));
            }
            events.push(activity(
                credential,
                kind,
                created,
                format!("status: {}", credential.health.as_str()),
                credential.created_at_ms,
                now_ms,
            ));
        }

        events.sort_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| a.credential_id.cmp(&b.credential_id))
        });
        events.truncate(limit);
        Ok(events)
    }

    pub async fn healthy_count(&self) -> Result<usize> {
        Ok(self
            .inner
            .credentials
            .find_healthy(OriginFilter::Any)
            .await?
            .len())
    }

    /// Re-validates one credential and stores the result; a healthy result
    /// brings a quarantined credential back into rotation.
    pub async fn validate_credential(&self, id: &str) -> Result<ValidationReport> {
        let credential = self.get_credential(id).await?;
        let (outcome, _) = self.revalidate(&credential).await?;
        Ok(report_for(&credential, &outcome))
    }

    /// Validates every credential in `scope` independently; a failure on one
    /// credential is reported in its entry and never stops the run.
    pub async fn validate_all(&self, scope: ValidationScope) -> Result<BulkValidationReport> {
        let credentials = self.inner.credentials.list_credentials().await?;
        let total = credentials.len();
        let selected: Vec<Credential> = credentials
            .into_iter()
            .filter(|credential| match scope {
                ValidationScope::All => true,
                ValidationScope::Healthy => credential.health == HealthStatus::Healthy,
            })
            .collect();

        let mut results: Vec<ValidationReport> = stream::iter(selected)
            .map(|credential| async move {
                match self.revalidate(&credential).await {
                    Ok((outcome, _)) => report_for(&credential, &outcome),
                    Err(err) => ValidationReport {
                        id: credential.id.clone(),
                        origin: credential.origin,
                        masked_key: credential.masked_key(),
                        status: ValidationStatus::Error,
                        message: err.to_string(),
                    },
                }
            })
            .buffer_unordered(self.inner.bulk_concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.id.cmp(&b.id));

        let mut report = BulkValidationReport {
            validated: results.len(),
            healthy: 0,
            quarantined: 0,
            errors: 0,
            total,
            results,
            validated_at_ms: self.inner.clock.now_epoch_millis(),
        };
        for result in &report.results {
            match result.status {
                ValidationStatus::Valid => report.healthy += 1,
                ValidationStatus::Invalid => report.quarantined += 1,
                ValidationStatus::Error => report.errors += 1,
            }
        }
        tracing::info!(
            validated = report.validated,
            healthy = report.healthy,
            quarantined = report.quarantined,
            errors = report.errors,
            "bulk credential validation finished"
        );
        Ok(report)
    }

    /// Operator reactivation: succeeds only if the credential validates now.
    pub async fn reactivate(&self, id: &str) -> Result<Credential> {
        let credential = self.get_credential(id).await?;
        let (outcome, updated) = self.revalidate(&credential).await?;
        if !outcome.healthy {
            return Err(PoolError::ValidationFailed {
                reason: outcome.reason().to_string(),
            });
        }
        tracing::info!(credential_id = %id, "credential reactivated");
        Ok(updated)
    }

    pub async fn ledger(&self) -> Result<UsageLedger> {
        Ok(self.inner.telemetry.ledger().await?)
    }

    pub async fn aggregate(&self) -> Result<UsageAggregate> {
        Ok(self.inner.telemetry.aggregate().await?)
    }

    pub async fn pool_stats(&self) -> Result<PoolStats> {
        let credentials = self.inner.credentials.list_credentials().await?;
        let ledger = self.inner.telemetry.ledger().await?;
        let all_instances = self.inner.telemetry.aggregate().await?;
        Ok(PoolStats {
            credentials: CredentialCounts::from_credentials(&credentials),
            instance: InstanceStats::from_ledger(&ledger),
            all_instances,
        })
    }

    /// Daily usage across every instance for the last `days` UTC days
    /// (default 30, clamped to 1..=90).
    pub async fn usage_report(&self, days: Option<u32>) -> Result<UsageReport> {
        let days = days.unwrap_or(DEFAULT_REPORT_DAYS).clamp(1, MAX_REPORT_DAYS);
        let credentials = self.inner.credentials.list_credentials().await?;
        let ledgers = self.inner.telemetry.ledgers().await?;
        let current = self.inner.telemetry.ledger().await?;

        let mut by_day: BTreeMap<u64, DailyUsage> = BTreeMap::new();
        for bucket in ledgers.iter().flat_map(|ledger| ledger.daily.iter()) {
            let entry = by_day.entry(bucket.day_start_ms).or_default();
            let weight_before = entry.api_calls as f64;
            entry.allocations = entry.allocations.saturating_add(bucket.allocations);
            entry.api_calls = entry.api_calls.saturating_add(bucket.api_calls);
            entry.successful_requests = entry
                .successful_requests
                .saturating_add(bucket.successful_requests);
            entry.failed_requests = entry.failed_requests.saturating_add(bucket.failed_requests);
            if entry.api_calls > 0 {
                entry.average_response_time_ms = (entry.average_response_time_ms * weight_before
                    + bucket.average_response_time_ms * bucket.api_calls as f64)
                    / entry.api_calls as f64;
            }
        }

        let today = day_start(self.inner.clock.now_epoch_millis());
        let first_day = today.saturating_sub(u64::from(days - 1) * DAY_MS);
        let mut daily = Vec::with_capacity(days as usize);
        let mut day_ms = first_day;
        while day_ms <= today {
            let mut entry = by_day.remove(&day_ms).unwrap_or_default();
            entry.day_start_ms = day_ms;
            entry.date = format_day(day_ms);
            daily.push(entry);
            day_ms += DAY_MS;
        }

        let mut summary = UsageSummary::default();
        for ledger in &ledgers {
            summary.total_api_calls = summary.total_api_calls.saturating_add(ledger.total_api_calls);
            summary.total_allocations = summary
                .total_allocations
                .saturating_add(ledger.total_allocations);
            summary.successful_requests = summary
                .successful_requests
                .saturating_add(ledger.successful_requests);
            summary.failed_requests = summary
                .failed_requests
                .saturating_add(ledger.failed_requests);
        }
        for credential in &credentials {
            match credential.origin {
                CredentialOrigin::Admin => {
                    summary.admin_usage = summary.admin_usage.saturating_add(credential.usage_count)
                }
                CredentialOrigin::Donated => {
                    summary.donated_usage =
                        summary.donated_usage.saturating_add(credential.usage_count)
                }
            }
        }

        Ok(UsageReport {
            days,
            summary,
            daily,
            instance: InstanceStats::from_ledger(&current),
        })
    }

    async fn ensure_not_stored(&self, key: &str) -> Result<()> {
        if self
            .inner
            .credentials
            .find_by_key_material(key)
            .await?
            .is_some()
        {
            return Err(PoolError::DuplicateCredential);
        }
        Ok(())
    }

    async fn insert(&self, credential: Credential) -> Result<()> {
        match self.inner.credentials.insert(credential).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => Err(PoolError::DuplicateCredential),
            Err(err) => Err(err.into()),
        }
    }

    async fn revalidate(&self, credential: &Credential) -> Result<(ValidationOutcome, Credential)> {
        let outcome = self.inner.validator.validate(&credential.key).await;
        let now_ms = self.inner.clock.now_epoch_millis();
        let (health, error) = if outcome.healthy {
            (HealthStatus::Healthy, None)
        } else {
            (HealthStatus::Quarantined, Some(outcome.reason()))
        };
        if !self
            .inner
            .credentials
            .set_health(&credential.id, health, error, now_ms)
            .await?
        {
            return Err(PoolError::CredentialNotFound {
                id: credential.id.clone(),
            });
        }
        let mut updated = credential.clone();
        updated.apply_health(health, error, now_ms);
        Ok((outcome, updated))
    }
}

fn normalize_key(key: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(PoolError::InvalidRequest {
            reason: "credential key is required".to_string(),
        });
    }
    Ok(key.to_string())
}

fn activity(
    credential: &Credential,
    kind: ActivityKind,
    action: String,
    details: String,
    timestamp_ms: u64,
    now_ms: u64,
) -> ActivityEvent {
    let time_ago_ms = now_ms.saturating_sub(timestamp_ms);
    ActivityEvent {
        kind,
        credential_id: credential.id.clone(),
        origin: credential.origin,
        masked_key: credential.masked_key(),
        action,
        details,
        timestamp_ms,
        time_ago_ms,
        time_ago: time_ago_text(time_ago_ms),
    }
}

fn time_ago_text(elapsed_ms: u64) -> String {
    let minutes = elapsed_ms / 60_000;
    let hours = minutes / 60;
    let days = hours / 24;
    let (count, unit) = if days > 0 {
        (days, "day")
    } else if hours > 0 {
        (hours, "hour")
    } else if minutes > 0 {
        (minutes, "minute")
    } else {
        return "just now".to_string();
    };
    let plural = if count > 1 { "s" } else { "" };
    format!("{count} {unit}{plural} ago")
}

fn report_for(credential: &Credential, outcome: &ValidationOutcome) -> ValidationReport {
    let (status, message) = if outcome.healthy {
        (ValidationStatus::Valid, "credential is valid".to_string())
    } else {
        (ValidationStatus::Invalid, outcome.reason().to_string())
    };
    ValidationReport {
        id: credential.id.clone(),
        origin: credential.origin,
        masked_key: credential.masked_key(),
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ago_uses_the_largest_whole_unit() {
        assert_eq!(time_ago_text(0), "just now");
        assert_eq!(time_ago_text(59_999), "just now");
        assert_eq!(time_ago_text(60_000), "1 minute ago");
        assert_eq!(time_ago_text(5 * 60_000), "5 minutes ago");
        assert_eq!(time_ago_text(3_600_000), "1 hour ago");
        assert_eq!(time_ago_text(DAY_MS * 3 + 1), "3 days ago");
    }

    #[test]
    fn healthy_unvalidated_donations_are_counted_as_pending() {
        let admin = Credential::new("AIzaSyCountsKey000001", CredentialOrigin::Admin, 1);
        let pending = Credential::new("AIzaSyCountsKey000002", CredentialOrigin::Donated, 2);
        let mut validated = Credential::new("AIzaSyCountsKey000003", CredentialOrigin::Donated, 3);
        validated.apply_health(HealthStatus::Healthy, None, 4);
        let mut quarantined =
            Credential::new("AIzaSyCountsKey000004", CredentialOrigin::Donated, 5);
        quarantined.apply_health(HealthStatus::Quarantined, Some("expired"), 6);

        let counts = CredentialCounts::from_credentials(&[admin, pending, validated, quarantined]);
        assert_eq!(counts.total, 4);
        assert_eq!(counts.healthy, 2);
        assert_eq!(counts.quarantined, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.donated.total, 3);
        assert_eq!(counts.donated.pending, 1);
        assert_eq!(counts.admin.pending, 0);
        assert_eq!(
            counts.healthy + counts.quarantined + counts.pending,
            counts.total
        );
    }
}
