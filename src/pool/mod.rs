//! Credential pool: allocation, health validation and usage accounting.

pub mod allocator;
pub mod config;
pub mod credential;
pub mod ledger;
pub mod manager;
pub mod memory_store;
pub mod store;
pub mod telemetry;
pub mod validator;

#[cfg(feature = "server")]
pub mod http;
#[cfg(feature = "otel")]
pub mod otel;
#[cfg(feature = "store-redis")]
mod redis_store;
#[cfg(feature = "store-sqlite")]
mod sqlite_store;

pub use allocator::{Allocation, PoolAllocator};
pub use config::{
    AdminConfig, AllocatorConfig, ConfigError, PoolConfig, TelemetryConfig, ValidatorConfig,
};
pub use credential::{Credential, CredentialOrigin, HealthStatus, credential_id, mask_key};
pub use ledger::{DailyBucket, HourlyBucket, RetentionPolicy, UsageAggregate, UsageLedger};
pub use manager::{
    ActivityEvent, ActivityKind, AddedCredential, BulkValidationReport, CredentialCounts, DailyUsage, InstanceStats, KeyPool,
    OriginCounts, PoolStats, PoolStores, UsageReport, UsageSummary, ValidationReport,
    ValidationScope, ValidationStatus,
};
pub use memory_store::MemoryStore;
pub use store::{CredentialIncrement, CredentialStore, OriginFilter, StoreError, UsageLedgerStore};
pub use telemetry::UsageTelemetry;
pub use validator::{GeminiValidator, ValidationOutcome, Validator};

#[cfg(feature = "server")]
pub use http::{OperatorAssertion, OperatorAuthority, PoolHttpState, StaticTokenAuthority};
#[cfg(feature = "store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        now_millis()
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
