mod error;
pub mod pool;

pub use error::{PoolError, Result};
pub use pool::{
    Allocation, Clock, Credential, CredentialOrigin, CredentialStore, HealthStatus, KeyPool,
    PoolConfig, PoolStores, StoreError, SystemClock, UsageLedger, UsageLedgerStore, Validator,
    ValidationOutcome,
};
