use std::sync::Arc;

use super::Clock;
use super::credential::{Credential, HealthStatus};
use super::store::{CredentialIncrement, CredentialStore, OriginFilter};
use super::validator::Validator;
use crate::{PoolError, Result};

#[derive(Clone, Debug)]
pub struct Allocation {
    /// The credential as it looks after the allocation was counted.
    pub credential: Credential,
    /// Validations performed by this call, including the successful one.
    pub validations: usize,
    /// Ids quarantined while searching for a healthy credential.
    pub quarantined: Vec<String>,
}

/// Least-loaded selection with validate-on-allocate.
///
/// Candidates are grouped into brackets of equal `allocation_count`. Members of
/// the lowest bracket are validated in `last_used_at_ms` order (never-used
/// first); the first healthy one is counted and returned, unhealthy ones are
/// quarantined. A fully failed bracket falls through to the next one.
pub struct PoolAllocator {
    store: Arc<dyn CredentialStore>,
    validator: Arc<dyn Validator>,
    clock: Arc<dyn Clock>,
    max_candidates: usize,
}

impl PoolAllocator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        validator: Arc<dyn Validator>,
        clock: Arc<dyn Clock>,
        max_candidates: usize,
    ) -> Self {
        Self {
            store,
            validator,
            clock,
            max_candidates: max_candidates.max(1),
        }
    }

    pub async fn allocate(&self) -> Result<Allocation> {
        let mut candidates = self.store.find_healthy(OriginFilter::Any).await?;
        if candidates.is_empty() {
            return Err(PoolError::NoCredentialsAvailable {
                reason: "no healthy credentials".to_string(),
            });
        }
        sort_candidates(&mut candidates);

        let mut validations = 0usize;
        let mut quarantined = Vec::new();
        let mut start = 0usize;
        while start < candidates.len() {
            let bracket_count = candidates[start].allocation_count;
            let end = start
                + candidates[start..]
                    .iter()
                    .take_while(|candidate| candidate.allocation_count == bracket_count)
                    .count();
            tracing::debug!(
                allocation_count = bracket_count,
                size = end - start,
                "trying credential bracket"
            );

            for candidate in &candidates[start..end] {
                if validations >= self.max_candidates {
                    tracing::warn!(
                        limit = self.max_candidates,
                        quarantined = quarantined.len(),
                        "allocation candidate limit reached"
                    );
                    return Err(PoolError::NoCredentialsAvailable {
                        reason: "candidate limit reached".to_string(),
                    });
                }
                validations += 1;

                let outcome = self.validator.validate(&candidate.key).await;
                let now_ms = self.clock.now_epoch_millis();
                if outcome.healthy {
                    let increment = CredentialIncrement::allocation(now_ms);
                    if !self.store.atomic_increment(&candidate.id, increment).await? {
                        // Deleted while we were validating it.
                        continue;
                    }
                    let mut credential = candidate.clone();
                    increment.apply(&mut credential);
                    return Ok(Allocation {
                        credential,
                        validations,
                        quarantined,
                    });
                }

                let reason = outcome.reason();
                self.store
                    .set_health(
                        &candidate.id,
                        HealthStatus::Quarantined,
                        Some(reason),
                        now_ms,
                    )
                    .await?;
                tracing::warn!(
                    credential_id = %candidate.id,
                    origin = candidate.origin.as_str(),
                    %reason,
                    "credential quarantined"
                );
                quarantined.push(candidate.id.clone());
            }

            start = end;
        }

        Err(PoolError::NoCredentialsAvailable {
            reason: "all credentials quarantined".to_string(),
        })
    }
}

/// `(allocation_count, last_used_at_ms)` ascending with never-used first;
/// creation time and id keep the order deterministic.
pub fn sort_candidates(candidates: &mut [Credential]) {
    candidates.sort_by(|a, b| {
        a.allocation_count
            .cmp(&b.allocation_count)
            .then_with(|| a.last_used_at_ms.cmp(&b.last_used_at_ms))
            .then_with(|| a.created_at_ms.cmp(&b.created_at_ms))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::credential::CredentialOrigin;

    fn credential(key: &str, allocations: u64, last_used: Option<u64>) -> Credential {
        let mut credential = Credential::new(key, CredentialOrigin::Admin, 1);
        credential.allocation_count = allocations;
        credential.last_used_at_ms = last_used;
        credential
    }

    #[test]
    fn sort_puts_never_used_first_within_bracket() {
        let mut candidates = vec![
            credential("key-c-000000000001", 1, None),
            credential("key-b-000000000001", 0, Some(50)),
            credential("key-a-000000000001", 0, None),
            credential("key-d-000000000001", 0, Some(10)),
        ];
        sort_candidates(&mut candidates);
        let keys: Vec<&str> = candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "key-a-000000000001",
                "key-d-000000000001",
                "key-b-000000000001",
                "key-c-000000000001",
            ]
        );
    }
}
