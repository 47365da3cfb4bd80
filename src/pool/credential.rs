use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOrigin {
    Admin,
    Donated,
}

impl CredentialOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Donated => "donated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "admin" => Some(Self::Admin),
            "donated" => Some(Self::Donated),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Quarantined,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Quarantined => "quarantined",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "healthy" => Some(Self::Healthy),
            "quarantined" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

/// A pooled upstream API key and its health/usage counters.
///
/// `key` is the natural identity of the record; `id` is derived from it with
/// [`credential_id`] so operator surfaces can address a credential without
/// echoing the raw key.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub key: String,
    pub origin: CredentialOrigin,
    pub health: HealthStatus,
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub allocation_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validation_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donor_contact: Option<String>,
    pub created_at_ms: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("origin", &self.origin)
            .field("health", &self.health)
            .field("validated", &self.validated)
            .field("usage_count", &self.usage_count)
            .field("allocation_count", &self.allocation_count)
            .field("last_used_at_ms", &self.last_used_at_ms)
            .field("last_validated_at_ms", &self.last_validated_at_ms)
            .field("last_validation_error", &self.last_validation_error)
            .field("label", &self.label)
            .field("donor_contact", &self.donor_contact)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

impl Credential {
    pub fn new(key: impl Into<String>, origin: CredentialOrigin, created_at_ms: u64) -> Self {
        let key = key.into();
        Self {
            id: credential_id(&key),
            key,
            origin,
            health: HealthStatus::Healthy,
            validated: false,
            usage_count: 0,
            allocation_count: 0,
            last_used_at_ms: None,
            last_validated_at_ms: None,
            last_validation_error: None,
            label: None,
            donor_contact: None,
            created_at_ms,
        }
    }

    /// Admin credentials only need to be healthy; donated ones must also have
    /// passed validation at least once.
    pub fn is_allocatable(&self) -> bool {
        self.health == HealthStatus::Healthy
            && (self.origin == CredentialOrigin::Admin || self.validated)
    }

    pub fn masked_key(&self) -> String {
        mask_key(&self.key)
    }

    /// Copy with the raw key replaced by its masked form, for listings.
    pub fn redacted(mut self) -> Self {
        self.key = mask_key(&self.key);
        self
    }

    pub(crate) fn apply_health(&mut self, health: HealthStatus, error: Option<&str>, at_ms: u64) {
        self.health = health;
        self.last_validated_at_ms = Some(at_ms);
        self.last_validation_error = error.map(str::to_string);
        if health == HealthStatus::Healthy {
            self.validated = true;
        }
    }
}

pub fn credential_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(4 + 16);
    out.push_str("key-");
    for byte in digest.iter().take(8) {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
