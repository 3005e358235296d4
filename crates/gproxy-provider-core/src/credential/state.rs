use tokio::time::Instant;

use serde::{Deserialize, Serialize};

pub type CredentialId = i64;

#[derive(Debug, Clone)]
pub enum CredentialState {
    Active,
    Unavailable {
        until: Instant,
        reason: UnavailableReason,
    },
}

impl CredentialState {
    pub fn is_active(&self) -> bool {
        matches!(self, CredentialState::Active)
    }

    pub fn unavailable_until(&self) -> Option<Instant> {
        match self {
            CredentialState::Unavailable { until, .. } => Some(*until),
            CredentialState::Active => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableReason {
    RateLimit,
    Timeout,
    Upstream5xx,
    AuthInvalid,
    /// Upstream reported quota exhaustion with an explicit reset time (HTTP 402-style).
    QuotaExhausted,
    ModelDisallow,
    Manual,
    Unknown,
}

/// Per-credential bookkeeping used by the LRU/usage/sequence selection score.
/// Lives alongside `CredentialState` but is mutated on every successful `acquire`,
/// not just on failure transitions.
#[derive(Debug, Clone, Copy)]
pub struct ScoreEntry {
    pub last_used: Option<Instant>,
    pub usage_count: u64,
    pub last_selection_seq: u64,
    pub last_health_check: Option<Instant>,
}

impl Default for ScoreEntry {
    fn default() -> Self {
        Self {
            last_used: None,
            usage_count: 0,
            last_selection_seq: 0,
            last_health_check: None,
        }
    }
}
