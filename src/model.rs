//! §3 data model: pipes, closures, signature states, dispute attempts, recorded events.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tag on a signed off-chain state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Close = 0,
    Transfer = 1,
    Deposit = 2,
    Withdraw = 3,
}

impl Action {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Action::Close),
            1 => Some(Action::Transfer),
            2 => Some(Action::Deposit),
            3 => Some(Action::Withdraw),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Canonical, order-independent identity of a pipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipeKey {
    pub token: Option<String>,
    pub principal_low: String,
    pub principal_high: String,
}

impl PipeKey {
    /// Builds the canonical key from an unordered pair of principals. The ordering
    /// is the lexicographic order of the principals' serialized form, so the same
    /// pair in either order yields an identical key.
    pub fn canonicalize(p1: &str, p2: &str, token: Option<String>) -> Self {
        let (low, high) = if p1 <= p2 {
            (p1.to_string(), p2.to_string())
        } else {
            (p2.to_string(), p1.to_string())
        };
        PipeKey {
            token,
            principal_low: low,
            principal_high: high,
        }
    }

    /// Stable hex digest of the canonical key, independent of input ordering.
    pub fn pipe_id(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.token {
            Some(t) => {
                hasher.update(1u8.to_be_bytes());
                hasher.update((t.len() as u32).to_be_bytes());
                hasher.update(t.as_bytes());
            }
            None => hasher.update(0u8.to_be_bytes()),
        }
        hasher.update((self.principal_low.len() as u32).to_be_bytes());
        hasher.update(self.principal_low.as_bytes());
        hasher.update((self.principal_high.len() as u32).to_be_bytes());
        hasher.update(self.principal_high.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// true iff `principal` occupies the low side of this key.
    pub fn side_of(&self, principal: &str) -> Option<Side> {
        if principal == self.principal_low {
            Some(Side::Low)
        } else if principal == self.principal_high {
            Some(Side::High)
        } else {
            None
        }
    }

    pub fn other(&self, principal: &str) -> Option<String> {
        match self.side_of(principal)? {
            Side::Low => Some(self.principal_high.clone()),
            Side::High => Some(self.principal_low.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Low,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAmount {
    pub amount: String,
    pub unlock_burn_height: u64,
}

/// On-chain view of a pipe, keyed by (contract_id, pipe_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedPipe {
    pub contract_id: String,
    pub pipe_id: String,
    #[serde(flatten)]
    pub key: PipeKey,
    pub balance_low: String,
    pub balance_high: String,
    pub pending_low: Option<PendingAmount>,
    pub pending_high: Option<PendingAmount>,
    pub expires_at: Option<u64>,
    pub nonce: u64,
    pub closer: Option<String>,
    pub event: String,
    pub txid: Option<String>,
    pub block_height: Option<u64>,
    pub updated_at: u64,
}

impl ObservedPipe {
    pub fn balance_for_side(&self, side: Side) -> &str {
        match side {
            Side::Low => &self.balance_low,
            Side::High => &self.balance_high,
        }
    }

    pub fn zeroed_terminal(mut self, event: &str, nonce: u64, expires_at: Option<u64>, now: u64) -> Self {
        self.balance_low = "0".to_string();
        self.balance_high = "0".to_string();
        self.pending_low = None;
        self.pending_high = None;
        self.closer = None;
        self.event = event.to_string();
        self.nonce = nonce;
        self.expires_at = expires_at;
        self.updated_at = now;
        self
    }
}

/// An active force-close/force-cancel, keyed by pipe_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Closure {
    pub contract_id: String,
    pub pipe_id: String,
    #[serde(flatten)]
    pub key: PipeKey,
    pub closer: Option<String>,
    pub expires_at: Option<u64>,
    pub nonce: Option<u64>,
    pub event: String,
    pub txid: Option<String>,
    pub block_height: Option<u64>,
    pub updated_at: u64,
}

/// An off-chain signed balance update held for one side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureState {
    pub contract_id: String,
    pub pipe_id: String,
    #[serde(flatten)]
    pub key: PipeKey,
    pub for_principal: String,
    pub with_principal: String,
    pub action: u8,
    pub amount: String,
    pub my_balance: String,
    pub their_balance: String,
    pub my_signature: String,
    pub their_signature: String,
    pub nonce: u64,
    pub actor: String,
    pub secret: Option<String>,
    pub valid_after: Option<u64>,
    #[serde(default)]
    pub beneficial_only: bool,
    pub updated_at: u64,
}

/// Record of a dispute submission attempt, keyed by `trigger_txid|for_principal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeAttempt {
    pub attempt_id: String,
    pub contract_id: String,
    pub pipe_id: String,
    pub for_principal: String,
    pub trigger_txid: Option<String>,
    pub success: bool,
    pub dispute_txid: Option<String>,
    pub error: Option<String>,
    pub created_at: u64,
}

/// A raw chain event retained in the bounded recent-events ring. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub seq: i64,
    pub contract_id: String,
    pub pipe_id: Option<String>,
    pub event: String,
    pub txid: Option<String>,
    pub block_height: Option<u64>,
    pub recorded_at: u64,
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub version: u32,
    pub updated_at: u64,
    pub observed_pipes: Vec<ObservedPipe>,
    pub closures: Vec<Closure>,
    pub signature_states: Vec<SignatureState>,
    pub dispute_attempts: Vec<DisputeAttempt>,
    pub recent_events: Vec<RecordedEvent>,
}
