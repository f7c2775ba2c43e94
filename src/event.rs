//! Decodes an upstream `/new_block`-style payload into typed [`StackflowPrintEvent`]s.

use serde::Deserialize;

use crate::model::{PendingAmount, PipeKey};

const KNOWN_EVENTS: &[&str] = &[
    "fund-pipe",
    "transfer",
    "deposit",
    "withdraw",
    "force-close",
    "force-cancel",
    "close-pipe",
    "dispute-closure",
    "finalize",
];

pub fn is_known_event(name: &str) -> bool {
    KNOWN_EVENTS.contains(&name)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBlockPayload {
    pub block_height: u64,
    #[serde(default)]
    pub events: Vec<RawChainEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChainEvent {
    pub txid: String,
    pub contract_identifier: String,
    pub topic: String,
    pub raw_value: RawPrintValue,
}

/// The decoded consensus form of the typed record the contract prints. Looser
/// than the real Clarity consensus encoding (out of scope, §1): we accept the
/// shape the upstream node forwards as plain JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawPrintValue {
    pub event: String,
    pub sender: String,
    pub pipe_key: RawPipeKey,
    #[serde(default)]
    pub pipe: Option<RawPipe>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawPipeKey {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(rename = "principal-1")]
    pub principal_1: String,
    #[serde(rename = "principal-2")]
    pub principal_2: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawPending {
    pub amount: String,
    #[serde(rename = "burn-height")]
    pub burn_height: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawPipe {
    #[serde(rename = "balance-1")]
    pub balance_1: String,
    #[serde(rename = "balance-2")]
    pub balance_2: String,
    #[serde(rename = "pending-1", default)]
    pub pending_1: Option<RawPending>,
    #[serde(rename = "pending-2", default)]
    pub pending_2: Option<RawPending>,
    #[serde(rename = "expires-at", default)]
    pub expires_at: Option<u64>,
    pub nonce: u64,
    #[serde(default)]
    pub closer: Option<String>,
}

/// A typed, normalized chain event ready for the watchtower's ingest pipeline.
#[derive(Debug, Clone)]
pub struct StackflowPrintEvent {
    pub event_name: String,
    pub sender: String,
    pub key: PipeKey,
    pub pipe_id: String,
    pub pipe: Option<DecodedPipe>,
    pub txid: String,
    pub block_height: u64,
    pub contract_id: String,
}

#[derive(Debug, Clone)]
pub struct DecodedPipe {
    /// Balance of `key.principal_low`.
    pub balance_low: String,
    /// Balance of `key.principal_high`.
    pub balance_high: String,
    pub pending_low: Option<PendingAmount>,
    pub pending_high: Option<PendingAmount>,
    pub expires_at: Option<u64>,
    pub nonce: u64,
    pub closer: Option<String>,
}

pub enum EventClass {
    OpenClosure,
    Terminal,
    Update,
    Unknown,
}

impl StackflowPrintEvent {
    pub fn class(&self) -> EventClass {
        match self.event_name.as_str() {
            "force-close" | "force-cancel" => EventClass::OpenClosure,
            "close-pipe" | "dispute-closure" | "finalize" => EventClass::Terminal,
            "fund-pipe" | "transfer" | "deposit" | "withdraw" => EventClass::Update,
            _ => EventClass::Unknown,
        }
    }
}

/// Decodes a `/new_block`-style payload into the sequence of events this watchtower
/// cares about: topic `print`, matching the watched-contract filter, and carrying a
/// known event name. Returns events in array order.
pub fn parse_new_block(
    payload: &NewBlockPayload,
    watched_contracts: &std::collections::HashSet<String>,
) -> Vec<StackflowPrintEvent> {
    let mut out = Vec::new();
    for raw in &payload.events {
        if raw.topic != "print" {
            continue;
        }
        if !watched_contracts.is_empty() && !watched_contracts.contains(&raw.contract_identifier) {
            continue;
        }
        if !is_known_event(&raw.raw_value.event) {
            tracing::debug!(event = %raw.raw_value.event, "ignoring forward-compatible event");
            continue;
        }

        let key = PipeKey::canonicalize(
            &raw.raw_value.pipe_key.principal_1,
            &raw.raw_value.pipe_key.principal_2,
            raw.raw_value.pipe_key.token.clone(),
        );
        let pipe_id = key.pipe_id();

        let pipe = raw.raw_value.pipe.as_ref().map(|p| {
            let (balance_low, balance_high) =
                if raw.raw_value.pipe_key.principal_1 <= raw.raw_value.pipe_key.principal_2 {
                    (p.balance_1.clone(), p.balance_2.clone())
                } else {
                    (p.balance_2.clone(), p.balance_1.clone())
                };
            let (pending_low, pending_high) =
                if raw.raw_value.pipe_key.principal_1 <= raw.raw_value.pipe_key.principal_2 {
                    (p.pending_1.clone(), p.pending_2.clone())
                } else {
                    (p.pending_2.clone(), p.pending_1.clone())
                };
            DecodedPipe {
                balance_low,
                balance_high,
                pending_low: pending_low.map(|r| PendingAmount {
                    amount: r.amount,
                    unlock_burn_height: r.burn_height,
                }),
                pending_high: pending_high.map(|r| PendingAmount {
                    amount: r.amount,
                    unlock_burn_height: r.burn_height,
                }),
                expires_at: p.expires_at,
                nonce: p.nonce,
                closer: p.closer.clone(),
            }
        });

        out.push(StackflowPrintEvent {
            event_name: raw.raw_value.event.clone(),
            sender: raw.raw_value.sender.clone(),
            key,
            pipe_id,
            pipe,
            txid: raw.txid.clone(),
            block_height: payload.block_height,
            contract_id: raw.contract_identifier.clone(),
        });
    }
    out
}
