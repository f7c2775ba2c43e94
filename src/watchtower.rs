//! The watchtower core: ingest state machine (§4.3), dispute evaluator (§4.3.2),
//! signature-state upsert (§4.3 "Signature-state upsert"), and burn-block tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::dispute::{DisputeExecutor, DisputeSubmission};
use crate::error::AppError;
use crate::event::{DecodedPipe, EventClass, StackflowPrintEvent};
use crate::model::{Closure, DisputeAttempt, ObservedPipe, PipeKey, RecordedEvent, Side, SignatureState};
use crate::store::{now_unix, Store};
use crate::verifier::Verifier;

pub struct Watchtower {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub verifier: Verifier,
    pub dispute_executor: DisputeExecutor,
    observed_count: AtomicU64,
    unwatched_count: AtomicU64,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestSummary {
    pub observed_events: u64,
    pub unwatched_events: u64,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BurnBlockSummary {
    pub burn_block_height: u64,
    pub processed_pipes: u64,
    pub settled_pipes: u64,
}

pub struct SignatureStateInput {
    pub contract_id: String,
    pub principal_1: String,
    pub principal_2: String,
    pub token: Option<String>,
    pub for_principal: String,
    pub with_principal: String,
    pub action: u8,
    pub amount: Option<String>,
    pub my_balance: String,
    pub their_balance: String,
    pub my_signature: String,
    pub their_signature: String,
    pub nonce: u64,
    pub actor: String,
    pub secret: Option<String>,
    pub valid_after: Option<u64>,
    pub beneficial_only: bool,
}

pub struct UpsertOutcome {
    pub stored: bool,
    pub replaced: bool,
    pub reason: Option<String>,
    pub state: SignatureState,
}

impl Watchtower {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        verifier: Verifier,
        dispute_executor: DisputeExecutor,
    ) -> Self {
        Self {
            store,
            config,
            verifier,
            dispute_executor,
            observed_count: AtomicU64::new(0),
            unwatched_count: AtomicU64::new(0),
        }
    }

    pub async fn ingest_new_block(
        &self,
        events: &[StackflowPrintEvent],
    ) -> Result<IngestSummary, AppError> {
        let mut summary = IngestSummary::default();
        for event in events {
            if !self.config.is_watched_pipe(&event.key.principal_low, &event.key.principal_high) {
                summary.unwatched_events += 1;
                self.unwatched_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            summary.observed_events += 1;
            self.observed_count.fetch_add(1, Ordering::Relaxed);
            self.ingest_event(event).await?;
        }
        tracing::info!(
            observed = summary.observed_events,
            unwatched = summary.unwatched_events,
            "new_block ingested"
        );
        Ok(summary)
    }

    async fn ingest_event(&self, event: &StackflowPrintEvent) -> Result<(), AppError> {
        let now = now_unix();

        if self.config.log_raw_events {
            tracing::trace!(?event.event_name, pipe_id = %event.pipe_id, "raw event");
        }

        self.store.record_event(&RecordedEvent {
            seq: 0,
            contract_id: event.contract_id.clone(),
            pipe_id: Some(event.pipe_id.clone()),
            event: event.event_name.clone(),
            txid: Some(event.txid.clone()),
            block_height: Some(event.block_height),
            recorded_at: now,
            raw: None,
        })?;

        match event.class() {
            EventClass::Update => {
                if let Some(pipe) = &event.pipe {
                    self.upsert_observed_pipe(event, pipe, now)?;
                }
                tracing::info!(pipe_id = %event.pipe_id, contract_id = %event.contract_id, event = %event.event_name, nonce = event.pipe.as_ref().map(|p| p.nonce).unwrap_or(0), result = "updated", "state transition");
            }
            EventClass::OpenClosure => {
                let closer = event
                    .pipe
                    .as_ref()
                    .and_then(|p| p.closer.clone())
                    .unwrap_or_else(|| event.sender.clone());
                let (nonce, expires_at) = event
                    .pipe
                    .as_ref()
                    .map(|p| (Some(p.nonce), p.expires_at))
                    .unwrap_or((None, None));

                let closure = Closure {
                    contract_id: event.contract_id.clone(),
                    pipe_id: event.pipe_id.clone(),
                    key: event.key.clone(),
                    closer: Some(closer.clone()),
                    expires_at,
                    nonce,
                    event: event.event_name.clone(),
                    txid: Some(event.txid.clone()),
                    block_height: Some(event.block_height),
                    updated_at: now,
                };
                self.store.set_closure(&closure)?;

                if let Some(pipe) = &event.pipe {
                    self.upsert_observed_pipe(event, pipe, now)?;
                }

                tracing::info!(pipe_id = %event.pipe_id, contract_id = %event.contract_id, event = %event.event_name, nonce = nonce.unwrap_or(0), result = "closure-opened", "state transition");

                self.evaluate_dispute(event, &closure).await?;
            }
            EventClass::Terminal => {
                self.store.delete_closure(&event.pipe_id)?;

                let existing = self
                    .store
                    .get_observed_pipe(&event.contract_id, &event.pipe_id)?;
                let (nonce, expires_at) = event
                    .pipe
                    .as_ref()
                    .map(|p| (p.nonce, p.expires_at))
                    .unwrap_or((existing.as_ref().map(|p| p.nonce).unwrap_or(0), None));

                let base = existing.unwrap_or_else(|| ObservedPipe {
                    contract_id: event.contract_id.clone(),
                    pipe_id: event.pipe_id.clone(),
                    key: event.key.clone(),
                    balance_low: "0".to_string(),
                    balance_high: "0".to_string(),
                    pending_low: None,
                    pending_high: None,
                    expires_at: None,
                    nonce: 0,
                    closer: None,
                    event: event.event_name.clone(),
                    txid: Some(event.txid.clone()),
                    block_height: Some(event.block_height),
                    updated_at: now,
                });
                let zeroed = base.zeroed_terminal(&event.event_name, nonce, expires_at, now);
                self.store.set_observed_pipe(&zeroed)?;

                tracing::info!(pipe_id = %event.pipe_id, contract_id = %event.contract_id, event = %event.event_name, nonce, result = "terminal", "state transition");
            }
            EventClass::Unknown => {
                // Filtered out by the event parser already; defensive no-op.
            }
        }

        Ok(())
    }

    fn upsert_observed_pipe(
        &self,
        event: &StackflowPrintEvent,
        pipe: &DecodedPipe,
        now: u64,
    ) -> Result<(), AppError> {
        let record = ObservedPipe {
            contract_id: event.contract_id.clone(),
            pipe_id: event.pipe_id.clone(),
            key: event.key.clone(),
            balance_low: pipe.balance_low.clone(),
            balance_high: pipe.balance_high.clone(),
            pending_low: pipe.pending_low.clone(),
            pending_high: pipe.pending_high.clone(),
            expires_at: pipe.expires_at,
            nonce: pipe.nonce,
            closer: pipe.closer.clone(),
            event: event.event_name.clone(),
            txid: Some(event.txid.clone()),
            block_height: Some(event.block_height),
            updated_at: now,
        };
        self.store.set_observed_pipe(&record)?;
        Ok(())
    }

    /// §4.3.2 Dispute Evaluator. Triggered only right after a Closure was (re)opened.
    async fn evaluate_dispute(
        &self,
        event: &StackflowPrintEvent,
        closure: &Closure,
    ) -> Result<(), AppError> {
        let Some(closure_nonce) = closure.nonce else {
            tracing::info!(pipe_id = %closure.pipe_id, result = "missing-closure-nonce", "dispute evaluation skipped");
            return Ok(());
        };
        let Some(closer) = closure.closer.clone() else {
            tracing::info!(pipe_id = %closure.pipe_id, result = "missing-closer", "dispute evaluation skipped");
            return Ok(());
        };

        let mut candidates = self
            .store
            .get_signature_states_for_pipe(&closure.contract_id, &closure.pipe_id)?
            .into_iter()
            .filter(|s| s.for_principal != closer)
            .collect::<Vec<_>>();

        candidates.sort_by(|a, b| b.nonce.cmp(&a.nonce).then_with(|| b.updated_at.cmp(&a.updated_at)));

        let beneficial_policy = self.config.dispute_only_beneficial;

        let chosen = candidates.into_iter().find(|s| {
            if s.nonce <= closure_nonce {
                return false;
            }
            if let (Some(valid_after), Some(block_height)) = (s.valid_after, Some(event.block_height)) {
                if valid_after > block_height {
                    return false;
                }
            }
            if beneficial_policy || s.beneficial_only {
                let Some(pipe) = &event.pipe else { return false };
                let Some(side) = closure.key.side_of(&s.for_principal) else {
                    return false;
                };
                let closure_balance = match side {
                    Side::Low => &pipe.balance_low,
                    Side::High => &pipe.balance_high,
                };
                let my_balance: u128 = s.my_balance.parse().unwrap_or(0);
                let closure_balance: u128 = closure_balance.parse().unwrap_or(0);
                if my_balance <= closure_balance {
                    return false;
                }
            }
            true
        });

        let Some(chosen) = chosen else {
            tracing::info!(pipe_id = %closure.pipe_id, result = "no-eligible-state", "dispute evaluation skipped");
            return Ok(());
        };

        let attempt_id = format!(
            "{}|{}",
            if event.txid.is_empty() {
                format!("{}|{}|{}", closure.contract_id, closure.pipe_id, closure_nonce)
            } else {
                event.txid.clone()
            },
            chosen.for_principal
        );

        if let Some(existing) = self.store.get_dispute_attempt(&attempt_id)? {
            if existing.success {
                tracing::info!(pipe_id = %closure.pipe_id, attempt_id = %attempt_id, result = "already-submitted", "dispute evaluation skipped");
                return Ok(());
            }
        }

        let outcome = self
            .dispute_executor
            .submit(DisputeSubmission {
                signature_state: &chosen,
                closure,
                trigger_txid: Some(event.txid.as_str()),
            })
            .await;

        let record = DisputeAttempt {
            attempt_id: attempt_id.clone(),
            contract_id: closure.contract_id.clone(),
            pipe_id: closure.pipe_id.clone(),
            for_principal: chosen.for_principal.clone(),
            trigger_txid: Some(event.txid.clone()),
            success: outcome.success,
            dispute_txid: outcome.dispute_txid.clone(),
            error: outcome.error.clone(),
            created_at: now_unix(),
        };
        self.store.set_dispute_attempt(&record)?;

        tracing::info!(
            pipe_id = %closure.pipe_id,
            attempt_id = %attempt_id,
            success = outcome.success,
            dispute_txid = ?outcome.dispute_txid,
            result = if outcome.success { "dispute-submitted" } else { "dispute-failed" },
            "dispute evaluation complete"
        );

        Ok(())
    }

    pub async fn ingest_burn_block(&self, height: u64) -> Result<BurnBlockSummary, AppError> {
        let pipes = self.store.list_observed_pipes()?;
        let mut processed = 0u64;
        let mut settled = 0u64;

        for mut pipe in pipes {
            let mut touched = false;

            if let Some(pending) = pipe.pending_low.clone() {
                if pending.unlock_burn_height <= height {
                    let bal: u128 = pipe.balance_low.parse().unwrap_or(0);
                    let amt: u128 = pending.amount.parse().unwrap_or(0);
                    pipe.balance_low = (bal + amt).to_string();
                    pipe.pending_low = None;
                    touched = true;
                }
            }
            if let Some(pending) = pipe.pending_high.clone() {
                if pending.unlock_burn_height <= height {
                    let bal: u128 = pipe.balance_high.parse().unwrap_or(0);
                    let amt: u128 = pending.amount.parse().unwrap_or(0);
                    pipe.balance_high = (bal + amt).to_string();
                    pipe.pending_high = None;
                    touched = true;
                }
            }

            if pipe.pending_low.is_some() || pipe.pending_high.is_some() || touched {
                processed += 1;
            }
            if touched {
                pipe.updated_at = now_unix();
                self.store.set_observed_pipe(&pipe)?;
                settled += 1;
            }
        }

        tracing::info!(burn_block_height = height, processed, settled, "burn block ingested");

        Ok(BurnBlockSummary {
            burn_block_height: height,
            processed_pipes: processed,
            settled_pipes: settled,
        })
    }

    /// §4.3 "Signature-state upsert". `skip_verification` is set by the signer
    /// service when it upserts its own freshly-produced signature.
    pub async fn upsert_signature_state(
        &self,
        input: SignatureStateInput,
        skip_verification: bool,
    ) -> Result<UpsertOutcome, AppError> {
        if input.for_principal.trim().is_empty() || input.with_principal.trim().is_empty() {
            return Err(AppError::BadRequest("principals must be non-empty".to_string()));
        }
        if SignatureState::action_name(input.action).is_none() {
            return Err(AppError::BadRequest(format!("invalid action {}", input.action)));
        }
        if hex::decode(input.my_signature.trim_start_matches("0x"))
            .map(|b| b.len())
            .unwrap_or(0)
            != 65
        {
            return Err(AppError::BadRequest("my_signature must be 65 bytes".to_string()));
        }
        if hex::decode(input.their_signature.trim_start_matches("0x"))
            .map(|b| b.len())
            .unwrap_or(0)
            != 65
        {
            return Err(AppError::BadRequest("their_signature must be 65 bytes".to_string()));
        }
        if let Some(secret) = &input.secret {
            if hex::decode(secret.trim_start_matches("0x")).map(|b| b.len()).unwrap_or(0) != 32 {
                return Err(AppError::BadRequest("secret must be 32 bytes".to_string()));
            }
        }

        let amount = match input.action {
            2 | 3 => input
                .amount
                .filter(|a| !a.is_empty())
                .ok_or_else(|| AppError::BadRequest("amount is required for deposit/withdraw".to_string()))?,
            _ => input.amount.unwrap_or_else(|| "0".to_string()),
        };

        if !self.config.is_watched_principal(&input.for_principal) {
            return Err(AppError::PrincipalNotWatched);
        }

        let key = PipeKey::canonicalize(&input.principal_1, &input.principal_2, input.token.clone());
        let pipe_id = key.pipe_id();

        let candidate = SignatureState {
            contract_id: input.contract_id.clone(),
            pipe_id: pipe_id.clone(),
            key,
            for_principal: input.for_principal.clone(),
            with_principal: input.with_principal.clone(),
            action: input.action,
            amount,
            my_balance: input.my_balance,
            their_balance: input.their_balance,
            my_signature: input.my_signature,
            their_signature: input.their_signature,
            nonce: input.nonce,
            actor: input.actor,
            secret: input.secret,
            valid_after: input.valid_after,
            beneficial_only: input.beneficial_only,
            updated_at: now_unix(),
        };

        if !skip_verification {
            let outcome = self.verifier.verify(&candidate).await;
            if !outcome.valid {
                return Err(AppError::SignatureValidation(
                    outcome.reason.unwrap_or_else(|| "invalid".to_string()),
                ));
            }
        }

        let existing = self.store.get_signature_state(
            &candidate.contract_id,
            &candidate.pipe_id,
            &candidate.for_principal,
        )?;

        if let Some(existing) = &existing {
            if existing.nonce >= candidate.nonce {
                return Ok(UpsertOutcome {
                    stored: false,
                    replaced: false,
                    reason: Some("nonce-too-low".to_string()),
                    state: existing.clone(),
                });
            }
        }

        self.store.set_signature_state(&candidate)?;

        Ok(UpsertOutcome {
            stored: true,
            replaced: existing.is_some(),
            reason: None,
            state: candidate,
        })
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.observed_count.load(Ordering::Relaxed),
            self.unwatched_count.load(Ordering::Relaxed),
        )
    }
}

impl SignatureState {
    pub fn action_name(action: u8) -> Option<&'static str> {
        match action {
            0 => Some("close"),
            1 => Some("transfer"),
            2 => Some("deposit"),
            3 => Some("withdraw"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisputeExecutorMode, SignerMode, VerifierMode};
    use crate::event::{parse_new_block, NewBlockPayload, RawChainEvent, RawPipe, RawPipeKey, RawPrintValue};
    use crate::model::PendingAmount;
    use std::collections::HashSet;

    fn test_config(watched_principals: &[&str], beneficial_only: bool) -> Config {
        Config {
            host: "0.0.0.0".to_string(),
            port: 0,
            db_file: std::path::PathBuf::new(),
            max_recent_events: 500,
            watched_contracts: HashSet::new(),
            watched_principals: watched_principals.iter().map(|s| s.to_string()).collect(),
            network: "devnet".to_string(),
            stacks_api_url: "http://localhost".to_string(),
            signer_key: None,
            producer_principal: None,
            signer_mode: SignerMode::LocalKey,
            stackflow_message_version: "0.6.0".to_string(),
            verifier_mode: VerifierMode::AcceptAll,
            reject_all_reason: "frozen".to_string(),
            dispute_executor_mode: DisputeExecutorMode::Mock,
            dispute_only_beneficial: beneficial_only,
            readonly_timeout: std::time::Duration::from_secs(10),
            dispute_timeout: std::time::Duration::from_secs(10),
            log_raw_events: false,
        }
    }

    fn make_tower(cfg: Config) -> Watchtower {
        // Leaked deliberately: sqlite's rollback journal needs the directory to
        // stay alive for the lifetime of the connection, which outlives this fn.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::load(dir.path().join("t.db"), cfg.max_recent_events).unwrap());
        std::mem::forget(dir);
        let cfg = Arc::new(cfg);
        let verifier = Verifier::from_config(&cfg);
        let executor = DisputeExecutor::from_config(&cfg);
        Watchtower::new(store, cfg, verifier, executor)
    }

    fn event_payload(event: &str, sender: &str, p1: &str, p2: &str, bal1: &str, bal2: &str, nonce: u64) -> NewBlockPayload {
        NewBlockPayload {
            block_height: 100,
            events: vec![RawChainEvent {
                txid: "0xtrigger".to_string(),
                contract_identifier: "SP0.stackflow".to_string(),
                topic: "print".to_string(),
                raw_value: RawPrintValue {
                    event: event.to_string(),
                    sender: sender.to_string(),
                    pipe_key: RawPipeKey {
                        token: None,
                        principal_1: p1.to_string(),
                        principal_2: p2.to_string(),
                    },
                    pipe: Some(RawPipe {
                        balance_1: bal1.to_string(),
                        balance_2: bal2.to_string(),
                        pending_1: None,
                        pending_2: None,
                        expires_at: Some(500),
                        nonce,
                        closer: Some(sender.to_string()),
                    }),
                },
            }],
        }
    }

    #[tokio::test]
    async fn unwatched_pipe_ignored() {
        let tower = make_tower(test_config(&["P1"], false));
        let payload = event_payload("force-close", "P3", "P2", "P3", "50", "75", 4);
        let events = parse_new_block(&payload, &tower.config.watched_contracts);
        let summary = tower.ingest_new_block(&events).await.unwrap();
        assert_eq!(summary.observed_events, 0);
        assert!(tower.store.list_closures().unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_close_then_finalize() {
        let tower = make_tower(test_config(&[], false));
        let payload = event_payload("force-close", "P1", "P1", "P2", "50", "75", 4);
        let events = parse_new_block(&payload, &tower.config.watched_contracts);
        tower.ingest_new_block(&events).await.unwrap();

        let closures = tower.store.list_closures().unwrap();
        assert_eq!(closures.len(), 1);
        let pipe = tower
            .store
            .get_observed_pipe("SP0.stackflow", &closures[0].pipe_id)
            .unwrap()
            .unwrap();
        assert_eq!(pipe.balance_low, "50");
        assert_eq!(pipe.balance_high, "75");

        let payload2 = event_payload("finalize", "P1", "P1", "P2", "0", "0", 4);
        let events2 = parse_new_block(&payload2, &tower.config.watched_contracts);
        tower.ingest_new_block(&events2).await.unwrap();

        assert!(tower.store.list_closures().unwrap().is_empty());
        let pipe = tower
            .store
            .get_observed_pipe("SP0.stackflow", &closures[0].pipe_id)
            .unwrap()
            .unwrap();
        assert_eq!(pipe.balance_low, "0");
        assert_eq!(pipe.balance_high, "0");
    }

    #[tokio::test]
    async fn pending_settlement() {
        let tower = make_tower(test_config(&[], false));
        let key = PipeKey::canonicalize("P1", "P2", None);
        let pipe = ObservedPipe {
            contract_id: "SP0.stackflow".to_string(),
            pipe_id: key.pipe_id(),
            key,
            balance_low: "0".to_string(),
            balance_high: "0".to_string(),
            pending_low: Some(PendingAmount {
                amount: "4000000".to_string(),
                unlock_burn_height: 159,
            }),
            pending_high: None,
            expires_at: None,
            nonce: 1,
            closer: None,
            event: "deposit".to_string(),
            txid: None,
            block_height: None,
            updated_at: now_unix(),
        };
        tower.store.set_observed_pipe(&pipe).unwrap();

        let s1 = tower.ingest_burn_block(158).await.unwrap();
        assert_eq!(s1.settled_pipes, 0);

        let s2 = tower.ingest_burn_block(159).await.unwrap();
        assert_eq!(s2.settled_pipes, 1);
        let after = tower.store.get_observed_pipe("SP0.stackflow", &pipe.pipe_id).unwrap().unwrap();
        assert_eq!(after.balance_low, "4000000");
        assert!(after.pending_low.is_none());
    }

    #[tokio::test]
    async fn signature_upsert_nonce_too_low() {
        let tower = make_tower(test_config(&[], false));
        let input = SignatureStateInput {
            contract_id: "SP0.stackflow".to_string(),
            principal_1: "P1".to_string(),
            principal_2: "P2".to_string(),
            token: None,
            for_principal: "P1".to_string(),
            with_principal: "P2".to_string(),
            action: 1,
            amount: None,
            my_balance: "900".to_string(),
            their_balance: "100".to_string(),
            my_signature: "11".repeat(65),
            their_signature: "22".repeat(65),
            nonce: 5,
            actor: "P1".to_string(),
            secret: None,
            valid_after: None,
            beneficial_only: false,
        };
        let result = tower.upsert_signature_state(input, true).await.unwrap();
        assert!(result.stored);
        assert!(!result.replaced);

        let input2 = SignatureStateInput {
            contract_id: "SP0.stackflow".to_string(),
            principal_1: "P1".to_string(),
            principal_2: "P2".to_string(),
            token: None,
            for_principal: "P1".to_string(),
            with_principal: "P2".to_string(),
            action: 1,
            amount: None,
            my_balance: "900".to_string(),
            their_balance: "100".to_string(),
            my_signature: "11".repeat(65),
            their_signature: "22".repeat(65),
            nonce: 5,
            actor: "P1".to_string(),
            secret: None,
            valid_after: None,
            beneficial_only: false,
        };
        let result2 = tower.upsert_signature_state(input2, true).await.unwrap();
        assert!(!result2.stored);
        assert_eq!(result2.reason.as_deref(), Some("nonce-too-low"));
    }

    #[tokio::test]
    async fn mock_dispute_end_to_end_at_most_once() {
        let tower = make_tower(test_config(&["P1"], false));

        let input = SignatureStateInput {
            contract_id: "SP0.stackflow".to_string(),
            principal_1: "P1".to_string(),
            principal_2: "P2".to_string(),
            token: None,
            for_principal: "P1".to_string(),
            with_principal: "P2".to_string(),
            action: 1,
            amount: None,
            my_balance: "900".to_string(),
            their_balance: "100".to_string(),
            my_signature: "11".repeat(65),
            their_signature: "22".repeat(65),
            nonce: 5,
            actor: "P1".to_string(),
            secret: None,
            valid_after: None,
            beneficial_only: false,
        };
        tower.upsert_signature_state(input, true).await.unwrap();

        let payload = event_payload("force-cancel", "P2", "P1", "P2", "500", "500", 3);
        let events = parse_new_block(&payload, &tower.config.watched_contracts);
        tower.ingest_new_block(&events).await.unwrap();

        let attempts = tower.store.list_dispute_attempts(None).unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
        assert!(attempts[0].dispute_txid.as_ref().unwrap().starts_with("0xmock"));

        // Re-ingesting the same triggering event must not submit a second dispute.
        tower.ingest_new_block(&events).await.unwrap();
        let attempts2 = tower.store.list_dispute_attempts(None).unwrap();
        assert_eq!(attempts2.len(), 1);
    }

    #[tokio::test]
    async fn beneficial_only_filters_non_improving_state() {
        let tower = make_tower(test_config(&["P1"], true));

        let input = SignatureStateInput {
            contract_id: "SP0.stackflow".to_string(),
            principal_1: "P1".to_string(),
            principal_2: "P2".to_string(),
            token: None,
            for_principal: "P1".to_string(),
            with_principal: "P2".to_string(),
            action: 1,
            amount: None,
            my_balance: "400".to_string(), // not an improvement over closure balance 500
            their_balance: "600".to_string(),
            my_signature: "11".repeat(65),
            their_signature: "22".repeat(65),
            nonce: 5,
            actor: "P1".to_string(),
            secret: None,
            valid_after: None,
            beneficial_only: false,
        };
        tower.upsert_signature_state(input, true).await.unwrap();

        let payload = event_payload("force-cancel", "P2", "P1", "P2", "500", "500", 3);
        let events = parse_new_block(&payload, &tower.config.watched_contracts);
        tower.ingest_new_block(&events).await.unwrap();

        let attempts = tower.store.list_dispute_attempts(None).unwrap();
        assert!(attempts.is_empty());
    }
}
