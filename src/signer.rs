//! Signer Service: produces `my_signature` on behalf of the operator principal,
//! enforces operator-local safety checks, and hands off to the watchtower's
//! signature-state upsert path. §4.4, §6.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::config::{Config, SignerMode};
use crate::error::AppError;
use crate::model::{ObservedPipe, PipeKey, Side};
use crate::watchtower::{SignatureStateInput, UpsertOutcome, Watchtower};

/// The canonical typed record signed over: `{ token, principal-1, principal-2,
/// balance-1, balance-2, nonce, action, actor, hashed-secret, valid-after }`,
/// with principals already in canonical (low, high) order and balances
/// reordered to match.
pub struct SigningMessage<'a> {
    pub key: &'a PipeKey,
    pub balance_low: &'a str,
    pub balance_high: &'a str,
    pub nonce: u64,
    pub action: u8,
    pub actor: &'a str,
    pub hashed_secret: Option<[u8; 32]>,
    pub valid_after: Option<u64>,
}

fn domain_hash(message_version: &str, chain_id: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"StackFlow");
    hasher.update((message_version.len() as u32).to_be_bytes());
    hasher.update(message_version.as_bytes());
    hasher.update(chain_id.to_be_bytes());
    hasher.finalize().into()
}

fn message_hash(msg: &SigningMessage) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match &msg.key.token {
        Some(t) => {
            hasher.update(1u8.to_be_bytes());
            hasher.update((t.len() as u32).to_be_bytes());
            hasher.update(t.as_bytes());
        }
        None => hasher.update(0u8.to_be_bytes()),
    }
    hasher.update((msg.key.principal_low.len() as u32).to_be_bytes());
    hasher.update(msg.key.principal_low.as_bytes());
    hasher.update((msg.key.principal_high.len() as u32).to_be_bytes());
    hasher.update(msg.key.principal_high.as_bytes());
    hasher.update((msg.balance_low.len() as u32).to_be_bytes());
    hasher.update(msg.balance_low.as_bytes());
    hasher.update((msg.balance_high.len() as u32).to_be_bytes());
    hasher.update(msg.balance_high.as_bytes());
    hasher.update(msg.nonce.to_be_bytes());
    hasher.update(msg.action.to_be_bytes());
    hasher.update((msg.actor.len() as u32).to_be_bytes());
    hasher.update(msg.actor.as_bytes());
    match msg.hashed_secret {
        Some(h) => {
            hasher.update(1u8.to_be_bytes());
            hasher.update(h);
        }
        None => hasher.update(0u8.to_be_bytes()),
    }
    match msg.valid_after {
        Some(v) => {
            hasher.update(1u8.to_be_bytes());
            hasher.update(v.to_be_bytes());
        }
        None => hasher.update(0u8.to_be_bytes()),
    }
    hasher.finalize().into()
}

/// `SHA256("SIP018" || domain_hash || message_hash)`.
pub fn sip018_digest(message_version: &str, chain_id: u64, msg: &SigningMessage) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"SIP018");
    hasher.update(domain_hash(message_version, chain_id));
    hasher.update(message_hash(msg));
    hasher.finalize().into()
}

/// A 65-byte signature: 64 bytes compact ECDSA + 1 recovery byte, recovery-byte-last.
pub fn encode_signature(sig: &RecoverableSignature) -> String {
    let (rec_id, compact) = sig.serialize_compact();
    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&compact);
    out.push(rec_id.to_i32() as u8);
    hex::encode(out)
}

#[derive(Clone)]
pub enum SignerBackend {
    LocalKey { key: Option<SecretKey> },
    Kms { key_id: Option<String> },
}

impl SignerBackend {
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.signer_mode {
            SignerMode::LocalKey => {
                let key = cfg.signer_key.as_ref().and_then(|hex_key| {
                    let bytes = hex::decode(hex_key.trim_start_matches("0x")).ok()?;
                    SecretKey::from_slice(&bytes).ok()
                });
                SignerBackend::LocalKey { key }
            }
            SignerMode::Kms => SignerBackend::Kms {
                key_id: cfg.producer_principal.clone(),
            },
        }
    }

    pub fn ensure_ready(&self) -> Result<(), AppError> {
        match self {
            SignerBackend::LocalKey { key: Some(_) } => Ok(()),
            SignerBackend::LocalKey { key: None } => Err(AppError::SignerDisabled),
            SignerBackend::Kms { key_id: Some(_) } => Ok(()),
            SignerBackend::Kms { key_id: None } => Err(AppError::SignerDisabled),
        }
    }

    /// Signs the 32-byte digest, never logging the key or the digest itself —
    /// only the resulting signature's hex goes to the logs.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<String, AppError> {
        match self {
            SignerBackend::LocalKey { key: Some(key) } => {
                let secp = Secp256k1::signing_only();
                let msg = Message::from_digest_slice(digest)
                    .map_err(|e| AppError::Internal(format!("invalid digest: {e}")))?;
                let sig = secp.sign_ecdsa_recoverable(&msg, key);
                let encoded = encode_signature(&sig);
                tracing::info!(signature = %encoded, "signed state with local key");
                Ok(encoded)
            }
            SignerBackend::LocalKey { key: None } => Err(AppError::SignerDisabled),
            SignerBackend::Kms { key_id: None } => Err(AppError::SignerDisabled),
            SignerBackend::Kms { key_id: Some(_) } => {
                // No KMS integration in this build (out of scope, §1); a real
                // deployment would call out to the external KMS here.
                Err(AppError::SignerDisabled)
            }
        }
    }
}

/// A request to the Signer Service: sign a proposed state on behalf of
/// `for_principal` and upsert it. `action` is fixed to transfer(1) by
/// `sign_transfer` and restricted to {close,deposit,withdraw} by
/// `sign_signature_request`.
pub struct ProducerRequest {
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
    pub their_signature: String,
    pub nonce: u64,
    pub actor: String,
    pub secret: Option<String>,
    pub valid_after: Option<u64>,
    pub beneficial_only: bool,
}

fn parse_amount(s: &str) -> u128 {
    s.parse().unwrap_or(0)
}

/// §4.4 common monotonicity/conservation checks. `delta` is the signed change
/// to the pipe's total balance implied by the action (0 for transfer/close,
/// `+amount` for deposit, `-amount` for withdraw).
fn check_producer_policy(
    baseline: &ObservedPipe,
    side: Side,
    req: &ProducerRequest,
    delta: i128,
) -> Result<(), AppError> {
    if req.nonce <= baseline.nonce {
        return Err(AppError::NonceTooLow {
            existing_nonce: baseline.nonce.to_string(),
        });
    }

    let baseline_side_balance = parse_amount(baseline.balance_for_side(side));
    let my_balance = parse_amount(&req.my_balance);
    let their_balance = parse_amount(&req.their_balance);

    let shrink_allowed = req.action == 3 && req.actor == req.for_principal;
    if my_balance < baseline_side_balance && !shrink_allowed {
        return Err(AppError::ProducerBalanceDecrease);
    }

    let baseline_total = parse_amount(&baseline.balance_low) + parse_amount(&baseline.balance_high);
    let expected_total = if delta >= 0 {
        baseline_total + delta as u128
    } else {
        baseline_total.saturating_sub((-delta) as u128)
    };
    if my_balance + their_balance != expected_total {
        return Err(AppError::BadRequest(
            "balance conservation violated".to_string(),
        ));
    }

    Ok(())
}

async fn sign_and_upsert(
    watchtower: &Watchtower,
    signer: &SignerBackend,
    req: ProducerRequest,
    amount: String,
) -> Result<UpsertOutcome, AppError> {
    signer.ensure_ready()?;

    let key = PipeKey::canonicalize(&req.principal_1, &req.principal_2, req.token.clone());

    let hashed_secret = req
        .secret
        .as_ref()
        .map(|s| -> Result<[u8; 32], AppError> {
            let bytes = hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| AppError::BadRequest(format!("invalid secret hex: {e}")))?;
            if bytes.len() != 32 {
                return Err(AppError::BadRequest("secret must be 32 bytes".to_string()));
            }
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            Ok(hasher.finalize().into())
        })
        .transpose()?;

    let (balance_low, balance_high) = match key.side_of(&req.for_principal) {
        Some(Side::Low) => (req.my_balance.clone(), req.their_balance.clone()),
        Some(Side::High) => (req.their_balance.clone(), req.my_balance.clone()),
        None => {
            return Err(AppError::BadRequest(
                "for_principal is not a party to this pipe".to_string(),
            ))
        }
    };

    let message = SigningMessage {
        key: &key,
        balance_low: &balance_low,
        balance_high: &balance_high,
        nonce: req.nonce,
        action: req.action,
        actor: &req.actor,
        hashed_secret,
        valid_after: req.valid_after,
    };
    let config = watchtower.config.clone();
    let digest = sip018_digest(&config.stackflow_message_version, config.chain_id(), &message);
    let my_signature = signer.sign(&digest)?;

    let input = SignatureStateInput {
        contract_id: req.contract_id,
        principal_1: req.principal_1,
        principal_2: req.principal_2,
        token: req.token,
        for_principal: req.for_principal,
        with_principal: req.with_principal,
        action: req.action,
        amount: Some(amount),
        my_balance: req.my_balance,
        their_balance: req.their_balance,
        my_signature,
        their_signature: req.their_signature,
        nonce: req.nonce,
        actor: req.actor,
        secret: req.secret,
        valid_after: req.valid_after,
        beneficial_only: req.beneficial_only,
    };

    watchtower.upsert_signature_state(input, true).await
}

/// `POST /producer/transfer`. `action` MUST be transfer(1); total balance is
/// conserved (no deposit/withdraw amount involved).
pub async fn sign_transfer(
    watchtower: &Watchtower,
    signer: &SignerBackend,
    req: ProducerRequest,
) -> Result<UpsertOutcome, AppError> {
    if req.action != 1 {
        return Err(AppError::BadRequest("signTransfer requires action=transfer".to_string()));
    }

    let key = PipeKey::canonicalize(&req.principal_1, &req.principal_2, req.token.clone());
    let pipe_id = key.pipe_id();
    let baseline = watchtower
        .store
        .get_observed_pipe(&req.contract_id, &pipe_id)?
        .ok_or(AppError::UnknownPipeState)?;
    let side = key
        .side_of(&req.for_principal)
        .ok_or_else(|| AppError::BadRequest("for_principal is not a party to this pipe".to_string()))?;

    check_producer_policy(&baseline, side, &req, 0)?;

    sign_and_upsert(watchtower, signer, req, "0".to_string()).await
}

/// `POST /producer/signature-request`. For `close`, `deposit`, `withdraw` only.
pub async fn sign_signature_request(
    watchtower: &Watchtower,
    signer: &SignerBackend,
    req: ProducerRequest,
    amount: Option<String>,
) -> Result<UpsertOutcome, AppError> {
    if req.action == 1 {
        return Err(AppError::BadRequest(
            "signSignatureRequest does not accept action=transfer; use /producer/transfer".to_string(),
        ));
    }

    let amount = match req.action {
        2 | 3 => amount
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| AppError::BadRequest("amount is required for deposit/withdraw".to_string()))?,
        _ => "0".to_string(),
    };

    let key = PipeKey::canonicalize(&req.principal_1, &req.principal_2, req.token.clone());
    let pipe_id = key.pipe_id();
    let baseline = watchtower
        .store
        .get_observed_pipe(&req.contract_id, &pipe_id)?
        .ok_or(AppError::UnknownPipeState)?;
    let side = key
        .side_of(&req.for_principal)
        .ok_or_else(|| AppError::BadRequest("for_principal is not a party to this pipe".to_string()))?;

    let delta: i128 = match req.action {
        2 => parse_amount(&amount) as i128,
        3 => -(parse_amount(&amount) as i128),
        _ => 0,
    };
    check_producer_policy(&baseline, side, &req, delta)?;

    sign_and_upsert(watchtower, signer, req, amount).await
}

/// Recovers the public key from a 65-byte (compact+recid) signature over `digest`
/// and returns whether it matches the expected principal's key — used only by
/// tests / local verification helpers, not by the `readonly` verifier backend
/// (which defers to the on-chain contract).
pub fn recover_pubkey_hex(digest: &[u8; 32], signature_hex: &str) -> Result<String, AppError> {
    let bytes = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|e| AppError::BadRequest(format!("invalid signature hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(AppError::BadRequest("signature must be 65 bytes".to_string()));
    }
    let rec_id = RecoveryId::from_i32(bytes[64] as i32)
        .map_err(|e| AppError::BadRequest(format!("invalid recovery id: {e}")))?;
    let sig = RecoverableSignature::from_compact(&bytes[..64], rec_id)
        .map_err(|e| AppError::BadRequest(format!("invalid signature: {e}")))?;
    let msg = Message::from_digest_slice(digest)
        .map_err(|e| AppError::Internal(format!("invalid digest: {e}")))?;
    let secp = Secp256k1::verification_only();
    let pubkey = secp
        .recover_ecdsa(&msg, &sig)
        .map_err(|e| AppError::SignatureValidation(format!("recovery failed: {e}")))?;
    Ok(hex::encode(pubkey.serialize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_roundtrip() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pubkey = secp256k1::PublicKey::from_secret_key(&secp, &key);

        let backend = SignerBackend::LocalKey { key: Some(key) };
        let digest = [1u8; 32];
        let sig_hex = backend.sign(&digest).unwrap();
        assert_eq!(hex::decode(&sig_hex).unwrap().len(), 65);

        let recovered = recover_pubkey_hex(&digest, &sig_hex).unwrap();
        assert_eq!(recovered, hex::encode(pubkey.serialize()));
    }

    #[test]
    fn disabled_without_key() {
        let backend = SignerBackend::LocalKey { key: None };
        assert!(backend.ensure_ready().is_err());
        assert!(backend.sign(&[0u8; 32]).is_err());
    }

    #[test]
    fn domain_hash_is_order_sensitive_to_version_and_chain() {
        let a = domain_hash("0.6.0", 1);
        let b = domain_hash("0.6.1", 1);
        let c = domain_hash("0.6.0", 2);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    fn baseline_pipe(balance_low: &str, balance_high: &str, nonce: u64) -> ObservedPipe {
        ObservedPipe {
            contract_id: "SP0.stackflow".to_string(),
            pipe_id: "pipe-1".to_string(),
            key: PipeKey::canonicalize("P1", "P2", None),
            balance_low: balance_low.to_string(),
            balance_high: balance_high.to_string(),
            pending_low: None,
            pending_high: None,
            expires_at: None,
            nonce,
            closer: None,
            event: "fund-pipe".to_string(),
            txid: None,
            block_height: None,
            updated_at: 0,
        }
    }

    fn producer_request(for_principal: &str, actor: &str, action: u8, my: &str, their: &str, nonce: u64) -> ProducerRequest {
        ProducerRequest {
            contract_id: "SP0.stackflow".to_string(),
            principal_1: "P1".to_string(),
            principal_2: "P2".to_string(),
            token: None,
            for_principal: for_principal.to_string(),
            with_principal: "P2".to_string(),
            action,
            amount: None,
            my_balance: my.to_string(),
            their_balance: their.to_string(),
            their_signature: "22".repeat(65),
            nonce,
            actor: actor.to_string(),
            secret: None,
            valid_after: None,
            beneficial_only: false,
        }
    }

    #[test]
    fn operator_beneficial_guard_rejects_balance_decrease() {
        // Scenario: signTransfer({my=150, their=150, nonce=5}) against a
        // baseline of {my=200, their=100, nonce=4} — the operator's own
        // balance would shrink on a transfer, which is never allowed.
        let baseline = baseline_pipe("200", "100", 4);
        let req = producer_request("P1", "P1", 1, "150", "150", 5);
        let err = check_producer_policy(&baseline, Side::Low, &req, 0).unwrap_err();
        assert!(matches!(err, AppError::ProducerBalanceDecrease));
    }

    #[test]
    fn withdraw_self_actor_shrink_allowed() {
        // A withdraw initiated by the withdrawing party is the one action
        // allowed to shrink that party's own balance.
        let baseline = baseline_pipe("200", "100", 4);
        let req = producer_request("P1", "P1", 3, "150", "100", 5);
        assert!(check_producer_policy(&baseline, Side::Low, &req, -50).is_ok());
    }

    #[test]
    fn withdraw_by_counterparty_is_not_shrink_allowed() {
        // Same balance shrink, but the actor is not the one whose balance
        // shrinks — must not be treated as a self-withdraw.
        let baseline = baseline_pipe("200", "100", 4);
        let req = producer_request("P1", "P2", 3, "150", "100", 5);
        let err = check_producer_policy(&baseline, Side::Low, &req, -50).unwrap_err();
        assert!(matches!(err, AppError::ProducerBalanceDecrease));
    }
}
