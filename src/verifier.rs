//! Signature Verifier: readonly / accept-all / reject-all backends.

use std::time::Duration;

use crate::config::{Config, VerifierMode};
use crate::model::SignatureState;

pub struct VerifyOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Maps the on-chain contract's `u100..u127` error codes to human-readable reasons.
fn readonly_error_reason(code: u32) -> String {
    match code {
        100 => "invalid-signature".to_string(),
        101 => "signature-principal-mismatch".to_string(),
        102 => "signature-expired".to_string(),
        103 => "malformed-signature".to_string(),
        other if (100..=127).contains(&other) => format!("contract-error-u{other}"),
        other => format!("unknown-error-u{other}"),
    }
}

#[derive(Clone)]
pub enum Verifier {
    Readonly {
        api_url: String,
        http: reqwest::Client,
    },
    AcceptAll,
    RejectAll {
        reason: String,
    },
}

impl Verifier {
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.verifier_mode {
            VerifierMode::AcceptAll => Verifier::AcceptAll,
            VerifierMode::RejectAll => Verifier::RejectAll {
                reason: cfg.reject_all_reason.clone(),
            },
            VerifierMode::Readonly => Verifier::Readonly {
                api_url: cfg.stacks_api_url.clone(),
                http: reqwest::Client::builder()
                    .timeout(cfg.readonly_timeout)
                    .build()
                    .expect("reqwest client builds"),
            },
        }
    }

    pub async fn verify(&self, state: &SignatureState) -> VerifyOutcome {
        match self {
            Verifier::AcceptAll => VerifyOutcome {
                valid: true,
                reason: None,
            },
            Verifier::RejectAll { reason } => VerifyOutcome {
                valid: false,
                reason: Some(reason.clone()),
            },
            Verifier::Readonly { api_url, http } => verify_readonly(api_url, http, state).await,
        }
    }
}

async fn verify_readonly(
    api_url: &str,
    http: &reqwest::Client,
    state: &SignatureState,
) -> VerifyOutcome {
    let url = format!(
        "{}/v2/contracts/call-read/{}/verify-signature-request",
        api_url.trim_end_matches('/'),
        state.contract_id
    );
    let body = serde_json::json!({
        "sender": state.for_principal,
        "arguments": [
            state.pipe_id,
            state.for_principal,
            state.with_principal,
            state.my_signature,
            state.their_signature,
            state.nonce.to_string(),
            state.action,
        ],
    });

    let resp = match http.post(&url).json(&body).send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return VerifyOutcome {
                valid: false,
                reason: Some("upstream-timeout".to_string()),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "readonly verifier call failed");
            return VerifyOutcome {
                valid: false,
                reason: Some(format!("verifier-rpc-error: {e}")),
            };
        }
    };

    let value: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => {
            return VerifyOutcome {
                valid: false,
                reason: Some(format!("invalid verifier response: {e}")),
            }
        }
    };

    if let Some(code) = value.get("error_code").and_then(|c| c.as_u64()) {
        return VerifyOutcome {
            valid: false,
            reason: Some(readonly_error_reason(code as u32)),
        };
    }

    let ok = value.get("okay").and_then(|v| v.as_bool()).unwrap_or(false)
        && value
            .get("result")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

    VerifyOutcome {
        valid: ok,
        reason: if ok { None } else { Some("verify-signature-request-returned-false".to_string()) },
    }
}

pub fn default_timeout() -> Duration {
    Duration::from_secs(10)
}
