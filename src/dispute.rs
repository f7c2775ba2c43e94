//! Dispute Executor: noop / mock / auto (on-chain submit) backends. Never retried
//! by the core — §5, §9.

use std::time::Duration;

use crate::config::{Config, DisputeExecutorMode};
use crate::model::{Closure, SignatureState};

pub struct DisputeSubmission<'a> {
    pub signature_state: &'a SignatureState,
    pub closure: &'a Closure,
    pub trigger_txid: Option<&'a str>,
}

pub struct DisputeOutcome {
    pub success: bool,
    pub dispute_txid: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub enum DisputeExecutor {
    Noop,
    Mock,
    Auto { api_url: String, http: reqwest::Client, timeout: Duration },
}

impl DisputeExecutor {
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.dispute_executor_mode {
            DisputeExecutorMode::Noop => DisputeExecutor::Noop,
            DisputeExecutorMode::Mock => DisputeExecutor::Mock,
            DisputeExecutorMode::Auto => DisputeExecutor::Auto {
                api_url: cfg.stacks_api_url.clone(),
                http: reqwest::Client::builder()
                    .timeout(cfg.dispute_timeout)
                    .build()
                    .expect("reqwest client builds"),
                timeout: cfg.dispute_timeout,
            },
        }
    }

    pub async fn submit(&self, req: DisputeSubmission<'_>) -> DisputeOutcome {
        match self {
            DisputeExecutor::Noop => DisputeOutcome {
                success: false,
                dispute_txid: None,
                error: Some("dispute-executor-noop".to_string()),
            },
            DisputeExecutor::Mock => {
                let txid = format!(
                    "0xmock{}",
                    &req.signature_state.pipe_id[..req.signature_state.pipe_id.len().min(16)]
                );
                tracing::info!(
                    pipe_id = %req.closure.pipe_id,
                    for_principal = %req.signature_state.for_principal,
                    dispute_txid = %txid,
                    "mock dispute submitted"
                );
                DisputeOutcome {
                    success: true,
                    dispute_txid: Some(txid),
                    error: None,
                }
            }
            DisputeExecutor::Auto { api_url, http, timeout } => {
                submit_auto(api_url, http, *timeout, &req).await
            }
        }
    }
}

async fn submit_auto(
    api_url: &str,
    http: &reqwest::Client,
    timeout: Duration,
    req: &DisputeSubmission<'_>,
) -> DisputeOutcome {
    let url = format!("{}/v2/transactions", api_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "contractId": req.closure.contract_id,
        "pipeId": req.closure.pipe_id,
        "forPrincipal": req.signature_state.for_principal,
        "nonce": req.signature_state.nonce,
        "mySignature": req.signature_state.my_signature,
        "theirSignature": req.signature_state.their_signature,
    });

    let send = tokio::time::timeout(timeout, http.post(&url).json(&body).send()).await;
    let resp = match send {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            return DisputeOutcome {
                success: false,
                dispute_txid: None,
                error: Some(format!("dispute submit failed: {e}")),
            }
        }
        Err(_) => {
            return DisputeOutcome {
                success: false,
                dispute_txid: None,
                error: Some("upstream-timeout".to_string()),
            }
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return DisputeOutcome {
            success: false,
            dispute_txid: None,
            error: Some(format!("dispute submit http {status}: {text}")),
        };
    }

    match resp.json::<serde_json::Value>().await {
        Ok(v) => {
            let txid = v.get("txid").and_then(|t| t.as_str()).map(|s| s.to_string());
            DisputeOutcome {
                success: txid.is_some(),
                dispute_txid: txid,
                error: None,
            }
        }
        Err(e) => DisputeOutcome {
            success: false,
            dispute_txid: None,
            error: Some(format!("invalid dispute submit response: {e}")),
        },
    }
}
