//! Env-var driven configuration, validated eagerly at startup.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierMode {
    Readonly,
    AcceptAll,
    RejectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeExecutorMode {
    Auto,
    Noop,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerMode {
    LocalKey,
    Kms,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_file: PathBuf,
    pub max_recent_events: usize,
    pub watched_contracts: HashSet<String>,
    pub watched_principals: HashSet<String>,
    pub network: String,
    pub stacks_api_url: String,
    pub signer_key: Option<String>,
    pub producer_principal: Option<String>,
    pub signer_mode: SignerMode,
    pub stackflow_message_version: String,
    pub verifier_mode: VerifierMode,
    pub reject_all_reason: String,
    pub dispute_executor_mode: DisputeExecutorMode,
    pub dispute_only_beneficial: bool,
    pub readonly_timeout: Duration,
    pub dispute_timeout: Duration,
    pub log_raw_events: bool,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

fn env_csv_set(name: &str, max: usize) -> HashSet<String> {
    let Some(raw) = env(name) else {
        return HashSet::new();
    };
    let mut set: HashSet<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if set.len() > max {
        tracing::warn!(
            configured = set.len(),
            max,
            "{} exceeds max entries; truncating",
            name
        );
        set = set.into_iter().take(max).collect();
    }
    set
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env("WATCHTOWER_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port: u16 = env("WATCHTOWER_PORT")
            .map(|v| v.parse())
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid WATCHTOWER_PORT: {e}"))?
            .unwrap_or(8787);

        let db_file = env("WATCHTOWER_DB_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/watchtower-state.db"));

        let max_recent_events: usize = env("WATCHTOWER_MAX_RECENT_EVENTS")
            .map(|v| v.parse())
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid WATCHTOWER_MAX_RECENT_EVENTS: {e}"))?
            .unwrap_or(500);
        if max_recent_events == 0 {
            anyhow::bail!("WATCHTOWER_MAX_RECENT_EVENTS must be > 0");
        }

        let watched_contracts = env_csv_set("WATCHTOWER_CONTRACTS", usize::MAX);
        let watched_principals = env_csv_set("WATCHTOWER_PRINCIPALS", 100);

        let network = env("STACKS_NETWORK").unwrap_or_else(|| "devnet".to_string());
        let stacks_api_url = env("STACKS_API_URL").unwrap_or_else(|| match network.as_str() {
            "mainnet" => "https://api.mainnet.hiro.so".to_string(),
            "testnet" => "https://api.testnet.hiro.so".to_string(),
            _ => "http://localhost:20443".to_string(),
        });

        let signer_key = env("WATCHTOWER_SIGNER_KEY").or_else(|| env("WATCHTOWER_PRODUCER_KEY"));
        let producer_principal = env("WATCHTOWER_PRODUCER_PRINCIPAL");

        let signer_mode = match env("WATCHTOWER_PRODUCER_SIGNER_MODE").as_deref() {
            Some("kms") => SignerMode::Kms,
            Some("local-key") | None => SignerMode::LocalKey,
            Some(other) => anyhow::bail!("invalid WATCHTOWER_PRODUCER_SIGNER_MODE: {other}"),
        };

        if signer_mode == SignerMode::LocalKey && signer_key.is_none() {
            tracing::warn!(
                "no signer key configured (WATCHTOWER_SIGNER_KEY); producer endpoints will return signer-disabled"
            );
        }

        let stackflow_message_version =
            env("WATCHTOWER_STACKFLOW_MESSAGE_VERSION").unwrap_or_else(|| "0.6.0".to_string());

        let verifier_mode = match env("WATCHTOWER_SIGNATURE_VERIFIER_MODE").as_deref() {
            Some("accept-all") => VerifierMode::AcceptAll,
            Some("reject-all") => VerifierMode::RejectAll,
            Some("readonly") | None => VerifierMode::Readonly,
            Some(other) => anyhow::bail!("invalid WATCHTOWER_SIGNATURE_VERIFIER_MODE: {other}"),
        };

        let dispute_executor_mode = match env("WATCHTOWER_DISPUTE_EXECUTOR_MODE").as_deref() {
            Some("noop") => DisputeExecutorMode::Noop,
            Some("mock") => DisputeExecutorMode::Mock,
            Some("auto") | None => DisputeExecutorMode::Auto,
            Some(other) => anyhow::bail!("invalid WATCHTOWER_DISPUTE_EXECUTOR_MODE: {other}"),
        };

        let dispute_only_beneficial = env_bool("WATCHTOWER_DISPUTE_ONLY_BENEFICIAL", false);
        let log_raw_events = env_bool("WATCHTOWER_LOG_RAW_EVENTS", false);

        if dispute_executor_mode == DisputeExecutorMode::Auto && verifier_mode != VerifierMode::Readonly {
            tracing::warn!(
                "dispute executor is auto but verifier is not readonly; this is unusual outside tests"
            );
        }

        Ok(Self {
            host,
            port,
            db_file,
            max_recent_events,
            watched_contracts,
            watched_principals,
            network,
            stacks_api_url,
            signer_key,
            producer_principal,
            signer_mode,
            stackflow_message_version,
            verifier_mode,
            reject_all_reason: env("WATCHTOWER_REJECT_ALL_REASON")
                .unwrap_or_else(|| "operational-freeze".to_string()),
            dispute_executor_mode,
            dispute_only_beneficial,
            readonly_timeout: Duration::from_secs(10),
            dispute_timeout: Duration::from_secs(30),
            log_raw_events,
        })
    }

    pub fn is_watched_principal(&self, principal: &str) -> bool {
        self.watched_principals.is_empty() || self.watched_principals.contains(principal)
    }

    pub fn is_watched_contract(&self, contract_id: &str) -> bool {
        self.watched_contracts.is_empty() || self.watched_contracts.contains(contract_id)
    }

    pub fn is_watched_pipe(&self, p_low: &str, p_high: &str) -> bool {
        self.watched_principals.is_empty()
            || self.watched_principals.contains(p_low)
            || self.watched_principals.contains(p_high)
    }

    pub fn chain_id(&self) -> u64 {
        match self.network.as_str() {
            "mainnet" => 1,
            "testnet" => 2147483648,
            "devnet" | "mocknet" => 2147483648,
            _ => 0,
        }
    }
}
