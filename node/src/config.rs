//! Payments core configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tollgate_hermes::HermesEndpoint;
use tollgate_types::{Address, ChainId};

use crate::{LogFormat, PaymentsError};

/// Configuration for the payments core.
///
/// Can be loaded from a TOML file via [`PaymentsConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentsConfig {
    /// Chain the node currently operates on.
    #[serde(default = "default_chain_id")]
    pub chain_id: ChainId,

    /// Chain withdrawals land on unless another is requested.
    #[serde(default = "default_l1_chain_id")]
    pub l1_chain_id: ChainId,

    /// Every chain with promises or balances to look after.
    #[serde(default = "default_chains")]
    pub chains: Vec<ChainId>,

    /// Data directory for the promise and settlement stores.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Known hermes instances.
    #[serde(default)]
    pub hermes: Vec<HermesEndpoint>,

    /// Promise requests that may wait for the worker before submitters block.
    #[serde(default = "default_promise_queue_capacity")]
    pub promise_queue_capacity: usize,

    /// Share of the available channel balance that triggers settlement.
    #[serde(default = "default_settlement_threshold")]
    pub settlement_threshold: f64,

    #[serde(default = "default_max_wait_for_settlement")]
    pub max_wait_for_settlement_secs: u64,

    /// Spacing of retries while the transactor refuses a withdrawal.
    #[serde(default = "default_withdrawal_retry_interval")]
    pub withdrawal_retry_interval_secs: u64,

    #[serde(default = "default_withdrawal_retries")]
    pub withdrawal_retries: u32,

    /// Account the transactor pays registration bounties from.
    #[serde(default = "default_transactor_address")]
    pub transactor_address: Address,

    /// How long balances reported by hermes for off-chain identities stay fresh.
    #[serde(default = "default_offchain_balance_expiration")]
    pub offchain_balance_expiration_secs: u64,

    #[serde(default = "default_aggressive_sync_timeout")]
    pub aggressive_sync_timeout_secs: u64,

    #[serde(default = "default_aggressive_sync_interval")]
    pub aggressive_sync_interval_secs: u64,

    #[serde(default = "default_lifetime_sync_timeout")]
    pub lifetime_sync_timeout_secs: u64,

    #[serde(default = "default_lifetime_sync_interval")]
    pub lifetime_sync_interval_secs: u64,

    /// Minimum spacing of throttled forced balance updates per identity.
    #[serde(default = "default_force_update_throttle")]
    pub force_update_throttle_secs: u64,

    #[serde(default = "default_hermes_timeout")]
    pub hermes_timeout_secs: u64,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_chain_id() -> ChainId {
    137
}

fn default_l1_chain_id() -> ChainId {
    1
}

fn default_chains() -> Vec<ChainId> {
    vec![default_chain_id()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tollgate_data")
}

fn default_promise_queue_capacity() -> usize {
    100
}

fn default_settlement_threshold() -> f64 {
    0.1
}

fn default_max_wait_for_settlement() -> u64 {
    10 * 60
}

fn default_withdrawal_retry_interval() -> u64 {
    30
}

fn default_withdrawal_retries() -> u32 {
    10
}

fn default_transactor_address() -> Address {
    Address::zero()
}

fn default_offchain_balance_expiration() -> u64 {
    30 * 60
}

fn default_aggressive_sync_timeout() -> u64 {
    5 * 60
}

fn default_aggressive_sync_interval() -> u64 {
    15
}

fn default_lifetime_sync_timeout() -> u64 {
    // Effectively the lifetime of the process.
    10 * 365 * 24 * 60 * 60
}

fn default_lifetime_sync_interval() -> u64 {
    10 * 60
}

fn default_force_update_throttle() -> u64 {
    60
}

fn default_hermes_timeout() -> u64 {
    30
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl PaymentsConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, PaymentsError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PaymentsError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, PaymentsError> {
        let config: Self = toml::from_str(s).map_err(|e| PaymentsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, PaymentsError> {
        toml::to_string_pretty(self).map_err(|e| PaymentsError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), PaymentsError> {
        if self.promise_queue_capacity == 0 {
            return Err(PaymentsError::Config(
                "promise_queue_capacity must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.settlement_threshold) {
            return Err(PaymentsError::Config(format!(
                "settlement_threshold {} is outside 0..=1",
                self.settlement_threshold
            )));
        }
        self.log_format()?;
        Ok(())
    }

    pub fn log_format(&self) -> Result<LogFormat, PaymentsError> {
        self.log_format.parse()
    }

    /// Chains to look after, always including `chain_id`.
    pub fn all_chains(&self) -> Vec<ChainId> {
        let mut chains = self.chains.clone();
        if !chains.contains(&self.chain_id) {
            chains.push(self.chain_id);
        }
        chains
    }

    pub fn max_wait_for_settlement(&self) -> Duration {
        Duration::from_secs(self.max_wait_for_settlement_secs)
    }

    pub fn withdrawal_retry_interval(&self) -> Duration {
        Duration::from_secs(self.withdrawal_retry_interval_secs)
    }

    pub fn offchain_balance_expiration(&self) -> Duration {
        Duration::from_secs(self.offchain_balance_expiration_secs)
    }

    pub fn aggressive_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.aggressive_sync_timeout_secs)
    }

    pub fn aggressive_sync_interval(&self) -> Duration {
        Duration::from_secs(self.aggressive_sync_interval_secs)
    }

    pub fn lifetime_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.lifetime_sync_timeout_secs)
    }

    pub fn lifetime_sync_interval(&self) -> Duration {
        Duration::from_secs(self.lifetime_sync_interval_secs)
    }

    pub fn force_update_throttle(&self) -> Duration {
        Duration::from_secs(self.force_update_throttle_secs)
    }

    pub fn hermes_timeout(&self) -> Duration {
        Duration::from_secs(self.hermes_timeout_secs)
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            l1_chain_id: default_l1_chain_id(),
            chains: default_chains(),
            data_dir: default_data_dir(),
            hermes: Vec::new(),
            promise_queue_capacity: default_promise_queue_capacity(),
            settlement_threshold: default_settlement_threshold(),
            max_wait_for_settlement_secs: default_max_wait_for_settlement(),
            withdrawal_retry_interval_secs: default_withdrawal_retry_interval(),
            withdrawal_retries: default_withdrawal_retries(),
            transactor_address: default_transactor_address(),
            offchain_balance_expiration_secs: default_offchain_balance_expiration(),
            aggressive_sync_timeout_secs: default_aggressive_sync_timeout(),
            aggressive_sync_interval_secs: default_aggressive_sync_interval(),
            lifetime_sync_timeout_secs: default_lifetime_sync_timeout(),
            lifetime_sync_interval_secs: default_lifetime_sync_interval(),
            force_update_throttle_secs: default_force_update_throttle(),
            hermes_timeout_secs: default_hermes_timeout(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}
