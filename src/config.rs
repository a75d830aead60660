//! Configuration management for the batch settler
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The wallet section references the signing key by environment variable name
//! only; key material never enters the settings tree and is never logged.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::settle::fee::{
    DEFAULT_GAS_LIMIT_MARGIN, DEFAULT_MAX_FEE_GWEI, DEFAULT_MAX_PRIORITY_FEE_GWEI,
};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub settler: SettlerConfig,
    pub schedule: ScheduleConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlerConfig {
    pub instance_id: String,
    /// Upper bound for a single JSON-RPC round trip (connectivity, simulate,
    /// estimate, receipt lookup).
    pub rpc_timeout_secs: u64,
    /// Upper bound for submitting a signed transaction to a node.
    pub broadcast_timeout_secs: u64,
    /// Upper bound for the whole confirmation wait. Must be nonzero: an
    /// unbounded wait would pin the cycle forever on a stuck transaction.
    pub confirmation_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub frequency: ScheduleFrequency,
    /// UTC hour for daily runs (0-23).
    pub hour: u32,
    /// UTC minute for daily runs (0-59).
    pub minute: u32,
    /// Tick period for interval runs.
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    Daily,
    Interval,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    /// Ordered JSON-RPC endpoints; the client rotates to the next one on
    /// transport failure.
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
    /// Path to the contract interface descriptor (JSON ABI array).
    pub abi_path: String,
    /// Name of the batch-settlement entry point inside the descriptor.
    pub entry_point: String,
    pub confirmation_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the signing key (hex). Defaults to
    /// `SETTLER_PRIVATE_KEY` when omitted.
    pub private_key_env: Option<String>,
    pub keystore_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Inclusive bounds for the range source.
    pub first_id: Option<u64>,
    pub last_id: Option<u64>,
    /// Fixed identifier list for the static source.
    pub ids: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Range,
    Static,
}

/// Fee policy knobs. These are operator-tunable floors/ceilings, not live
/// congestion samples; omitted fields fall back to the policy defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_gas_limit_margin")]
    pub gas_limit_margin: u64,
    #[serde(default = "default_max_priority_fee_gwei")]
    pub max_priority_fee_gwei: u64,
    #[serde(default = "default_max_fee_gwei")]
    pub max_fee_gwei: u64,
}

fn default_gas_limit_margin() -> u64 {
    DEFAULT_GAS_LIMIT_MARGIN
}

fn default_max_priority_fee_gwei() -> u64 {
    DEFAULT_MAX_PRIORITY_FEE_GWEI
}

fn default_max_fee_gwei() -> u64 {
    DEFAULT_MAX_FEE_GWEI
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            gas_limit_margin: default_gas_limit_margin(),
            max_priority_fee_gwei: default_max_priority_fee_gwei(),
            max_fee_gwei: default_max_fee_gwei(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SETTLER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("chain.rpc_urls must list at least one endpoint");
        }
        if self.chain.contract_address.is_empty() {
            anyhow::bail!("chain.contract_address is required");
        }
        if self.chain.entry_point.is_empty() {
            anyhow::bail!("chain.entry_point is required");
        }
        if self.chain.abi_path.is_empty() {
            anyhow::bail!("chain.abi_path is required");
        }

        if self.settler.rpc_timeout_secs == 0 {
            anyhow::bail!("settler.rpc_timeout_secs must be nonzero");
        }
        if self.settler.broadcast_timeout_secs == 0 {
            anyhow::bail!("settler.broadcast_timeout_secs must be nonzero");
        }
        // An unbounded confirmation wait leaves a cycle pinned on a stuck
        // transaction, which also starves subsequent ticks via single-flight.
        if self.settler.confirmation_timeout_secs == 0 {
            anyhow::bail!("settler.confirmation_timeout_secs must be nonzero");
        }

        match self.schedule.frequency {
            ScheduleFrequency::Daily => {
                if self.schedule.hour > 23 {
                    anyhow::bail!("schedule.hour must be 0-23");
                }
                if self.schedule.minute > 59 {
                    anyhow::bail!("schedule.minute must be 0-59");
                }
            }
            ScheduleFrequency::Interval => {
                if self.schedule.interval_secs == 0 {
                    anyhow::bail!("schedule.interval_secs must be nonzero");
                }
            }
        }

        match self.source.kind {
            SourceKind::Range => {
                let (first, last) = match (self.source.first_id, self.source.last_id) {
                    (Some(f), Some(l)) => (f, l),
                    _ => anyhow::bail!("range source requires source.first_id and source.last_id"),
                };
                if last < first {
                    anyhow::bail!("source.last_id must be >= source.first_id");
                }
            }
            SourceKind::Static => {
                if self.source.ids.is_none() {
                    anyhow::bail!("static source requires source.ids");
                }
            }
        }

        if self.fees.gas_limit_margin == 0 {
            anyhow::bail!("fees.gas_limit_margin must be nonzero");
        }
        if self.fees.max_fee_gwei < self.fees.max_priority_fee_gwei {
            anyhow::bail!("fees.max_fee_gwei must be >= fees.max_priority_fee_gwei");
        }

        Ok(())
    }

    /// Environment variable name holding the signing key.
    pub fn private_key_env(&self) -> &str {
        self.wallet
            .private_key_env
            .as_deref()
            .unwrap_or("SETTLER_PRIVATE_KEY")
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
