use anyhow::{anyhow, bail, Context, Result};
use ethers::types::{Address, U256};
use ethers::utils::parse_ether;
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

use crate::trace::TraceMethod;

pub const ORIGIN_CHAIN_ID: u64 = 8453;
pub const ORIGIN_RPC_URL: &str = "https://mainnet.base.org";
pub const DESTINATION_CHAIN_ID: u64 = 666_666_666;
pub const DESTINATION_RPC_URL: &str = "https://rpc.degen.tips";
pub const ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
pub const WDEGEN_TOKEN: &str = "0xEb54dACB4C2ccb64F8074eceEa33b5eBb38E5387";
pub const LOG_INDEXER_URL: &str = "https://scope.sh/api/logs";
pub const TRACE_URL: &str = "https://tenderly-rpc-proxy.vercel.app";

/// Env vars consulted after the config file and before CLI flags.
pub const DESTINATION_RPC_ENV: &str = "RPC_URL_666666666";
pub const ORIGIN_RPC_ENV: &str = "ORIGIN_RPC_URL";
pub const TRACE_URL_ENV: &str = "TENDERLY_RPC_URL";
pub const LOG_INDEXER_ENV: &str = "LOG_INDEXER_URL";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogSourceKind {
    /// Paged HTTP log indexer.
    #[default]
    Indexer,
    /// `eth_getLogs` on the origin chain.
    Rpc,
}

/// Gas bounds of the rescue UserOperation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasSettings {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl Default for GasSettings {
    fn default() -> Self {
        let gwei = U256::exp10(9);
        Self {
            call_gas_limit: U256::from(2_000_000u64),
            verification_gas_limit: U256::from(1_000_000u64),
            pre_verification_gas: U256::from(2_000_000u64),
            max_fee_per_gas: gwei,
            max_priority_fee_per_gas: gwei,
        }
    }
}

/// On-disk shape. Everything is optional; missing fields fall back to the built-in
/// Base → Degen defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RescueConfigFile {
    pub origin_chain_id: Option<u64>,
    pub origin_rpc_url: Option<String>,
    pub destination_chain_id: Option<u64>,
    pub destination_rpc_url: Option<String>,
    pub entry_point: Option<String>,
    pub token: Option<String>,

    /// Ether units, e.g. "0.1".
    pub min_funding: Option<String>,
    pub recovery_owner_index: Option<u64>,

    pub log_source: Option<LogSourceKind>,
    pub log_indexer_url: Option<String>,
    pub log_page_limit: Option<u32>,
    pub log_start_block: Option<u64>,
    pub log_chunk_size: Option<u64>,

    pub trace_url: Option<String>,
    pub trace_method: Option<TraceMethod>,

    pub http_timeout_seconds: Option<u64>,
    pub poll_interval_ms: Option<u64>,

    pub call_gas_limit: Option<u64>,
    pub verification_gas_limit: Option<u64>,
    pub pre_verification_gas: Option<u64>,
    /// Gwei.
    pub max_fee_per_gas_gwei: Option<u64>,
    /// Gwei.
    pub max_priority_fee_per_gas_gwei: Option<u64>,
}

/// Command-line overrides; take precedence over env vars and the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub origin_rpc_url: Option<String>,
    pub destination_rpc_url: Option<String>,
    pub trace_url: Option<String>,
    pub log_indexer_url: Option<String>,
    pub log_source: Option<LogSourceKind>,
    pub recovery_owner_index: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RescueConfig {
    pub origin_chain_id: u64,
    pub origin_rpc_url: String,
    pub destination_chain_id: u64,
    pub destination_rpc_url: String,
    pub entry_point: Address,
    pub token: Address,

    /// Native balance the recovery owner needs on the destination chain.
    pub min_funding: U256,
    /// Owner slot the recovery owner is expected to occupy.
    pub recovery_owner_index: u64,

    pub log_source: LogSourceKind,
    pub log_indexer_url: String,
    pub log_page_limit: u32,
    pub log_start_block: u64,
    pub log_chunk_size: u64,

    pub trace_url: String,
    pub trace_method: TraceMethod,

    pub http_timeout: Duration,
    pub poll_interval: Duration,

    pub gas: GasSettings,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            origin_chain_id: ORIGIN_CHAIN_ID,
            origin_rpc_url: ORIGIN_RPC_URL.to_string(),
            destination_chain_id: DESTINATION_CHAIN_ID,
            destination_rpc_url: DESTINATION_RPC_URL.to_string(),
            entry_point: Address::from(hex_literal(ENTRY_POINT)),
            token: Address::from(hex_literal(WDEGEN_TOKEN)),
            min_funding: U256::exp10(17),
            recovery_owner_index: 1,
            log_source: LogSourceKind::Indexer,
            log_indexer_url: LOG_INDEXER_URL.to_string(),
            log_page_limit: 21,
            log_start_block: 0,
            log_chunk_size: 10_000,
            trace_url: TRACE_URL.to_string(),
            trace_method: TraceMethod::Tenderly,
            http_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(2_000),
            gas: GasSettings::default(),
        }
    }
}

// Only used for the compile-time constants above, which are known-good.
fn hex_literal(s: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    if let Ok(bytes) = hex::decode(s.trim_start_matches("0x")) {
        if bytes.len() == 20 {
            out.copy_from_slice(&bytes);
        }
    }
    out
}

/// Resolves the configuration: optional JSON file, then env vars, then CLI overrides.
pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<RescueConfig> {
    let file = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config json at {}", path.display()))?;
            serde_json::from_str::<RescueConfigFile>(&raw)
                .with_context(|| format!("failed to parse config json at {}", path.display()))?
        }
        None => RescueConfigFile::default(),
    };

    let env_lookup = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
    resolve(file, env_lookup, overrides)
}

fn resolve(
    file: RescueConfigFile,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<RescueConfig> {
    let defaults = RescueConfig::default();

    let pick = |cli: Option<String>, env_key: &str, file: Option<String>, default: String| {
        cli.or_else(|| env_lookup(env_key)).or(file).unwrap_or(default)
    };

    let origin_rpc_url = pick(
        overrides.origin_rpc_url,
        ORIGIN_RPC_ENV,
        file.origin_rpc_url,
        defaults.origin_rpc_url,
    );
    let destination_rpc_url = pick(
        overrides.destination_rpc_url,
        DESTINATION_RPC_ENV,
        file.destination_rpc_url,
        defaults.destination_rpc_url,
    );
    let trace_url = pick(
        overrides.trace_url,
        TRACE_URL_ENV,
        file.trace_url,
        defaults.trace_url,
    );
    let log_indexer_url = pick(
        overrides.log_indexer_url,
        LOG_INDEXER_ENV,
        file.log_indexer_url,
        defaults.log_indexer_url,
    );

    let entry_point = match file.entry_point {
        Some(s) => parse_addr(&s).context("invalid entryPoint address")?,
        None => defaults.entry_point,
    };
    let token = match file.token {
        Some(s) => parse_addr(&s).context("invalid token address")?,
        None => defaults.token,
    };

    let min_funding = match file.min_funding {
        Some(s) => parse_ether(s.trim())
            .map_err(|e| anyhow!("invalid minFunding '{s}': {e}"))?,
        None => defaults.min_funding,
    };

    let gwei = U256::exp10(9);
    let gas = GasSettings {
        call_gas_limit: file
            .call_gas_limit
            .map(U256::from)
            .unwrap_or(defaults.gas.call_gas_limit),
        verification_gas_limit: file
            .verification_gas_limit
            .map(U256::from)
            .unwrap_or(defaults.gas.verification_gas_limit),
        pre_verification_gas: file
            .pre_verification_gas
            .map(U256::from)
            .unwrap_or(defaults.gas.pre_verification_gas),
        max_fee_per_gas: file
            .max_fee_per_gas_gwei
            .map(|g| U256::from(g) * gwei)
            .unwrap_or(defaults.gas.max_fee_per_gas),
        max_priority_fee_per_gas: file
            .max_priority_fee_per_gas_gwei
            .map(|g| U256::from(g) * gwei)
            .unwrap_or(defaults.gas.max_priority_fee_per_gas),
    };

    let cfg = RescueConfig {
        origin_chain_id: file.origin_chain_id.unwrap_or(defaults.origin_chain_id),
        origin_rpc_url,
        destination_chain_id: file
            .destination_chain_id
            .unwrap_or(defaults.destination_chain_id),
        destination_rpc_url,
        entry_point,
        token,
        min_funding,
        recovery_owner_index: overrides
            .recovery_owner_index
            .or(file.recovery_owner_index)
            .unwrap_or(defaults.recovery_owner_index),
        log_source: overrides
            .log_source
            .or(file.log_source)
            .unwrap_or(defaults.log_source),
        log_indexer_url,
        log_page_limit: file.log_page_limit.unwrap_or(defaults.log_page_limit),
        log_start_block: file.log_start_block.unwrap_or(defaults.log_start_block),
        log_chunk_size: file.log_chunk_size.unwrap_or(defaults.log_chunk_size),
        trace_url,
        trace_method: file.trace_method.unwrap_or(defaults.trace_method),
        http_timeout: file
            .http_timeout_seconds
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or(defaults.http_timeout),
        poll_interval: file
            .poll_interval_ms
            .map(|ms| Duration::from_millis(ms.max(100)))
            .unwrap_or(defaults.poll_interval),
        gas,
    };

    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &RescueConfig) -> Result<()> {
    if cfg.origin_chain_id == cfg.destination_chain_id {
        bail!(
            "origin and destination chain are both {}; the rescue replays across chains",
            cfg.origin_chain_id
        );
    }
    if cfg.log_page_limit == 0 {
        bail!("log page limit must be > 0");
    }
    if cfg.log_chunk_size == 0 {
        bail!("log chunk size must be > 0");
    }
    if cfg.entry_point.is_zero() {
        bail!("entryPoint address must not be zero");
    }
    if cfg.token.is_zero() {
        bail!("token address must not be zero");
    }
    if cfg.gas.max_priority_fee_per_gas > cfg.gas.max_fee_per_gas {
        bail!("maxPriorityFeePerGas exceeds maxFeePerGas");
    }

    for url in [&cfg.origin_rpc_url, &cfg.destination_rpc_url, &cfg.trace_url] {
        if url.contains("alchemy.com/v2/") || url.contains("infura.io/v3/") {
            tracing::warn!("RPC URL looks like it may contain an API key; consider passing it via env instead of a config file.");
        }
    }
    Ok(())
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
