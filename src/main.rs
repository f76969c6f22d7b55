use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use ethers::prelude::*;
use ethers::signers::coins_bip39::English;
use ethers::utils::format_ether;
use smart_wallet_rescue::config::{load_config, ConfigOverrides, LogSourceKind, RescueConfig};
use smart_wallet_rescue::gateway::{ensure_chain_id, EthersGateway};
use smart_wallet_rescue::rescue::{
    Collaborators, FundingSignal, Rescue, RescueRequest, RescueSettings,
};
use smart_wallet_rescue::scanner::{IndexerLogSource, OwnershipLogSource, RpcLogSource};
use smart_wallet_rescue::trace::TraceClient;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

const PHRASE_PREFIX: &str = "wallet";
const PHRASE_WORDS: usize = 12;

#[derive(Parser, Debug)]
#[command(name = "smart-wallet-rescue", version)]
/// Recover a smart wallet's token balance on a chain it was never deployed to, by
/// replaying its recovery-owner registration there.
struct Cli {
    /// Smart wallet address (same on every chain).
    #[arg(long)]
    wallet: String,

    /// Address that receives the rescued tokens.
    #[arg(long)]
    destination: String,

    /// Optional JSON config (chains, contracts, gas, log/trace endpoints).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Origin chain RPC URL.
    #[arg(long, env = "ORIGIN_RPC_URL")]
    origin_rpc: Option<String>,

    /// Destination chain RPC URL.
    #[arg(long, env = "RPC_URL_666666666")]
    destination_rpc: Option<String>,

    /// Trace JSON-RPC endpoint.
    #[arg(long, env = "TENDERLY_RPC_URL")]
    trace_url: Option<String>,

    /// Log indexer endpoint.
    #[arg(long, env = "LOG_INDEXER_URL")]
    log_indexer_url: Option<String>,

    /// Scan AddOwner logs with eth_getLogs on the origin chain instead of the indexer.
    #[arg(long, default_value_t = false)]
    rpc_logs: bool,

    /// Owner slot the recovery owner is expected to occupy.
    #[arg(long)]
    recovery_owner_index: Option<u64>,

    /// Recovery phrase ("wallet" followed by 12 words).
    ///
    /// Recommended: leave unset and type it at the prompt.
    #[arg(long, env = "SMART_WALLET_RESCUE_PHRASE", hide_env_values = true)]
    recovery_phrase: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // stdout carries only the final summary.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let wallet = Address::from_str(&cli.wallet).context("invalid --wallet address")?;
    let destination =
        Address::from_str(&cli.destination).context("invalid --destination address")?;

    let cfg = load_config(
        cli.config.as_deref(),
        ConfigOverrides {
            origin_rpc_url: cli.origin_rpc.clone(),
            destination_rpc_url: cli.destination_rpc.clone(),
            trace_url: cli.trace_url.clone(),
            log_indexer_url: cli.log_indexer_url.clone(),
            log_source: cli.rpc_logs.then_some(LogSourceKind::Rpc),
            recovery_owner_index: cli.recovery_owner_index,
        },
    )?;

    let phrase = match cli.recovery_phrase.clone() {
        Some(p) => p,
        None => prompt_line(format!(
            "Please enter your {} word recovery phrase:\n> ",
            PHRASE_WORDS + 1
        ))
        .await?
        .ok_or_else(|| anyhow!("no recovery phrase provided"))?,
    };
    let mnemonic = parse_recovery_phrase(&phrase)?;
    let signer = MnemonicBuilder::<English>::default()
        .phrase(mnemonic.as_str())
        .build()
        .context("failed to derive recovery owner from phrase")?
        .with_chain_id(cfg.destination_chain_id);
    tracing::info!(actor = ?signer.address(), "derived recovery owner");

    let http = reqwest::Client::builder()
        .timeout(cfg.http_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let origin = Arc::new(connect(&cfg.origin_rpc_url, &http, &cfg)?);
    let destination_client = Arc::new(SignerMiddleware::new(
        connect(&cfg.destination_rpc_url, &http, &cfg)?,
        signer.clone(),
    ));

    let origin_gateway = EthersGateway::new("origin", origin.clone(), cfg.poll_interval);
    let destination_gateway =
        EthersGateway::new("destination", destination_client, cfg.poll_interval);
    ensure_chain_id(&origin_gateway, cfg.origin_chain_id).await?;
    ensure_chain_id(&destination_gateway, cfg.destination_chain_id).await?;

    let logs: Arc<dyn OwnershipLogSource> = match cfg.log_source {
        LogSourceKind::Indexer => Arc::new(IndexerLogSource::new(
            http.clone(),
            cfg.log_indexer_url.clone(),
            cfg.log_page_limit,
        )),
        LogSourceKind::Rpc => Arc::new(RpcLogSource::new(
            origin,
            cfg.log_start_block,
            cfg.log_chunk_size,
        )),
    };

    let rescue = Rescue::new(
        RescueSettings::from(&cfg),
        RescueRequest {
            wallet,
            destination,
        },
        Collaborators {
            origin: Arc::new(origin_gateway),
            destination: Arc::new(destination_gateway),
            logs,
            traces: Arc::new(TraceClient::new(
                http.clone(),
                cfg.trace_url.clone(),
                cfg.trace_method,
            )),
            signer: Arc::new(signer),
            funding: Arc::new(StdinFundingPrompt),
        },
    );

    match rescue.run().await {
        Ok(outcome) => {
            println!("rescue tx:           {:#x}", outcome.rescue_tx);
            println!("amount:              {}", format_ether(outcome.amount));
            println!(
                "destination balance: {}",
                format_ether(outcome.destination_balance)
            );
            Ok(())
        }
        Err(failure) => {
            tracing::error!(
                stage = %failure.stage,
                kind = %failure.kind(),
                error = %failure.error,
                "rescue failed"
            );
            Err(failure.into())
        }
    }
}

fn connect(url: &str, http: &reqwest::Client, cfg: &RescueConfig) -> Result<Provider<Http>> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid RPC URL {url}"))?;
    Ok(Provider::new(Http::new_with_client(parsed, http.clone())).interval(cfg.poll_interval))
}

/// Validates `wallet <12 words>` and returns the 12-word mnemonic.
fn parse_recovery_phrase(input: &str) -> Result<String> {
    let mut words = input.split_whitespace();
    if words.next().map(str::to_lowercase).as_deref() != Some(PHRASE_PREFIX) {
        bail!("invalid recovery phrase: the first word should be '{PHRASE_PREFIX}'");
    }
    let words: Vec<&str> = words.collect();
    if words.len() != PHRASE_WORDS {
        bail!(
            "invalid recovery phrase: expected {PHRASE_WORDS} words (excluding '{PHRASE_PREFIX}'), got {}",
            words.len()
        );
    }
    Ok(words.join(" ").to_lowercase())
}

/// Prints `prompt` to stderr and reads one line from stdin. `None` on EOF.
async fn prompt_line(prompt: String) -> Result<Option<String>> {
    tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{prompt}")?;
        stderr.flush()?;

        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        Ok((read > 0).then(|| line.trim().to_string()))
    })
    .await
    .context("stdin prompt task failed")?
}

/// "Press enter once funded" on the terminal.
struct StdinFundingPrompt;

#[async_trait]
impl FundingSignal for StdinFundingPrompt {
    async fn wait_for_funding(&self, account: Address, balance: U256, required: U256) -> bool {
        let prompt = format!(
            "Fund recovery owner account ({account:?}) with at least {} on the destination chain (current balance {}).\n[Press enter to continue]",
            format_ether(required),
            format_ether(balance)
        );
        match prompt_line(prompt).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(error = %err, "funding prompt failed");
                false
            }
        }
    }
}
