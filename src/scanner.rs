use crate::encoding::{parse_block_number, to_hex};
use crate::error::ScanError;
use crate::types::OwnershipEvent;
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Bytes, Filter, H256, U256};
use ethers::utils::keccak256;
use serde::Deserialize;
use serde_json::Value;
use std::cmp;
use std::sync::Arc;

/// Event topic0 for:
/// AddOwner(uint256 indexed index, bytes owner)
pub fn add_owner_topic() -> H256 {
    H256::from(keccak256("AddOwner(uint256,bytes)"))
}

/// Source of a wallet's ownership history on one chain.
#[async_trait]
pub trait OwnershipLogSource: Send + Sync {
    /// `AddOwner` events of `account`, ascending by block.
    async fn fetch_ownership_events(
        &self,
        account: Address,
        chain_id: u64,
    ) -> Result<Vec<OwnershipEvent>, ScanError>;
}

/// The wallet's first `AddOwner` is the owner it was deployed with.
pub fn find_deployment_event(events: &[OwnershipEvent]) -> Result<&OwnershipEvent, ScanError> {
    events
        .first()
        .ok_or(ScanError::NotFound("deployment AddOwner event"))
}

/// First event registering a 32-byte (address) owner.
pub fn find_recovery_owner_event(
    events: &[OwnershipEvent],
) -> Result<&OwnershipEvent, ScanError> {
    events
        .iter()
        .find(|e| e.is_recovery_owner())
        .ok_or(ScanError::NotFound("recovery owner AddOwner event (32-byte owner)"))
}

/// Decodes one log. Logs with another topic0 yield `Ok(None)`; an `AddOwner` log with a
/// malformed payload is an error.
pub fn decode_add_owner(
    account: Address,
    topics: &[H256],
    data: &[u8],
    transaction_hash: H256,
    block_number: Option<u64>,
) -> Result<Option<OwnershipEvent>, ScanError> {
    if topics.first() != Some(&add_owner_topic()) {
        return Ok(None);
    }

    let decode_err = |reason: String| ScanError::Decode {
        tx: Some(transaction_hash),
        reason,
    };

    let index = topics
        .get(1)
        .map(|t| U256::from_big_endian(t.as_bytes()))
        .ok_or_else(|| decode_err("missing indexed owner index topic".to_string()))?;

    let owner = match abi::decode(&[ParamType::Bytes], data)
        .map_err(|e| decode_err(e.to_string()))?
        .pop()
    {
        Some(Token::Bytes(owner)) => Bytes::from(owner),
        other => return Err(decode_err(format!("expected bytes owner, got {other:?}"))),
    };

    Ok(Some(OwnershipEvent {
        account,
        index,
        owner,
        block_number,
        transaction_hash,
    }))
}

/// Stable sort by block; left untouched when any block number is unknown, since the
/// sources already return ascending order.
fn sort_by_block(events: &mut [OwnershipEvent]) {
    if events.iter().all(|e| e.block_number.is_some()) {
        events.sort_by_key(|e| e.block_number);
    }
}

/// Log-indexing HTTP endpoint (`GET {url}?chain=..&address=..&cursor=..&limit=..&sort=asc`).
#[derive(Debug, Clone)]
pub struct IndexerLogSource {
    url: String,
    page_limit: u32,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IndexerPage {
    #[serde(default)]
    logs: Vec<IndexerLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexerLog {
    #[serde(default)]
    address: Option<Address>,
    #[serde(default)]
    topics: Vec<H256>,
    #[serde(default)]
    data: Bytes,
    transaction_hash: H256,
    #[serde(default)]
    block_number: Value,
}

impl IndexerLogSource {
    pub fn new(http: reqwest::Client, url: String, page_limit: u32) -> Self {
        Self {
            url,
            page_limit,
            http,
        }
    }

    /// One page of `AddOwner` events starting at `cursor`. Callers that expect more
    /// events than one page holds paginate with this directly.
    pub async fn fetch_page(
        &self,
        account: Address,
        chain_id: u64,
        cursor: u64,
    ) -> Result<Vec<OwnershipEvent>, ScanError> {
        let query = [
            ("chain", chain_id.to_string()),
            ("address", to_hex(account)),
            ("cursor", cursor.to_string()),
            ("limit", self.page_limit.to_string()),
            ("sort", "asc".to_string()),
        ];

        let resp = self
            .http
            .get(&self.url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ScanError::Network(format!("GET {} failed: {e}", self.url)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScanError::Network(format!("HTTP {} from {}", status, self.url)));
        }

        let body: Value = resp.json().await.map_err(|e| ScanError::Decode {
            tx: None,
            reason: format!("failed to decode JSON: {e}"),
        })?;

        parse_indexer_page(account, body)
    }
}

#[async_trait]
impl OwnershipLogSource for IndexerLogSource {
    async fn fetch_ownership_events(
        &self,
        account: Address,
        chain_id: u64,
    ) -> Result<Vec<OwnershipEvent>, ScanError> {
        let events = self.fetch_page(account, chain_id, 0).await?;
        tracing::info!(
            account = ?account,
            chain_id,
            events = events.len(),
            "fetched AddOwner events from log indexer"
        );
        Ok(events)
    }
}

fn parse_indexer_page(account: Address, body: Value) -> Result<Vec<OwnershipEvent>, ScanError> {
    let page: IndexerPage = serde_json::from_value(body).map_err(|e| ScanError::Decode {
        tx: None,
        reason: format!("unexpected indexer response: {e}"),
    })?;

    let mut events = Vec::new();
    for log in page.logs {
        // The address filter can also match logs that merely mention the account.
        if log.address.is_some_and(|a| a != account) {
            continue;
        }
        let block = parse_block_number(&log.block_number);
        if let Some(event) =
            decode_add_owner(account, &log.topics, &log.data, log.transaction_hash, block)?
        {
            events.push(event);
        }
    }

    sort_by_block(&mut events);
    Ok(events)
}

/// `eth_getLogs` straight from the origin chain, for when no indexer is available.
#[derive(Debug, Clone)]
pub struct RpcLogSource<M> {
    client: Arc<M>,
    start_block: u64,
    chunk_size: u64,
}

impl<M: Middleware + 'static> RpcLogSource<M> {
    pub fn new(client: Arc<M>, start_block: u64, chunk_size: u64) -> Self {
        Self {
            client,
            start_block,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn get_logs(
        &self,
        account: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<ethers::types::Log>, ScanError> {
        let filter = Filter::new()
            .address(account)
            .topic0(add_owner_topic())
            .from_block(BlockNumber::Number(from.into()))
            .to_block(BlockNumber::Number(to.into()));

        self.client
            .get_logs(&filter)
            .await
            .map_err(|e| ScanError::Network(format!("eth_getLogs [{from}, {to}] failed: {e}")))
    }
}

#[async_trait]
impl<M: Middleware + 'static> OwnershipLogSource for RpcLogSource<M> {
    async fn fetch_ownership_events(
        &self,
        account: Address,
        chain_id: u64,
    ) -> Result<Vec<OwnershipEvent>, ScanError> {
        let remote = self
            .client
            .get_chainid()
            .await
            .map_err(|e| ScanError::Network(format!("eth_chainId failed: {e}")))?
            .as_u64();
        if remote != chain_id {
            return Err(ScanError::ChainMismatch {
                expected: chain_id,
                actual: remote,
            });
        }

        let latest = self
            .client
            .get_block_number()
            .await
            .map_err(|e| ScanError::Network(format!("eth_blockNumber failed: {e}")))?
            .as_u64();

        let mut chunk = self.chunk_size;
        let mut cursor = self.start_block;
        let mut events = Vec::new();

        tracing::info!(
            account = ?account,
            from = cursor,
            to = latest,
            chunk,
            "scanning for AddOwner logs"
        );

        while cursor <= latest {
            let end = cmp::min(cursor.saturating_add(chunk - 1), latest);

            let logs = match self.get_logs(account, cursor, end).await {
                Ok(logs) => logs,
                Err(err) => {
                    // Providers cap the range; shrink it (down to 10-block chunks).
                    if chunk <= 10 {
                        return Err(err);
                    }
                    chunk = cmp::max(10, chunk / 2);
                    tracing::warn!(cursor, end, chunk, "log fetch failed; reducing chunk size");
                    continue;
                }
            };

            for log in logs {
                let tx = log.transaction_hash.ok_or_else(|| ScanError::Decode {
                    tx: None,
                    reason: "log without transaction hash".to_string(),
                })?;
                let block = log.block_number.map(|b| b.as_u64());
                if let Some(event) = decode_add_owner(account, &log.topics, &log.data, tx, block)? {
                    events.push(event);
                }
            }

            cursor = end.saturating_add(1);
        }

        sort_by_block(&mut events);
        tracing::info!(account = ?account, events = events.len(), "scan complete");
        Ok(events)
    }
}
