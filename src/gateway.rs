use crate::error::GatewayError;
use async_trait::async_trait;
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Transaction, TransactionReceipt, TransactionRequest, H256, U256, U64,
};
use std::sync::Arc;
use std::time::Duration;

/// A mined transaction sent by this tool.
#[derive(Clone, Debug)]
pub struct Submission {
    pub tx_hash: H256,
    pub receipt: TransactionReceipt,
}

/// Read-only view of one chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn label(&self) -> &'static str;

    async fn chain_id(&self) -> Result<u64, GatewayError>;

    /// Native balance.
    async fn read_balance(&self, account: Address) -> Result<U256, GatewayError>;

    async fn read_code(&self, account: Address) -> Result<Bytes, GatewayError>;

    /// `eth_call` against latest state; returns the raw return data.
    async fn read_contract_value(&self, to: Address, calldata: Bytes)
        -> Result<Bytes, GatewayError>;

    async fn get_transaction(&self, tx: H256) -> Result<Option<Transaction>, GatewayError>;

    async fn get_transaction_receipt(
        &self,
        tx: H256,
    ) -> Result<Option<TransactionReceipt>, GatewayError>;
}

/// A chain this tool can send transactions to. Submissions wait for the receipt and are
/// never retried.
#[async_trait]
pub trait ChainWriter: ChainReader {
    /// Account paying for submissions, when the client knows it.
    fn sender(&self) -> Option<Address>;

    /// Plain transaction to `to` with `data`, without a pre-flight simulation.
    async fn submit_raw_call(&self, to: Address, data: Bytes) -> Result<Submission, GatewayError>;

    /// Contract call, simulated with `eth_call` first so a reverting call is never sent.
    async fn submit_contract_call(
        &self,
        to: Address,
        calldata: Bytes,
    ) -> Result<Submission, GatewayError>;
}

/// Fails unless `reader` is connected to `expected`.
pub async fn ensure_chain_id(reader: &dyn ChainReader, expected: u64) -> Result<(), GatewayError> {
    let actual = reader.chain_id().await?;
    if actual != expected {
        return Err(GatewayError::ChainMismatch {
            chain: reader.label(),
            expected,
            actual,
        });
    }
    tracing::debug!(chain = reader.label(), chain_id = actual, "connected");
    Ok(())
}

/// [`ChainReader`] / [`ChainWriter`] over any ethers middleware stack.
#[derive(Debug)]
pub struct EthersGateway<M> {
    label: &'static str,
    client: Arc<M>,
    poll_interval: Duration,
}

impl<M: Middleware + 'static> EthersGateway<M> {
    pub fn new(label: &'static str, client: Arc<M>, poll_interval: Duration) -> Self {
        Self {
            label,
            client,
            poll_interval,
        }
    }

    fn network(&self, op: &'static str, err: impl ToString) -> GatewayError {
        GatewayError::Network {
            chain: self.label,
            op,
            reason: err.to_string(),
        }
    }

    /// Node-reported reverts (JSON-RPC code 3 or a "revert" message) are contract
    /// failures; everything else is transport.
    fn classify(&self, op: &'static str, err: M::Error) -> GatewayError {
        if let Some(resp) = err.as_error_response() {
            if resp.code == 3 || resp.message.to_ascii_lowercase().contains("revert") {
                return GatewayError::Reverted {
                    chain: self.label,
                    op,
                    reason: resp.message.clone(),
                };
            }
        }
        self.network(op, err)
    }

    fn request(&self, to: Address, data: Bytes) -> TransactionRequest {
        let mut tx = TransactionRequest::new().to(to).data(data);
        if let Some(from) = self.client.default_sender() {
            tx = tx.from(from);
        }
        tx
    }

    async fn send(
        &self,
        op: &'static str,
        tx: TransactionRequest,
    ) -> Result<Submission, GatewayError> {
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| self.classify(op, e))?;
        let tx_hash = pending.tx_hash();
        tracing::info!(chain = self.label, op, tx = ?tx_hash, "transaction sent; waiting for receipt");

        let receipt = pending
            .interval(self.poll_interval)
            .await
            .map_err(|e| self.network(op, e))?
            .ok_or(GatewayError::Dropped {
                chain: self.label,
                tx: tx_hash,
            })?;

        if receipt.status != Some(U64::from(1)) {
            tracing::warn!(chain = self.label, op, tx = ?tx_hash, "transaction mined but reverted");
            return Err(GatewayError::TxReverted {
                chain: self.label,
                tx: tx_hash,
            });
        }

        tracing::info!(
            chain = self.label,
            op,
            tx = ?tx_hash,
            block = ?receipt.block_number,
            gas_used = ?receipt.gas_used,
            "transaction mined"
        );
        Ok(Submission { tx_hash, receipt })
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainReader for EthersGateway<M> {
    fn label(&self) -> &'static str {
        self.label
    }

    async fn chain_id(&self) -> Result<u64, GatewayError> {
        self.client
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| self.network("eth_chainId", e))
    }

    async fn read_balance(&self, account: Address) -> Result<U256, GatewayError> {
        self.client
            .get_balance(account, None)
            .await
            .map_err(|e| self.network("eth_getBalance", e))
    }

    async fn read_code(&self, account: Address) -> Result<Bytes, GatewayError> {
        self.client
            .get_code(account, None)
            .await
            .map_err(|e| self.network("eth_getCode", e))
    }

    async fn read_contract_value(
        &self,
        to: Address,
        calldata: Bytes,
    ) -> Result<Bytes, GatewayError> {
        let tx: TypedTransaction = self.request(to, calldata).into();
        self.client
            .call(&tx, None)
            .await
            .map_err(|e| self.classify("eth_call", e))
    }

    async fn get_transaction(&self, tx: H256) -> Result<Option<Transaction>, GatewayError> {
        self.client
            .get_transaction(tx)
            .await
            .map_err(|e| self.network("eth_getTransactionByHash", e))
    }

    async fn get_transaction_receipt(
        &self,
        tx: H256,
    ) -> Result<Option<TransactionReceipt>, GatewayError> {
        self.client
            .get_transaction_receipt(tx)
            .await
            .map_err(|e| self.network("eth_getTransactionReceipt", e))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainWriter for EthersGateway<M> {
    fn sender(&self) -> Option<Address> {
        self.client.default_sender()
    }

    async fn submit_raw_call(&self, to: Address, data: Bytes) -> Result<Submission, GatewayError> {
        self.send("raw call", self.request(to, data)).await
    }

    async fn submit_contract_call(
        &self,
        to: Address,
        calldata: Bytes,
    ) -> Result<Submission, GatewayError> {
        // Guardrail: simulate via eth_call before spending gas.
        let tx = self.request(to, calldata);
        let simulated: TypedTransaction = tx.clone().into();
        self.client
            .call(&simulated, None)
            .await
            .map_err(|e| self.classify("contract call simulation", e))?;

        self.send("contract call", tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{JsonRpcError, MockError, MockProvider, MockResponse, Provider};
    use ethers::types::{BlockId, BlockNumber};

    const TARGET: Address = Address::repeat_byte(2);

    fn gateway() -> (EthersGateway<Provider<MockProvider>>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        let provider = provider.interval(Duration::from_millis(5));
        (
            EthersGateway::new("destination", Arc::new(provider), Duration::from_millis(5)),
            mock,
        )
    }

    fn rpc_error(code: i64, message: &str) -> MockResponse {
        MockResponse::Error(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        })
    }

    /// Queues the answers a legacy send consumes: gas price, gas estimate, the hash.
    /// Responses are served last-in first-out, so callers push later answers first.
    fn push_send(mock: &MockProvider, tx_hash: H256) {
        mock.push::<H256, _>(tx_hash).unwrap();
        mock.push::<U256, _>(U256::from(21_000u64)).unwrap();
        mock.push::<U256, _>(U256::exp10(9)).unwrap();
    }

    fn push_mined(mock: &MockProvider, tx_hash: H256, status: u64) {
        let receipt = TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(5)),
            status: Some(U64::from(status)),
            ..Default::default()
        };
        let tx = Transaction {
            hash: tx_hash,
            block_number: Some(U64::from(5)),
            ..Default::default()
        };
        mock.push::<TransactionReceipt, _>(receipt).unwrap();
        mock.push::<Transaction, _>(tx).unwrap();
        push_send(mock, tx_hash);
    }

    #[tokio::test]
    async fn reads_go_through_the_provider() {
        let (gw, mock) = gateway();
        mock.push::<U256, _>(U256::from(666_666_666u64)).unwrap();
        assert_eq!(gw.chain_id().await.unwrap(), 666_666_666);

        mock.push::<U256, _>(U256::exp10(17)).unwrap();
        assert_eq!(gw.read_balance(TARGET).await.unwrap(), U256::exp10(17));

        mock.push::<Bytes, _>(Bytes::from(vec![0x60, 0x80])).unwrap();
        assert_eq!(gw.read_code(TARGET).await.unwrap().as_ref(), &[0x60, 0x80]);
    }

    #[tokio::test]
    async fn chain_id_check_names_the_chain() {
        let (gw, mock) = gateway();
        mock.push::<U256, _>(U256::from(8453u64)).unwrap();
        ensure_chain_id(&gw, 8453).await.unwrap();

        mock.push::<U256, _>(U256::from(1u64)).unwrap();
        let err = ensure_chain_id(&gw, 8453).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ChainMismatch {
                chain: "destination",
                expected: 8453,
                actual: 1
            }
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn transport_failures_are_network_errors() {
        // An empty mock responds with an error that carries no JSON-RPC payload.
        let (gw, _mock) = gateway();
        let err = gw
            .read_contract_value(TARGET, Bytes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Network { chain: "destination", .. }));

        let (gw, mock) = gateway();
        mock.push_response(rpc_error(-32005, "rate limit exceeded"));
        let err = gw
            .read_contract_value(TARGET, Bytes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Network { op: "eth_call", .. }));
    }

    #[tokio::test]
    async fn node_reported_reverts_are_contract_failures() {
        let (gw, mock) = gateway();
        mock.push_response(rpc_error(3, "execution reverted: AA24 signature error"));
        let err = gw
            .read_contract_value(TARGET, Bytes::default())
            .await
            .unwrap_err();
        match &err {
            GatewayError::Reverted { chain, op, reason } => {
                assert_eq!(*chain, "destination");
                assert_eq!(*op, "eth_call");
                assert!(reason.contains("AA24"));
            }
            other => panic!("expected a revert, got {other:?}"),
        }
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationFailed);

        // Some nodes use a generic code and only say so in the message.
        mock.push_response(rpc_error(-32000, "Execution Reverted"));
        let err = gw
            .read_contract_value(TARGET, Bytes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Reverted { .. }));
    }

    #[tokio::test]
    async fn reverting_contract_call_is_never_sent() {
        let (gw, mock) = gateway();
        let calldata = Bytes::from(vec![0x1f, 0xad, 0x94, 0x8c]);
        mock.push::<U256, _>(U256::from(42u64)).unwrap();
        mock.push_response(rpc_error(3, "execution reverted"));

        let err = gw
            .submit_contract_call(TARGET, calldata.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Reverted {
                op: "contract call simulation",
                ..
            }
        ));

        // The untouched answer is still queued.
        assert_eq!(gw.chain_id().await.unwrap(), 42);

        let simulated: TypedTransaction = TransactionRequest::new().to(TARGET).data(calldata).into();
        let latest: BlockId = BlockNumber::Latest.into();
        mock.assert_request(
            "eth_call",
            [
                serde_json::to_value(&simulated).unwrap(),
                serde_json::to_value(latest).unwrap(),
            ],
        )
        .unwrap();
        mock.assert_request("eth_chainId", ()).unwrap();
        assert!(matches!(
            mock.assert_request("eth_sendTransaction", ()),
            Err(MockError::EmptyRequests)
        ));
    }

    #[tokio::test]
    async fn mined_transactions_are_checked_for_status() {
        let (gw, mock) = gateway();
        let ok = H256::repeat_byte(0x11);
        push_mined(&mock, ok, 1);
        let submission = gw.submit_raw_call(TARGET, Bytes::default()).await.unwrap();
        assert_eq!(submission.tx_hash, ok);
        assert_eq!(submission.receipt.status, Some(U64::from(1)));

        let reverted = H256::repeat_byte(0x22);
        push_mined(&mock, reverted, 0);
        let err = gw
            .submit_raw_call(TARGET, Bytes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TxReverted { tx, .. } if tx == reverted));
        assert_eq!(err.kind(), crate::error::ErrorKind::VerificationFailed);
    }

    #[tokio::test]
    async fn simulated_contract_call_is_then_sent() {
        let (gw, mock) = gateway();
        let hash = H256::repeat_byte(0x33);
        push_mined(&mock, hash, 1);
        mock.push::<Bytes, _>(Bytes::default()).unwrap();

        let submission = gw
            .submit_contract_call(TARGET, Bytes::from(vec![0x01]))
            .await
            .unwrap();
        assert_eq!(submission.tx_hash, hash);
    }

    #[tokio::test]
    async fn transaction_missing_from_the_mempool_is_dropped() {
        let (gw, mock) = gateway();
        let hash = H256::repeat_byte(0x44);
        // First lookup plus the poller's retries all come back empty.
        for _ in 0..4 {
            mock.push::<Option<Transaction>, _>(None).unwrap();
        }
        push_send(&mock, hash);

        let err = gw
            .submit_raw_call(TARGET, Bytes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Dropped { tx, .. } if tx == hash));
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
    }
}
