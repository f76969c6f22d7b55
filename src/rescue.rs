//! Replays a smart wallet's cross-chain recovery-owner registration on the destination
//! chain, then uses that owner to move the wallet's token balance out.
//!
//! Each stage is a public method returning a typed value; [`Rescue::run`] sequences them
//! and stops at the first failure, reported as a [`StageFailure`].

use crate::codec::{
    encode_handle_ops, encode_owner_address, encode_signed_operation, is_replayable_nonce,
    split_init_code, wrap_owner_signature,
};
use crate::config::{GasSettings, RescueConfig};
use crate::encoding::to_hex;
use crate::entry_point::{decode_user_op_hash, encode_get_user_op_hash, GetNonceCall, GetNonceReturn};
use crate::erc20::{BalanceOfCall, BalanceOfReturn, TransferCall, TransferFilter};
use crate::error::{CodecError, ErrorKind, RescueError, TraceError};
use crate::gateway::{ChainReader, ChainWriter, Submission};
use crate::scanner::{find_deployment_event, find_recovery_owner_event, OwnershipLogSource};
use crate::smart_wallet::{
    ExecuteCall, IsOwnerAddressCall, IsOwnerAddressReturn, OwnerAtIndexCall, OwnerAtIndexReturn,
};
use crate::trace::{extract_from_transaction_input, extract_user_operations, TraceSource};
use crate::types::{OwnershipEvent, UserOperation};
use async_trait::async_trait;
use ethers::abi::{AbiDecode, AbiEncode, RawLog};
use ethers::contract::EthEvent;
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, H256, U256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    AwaitFunding,
    ScanEvents,
    LocateDeployment,
    LocateRecoveryRegistration,
    ExtractReplayableOp,
    Deploy,
    Replay,
    VerifyOwnership,
    BuildRescueOp,
    SignAndSubmit,
    VerifyTransfer,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::AwaitFunding => "await-funding",
            Stage::ScanEvents => "scan-events",
            Stage::LocateDeployment => "locate-deployment",
            Stage::LocateRecoveryRegistration => "locate-recovery-registration",
            Stage::ExtractReplayableOp => "extract-replayable-op",
            Stage::Deploy => "deploy",
            Stage::Replay => "replay",
            Stage::VerifyOwnership => "verify-ownership",
            Stage::BuildRescueOp => "build-rescue-op",
            Stage::SignAndSubmit => "sign-and-submit",
            Stage::VerifyTransfer => "verify-transfer",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

/// Terminal failure: the stage that failed and why.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: RescueError,
}

impl StageFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

fn failed(stage: Stage) -> impl FnOnce(RescueError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// Produces owner signatures over UserOperation hashes.
#[async_trait]
pub trait UserOpSigner: Send + Sync {
    fn address(&self) -> Address;

    /// 65-byte `r ‖ s ‖ v` signature over the raw hash (no message prefix).
    async fn sign_hash(&self, hash: H256) -> Result<Bytes, RescueError>;
}

#[async_trait]
impl UserOpSigner for LocalWallet {
    fn address(&self) -> Address {
        ethers::signers::Signer::address(self)
    }

    async fn sign_hash(&self, hash: H256) -> Result<Bytes, RescueError> {
        let signature = LocalWallet::sign_hash(self, hash)
            .map_err(|e| RescueError::Signing(e.to_string()))?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

/// External continuation for the funding wait, e.g. "press enter once funded".
#[async_trait]
pub trait FundingSignal: Send + Sync {
    /// Resolves once the operator says `account` was topped up; `false` aborts.
    async fn wait_for_funding(&self, account: Address, balance: U256, required: U256) -> bool;
}

/// The subset of [`RescueConfig`] the pipeline needs.
#[derive(Clone, Debug)]
pub struct RescueSettings {
    pub origin_chain_id: u64,
    pub entry_point: Address,
    pub token: Address,
    pub min_funding: U256,
    pub recovery_owner_index: u64,
    pub gas: GasSettings,
}

impl From<&RescueConfig> for RescueSettings {
    fn from(cfg: &RescueConfig) -> Self {
        Self {
            origin_chain_id: cfg.origin_chain_id,
            entry_point: cfg.entry_point,
            token: cfg.token,
            min_funding: cfg.min_funding,
            recovery_owner_index: cfg.recovery_owner_index,
            gas: cfg.gas,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RescueRequest {
    /// Smart wallet address (identical on both chains).
    pub wallet: Address,
    /// Where the token balance goes.
    pub destination: Address,
}

pub struct Collaborators {
    pub origin: Arc<dyn ChainReader>,
    pub destination: Arc<dyn ChainWriter>,
    pub logs: Arc<dyn OwnershipLogSource>,
    pub traces: Arc<dyn TraceSource>,
    pub signer: Arc<dyn UserOpSigner>,
    pub funding: Arc<dyn FundingSignal>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipHistory {
    pub deployment: OwnershipEvent,
    pub recovery: OwnershipEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RescuePlan {
    /// Unsigned operation.
    pub op: UserOperation,
    pub amount: U256,
    pub destination_balance_before: U256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RescueOutcome {
    /// `None` when the wallet already existed on the destination chain.
    pub deploy_tx: Option<H256>,
    /// `None` when the recovery owner was already registered.
    pub replay_tx: Option<H256>,
    pub rescue_tx: H256,
    pub amount: U256,
    pub destination_balance: U256,
}

pub struct Rescue {
    settings: RescueSettings,
    request: RescueRequest,
    origin: Arc<dyn ChainReader>,
    destination: Arc<dyn ChainWriter>,
    logs: Arc<dyn OwnershipLogSource>,
    traces: Arc<dyn TraceSource>,
    signer: Arc<dyn UserOpSigner>,
    funding: Arc<dyn FundingSignal>,
}

impl Rescue {
    pub fn new(settings: RescueSettings, request: RescueRequest, with: Collaborators) -> Self {
        Self {
            settings,
            request,
            origin: with.origin,
            destination: with.destination,
            logs: with.logs,
            traces: with.traces,
            signer: with.signer,
            funding: with.funding,
        }
    }

    /// Recovery owner address; also pays for and beneficiates every submission.
    pub fn actor(&self) -> Address {
        self.signer.address()
    }

    pub async fn run(&self) -> Result<RescueOutcome, StageFailure> {
        let wallet = self.request.wallet;
        tracing::info!(
            wallet = ?wallet,
            destination = ?self.request.destination,
            actor = ?self.actor(),
            "starting rescue"
        );

        let funded = self
            .await_funding()
            .await
            .map_err(failed(Stage::AwaitFunding))?;
        tracing::info!(balance = %funded, "recovery owner funded; proceeding");

        let history = self.scan_events().await.map_err(failed(Stage::ScanEvents))?;

        let deploy_op = self
            .locate_deployment(&history.deployment)
            .await
            .map_err(failed(Stage::LocateDeployment))?;

        let candidates = self
            .locate_recovery_registration(&history.recovery)
            .await
            .map_err(failed(Stage::LocateRecoveryRegistration))?;

        let replayable = self
            .extract_replayable_op(history.recovery.transaction_hash, candidates)
            .map_err(failed(Stage::ExtractReplayableOp))?;
        tracing::info!("found replayable UserOperation");

        let deploy_tx = self.deploy(&deploy_op).await.map_err(failed(Stage::Deploy))?;
        let replay_tx = self.replay(&replayable).await.map_err(failed(Stage::Replay))?;

        self.verify_ownership()
            .await
            .map_err(failed(Stage::VerifyOwnership))?;

        let plan = self
            .build_rescue_op()
            .await
            .map_err(failed(Stage::BuildRescueOp))?;

        let submission = self
            .sign_and_submit(&plan)
            .await
            .map_err(failed(Stage::SignAndSubmit))?;

        let destination_balance = self
            .verify_transfer(&plan, &submission)
            .await
            .map_err(failed(Stage::VerifyTransfer))?;

        tracing::info!(
            stage = %Stage::Done,
            rescue_tx = ?submission.tx_hash,
            amount = %plan.amount,
            destination_balance = %destination_balance,
            "rescue complete"
        );

        Ok(RescueOutcome {
            deploy_tx,
            replay_tx,
            rescue_tx: submission.tx_hash,
            amount: plan.amount,
            destination_balance,
        })
    }

    /// Blocks on the funding signal until the actor holds `min_funding` on the
    /// destination chain. Returns the funded balance.
    pub async fn await_funding(&self) -> Result<U256, RescueError> {
        let actor = self.actor();
        let required = self.settings.min_funding;

        // The actor is also the handleOps beneficiary, so it must be the paying account.
        if let Some(sender) = self.destination.sender() {
            if sender != actor {
                return Err(RescueError::SenderMismatch { sender, actor });
            }
        }

        loop {
            let balance = self.destination.read_balance(actor).await?;
            if balance >= required {
                return Ok(balance);
            }

            tracing::info!(
                chain = self.destination.label(),
                actor = ?actor,
                balance = %balance,
                required = %required,
                "recovery owner needs gas funds"
            );
            if !self.funding.wait_for_funding(actor, balance, required).await {
                return Err(RescueError::FundingAborted {
                    actor,
                    balance,
                    required,
                });
            }
        }
    }

    pub async fn scan_events(&self) -> Result<OwnershipHistory, RescueError> {
        let events = self
            .logs
            .fetch_ownership_events(self.request.wallet, self.settings.origin_chain_id)
            .await?;

        let deployment = find_deployment_event(&events)?.clone();
        let recovery = find_recovery_owner_event(&events)?.clone();

        let actor = self.actor();
        if recovery.owner_address() != Some(actor) {
            return Err(RescueError::RecoveryOwnerMismatch {
                registered: to_hex(&recovery.owner),
                actor,
            });
        }

        tracing::info!(
            events = events.len(),
            deployment_tx = ?deployment.transaction_hash,
            recovery_tx = ?recovery.transaction_hash,
            recovery_index = %recovery.index,
            "found ownership history"
        );
        if recovery.index != U256::from(self.settings.recovery_owner_index) {
            tracing::warn!(
                registered_index = %recovery.index,
                expected_index = self.settings.recovery_owner_index,
                "recovery owner was registered at an unexpected slot"
            );
        }

        Ok(OwnershipHistory {
            deployment,
            recovery,
        })
    }

    /// The operation that deployed the wallet on the origin chain.
    pub async fn locate_deployment(
        &self,
        event: &OwnershipEvent,
    ) -> Result<UserOperation, RescueError> {
        let tx = event.transaction_hash;
        let ops = self.operations_in(tx, None).await?;

        let op = ops
            .into_iter()
            .find(UserOperation::has_init_code)
            .ok_or(RescueError::DeploymentOpNotFound { tx })?;
        if op.sender != self.request.wallet {
            tracing::warn!(sender = ?op.sender, wallet = ?self.request.wallet, "deployment op sender differs from wallet");
        }
        tracing::debug!(
            sender = ?op.sender,
            nonce = %op.nonce,
            init_code = %to_hex(&op.init_code),
            "deployment UserOperation"
        );
        Ok(op)
    }

    /// The wallet's operations in the recovery registration transaction.
    pub async fn locate_recovery_registration(
        &self,
        event: &OwnershipEvent,
    ) -> Result<Vec<UserOperation>, RescueError> {
        let ops = self
            .operations_in(event.transaction_hash, Some(self.request.wallet))
            .await?;
        tracing::info!(tx = ?event.transaction_hash, candidates = ops.len(), "decoded registration operations");
        Ok(ops)
    }

    pub fn extract_replayable_op(
        &self,
        tx: H256,
        candidates: Vec<UserOperation>,
    ) -> Result<UserOperation, RescueError> {
        candidates
            .into_iter()
            .find(|op| is_replayable_nonce(op.nonce))
            .ok_or(RescueError::ReplayableOpNotFound {
                tx,
                sender: self.request.wallet,
            })
    }

    /// Re-runs the wallet factory call. Skipped when the wallet already has code.
    pub async fn deploy(&self, op: &UserOperation) -> Result<Option<H256>, RescueError> {
        let wallet = self.request.wallet;
        if !self.destination.read_code(wallet).await?.is_empty() {
            tracing::info!(wallet = ?wallet, "wallet already deployed on destination; skipping");
            return Ok(None);
        }

        let (factory, payload) = split_init_code(&op.init_code)?;
        let submission = self.destination.submit_raw_call(factory, payload).await?;

        if self.destination.read_code(wallet).await?.is_empty() {
            return Err(RescueError::DeploymentMismatch {
                tx: submission.tx_hash,
                factory,
                wallet,
            });
        }
        tracing::info!(tx = ?submission.tx_hash, factory = ?factory, "deployed wallet");
        Ok(Some(submission.tx_hash))
    }

    /// Submits the registration operation unchanged. Skipped when the actor is already
    /// an owner.
    pub async fn replay(&self, op: &UserOperation) -> Result<Option<H256>, RescueError> {
        let actor = self.actor();
        if self.is_owner(actor).await? {
            tracing::info!(actor = ?actor, "recovery owner already registered; skipping replay");
            return Ok(None);
        }

        let calldata = encode_handle_ops(std::slice::from_ref(op), actor);
        let submission = self
            .destination
            .submit_contract_call(self.settings.entry_point, calldata)
            .await?;
        tracing::info!(tx = ?submission.tx_hash, "replayed recovery owner registration");
        Ok(Some(submission.tx_hash))
    }

    pub async fn verify_ownership(&self) -> Result<(), RescueError> {
        let actor = self.actor();
        if !self.is_owner(actor).await? {
            return Err(RescueError::OwnershipVerificationFailed {
                reason: format!("isOwnerAddress({actor:?}) is false"),
            });
        }

        let index = self.settings.recovery_owner_index;
        let OwnerAtIndexReturn(owner) = self
            .view(
                self.request.wallet,
                OwnerAtIndexCall {
                    index: U256::from(index),
                },
            )
            .await?;
        let expected = encode_owner_address(actor);
        if owner != expected {
            return Err(RescueError::OwnershipVerificationFailed {
                reason: format!(
                    "owner slot {index} holds {}, expected {}",
                    to_hex(&owner),
                    to_hex(&expected)
                ),
            });
        }

        tracing::info!(actor = ?actor, index, "recovery owner verified");
        Ok(())
    }

    /// Unsigned operation moving the wallet's whole token balance to the destination.
    pub async fn build_rescue_op(&self) -> Result<RescuePlan, RescueError> {
        let RescueRequest {
            wallet,
            destination,
        } = self.request;
        let token = self.settings.token;

        let BalanceOfReturn(amount) = self.view(token, BalanceOfCall { account: wallet }).await?;
        if amount.is_zero() {
            return Err(RescueError::NothingToRescue { wallet, token });
        }

        let GetNonceReturn(nonce) = self
            .view(
                self.settings.entry_point,
                GetNonceCall {
                    sender: wallet,
                    key: U256::zero(),
                },
            )
            .await?;

        let transfer = TransferCall {
            to: destination,
            amount,
        };
        let call_data = ExecuteCall {
            target: token,
            value: U256::zero(),
            data: Bytes::from(transfer.encode()),
        }
        .encode();

        let gas = self.settings.gas;
        let op = UserOperation {
            sender: wallet,
            nonce,
            init_code: Bytes::default(),
            call_data: Bytes::from(call_data),
            call_gas_limit: gas.call_gas_limit,
            verification_gas_limit: gas.verification_gas_limit,
            pre_verification_gas: gas.pre_verification_gas,
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        };

        let BalanceOfReturn(before) = self
            .view(
                token,
                BalanceOfCall {
                    account: destination,
                },
            )
            .await?;

        tracing::info!(amount = %amount, nonce = %nonce, destination = ?destination, "built rescue operation");
        Ok(RescuePlan {
            op,
            amount,
            destination_balance_before: before,
        })
    }

    pub async fn sign_and_submit(&self, plan: &RescuePlan) -> Result<Submission, RescueError> {
        let entry_point = self.settings.entry_point;

        let raw = self
            .destination
            .read_contract_value(entry_point, encode_get_user_op_hash(&plan.op))
            .await?;
        let hash = decode_user_op_hash(&raw)?;

        let signature = self.signer.sign_hash(hash).await?;
        let wrapped = wrap_owner_signature(
            U256::from(self.settings.recovery_owner_index),
            &signature,
        );
        let calldata = encode_signed_operation(&plan.op, wrapped, self.actor());

        tracing::info!(user_op_hash = ?hash, "submitting rescue operation");
        let submission = self
            .destination
            .submit_contract_call(entry_point, calldata)
            .await?;
        tracing::info!(tx = ?submission.tx_hash, "rescue operation mined");
        Ok(submission)
    }

    /// Requires a `Transfer(wallet → destination)` log from the token and a changed
    /// destination balance. Returns the balance after.
    pub async fn verify_transfer(
        &self,
        plan: &RescuePlan,
        submission: &Submission,
    ) -> Result<U256, RescueError> {
        let RescueRequest {
            wallet,
            destination,
        } = self.request;
        let token = self.settings.token;

        let transferred = submission
            .receipt
            .logs
            .iter()
            .filter(|log| log.address == token)
            .filter_map(|log| {
                TransferFilter::decode_log(&RawLog {
                    topics: log.topics.clone(),
                    data: log.data.to_vec(),
                })
                .ok()
            })
            .any(|t| t.from == wallet && t.to == destination);
        if !transferred {
            return Err(RescueError::TransferLogNotFound {
                tx: submission.tx_hash,
                destination,
            });
        }

        let BalanceOfReturn(after) = self
            .view(
                token,
                BalanceOfCall {
                    account: destination,
                },
            )
            .await?;
        if after == plan.destination_balance_before {
            return Err(RescueError::BalanceUnchanged {
                tx: submission.tx_hash,
                balance: after,
            });
        }
        Ok(after)
    }

    async fn is_owner(&self, account: Address) -> Result<bool, RescueError> {
        let IsOwnerAddressReturn(owner) = self
            .view(self.request.wallet, IsOwnerAddressCall { account })
            .await?;
        Ok(owner)
    }

    /// Trace-decoded operations of `tx`, or the transaction's own input when the trace
    /// endpoint fails.
    async fn operations_in(
        &self,
        tx: H256,
        sender: Option<Address>,
    ) -> Result<Vec<UserOperation>, RescueError> {
        let entry_point = self.settings.entry_point;
        match self.traces.fetch_trace(tx).await {
            Ok(trace) => Ok(extract_user_operations(&trace, entry_point, sender)?),
            Err(err @ TraceError::Unavailable { .. }) => {
                tracing::warn!(tx = ?tx, error = %err, "trace unavailable; decoding transaction input instead");
                let Some(transaction) = self.origin.get_transaction(tx).await? else {
                    return Err(err.into());
                };
                let ops = extract_from_transaction_input(&transaction, entry_point)?;
                Ok(ops
                    .into_iter()
                    .filter(|op| sender.map_or(true, |s| op.sender == s))
                    .collect())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `eth_call` on the destination chain with typed call/return values.
    async fn view<C, R>(&self, to: Address, call: C) -> Result<R, RescueError>
    where
        C: AbiEncode,
        R: AbiDecode,
    {
        let raw = self
            .destination
            .read_contract_value(to, Bytes::from(call.encode()))
            .await?;
        <R as AbiDecode>::decode(raw.as_ref()).map_err(|e| {
            CodecError::Malformed {
                what: "contract return data",
                reason: e.to_string(),
            }
            .into()
        })
    }
}
