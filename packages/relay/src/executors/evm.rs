use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolError;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::retry::submission_error;
use super::Executor;
use crate::config::EvmConfig;
use crate::contracts::evm_bridge::MirageBridge::{self, ExecuteMessage, MessageNotExecuted};
use crate::error::RelayError;
use crate::types::{ChainId, Message, Receipt};

/// How long the first receipt wait may take before polling by hash
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
/// Receipt lookups by hash once the first wait failed
const RECEIPT_POLLS: u32 = 5;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(6);

/// Submits messages to the bridge contract's `executeMessage`
pub struct EvmExecutor {
    chain: ChainId,
    rpc_url: Url,
    bridge_address: Address,
    signer: PrivateKeySigner,
}

impl EvmExecutor {
    pub fn new(config: &EvmConfig) -> Result<Self> {
        let bridge_address =
            Address::from_str(&config.bridge_address).wrap_err("Invalid bridge address")?;
        let rpc_url = config.rpc_url.parse().wrap_err("Invalid RPC URL")?;
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .wrap_err("Invalid private key")?;

        info!(
            executor_address = %signer.address(),
            chain = config.chain_id.name(),
            bridge_address = %bridge_address,
            "EVM executor initialized"
        );

        Ok(Self {
            chain: config.chain_id,
            rpc_url,
            bridge_address,
            signer,
        })
    }

    /// ABI struct for `executeMessage`. The nonce travels as a decimal string.
    pub fn encode(message: &Message) -> ExecuteMessage {
        ExecuteMessage {
            id: message.id().to_string(),
            nonce: message.nonce().to_string(),
            opType: message.op_type().as_u8(),
            srcChainId: U256::from(message.src_chain_id().as_u64()),
            destChainId: U256::from(message.dest_chain_id().as_u64()),
            destAddress: message.dest_address().to_string(),
            contractAddress: message.contract_address().to_string(),
            tokenId: message.token_id(),
        }
    }
}

/// Look up the receipt of an already broadcast transaction until it shows up.
/// `lookup` yields the receipt status, `None` while it is still pending.
/// A transaction that never shows up is in doubt; it is never resent.
async fn poll_receipt_status<F, Fut>(
    reference: &str,
    polls: u32,
    interval: Duration,
    mut lookup: F,
) -> Result<(), RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<bool>, String>>,
{
    let mut last_error = "receipt not found".to_string();
    for poll in 0..polls {
        if poll > 0 {
            tokio::time::sleep(interval).await;
        }
        match lookup().await {
            Ok(Some(true)) => return Ok(()),
            Ok(Some(false)) => {
                return Err(RelayError::permanent(format!(
                    "Transaction {} reverted",
                    reference
                )))
            }
            Ok(None) => last_error = "receipt not found".to_string(),
            Err(e) => last_error = e,
        }
    }
    Err(RelayError::in_doubt(reference, last_error))
}

/// Reason string of a `MessageNotExecuted` revert, if that is what this is
fn not_executed_reason(err: &alloy::contract::Error) -> Option<String> {
    match err {
        alloy::contract::Error::TransportError(rpc) => rpc
            .as_error_resp()?
            .as_revert_data()
            .and_then(|data| MessageNotExecuted::abi_decode(&data, true).ok())
            .map(|e| e.reason),
        _ => None,
    }
}

#[async_trait]
impl Executor for EvmExecutor {
    fn chain_id(&self) -> ChainId {
        self.chain
    }

    async fn execute(&self, message: &Message) -> Result<Receipt, RelayError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = MirageBridge::new(self.bridge_address, &provider);

        debug!(
            message_id = message.id(),
            nonce = %message.nonce(),
            token_id = %message.token_id(),
            "Submitting executeMessage"
        );

        let pending_tx = contract
            .executeMessage(Self::encode(message))
            .send()
            .await
            .map_err(|e| match not_executed_reason(&e) {
                Some(reason) => RelayError::permanent(format!("MessageNotExecuted: {}", reason)),
                None => submission_error(&format!("Failed to send transaction: {}", e)),
            })?;

        let tx_hash = *pending_tx.tx_hash();
        let reference = format!("0x{:x}", tx_hash);
        info!(
            message_id = message.id(),
            tx_hash = %reference,
            "Transaction sent, waiting for confirmation"
        );

        // From here on the transaction is out; only its hash is queried again
        match pending_tx
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
        {
            Ok(receipt) if receipt.status() => {}
            Ok(_) => {
                return Err(RelayError::permanent(format!(
                    "Transaction {} reverted",
                    reference
                )))
            }
            Err(e) => {
                warn!(
                    message_id = message.id(),
                    tx_hash = %reference,
                    error = %e,
                    "Receipt wait failed, polling by transaction hash"
                );
                let provider = &provider;
                let lookup = move || async move {
                    provider
                        .get_transaction_receipt(tx_hash)
                        .await
                        .map(|receipt| receipt.map(|r| r.status()))
                        .map_err(|e| format!("Failed to get receipt: {}", e))
                };
                poll_receipt_status(&reference, RECEIPT_POLLS, RECEIPT_POLL_INTERVAL, lookup)
                    .await?;
            }
        }

        Ok(Receipt { reference })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::OpType;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    async fn poll_scripted(
        script: Vec<Result<Option<bool>, String>>,
    ) -> (Result<(), RelayError>, usize) {
        let script = Mutex::new(VecDeque::from(script));
        let lookups = Mutex::new(0usize);
        let result = poll_receipt_status("0xfeed", 3, Duration::ZERO, || {
            *lookups.lock().unwrap() += 1;
            let next = script.lock().unwrap().pop_front();
            async move { next.unwrap_or(Ok(None)) }
        })
        .await;
        let count = *lookups.lock().unwrap();
        (result, count)
    }

    #[tokio::test]
    async fn test_receipt_found_after_failed_lookups() {
        let (result, lookups) = poll_scripted(vec![
            Err("connection reset".to_string()),
            Ok(None),
            Ok(Some(true)),
        ])
        .await;
        assert!(result.is_ok());
        assert_eq!(lookups, 3);
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_permanent() {
        let (result, lookups) = poll_scripted(vec![Ok(Some(false))]).await;
        let err = result.unwrap_err();
        assert_eq!(lookups, 1);
        assert_eq!(err.kind(), ErrorKind::SubmissionFailed);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_receipt_is_in_doubt() {
        let (result, lookups) = poll_scripted(vec![Err("request timed out".to_string())]).await;
        let err = result.unwrap_err();
        assert_eq!(lookups, 3);
        assert_eq!(err.kind(), ErrorKind::InDoubt);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("0xfeed"));
    }

    #[test]
    fn test_encode_execute_message() {
        let message = Message::new(
            "icp-9",
            U256::from(5u64),
            OpType::Burn,
            ChainId::Icp,
            ChainId::Ethereum,
            "0x00000000000000000000000000000000000000aa",
            "ryjl3-tyaaa-aaaaa-aaaba-cai",
            U256::MAX,
        );

        let encoded = EvmExecutor::encode(&message);
        assert_eq!(encoded.id, "icp-9");
        assert_eq!(encoded.nonce, "5");
        assert_eq!(encoded.opType, 2);
        assert_eq!(encoded.srcChainId, U256::from(2u64));
        assert_eq!(encoded.destChainId, U256::from(1u64));
        assert_eq!(encoded.contractAddress, "ryjl3-tyaaa-aaaaa-aaaba-cai");
        assert_eq!(encoded.tokenId, U256::MAX);
    }

    #[test]
    fn test_new_rejects_bad_key() {
        let config = EvmConfig {
            chain_id: ChainId::Ethereum,
            rpc_url: "http://localhost:8545".to_string(),
            ws_url: "ws://localhost:8546".to_string(),
            bridge_address: "0x0000000000000000000000000000000000000001".to_string(),
            private_key: "0x123".to_string(),
            ipfs_gateway_url: "https://ipfs.io/ipfs/".to_string(),
        };
        assert!(EvmExecutor::new(&config).is_err());
    }
}
