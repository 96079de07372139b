use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::{Stream, StreamExt};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::metadata::{Erc721MetadataReader, MetadataReader};
use super::{report_rejected, Listener, MessageSink};
use crate::config::EvmConfig;
use crate::contracts::evm_bridge::MirageBridge::MessageSent;
use crate::error::RelayError;
use crate::executors::retry::RetryConfig;
use crate::metrics;
use crate::types::{ChainId, Message, OpType};

const METADATA_ATTEMPTS: u32 = 3;

/// Why a subscription stream stopped being consumed
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Shutdown,
    Closed,
}

/// Decode a `MessageSent` log into a canonical message (without metadata)
pub fn decode_message_sent(log: &Log) -> std::result::Result<Message, RelayError> {
    let decoded = log
        .log_decode::<MessageSent>()
        .map_err(|e| RelayError::Parse(format!("undecodable MessageSent log: {}", e)))?;
    let MessageSent { id, message } = decoded.inner.data;

    let op_type = OpType::try_from(message.opType).map_err(|e| RelayError::Parse(e.to_string()))?;
    let src = ChainId::try_from(message.srcChainId)
        .map_err(|e| RelayError::Parse(format!("srcChainId: {}", e)))?;
    let dest = ChainId::try_from(message.destChainId)
        .map_err(|e| RelayError::Parse(format!("destChainId: {}", e)))?;

    let normalized = Message::new(
        format!("{:#x}", id),
        message.nonce,
        op_type,
        src,
        dest,
        message.destAddress,
        message.contractAddress.to_checksum(None),
        message.tokenId,
    );
    normalized
        .validate()
        .map_err(|e| RelayError::Parse(e.to_string()))?;
    Ok(normalized)
}

/// Push-subscription listener for the bridge contract's `MessageSent` logs
pub struct EvmListener {
    chain: ChainId,
    ws_url: String,
    bridge_address: Address,
    metadata: Arc<dyn MetadataReader>,
    reconnect: RetryConfig,
}

impl EvmListener {
    pub fn new(config: &EvmConfig) -> Result<Self> {
        let bridge_address =
            Address::from_str(&config.bridge_address).wrap_err("Invalid bridge address")?;
        let rpc_url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let reader = Erc721MetadataReader::new(rpc_url, config.ipfs_gateway_url.clone())?;

        Ok(Self::with_metadata_reader(
            config.chain_id,
            config.ws_url.clone(),
            bridge_address,
            Arc::new(reader),
        ))
    }

    pub fn with_metadata_reader(
        chain: ChainId,
        ws_url: String,
        bridge_address: Address,
        metadata: Arc<dyn MetadataReader>,
    ) -> Self {
        Self {
            chain,
            ws_url,
            bridge_address,
            metadata,
            reconnect: RetryConfig {
                max_retries: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Decode the log and, for mints, attach collection info and token metadata
    pub async fn normalize(&self, log: &Log) -> std::result::Result<Message, RelayError> {
        let message = decode_message_sent(log)?;
        if message.src_chain_id() != self.chain {
            return Err(RelayError::Parse(format!(
                "event claims source chain {} on the {} bridge",
                message.src_chain_id(),
                self.chain
            )));
        }
        if message.op_type() != OpType::Mint {
            return Ok(message);
        }

        let contract = Address::from_str(message.contract_address())
            .map_err(|e| RelayError::Parse(format!("contract address: {}", e)))?;
        let token_id = message.token_id();

        let mut attempt = 0;
        loop {
            let resolved = async {
                let collection = self.metadata.collection(contract).await?;
                let metadata = self.metadata.token_metadata(contract, token_id).await?;
                Ok::<_, eyre::Report>((collection, metadata))
            }
            .await;

            match resolved {
                Ok((collection, metadata)) => {
                    return Ok(message
                        .with_collection(collection.name, collection.symbol)
                        .with_metadata(metadata));
                }
                Err(e) if attempt + 1 < METADATA_ATTEMPTS => {
                    let backoff = self.reconnect.backoff_for_attempt(attempt);
                    debug!(
                        message_id = message.id(),
                        attempt,
                        error = %e,
                        "Metadata lookup failed, retrying in {:?}",
                        backoff
                    );
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(RelayError::Parse(format!(
                        "metadata for token {} of {}: {:#}",
                        token_id, contract, e
                    )));
                }
            }
        }
    }

    /// Feed logs from `stream` into the sink until shutdown or the stream ends
    pub(crate) async fn consume<S>(
        &self,
        stream: S,
        sink: &MessageSink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd
    where
        S: Stream<Item = Log>,
    {
        let mut stream = Box::pin(stream);
        loop {
            let log = tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Shutdown,
                next = stream.next() => match next {
                    Some(log) => log,
                    None => return StreamEnd::Closed,
                },
            };

            metrics::record_event_observed(self.chain.name());
            let event_ref = log
                .transaction_hash
                .map(|h| format!("{}:{}", h, log.log_index.unwrap_or_default()))
                .unwrap_or_else(|| "pending".to_string());

            let message = match self.normalize(&log).await {
                Ok(message) => message,
                Err(e) => {
                    report_rejected(self.chain, &event_ref, &e);
                    continue;
                }
            };

            info!(
                message_id = message.id(),
                src_chain = message.src_chain_id().name(),
                dest_chain = message.dest_chain_id().name(),
                op_type = %message.op_type(),
                event = %event_ref,
                "MessageSent observed"
            );

            if sink.deliver(message).await.is_err() {
                info!(chain = self.chain.name(), "Router intake closed, stopping EVM listener");
                return StreamEnd::Shutdown;
            }
        }
    }

    async fn subscribe_and_consume(
        &self,
        sink: &MessageSink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd> {
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .wrap_err("Failed to connect to EVM websocket")?;

        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(MessageSent::SIGNATURE_HASH);

        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .wrap_err("Failed to subscribe to MessageSent logs")?;

        info!(
            chain = self.chain.name(),
            bridge = %self.bridge_address,
            "Subscribed to MessageSent logs"
        );

        Ok(self
            .consume(subscription.into_stream(), sink, shutdown)
            .await)
    }
}

#[async_trait]
impl Listener for EvmListener {
    fn chain_id(&self) -> ChainId {
        self.chain
    }

    async fn run(&self, sink: MessageSink, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.subscribe_and_consume(&sink, &mut shutdown).await {
                Ok(StreamEnd::Shutdown) => return Ok(()),
                Ok(StreamEnd::Closed) => {
                    warn!(chain = self.chain.name(), "Log subscription ended, resubscribing");
                    attempt = 0;
                }
                Err(e) => {
                    metrics::record_error(self.chain.name(), "subscription");
                    warn!(
                        chain = self.chain.name(),
                        attempt,
                        error = %format!("{:#}", e),
                        "EVM subscription failed"
                    );
                }
            }

            let backoff = self.reconnect.backoff_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::evm_bridge::MirageBridge::MessageData;
    use crate::listeners::metadata::CollectionInfo;
    use alloy::primitives::U256;
    use tokio::sync::mpsc;

    struct FixedMetadata;

    #[async_trait]
    impl MetadataReader for FixedMetadata {
        async fn collection(&self, _contract: Address) -> Result<CollectionInfo> {
            Ok(CollectionInfo {
                name: "Apes".to_string(),
                symbol: "APE".to_string(),
            })
        }

        async fn token_metadata(&self, _contract: Address, token_id: U256) -> Result<String> {
            Ok(format!("{{\"token\":{}}}", token_id))
        }
    }

    fn bridge() -> Address {
        Address::repeat_byte(0xb1)
    }

    fn listener() -> EvmListener {
        EvmListener::with_metadata_reader(
            ChainId::Ethereum,
            "ws://localhost:8546".to_string(),
            bridge(),
            Arc::new(FixedMetadata),
        )
    }

    fn sent_log(id: u64, op_type: u8, dest_chain: u64) -> Log {
        let event = MessageSent {
            id: U256::from(id),
            message: MessageData {
                nonce: U256::from(5u64),
                opType: op_type,
                srcChainId: U256::from(1u64),
                destChainId: U256::from(dest_chain),
                destAddress: "aaaaa-aa".to_string(),
                contractAddress: Address::repeat_byte(0x0c),
                tokenId: U256::from(42u64),
            },
        };
        Log {
            inner: alloy::primitives::Log {
                address: bridge(),
                data: event.encode_log_data(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_message_sent() {
        let message = decode_message_sent(&sent_log(1, 2, 2)).unwrap();
        assert_eq!(message.id(), "0x1");
        assert_eq!(message.nonce(), U256::from(5u64));
        assert_eq!(message.op_type(), OpType::Burn);
        assert_eq!(message.dest_chain_id(), ChainId::Icp);
        assert_eq!(message.token_id(), U256::from(42u64));
    }

    #[test]
    fn test_decode_rejects_unknown_destination() {
        let err = decode_message_sent(&sent_log(1, 1, 777)).unwrap_err();
        assert!(matches!(err, RelayError::Parse(_)));
    }

    #[tokio::test]
    async fn test_mint_gets_collection_and_metadata() {
        let message = listener().normalize(&sent_log(3, 1, 2)).await.unwrap();
        assert_eq!(message.collection_name(), "Apes");
        assert_eq!(message.collection_symbol(), "APE");
        assert_eq!(message.metadata(), Some("{\"token\":42}"));
    }

    #[tokio::test]
    async fn test_malformed_log_does_not_stop_consumption() {
        let mut garbage = sent_log(9, 1, 2);
        garbage.inner.data = alloy::primitives::LogData::new_unchecked(
            vec![MessageSent::SIGNATURE_HASH],
            vec![0xde, 0xad].into(),
        );
        let logs = vec![garbage, sent_log(10, 2, 2)];

        let (tx, mut rx) = mpsc::channel(4);
        let sink = MessageSink::new(ChainId::Ethereum, tx);
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let end = listener()
            .consume(futures::stream::iter(logs), &sink, &mut stop_rx)
            .await;
        assert_eq!(end, StreamEnd::Closed);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.id(), "0xa");
        assert!(rx.try_recv().is_err());
    }
}
