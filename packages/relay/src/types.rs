//! Canonical message model shared by every listener and executor.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec;
use crate::error::ErrorKind;

/// Chain identifier, encoded as the same bare number on every wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum ChainId {
    Ethereum,
    Icp,
    Localhost,
}

impl ChainId {
    pub const ALL: [ChainId; 3] = [ChainId::Ethereum, ChainId::Icp, ChainId::Localhost];

    pub const fn as_u64(self) -> u64 {
        match self {
            ChainId::Ethereum => 1,
            ChainId::Icp => 2,
            ChainId::Localhost => 31337,
        }
    }

    pub fn from_u64(value: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_u64() == value)
    }

    /// Label used in logs and metric labels
    pub const fn name(self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Icp => "icp",
            ChainId::Localhost => "localhost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chain id {0}")]
pub struct UnknownChainId(pub String);

impl TryFrom<u64> for ChainId {
    type Error = UnknownChainId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_u64(value).ok_or_else(|| UnknownChainId(value.to_string()))
    }
}

impl TryFrom<U256> for ChainId {
    type Error = UnknownChainId;

    fn try_from(value: U256) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .ok()
            .and_then(Self::from_u64)
            .ok_or_else(|| UnknownChainId(value.to_string()))
    }
}

impl From<ChainId> for u64 {
    fn from(chain: ChainId) -> u64 {
        chain.as_u64()
    }
}

/// Accepts either the numeric id or the chain name.
impl FromStr for ChainId {
    type Err = UnknownChainId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<u64>() {
            return Self::try_from(n);
        }
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownChainId(trimmed.to_string()))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u64())
    }
}

/// Action requested on the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OpType {
    Mint,
    Burn,
}

impl OpType {
    pub const fn as_u8(self) -> u8 {
        match self {
            OpType::Mint => 1,
            OpType::Burn => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown op type {0}")]
pub struct UnknownOpType(pub u8);

impl TryFrom<u8> for OpType {
    type Error = UnknownOpType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpType::Mint),
            2 => Ok(OpType::Burn),
            other => Err(UnknownOpType(other)),
        }
    }
}

impl From<OpType> for u8 {
    fn from(op: OpType) -> u8 {
        op.as_u8()
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpType::Mint => write!(f, "mint"),
            OpType::Burn => write!(f, "burn"),
        }
    }
}

/// Chain-agnostic cross-chain message.
///
/// Built once by a listener and never mutated afterwards; executors derive
/// their chain-native encodings from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(with = "codec::u256_dec")]
    nonce: U256,
    op_type: OpType,
    src_chain_id: ChainId,
    dest_chain_id: ChainId,
    dest_address: String,
    contract_address: String,
    #[serde(with = "codec::u256_dec")]
    token_id: U256,
    #[serde(default)]
    collection_name: String,
    #[serde(default)]
    collection_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("message id is empty")]
    EmptyId,
    #[error("destination address is empty")]
    EmptyDestination,
    #[error("source and destination chain are both {0}")]
    SameChain(ChainId),
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        nonce: U256,
        op_type: OpType,
        src_chain_id: ChainId,
        dest_chain_id: ChainId,
        dest_address: impl Into<String>,
        contract_address: impl Into<String>,
        token_id: U256,
    ) -> Self {
        Self {
            id: id.into(),
            nonce,
            op_type,
            src_chain_id,
            dest_chain_id,
            dest_address: dest_address.into(),
            contract_address: contract_address.into(),
            token_id,
            collection_name: String::new(),
            collection_symbol: String::new(),
            metadata: None,
        }
    }

    pub fn with_collection(mut self, name: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self.collection_symbol = symbol.into();
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Structural checks every listener applies before handing a message on
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        if self.id.trim().is_empty() {
            return Err(InvalidMessage::EmptyId);
        }
        if self.dest_address.trim().is_empty() {
            return Err(InvalidMessage::EmptyDestination);
        }
        if self.src_chain_id == self.dest_chain_id {
            return Err(InvalidMessage::SameChain(self.src_chain_id));
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.src_chain_id, self.id.clone())
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn src_chain_id(&self) -> ChainId {
        self.src_chain_id
    }

    pub fn dest_chain_id(&self) -> ChainId {
        self.dest_chain_id
    }

    pub fn dest_address(&self) -> &str {
        &self.dest_address
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    pub fn token_id(&self) -> U256 {
        self.token_id
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn collection_symbol(&self) -> &str {
        &self.collection_symbol
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }
}

/// Lifecycle of a message inside the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Observed,
    Normalized,
    Routed,
    Submitted,
    Confirmed,
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Observed => "observed",
            MessageState::Normalized => "normalized",
            MessageState::Routed => "routed",
            MessageState::Submitted => "submitted",
            MessageState::Confirmed => "confirmed",
            MessageState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Confirmed | MessageState::Failed)
    }
}

impl FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(MessageState::Observed),
            "normalized" => Ok(MessageState::Normalized),
            "routed" => Ok(MessageState::Routed),
            "submitted" => Ok(MessageState::Submitted),
            "confirmed" => Ok(MessageState::Confirmed),
            "failed" => Ok(MessageState::Failed),
            _ => Err(format!("Invalid message state: {}", s)),
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a message in the log. Ids are only unique per source chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageKey {
    pub src_chain_id: ChainId,
    pub id: String,
}

impl MessageKey {
    pub fn new(src_chain_id: ChainId, id: impl Into<String>) -> Self {
        Self {
            src_chain_id,
            id: id.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.src_chain_id.name(), self.id)
    }
}

/// One row of the append-only message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRecord {
    pub src_chain_id: ChainId,
    pub message_id: String,
    pub state: MessageState,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Destination-chain acknowledgment of an executed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Transaction hash (EVM) or canister call reference (ICP)
    pub reference: String,
}
