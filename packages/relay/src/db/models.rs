use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;

use crate::codec::parse_u256;
use crate::types::{ChainId, Message, MessageState, OpType, StateRecord};

// Note: nonce and token_id are NUMERIC(78,0) in the database. Inserts cast the
// decimal text ($n::NUMERIC) and selects cast back to TEXT, so no bigdecimal
// type is involved on the Rust side.

/// Message payload joined with its latest state
#[derive(Debug, Clone, FromRow)]
pub struct PendingMessageRow {
    pub id: String,
    pub nonce: String,
    pub op_type: i16,
    pub src_chain_id: i64,
    pub dest_chain_id: i64,
    pub dest_address: String,
    pub contract_address: String,
    pub token_id: String,
    pub collection_name: String,
    pub collection_symbol: String,
    pub metadata: Option<String>,
    pub state: String,
}

impl PendingMessageRow {
    pub fn into_message(self) -> Result<(Message, MessageState)> {
        let op_type = u8::try_from(self.op_type)
            .ok()
            .and_then(|v| OpType::try_from(v).ok())
            .ok_or_else(|| eyre!("message {} has invalid op_type {}", self.id, self.op_type))?;
        let src = chain_from_column(&self.id, self.src_chain_id)?;
        let dest = chain_from_column(&self.id, self.dest_chain_id)?;
        let nonce = parse_u256(&self.nonce).map_err(|e| eyre!(e))?;
        let token_id = parse_u256(&self.token_id).map_err(|e| eyre!(e))?;
        let state = self
            .state
            .parse::<MessageState>()
            .map_err(|e| eyre!(e))?;

        let mut message = Message::new(
            self.id,
            nonce,
            op_type,
            src,
            dest,
            self.dest_address,
            self.contract_address,
            token_id,
        )
        .with_collection(self.collection_name, self.collection_symbol);
        if let Some(metadata) = self.metadata {
            message = message.with_metadata(metadata);
        }
        Ok((message, state))
    }
}

fn chain_from_column(message_id: &str, raw: i64) -> Result<ChainId> {
    u64::try_from(raw)
        .wrap_err_with(|| format!("message {} has negative chain id {}", message_id, raw))
        .and_then(|v| ChainId::try_from(v).wrap_err_with(|| format!("message {}", message_id)))
}

/// Row of the append-only state history
#[derive(Debug, Clone, FromRow)]
pub struct StateRow {
    pub src_chain_id: i64,
    pub message_id: String,
    pub state: String,
    pub error_kind: Option<String>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<StateRow> for StateRecord {
    type Error = eyre::Report;

    fn try_from(row: StateRow) -> Result<Self> {
        Ok(StateRecord {
            src_chain_id: chain_from_column(&row.message_id, row.src_chain_id)?,
            state: row.state.parse().map_err(|e: String| eyre!(e))?,
            error_kind: row
                .error_kind
                .map(|k| k.parse())
                .transpose()
                .map_err(|e: String| eyre!(e))?,
            message_id: row.message_id,
            detail: row.detail,
            recorded_at: row.recorded_at,
        })
    }
}
