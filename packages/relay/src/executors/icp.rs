use async_trait::async_trait;
use candid::{Decode, Encode, Principal};
use eyre::{eyre, Result, WrapErr};
use ic_agent::agent::CallResponse;
use ic_agent::identity::Secp256k1Identity;
use ic_agent::{Agent, AgentError};
use std::future::Future;
use tracing::{debug, info, warn};

use super::retry::submission_error;
use super::Executor;
use crate::codec::narrow;
use crate::config::IcpConfig;
use crate::contracts::icp_bridge::{
    CanisterMessage, ExecuteError, ExecuteResult, EXECUTE_MESSAGE_METHOD,
};
use crate::error::RelayError;
use crate::types::{ChainId, Message, Receipt};

/// `agent.wait` rounds for an accepted request before it is in doubt
const WAIT_ATTEMPTS: u32 = 3;

/// Calls the bridge canister's `execute_message` through an authenticated agent
pub struct IcpExecutor {
    chain: ChainId,
    agent: Agent,
    canister_id: Principal,
}

/// Parse a hex secp256k1 secret key (with or without 0x)
fn secret_key_from_hex(raw: &str) -> Result<k256::SecretKey> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .wrap_err("ICP executor secret key is not hex")?;
    k256::SecretKey::from_slice(&bytes).map_err(|_| eyre!("ICP executor secret key is invalid"))
}

fn is_reject(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::CertifiedReject(_) | AgentError::UncertifiedReject(_)
    )
}

/// A canister or replica reject is final unless it names the caller
fn reject_error(err: &AgentError) -> RelayError {
    let text = format!("execute_message rejected: {}", err);
    match submission_error(&text) {
        RelayError::Auth(reason) => RelayError::Auth(reason),
        _ => RelayError::permanent(text),
    }
}

fn call_error(err: AgentError) -> RelayError {
    if is_reject(&err) {
        reject_error(&err)
    } else {
        submission_error(&format!("execute_message call failed: {}", err))
    }
}

/// Wait on an accepted request until it replies. `wait` re-polls the same
/// request id; the call itself is never sent again.
async fn await_reply<F, Fut>(
    reference: &str,
    attempts: u32,
    mut wait: F,
) -> Result<Vec<u8>, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, AgentError>>,
{
    let mut last_error = "no reply".to_string();
    for attempt in 0..attempts {
        match wait().await {
            Ok(reply) => return Ok(reply),
            Err(e) if is_reject(&e) => return Err(reject_error(&e)),
            Err(e) => {
                warn!(
                    request_id = reference,
                    attempt = attempt + 1,
                    error = %e,
                    "Waiting for execute_message reply failed"
                );
                last_error = e.to_string();
            }
        }
    }
    Err(RelayError::in_doubt(reference, last_error))
}

impl IcpExecutor {
    pub async fn connect(config: &IcpConfig) -> Result<Self> {
        let canister_id = Principal::from_text(&config.canister_id)
            .map_err(|e| eyre!("Invalid ICP canister id {}: {}", config.canister_id, e))?;
        let identity = Secp256k1Identity::from_private_key(secret_key_from_hex(&config.secret_key)?);

        let agent = Agent::builder()
            .with_url(config.host_url.as_str())
            .with_identity(identity)
            .build()
            .wrap_err("Failed to build ICP agent")?;

        if config.fetch_root_key {
            agent
                .fetch_root_key()
                .await
                .wrap_err("Failed to fetch ICP root key")?;
        }

        let principal = agent
            .get_principal()
            .map_err(|e| eyre!("ICP identity has no principal: {}", e))?;
        info!(
            executor_principal = %principal,
            canister_id = %canister_id,
            host = %config.host_url,
            "ICP executor initialized"
        );

        Ok(Self {
            chain: config.chain_id,
            agent,
            canister_id,
        })
    }

    /// Canister record with checked narrowing of every integer field
    pub fn encode(message: &Message) -> Result<CanisterMessage, RelayError> {
        Ok(CanisterMessage {
            id: message.id().to_string(),
            nonce: narrow("nonce", message.nonce())?,
            op_type: message.op_type().as_u8(),
            src_chain_id: message.src_chain_id().as_u64(),
            dest_chain_id: message.dest_chain_id().as_u64(),
            dest_address: message.dest_address().to_string(),
            contract_address: message.contract_address().to_string(),
            collection_name: message.collection_name().to_string(),
            collection_symbol: message.collection_symbol().to_string(),
            token_id: narrow("token_id", message.token_id())?,
            token_metadata: message.metadata().unwrap_or_default().to_string(),
        })
    }

    /// Map the canister's reply onto the relay's result
    pub fn interpret_reply(reply: &[u8]) -> Result<(), RelayError> {
        let result = Decode!(reply, ExecuteResult)
            .map_err(|e| RelayError::permanent(format!("undecodable canister reply: {}", e)))?;
        match result {
            Ok(()) => Ok(()),
            Err(ExecuteError::MessageNotExecuted(reason)) => Err(RelayError::permanent(format!(
                "MessageNotExecuted: {}",
                reason
            ))),
        }
    }
}

#[async_trait]
impl Executor for IcpExecutor {
    fn chain_id(&self) -> ChainId {
        self.chain
    }

    async fn execute(&self, message: &Message) -> Result<Receipt, RelayError> {
        let record = Self::encode(message)?;
        let arg = Encode!(&record)
            .map_err(|e| RelayError::permanent(format!("candid encoding failed: {}", e)))?;

        debug!(
            message_id = message.id(),
            canister_id = %self.canister_id,
            "Calling execute_message"
        );

        let response = self
            .agent
            .update(&self.canister_id, EXECUTE_MESSAGE_METHOD)
            .with_arg(arg)
            .call()
            .await
            .map_err(call_error)?;

        let reply = match response {
            CallResponse::Response((reply, _certificate)) => reply,
            CallResponse::Poll(request_id) => {
                let reference = request_id.to_string();
                debug!(
                    message_id = message.id(),
                    request_id = %reference,
                    "execute_message accepted, awaiting reply"
                );
                let agent = &self.agent;
                let canister_id = self.canister_id;
                let request_id = &request_id;
                let wait = move || async move {
                    agent
                        .wait(request_id, canister_id)
                        .await
                        .map(|(reply, _certificate)| reply)
                };
                await_reply(&reference, WAIT_ATTEMPTS, wait).await?
            }
        };

        Self::interpret_reply(&reply)?;

        Ok(Receipt {
            reference: format!("{}:{}", self.canister_id, message.id()),
        })
    }
}
