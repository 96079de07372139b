//! Candid types of the ICP bridge canister's `execute_message` endpoint.

use candid::CandidType;
use serde::Deserialize;

pub const EXECUTE_MESSAGE_METHOD: &str = "execute_message";

/// Canister-side message record. Integers are the canister's fixed widths;
/// conversion from the canonical message is checked, never truncated.
#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub struct CanisterMessage {
    pub id: String,
    pub nonce: u64,
    pub op_type: u8,
    pub src_chain_id: u64,
    pub dest_chain_id: u64,
    pub dest_address: String,
    pub contract_address: String,
    pub collection_name: String,
    pub collection_symbol: String,
    pub token_id: u64,
    pub token_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub enum ExecuteError {
    MessageNotExecuted(String),
}

pub type ExecuteResult = Result<(), ExecuteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use candid::{Decode, Encode};

    #[test]
    fn test_execute_result_decodes_err_variant() {
        let reply: ExecuteResult = Err(ExecuteError::MessageNotExecuted("already minted".into()));
        let bytes = Encode!(&reply).unwrap();
        let decoded = Decode!(&bytes, ExecuteResult).unwrap();
        assert_eq!(
            decoded,
            Err(ExecuteError::MessageNotExecuted("already minted".into()))
        );
    }
}
