//! EVM bridge and NFT contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Bridge contract: emits outbound messages and executes inbound ones
    #[sol(rpc)]
    contract MirageBridge {
        /// Payload of an outbound message as emitted on the source chain
        struct MessageData {
            uint256 nonce;
            uint8 opType;
            uint256 srcChainId;
            uint256 destChainId;
            string destAddress;
            address contractAddress;
            uint256 tokenId;
        }

        /// Inbound message as accepted by `executeMessage`.
        /// `contractAddress` is a string because ICP-originated messages carry
        /// a principal there.
        struct ExecuteMessage {
            string id;
            string nonce;
            uint8 opType;
            uint256 srcChainId;
            uint256 destChainId;
            string destAddress;
            string contractAddress;
            uint256 tokenId;
        }

        event MessageSent(uint256 indexed id, MessageData message);

        error MessageNotExecuted(string reason);

        function executeMessage(ExecuteMessage message) external;
    }

    /// ERC-721 metadata extension, read for collection info on mint
    #[sol(rpc)]
    contract IERC721Metadata {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function tokenURI(uint256 tokenId) external view returns (string);
    }
}
