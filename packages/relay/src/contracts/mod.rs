//! Chain-side interface declarations the relay talks to.

pub mod evm_bridge;
pub mod icp_bridge;
