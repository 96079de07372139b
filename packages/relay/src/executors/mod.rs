//! Destination-side submission.
//!
//! An executor re-encodes a canonical message for its chain and submits it.
//! Each executor sits behind its own [`ExecutionQueue`], which serializes
//! submissions and owns retry, halt, and state recording.

use async_trait::async_trait;

use crate::error::RelayError;
use crate::types::{ChainId, Message, Receipt};

pub mod evm;
pub mod icp;
pub mod queue;
pub mod retry;

pub use evm::EvmExecutor;
pub use icp::IcpExecutor;
pub use queue::{CircuitBreakerConfig, ExecutionQueue, QueueConfig, QueueHandle, QueueHealth};
pub use retry::{classify_error, RetryConfig};

#[async_trait]
pub trait Executor: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Submit one message and wait for the destination's acknowledgment.
    /// Errors carry their retry classification.
    async fn execute(&self, message: &Message) -> Result<Receipt, RelayError>;
}
