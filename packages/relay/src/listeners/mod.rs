//! Source-side event intake.
//!
//! A listener owns one chain-native event source and turns what it sees into
//! canonical [`Message`]s, handing them to the router through a [`MessageSink`].

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::error::RelayError;
use crate::metrics;
use crate::types::{ChainId, Message};

pub mod evm;
pub mod icp;
pub mod metadata;

pub use evm::EvmListener;
pub use icp::IcpListener;

#[async_trait]
pub trait Listener: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Run until `shutdown` flips to true. Per-event failures must be handled
    /// inside; an `Err` means the event source itself is gone.
    async fn run(&self, sink: MessageSink, shutdown: watch::Receiver<bool>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("router intake is closed")]
pub struct IntakeClosed;

/// Sending half of the shared router intake, tagged with the source chain
#[derive(Debug, Clone)]
pub struct MessageSink {
    chain: ChainId,
    tx: mpsc::Sender<Message>,
}

impl MessageSink {
    pub fn new(chain: ChainId, tx: mpsc::Sender<Message>) -> Self {
        Self { chain, tx }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain
    }

    /// Waits for intake capacity
    pub async fn deliver(&self, message: Message) -> std::result::Result<(), IntakeClosed> {
        self.tx.send(message).await.map_err(|_| IntakeClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Log and count an event that could not become a message
pub(crate) fn report_rejected(chain: ChainId, event_ref: &str, err: &RelayError) {
    metrics::record_event_rejected(chain.name());
    warn!(
        src_chain = chain.name(),
        event = event_ref,
        error_kind = %err.kind(),
        error = %err,
        "Dropping event that could not be parsed"
    );
}
