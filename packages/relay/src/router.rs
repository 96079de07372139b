//! Dispatch of canonical messages to destination execution queues.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::db::MessageStore;
use crate::error::RelayError;
use crate::executors::QueueHandle;
use crate::metrics;
use crate::types::{ChainId, Message, MessageState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the destination queue
    Dispatched,
    /// The id was seen before; nothing executed
    Duplicate,
    /// No plugin owns the destination chain
    NotFound,
    /// Could not be claimed or enqueued; left for recovery or dropped
    Rejected,
}

pub struct Router {
    routes: HashMap<ChainId, QueueHandle>,
    store: Arc<dyn MessageStore>,
}

impl Router {
    pub fn new(routes: HashMap<ChainId, QueueHandle>, store: Arc<dyn MessageStore>) -> Self {
        Self { routes, store }
    }

    pub fn destinations(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.routes.keys().copied()
    }

    pub async fn route_message(&self, message: Message) -> RouteOutcome {
        match self.store.claim(&message).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    message_id = message.id(),
                    src_chain = message.src_chain_id().name(),
                    "Duplicate message id for source chain, ignoring"
                );
                metrics::record_dropped("duplicate");
                return RouteOutcome::Duplicate;
            }
            Err(e) => {
                error!(
                    message_id = message.id(),
                    src_chain = message.src_chain_id().name(),
                    dest_chain = message.dest_chain_id().name(),
                    error_kind = "store_error",
                    error = %e,
                    "Failed to claim message id, dropping"
                );
                metrics::record_dropped("store_error");
                return RouteOutcome::Rejected;
            }
        }

        self.dispatch(message).await
    }

    /// Look up the destination queue and hand the message over. The message
    /// must already be claimed.
    async fn dispatch(&self, message: Message) -> RouteOutcome {
        let dest = message.dest_chain_id();
        let Some(queue) = self.routes.get(&dest) else {
            let err = RelayError::RouteNotFound { dest };
            warn!(
                message_id = message.id(),
                src_chain = message.src_chain_id().name(),
                dest_chain = dest.name(),
                error_kind = %err.kind(),
                "No plugin registered for destination chain, dropping message"
            );
            if let Err(e) = self
                .store
                .record(&message.key(), MessageState::Failed, Some(&err))
                .await
            {
                error!(message_id = message.id(), error = %e, "Failed to record unroutable message");
            }
            metrics::record_dropped(err.kind().as_str());
            return RouteOutcome::NotFound;
        };

        if let Err(e) = self
            .store
            .record(&message.key(), MessageState::Routed, None)
            .await
        {
            error!(message_id = message.id(), error = %e, "Failed to record routing");
        }

        let src = message.src_chain_id();
        let id = message.id().to_string();
        match queue.enqueue(message).await {
            Ok(()) => {
                metrics::record_routed(src.name(), dest.name());
                debug!(message_id = %id, dest_chain = dest.name(), "Message routed");
                RouteOutcome::Dispatched
            }
            Err(e) => {
                warn!(
                    message_id = %id,
                    src_chain = src.name(),
                    dest_chain = dest.name(),
                    error = %e,
                    "Destination queue closed; message left for recovery"
                );
                RouteOutcome::Rejected
            }
        }
    }

    /// Re-dispatch messages a previous run left unfinished. Messages already
    /// submitted are in doubt and only reported.
    pub async fn recover(&self) -> eyre::Result<usize> {
        let pending = self.store.unfinished().await?;
        let mut requeued = 0;
        let mut in_doubt = Vec::new();

        for (message, state) in pending {
            match state {
                MessageState::Normalized | MessageState::Routed => {
                    if self.dispatch(message).await == RouteOutcome::Dispatched {
                        requeued += 1;
                    }
                }
                MessageState::Submitted => in_doubt.push(message.key().to_string()),
                _ => {}
            }
        }

        if !in_doubt.is_empty() {
            warn!(
                count = in_doubt.len(),
                ids = ?in_doubt,
                "Messages were submitted before the last shutdown without a recorded outcome; \
                 check the destination chain before resubmitting"
            );
        }
        if requeued > 0 {
            info!(count = requeued, "Recovered unfinished messages");
        }
        Ok(requeued)
    }

    /// Consume the shared intake until shutdown or until every sender is gone.
    /// On shutdown the intake is closed and whatever is already buffered is
    /// still routed.
    pub async fn run(&self, mut intake: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
        info!(destinations = self.routes.len(), "Router started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = intake.recv() => match next {
                    Some(message) => {
                        self.route_message(message).await;
                    }
                    None => {
                        info!("All listeners disconnected, router stopping");
                        return;
                    }
                },
            }
        }

        intake.close();
        let mut drained = 0usize;
        while let Some(message) = intake.recv().await {
            self.route_message(message).await;
            drained += 1;
        }
        info!(drained, "Router stopped");
    }
}
