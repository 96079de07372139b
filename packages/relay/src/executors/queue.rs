//! Per-destination execution queue.
//!
//! One bounded channel and one consumer task per destination chain, so
//! submissions to a chain happen strictly in routed order.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::retry::RetryConfig;
use super::Executor;
use crate::db::MessageStore;
use crate::error::RelayError;
use crate::metrics;
use crate::types::{ChainId, Message, MessageState};

/// Circuit breaker configuration for execution queues
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed messages before pausing
    pub threshold: u32,
    /// How long to pause when circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300), // 5 minutes
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Live counters for one queue, shared with the operations API
#[derive(Debug)]
pub struct QueueHealth {
    chain: ChainId,
    halted: AtomicBool,
    paused: AtomicBool,
    depth: AtomicUsize,
    consecutive_failures: AtomicU32,
    confirmed: AtomicU64,
    failed: AtomicU64,
    in_doubt: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub chain: &'static str,
    pub chain_id: u64,
    pub halted: bool,
    pub paused: bool,
    pub depth: usize,
    pub consecutive_failures: u32,
    pub confirmed: u64,
    pub failed: u64,
    pub in_doubt: u64,
}

impl QueueHealth {
    fn new(chain: ChainId) -> Self {
        Self {
            chain,
            halted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            confirmed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_doubt: AtomicU64::new(0),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> QueueStatus {
        QueueStatus {
            chain: self.chain.name(),
            chain_id: self.chain.as_u64(),
            halted: self.halted.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            depth: self.depth.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            confirmed: self.confirmed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            in_doubt: self.in_doubt.load(Ordering::SeqCst),
        }
    }

    fn set_depth_metric(&self) {
        metrics::set_queue_depth(self.chain.name(), self.depth.load(Ordering::SeqCst));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("execution queue for {0} is closed")]
pub struct QueueClosed(pub ChainId);

/// Sending side of a queue; cloned into the router
#[derive(Clone)]
pub struct QueueHandle {
    chain: ChainId,
    tx: mpsc::Sender<Message>,
    health: Arc<QueueHealth>,
}

impl QueueHandle {
    pub fn chain_id(&self) -> ChainId {
        self.chain
    }

    pub fn health(&self) -> Arc<QueueHealth> {
        self.health.clone()
    }

    /// Waits while the queue is full. Dropping the future while it waits
    /// leaves the queue untouched.
    pub async fn enqueue(&self, message: Message) -> Result<(), QueueClosed> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| QueueClosed(self.chain))?;
        self.health.depth.fetch_add(1, Ordering::SeqCst);
        permit.send(message);
        self.health.set_depth_metric();
        Ok(())
    }
}

/// A running queue: its handle plus the consumer task
pub struct ExecutionQueue {
    handle: QueueHandle,
    worker: JoinHandle<()>,
}

impl ExecutionQueue {
    pub fn spawn(
        executor: Arc<dyn Executor>,
        store: Arc<dyn MessageStore>,
        config: QueueConfig,
    ) -> Self {
        let chain = executor.chain_id();
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let health = Arc::new(QueueHealth::new(chain));
        metrics::set_executor_halted(chain.name(), false);

        let worker = QueueWorker {
            chain,
            executor,
            store,
            retry: config.retry,
            circuit_breaker: config.circuit_breaker,
            health: health.clone(),
            halt_reason: None,
        };
        let worker = tokio::spawn(worker.run(rx));

        Self {
            handle: QueueHandle { chain, tx, health },
            worker,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn chain_id(&self) -> ChainId {
        self.handle.chain
    }

    /// Close this queue's sender and wait for the worker to drain, aborting it
    /// at `deadline`. Other handle clones must be dropped first for the drain
    /// to finish on its own.
    pub async fn shutdown(self, deadline: Instant) {
        let chain = self.handle.chain;
        drop(self.handle);

        let mut worker = self.worker;
        match tokio::time::timeout_at(deadline, &mut worker).await {
            Ok(Ok(())) => info!(chain = chain.name(), "Execution queue drained"),
            Ok(Err(e)) => error!(chain = chain.name(), error = %e, "Execution queue task failed"),
            Err(_) => {
                warn!(
                    chain = chain.name(),
                    "Execution queue did not drain before the deadline, aborting"
                );
                worker.abort();
            }
        }
    }
}

struct QueueWorker {
    chain: ChainId,
    executor: Arc<dyn Executor>,
    store: Arc<dyn MessageStore>,
    retry: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    health: Arc<QueueHealth>,
    halt_reason: Option<String>,
}

impl QueueWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        info!(chain = self.chain.name(), "Execution queue started");

        while let Some(message) = rx.recv().await {
            self.health.depth.fetch_sub(1, Ordering::SeqCst);
            self.health.set_depth_metric();

            if let Some(reason) = &self.halt_reason {
                let err = RelayError::Auth(format!("executor halted: {}", reason));
                self.finish_failed(&message, &err).await;
                continue;
            }

            self.check_circuit_breaker().await;
            self.process(message).await;
        }

        info!(chain = self.chain.name(), "Execution queue closed");
    }

    async fn check_circuit_breaker(&self) {
        let failures = self.health.consecutive_failures.load(Ordering::SeqCst);
        if failures < self.circuit_breaker.threshold {
            return;
        }
        warn!(
            chain = self.chain.name(),
            failures,
            pause_secs = self.circuit_breaker.pause_duration.as_secs(),
            "Circuit breaker tripped, pausing execution queue"
        );
        self.health.paused.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.circuit_breaker.pause_duration).await;
        self.health.paused.store(false, Ordering::SeqCst);
        self.health.consecutive_failures.store(0, Ordering::SeqCst);
        metrics::set_consecutive_failures(self.chain.name(), 0);
    }

    async fn process(&mut self, message: Message) {
        let started = Instant::now();

        if let Err(e) = self
            .store
            .record(&message.key(), MessageState::Submitted, None)
            .await
        {
            // Not submitted; the message stays Routed and is picked up on restart
            error!(
                message_id = message.id(),
                dest_chain = self.chain.name(),
                error_kind = "store_error",
                error = %e,
                "Failed to record submission, skipping message"
            );
            metrics::record_error(self.chain.name(), "store");
            return;
        }

        let mut attempt = 0u32;
        let outcome = loop {
            match self.executor.execute(&message).await {
                Ok(receipt) => break Ok(receipt),
                Err(err) => match self.retry.next_delay(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            message_id = message.id(),
                            dest_chain = self.chain.name(),
                            attempt = attempt + 1,
                            max = self.retry.max_retries,
                            ?delay,
                            error = %err,
                            "Retryable submission failure"
                        );
                        metrics::record_retry(self.chain.name());
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(err),
                },
            }
        };

        metrics::record_latency(self.chain.name(), started.elapsed().as_secs_f64());

        match outcome {
            Ok(receipt) => {
                if let Err(e) = self
                    .store
                    .record(&message.key(), MessageState::Confirmed, None)
                    .await
                {
                    error!(message_id = message.id(), error = %e, "Failed to record confirmation");
                }
                self.health.confirmed.fetch_add(1, Ordering::SeqCst);
                self.health.consecutive_failures.store(0, Ordering::SeqCst);
                metrics::set_consecutive_failures(self.chain.name(), 0);
                metrics::record_submission(self.chain.name(), true);
                info!(
                    message_id = message.id(),
                    src_chain = message.src_chain_id().name(),
                    dest_chain = self.chain.name(),
                    reference = %receipt.reference,
                    attempts = attempt + 1,
                    "Message confirmed"
                );
            }
            Err(err @ RelayError::InDoubt { .. }) => self.leave_in_doubt(&message, &err).await,
            Err(err) => {
                if let RelayError::Auth(reason) = &err {
                    error!(
                        dest_chain = self.chain.name(),
                        error_kind = %err.kind(),
                        reason = %reason,
                        "Executor credential rejected, halting queue"
                    );
                    self.halt_reason = Some(reason.clone());
                    self.health.halted.store(true, Ordering::SeqCst);
                    metrics::set_executor_halted(self.chain.name(), true);
                } else {
                    let failures = self.health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    metrics::set_consecutive_failures(self.chain.name(), failures);
                }
                self.finish_failed(&message, &err).await;
            }
        }
    }

    /// The destination may have executed the message. It stays Submitted,
    /// with the tx hash or request id attached, for an operator to resolve.
    async fn leave_in_doubt(&self, message: &Message, err: &RelayError) {
        if let Err(e) = self
            .store
            .record(&message.key(), MessageState::Submitted, Some(err))
            .await
        {
            error!(message_id = message.id(), error = %e, "Failed to record in-doubt submission");
        }
        self.health.in_doubt.fetch_add(1, Ordering::SeqCst);
        metrics::record_error(self.chain.name(), err.kind().as_str());
        warn!(
            message_id = message.id(),
            src_chain = message.src_chain_id().name(),
            dest_chain = self.chain.name(),
            error_kind = %err.kind(),
            error = %err,
            "Submission outcome unknown, not resubmitting"
        );
    }

    async fn finish_failed(&self, message: &Message, err: &RelayError) {
        if let Err(e) = self
            .store
            .record(&message.key(), MessageState::Failed, Some(err))
            .await
        {
            error!(message_id = message.id(), error = %e, "Failed to record failure");
        }
        self.health.failed.fetch_add(1, Ordering::SeqCst);
        metrics::record_submission(self.chain.name(), false);
        metrics::record_error(self.chain.name(), err.kind().as_str());
        warn!(
            message_id = message.id(),
            src_chain = message.src_chain_id().name(),
            dest_chain = message.dest_chain_id().name(),
            error_kind = %err.kind(),
            error = %err,
            "Message failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryMessageStore;
    use crate::error::ErrorKind;
    use crate::types::{MessageKey, OpType, Receipt};
    use alloy::primitives::U256;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Plays back scripted results, then succeeds
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<Receipt, RelayError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<Receipt, RelayError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn chain_id(&self) -> ChainId {
            ChainId::Icp
        }

        async fn execute(&self, message: &Message) -> Result<Receipt, RelayError> {
            self.calls.lock().unwrap().push(message.id().to_string());
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(Receipt {
                    reference: format!("ok-{}", message.id()),
                })
            })
        }
    }

    /// Blocks every call until a permit is released; `None` never returns
    struct GatedExecutor {
        gate: Option<Arc<Semaphore>>,
        calls: AtomicUsize,
    }

    impl GatedExecutor {
        fn new(gate: Option<Arc<Semaphore>>) -> Arc<Self> {
            Arc::new(Self {
                gate,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Executor for GatedExecutor {
        fn chain_id(&self) -> ChainId {
            ChainId::Icp
        }

        async fn execute(&self, message: &Message) -> Result<Receipt, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.gate {
                Some(gate) => {
                    let permit = gate.acquire().await;
                    drop(permit);
                }
                None => std::future::pending::<()>().await,
            }
            Ok(Receipt {
                reference: format!("ok-{}", message.id()),
            })
        }
    }

    fn key(id: &str) -> MessageKey {
        MessageKey::new(ChainId::Ethereum, id)
    }

    fn message(id: &str) -> Message {
        Message::new(
            id,
            U256::from(1u64),
            OpType::Mint,
            ChainId::Ethereum,
            ChainId::Icp,
            "aaaaa-aa",
            "0x0000000000000000000000000000000000000abc",
            U256::from(42u64),
        )
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            capacity: 8,
            retry: RetryConfig::new(3, Duration::from_millis(5)),
            circuit_breaker: CircuitBreakerConfig {
                threshold: 100,
                pause_duration: Duration::from_millis(1),
            },
        }
    }

    async fn run_to_completion(
        executor: Arc<ScriptedExecutor>,
        store: Arc<MemoryMessageStore>,
        ids: &[&str],
    ) -> Arc<QueueHealth> {
        let queue = ExecutionQueue::spawn(executor, store.clone(), fast_config());
        let handle = queue.handle();
        for id in ids {
            store.claim(&message(id)).await.unwrap();
            handle.enqueue(message(id)).await.unwrap();
        }
        let health = handle.health();
        drop(handle);
        queue
            .shutdown(Instant::now() + Duration::from_secs(5))
            .await;
        health
    }

    #[tokio::test]
    async fn test_processes_in_order_and_confirms_once() {
        let executor = ScriptedExecutor::new(vec![]);
        let store = Arc::new(MemoryMessageStore::new());

        let health = run_to_completion(executor.clone(), store.clone(), &["a", "b", "c"]).await;

        assert_eq!(executor.calls(), vec!["a", "b", "c"]);
        assert_eq!(store.count_state(MessageState::Confirmed), 3);
        assert_eq!(health.snapshot().confirmed, 3);
        assert_eq!(health.snapshot().depth, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let executor = ScriptedExecutor::new(vec![Err(RelayError::transient("connection reset"))]);
        let store = Arc::new(MemoryMessageStore::new());

        run_to_completion(executor.clone(), store.clone(), &["a"]).await;

        assert_eq!(executor.calls(), vec!["a", "a"]);
        let states: Vec<_> = store
            .history(&key("a"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect();
        assert_eq!(
            states,
            vec![
                MessageState::Normalized,
                MessageState::Submitted,
                MessageState::Confirmed
            ]
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let executor = ScriptedExecutor::new(vec![Err(RelayError::permanent("reverted"))]);
        let store = Arc::new(MemoryMessageStore::new());

        let health = run_to_completion(executor.clone(), store.clone(), &["a", "b"]).await;

        assert_eq!(executor.calls(), vec!["a", "b"]);
        assert_eq!(
            store.latest_state(&key("a")).await.unwrap(),
            Some(MessageState::Failed)
        );
        assert_eq!(
            store.latest_state(&key("b")).await.unwrap(),
            Some(MessageState::Confirmed)
        );
        assert_eq!(health.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_records_failure() {
        let executor = ScriptedExecutor::new(vec![
            Err(RelayError::transient("timeout")),
            Err(RelayError::transient("timeout")),
            Err(RelayError::transient("timeout")),
            Err(RelayError::transient("timeout")),
        ]);
        let store = Arc::new(MemoryMessageStore::new());

        run_to_completion(executor.clone(), store.clone(), &["a"]).await;

        // one initial attempt plus max_retries
        assert_eq!(executor.calls().len(), 4);
        let history = store.history(&key("a")).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.state, MessageState::Failed);
        assert_eq!(last.error_kind, Some(ErrorKind::SubmissionFailed));
    }

    #[tokio::test]
    async fn test_auth_error_halts_queue() {
        let executor = ScriptedExecutor::new(vec![Err(RelayError::Auth("forbidden".into()))]);
        let store = Arc::new(MemoryMessageStore::new());

        let health = run_to_completion(executor.clone(), store.clone(), &["a", "b"]).await;

        assert_eq!(executor.calls(), vec!["a"]);
        assert!(health.is_halted());
        for id in ["a", "b"] {
            let history = store.history(&key(id)).await.unwrap();
            let last = history.last().unwrap();
            assert_eq!(last.state, MessageState::Failed);
            assert_eq!(last.error_kind, Some(ErrorKind::AuthError));
        }
        // "b" was never submitted
        assert!(store
            .history(&key("b"))
            .await
            .unwrap()
            .iter()
            .all(|r| r.state != MessageState::Submitted));
    }

    #[tokio::test]
    async fn test_in_doubt_is_not_resubmitted() {
        let executor = ScriptedExecutor::new(vec![Err(RelayError::in_doubt(
            "0xfeed",
            "receipt not found",
        ))]);
        let store = Arc::new(MemoryMessageStore::new());

        let health = run_to_completion(executor.clone(), store.clone(), &["a", "b"]).await;

        assert_eq!(executor.calls(), vec!["a", "b"]);
        let history = store.history(&key("a")).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.state, MessageState::Submitted);
        assert_eq!(last.error_kind, Some(ErrorKind::InDoubt));
        assert!(last.detail.as_deref().unwrap().contains("0xfeed"));
        assert!(history.iter().all(|r| r.state != MessageState::Failed));
        assert_eq!(health.snapshot().in_doubt, 1);
        assert_eq!(health.snapshot().failed, 0);
        assert_eq!(
            store.latest_state(&key("b")).await.unwrap(),
            Some(MessageState::Confirmed)
        );
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let gate = Arc::new(Semaphore::new(0));
        let executor = GatedExecutor::new(Some(gate.clone()));
        let store = Arc::new(MemoryMessageStore::new());
        let config = QueueConfig {
            capacity: 1,
            ..fast_config()
        };
        let queue = ExecutionQueue::spawn(executor.clone(), store.clone(), config);
        let handle = queue.handle();
        for id in ["a", "b", "c"] {
            store.claim(&message(id)).await.unwrap();
        }

        // "a" is taken by the worker and blocks; "b" fills the single slot
        handle.enqueue(message("a")).await.unwrap();
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.enqueue(message("b")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), handle.enqueue(message("c"))).await;
        assert!(blocked.is_err(), "enqueue into a full queue must wait");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        assert_eq!(handle.health().snapshot().depth, 1);

        gate.add_permits(3);
        handle.enqueue(message("c")).await.unwrap();
        drop(handle);
        queue.shutdown(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.count_state(MessageState::Confirmed), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_at_deadline() {
        let executor = GatedExecutor::new(None);
        let store = Arc::new(MemoryMessageStore::new());
        let queue = ExecutionQueue::spawn(executor.clone(), store.clone(), fast_config());
        let handle = queue.handle();
        store.claim(&message("stuck")).await.unwrap();
        handle.enqueue(message("stuck")).await.unwrap();
        drop(handle);
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let started = Instant::now();
        tokio::time::timeout(
            Duration::from_secs(2),
            queue.shutdown(started + Duration::from_millis(100)),
        )
        .await
        .expect("shutdown returns at the deadline");

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            store.latest_state(&key("stuck")).await.unwrap(),
            Some(MessageState::Submitted)
        );
    }

    #[tokio::test]
    async fn test_circuit_breaker_pauses_after_threshold() {
        let executor = ScriptedExecutor::new(vec![
            Err(RelayError::permanent("reverted")),
            Err(RelayError::permanent("reverted")),
        ]);
        let store = Arc::new(MemoryMessageStore::new());
        let config = QueueConfig {
            circuit_breaker: CircuitBreakerConfig {
                threshold: 2,
                pause_duration: Duration::from_millis(300),
            },
            ..fast_config()
        };
        let queue = ExecutionQueue::spawn(executor.clone(), store.clone(), config);
        let handle = queue.handle();
        let health = handle.health();
        for id in ["a", "b", "c"] {
            store.claim(&message(id)).await.unwrap();
            handle.enqueue(message(id)).await.unwrap();
        }

        let mut tripped = false;
        for _ in 0..200 {
            if health.snapshot().paused {
                tripped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(tripped, "two consecutive failures trip the breaker");
        assert_eq!(health.snapshot().consecutive_failures, 2);
        assert_eq!(executor.calls(), vec!["a", "b"]);

        drop(handle);
        queue.shutdown(Instant::now() + Duration::from_secs(5)).await;
        let status = health.snapshot();
        assert!(!status.paused);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(executor.calls(), vec!["a", "b", "c"]);
        assert_eq!(
            store.latest_state(&key("c")).await.unwrap(),
            Some(MessageState::Confirmed)
        );
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let executor = ScriptedExecutor::new(vec![]);
        let store = Arc::new(MemoryMessageStore::new());
        let queue = ExecutionQueue::spawn(executor, store, fast_config());
        let ExecutionQueue { handle, worker } = queue;
        worker.abort();
        let _ = worker.await;

        assert_eq!(
            handle.enqueue(message("late")).await,
            Err(QueueClosed(ChainId::Icp))
        );
    }
}
