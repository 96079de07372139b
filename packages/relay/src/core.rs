//! Relay orchestrator: plugin registry, queue and listener lifecycle.

use eyre::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::MessageStore;
use crate::error::RelayError;
use crate::executors::queue::QueueStatus;
use crate::executors::{ExecutionQueue, QueueConfig, QueueHealth};
use crate::listeners::MessageSink;
use crate::plugin::{build_configured_plugins, Plugin};
use crate::router::Router;
use crate::types::ChainId;

/// Runtime bounds for the relay pipeline
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub intake_capacity: usize,
    pub queue: QueueConfig,
    pub drain_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            intake_capacity: 1024,
            queue: QueueConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Queue health of a running relay, read by the operations API
pub struct RelayHealth {
    started_at: std::time::Instant,
    queues: RwLock<Vec<Arc<QueueHealth>>>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub queues: Vec<QueueStatus>,
}

impl RelayHealth {
    fn new() -> Self {
        Self {
            started_at: std::time::Instant::now(),
            queues: RwLock::new(Vec::new()),
        }
    }

    fn set_queues(&self, queues: Vec<Arc<QueueHealth>>) {
        if let Ok(mut guard) = self.queues.write() {
            *guard = queues;
        }
    }

    pub fn report(&self) -> HealthReport {
        let queues: Vec<QueueStatus> = self
            .queues
            .read()
            .map(|q| q.iter().map(|h| h.snapshot()).collect())
            .unwrap_or_default();
        let status = if queues.iter().any(|q| q.halted) {
            "degraded"
        } else {
            "healthy"
        };
        HealthReport {
            status,
            uptime_secs: self.started_at.elapsed().as_secs(),
            queues,
        }
    }
}

pub struct Core {
    config: Option<Config>,
    settings: RelaySettings,
    store: Arc<dyn MessageStore>,
    plugins: HashMap<ChainId, Plugin>,
    health: Arc<RelayHealth>,
    started: bool,
}

impl Core {
    /// A core with no configured chains; plugins are registered by hand
    pub fn new(settings: RelaySettings, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config: None,
            settings,
            store,
            plugins: HashMap::new(),
            health: Arc::new(RelayHealth::new()),
            started: false,
        }
    }

    /// A core that builds the chains enabled in `config` when it runs
    pub fn from_config(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let settings = config.relay_settings();
        let mut core = Self::new(settings, store);
        core.config = Some(config);
        core
    }

    pub fn register(&mut self, chain_id: ChainId, plugin: Plugin) -> Result<(), RelayError> {
        if plugin.identifier() != chain_id {
            return Err(RelayError::PluginMismatch {
                requested: chain_id,
                plugin: plugin.identifier(),
            });
        }
        if self.plugins.contains_key(&chain_id) {
            return Err(RelayError::DuplicateChain(chain_id));
        }
        info!(chain = chain_id.name(), "Plugin registered");
        self.plugins.insert(chain_id, plugin);
        Ok(())
    }

    pub fn get_plugin(&self, chain_id: ChainId) -> Option<&Plugin> {
        self.plugins.get(&chain_id)
    }

    pub fn health(&self) -> Arc<RelayHealth> {
        self.health.clone()
    }

    /// Start every plugin and relay until `shutdown` receives a signal.
    /// Can only be called once.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        if self.started {
            return Err(RelayError::AlreadyStarted.into());
        }
        self.started = true;

        if let Some(config) = self.config.take() {
            for plugin in build_configured_plugins(&config).await? {
                self.register(plugin.identifier(), plugin)?;
            }
        }
        if self.plugins.is_empty() {
            warn!("No plugins registered; the relay will only wait for shutdown");
        }

        // One queue per destination
        let mut queues = Vec::new();
        let mut routes = HashMap::new();
        for (chain, plugin) in &self.plugins {
            let queue = ExecutionQueue::spawn(
                plugin.executor(),
                self.store.clone(),
                self.settings.queue.clone(),
            );
            routes.insert(*chain, queue.handle());
            queues.push(queue);
        }
        self.health.set_queues(
            routes.values().map(|h| h.health()).collect(),
        );

        let router = Arc::new(Router::new(routes, self.store.clone()));
        if let Err(e) = router.recover().await {
            error!(error = %e, "Crash recovery failed; unfinished messages were not requeued");
        }

        let (intake_tx, intake_rx) = mpsc::channel(self.settings.intake_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut listeners = JoinSet::new();
        for (chain, plugin) in &self.plugins {
            let chain = *chain;
            let listener = plugin.listener();
            let sink = MessageSink::new(chain, intake_tx.clone());
            let stop = stop_rx.clone();
            listeners.spawn(async move { (chain, listener.run(sink, stop).await) });
        }
        drop(intake_tx);

        let router_task = {
            let router = router.clone();
            let stop = stop_rx.clone();
            tokio::spawn(async move { router.run(intake_rx, stop).await })
        };

        info!(chains = ?self.plugins.keys().map(|c| c.name()).collect::<Vec<_>>(), "Relay running");

        loop {
            if listeners.is_empty() {
                let _ = shutdown.recv().await;
                break;
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(joined) = listeners.join_next() => match joined {
                    Ok((chain, Ok(()))) => {
                        warn!(chain = chain.name(), "Listener exited");
                    }
                    Ok((chain, Err(e))) => {
                        error!(chain = chain.name(), error = %format!("{:#}", e), "Listener stopped with error");
                    }
                    Err(e) => {
                        error!(error = %e, "Listener task panicked");
                    }
                },
            }
        }

        info!("Shutdown signal received, stopping relay");
        let deadline = Instant::now() + self.settings.drain_timeout;
        let _ = stop_tx.send(true);

        if tokio::time::timeout_at(deadline, async {
            while listeners.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Listeners did not stop before the drain deadline, aborting");
            listeners.shutdown().await;
        }

        let mut router_task = router_task;
        if tokio::time::timeout_at(deadline, &mut router_task).await.is_err() {
            warn!("Router did not drain before the deadline, aborting");
            router_task.abort();
        }
        // Last QueueHandle clones live in the router
        drop(router);

        for queue in queues {
            queue.shutdown(deadline).await;
        }

        info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryMessageStore;
    use crate::executors::Executor;
    use crate::listeners::Listener;
    use crate::types::{Message, Receipt};
    use async_trait::async_trait;

    struct IdleListener(ChainId);

    #[async_trait]
    impl Listener for IdleListener {
        fn chain_id(&self) -> ChainId {
            self.0
        }

        async fn run(&self, _sink: MessageSink, mut shutdown: watch::Receiver<bool>) -> Result<()> {
            let _ = shutdown.changed().await;
            Ok(())
        }
    }

    struct NoopExecutor(ChainId);

    #[async_trait]
    impl Executor for NoopExecutor {
        fn chain_id(&self) -> ChainId {
            self.0
        }

        async fn execute(&self, _message: &Message) -> Result<Receipt, RelayError> {
            Ok(Receipt {
                reference: String::new(),
            })
        }
    }

    fn plugin(chain: ChainId) -> Plugin {
        Plugin::new(Arc::new(IdleListener(chain)), Arc::new(NoopExecutor(chain))).unwrap()
    }

    fn core() -> Core {
        Core::new(RelaySettings::default(), Arc::new(MemoryMessageStore::new()))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut core = core();
        core.register(ChainId::Icp, plugin(ChainId::Icp)).unwrap();

        assert_eq!(
            core.get_plugin(ChainId::Icp).map(|p| p.identifier()),
            Some(ChainId::Icp)
        );
        assert!(core.get_plugin(ChainId::Ethereum).is_none());
    }

    #[test]
    fn test_register_rejects_duplicates_and_mismatches() {
        let mut core = core();
        core.register(ChainId::Icp, plugin(ChainId::Icp)).unwrap();

        assert!(matches!(
            core.register(ChainId::Icp, plugin(ChainId::Icp)),
            Err(RelayError::DuplicateChain(ChainId::Icp))
        ));
        assert!(matches!(
            core.register(ChainId::Ethereum, plugin(ChainId::Icp)),
            Err(RelayError::PluginMismatch { .. })
        ));
    }

    #[test]
    fn test_plugin_requires_matching_chains() {
        let result = Plugin::new(
            Arc::new(IdleListener(ChainId::Icp)),
            Arc::new(NoopExecutor(ChainId::Ethereum)),
        );
        assert!(matches!(result, Err(RelayError::PluginMismatch { .. })));
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let mut core = core();
        core.register(ChainId::Icp, plugin(ChainId::Icp)).unwrap();

        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();
        core.run(rx).await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let err = core.run(rx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_health_report_lists_queues() {
        let mut core = core();
        core.register(ChainId::Icp, plugin(ChainId::Icp)).unwrap();
        let health = core.health();

        let (tx, rx) = mpsc::channel(1);
        let run = tokio::spawn(async move { core.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = health.report();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.queues.len(), 1);
        assert_eq!(report.queues[0].chain, "icp");

        tx.send(()).await.unwrap();
        run.await.unwrap().unwrap();
    }
}
