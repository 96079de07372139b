//! Per-chain bundle of listener and executor.

use eyre::{Result, WrapErr};
use std::fmt;
use std::sync::Arc;

use crate::config::{ChainKind, Config};
use crate::error::RelayError;
use crate::executors::{EvmExecutor, Executor, IcpExecutor};
use crate::listeners::{EvmListener, IcpListener, Listener};
use crate::types::ChainId;

/// The only point where chain-specific code enters the relay's control flow
#[derive(Clone)]
pub struct Plugin {
    identifier: ChainId,
    listener: Arc<dyn Listener>,
    executor: Arc<dyn Executor>,
}

impl Plugin {
    pub fn new(
        listener: Arc<dyn Listener>,
        executor: Arc<dyn Executor>,
    ) -> std::result::Result<Self, RelayError> {
        let identifier = listener.chain_id();
        if executor.chain_id() != identifier {
            return Err(RelayError::PluginMismatch {
                requested: identifier,
                plugin: executor.chain_id(),
            });
        }
        Ok(Self {
            identifier,
            listener,
            executor,
        })
    }

    pub fn identifier(&self) -> ChainId {
        self.identifier
    }

    pub fn listener(&self) -> Arc<dyn Listener> {
        self.listener.clone()
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// Build the plugins enabled in `config`
pub async fn build_configured_plugins(config: &Config) -> Result<Vec<Plugin>> {
    let mut plugins = Vec::new();

    for kind in &config.relayer.enabled_chains {
        let plugin = match kind {
            ChainKind::Evm => {
                let evm = config.evm.as_ref().ok_or_else(|| {
                    RelayError::ConfigMissing("EVM_RPC_PROVIDER".to_string())
                })?;
                Plugin::new(
                    Arc::new(EvmListener::new(evm)?),
                    Arc::new(EvmExecutor::new(evm)?),
                )?
            }
            ChainKind::Icp => {
                let icp = config.icp.as_ref().ok_or_else(|| {
                    RelayError::ConfigMissing("ICP_HOST_URL".to_string())
                })?;
                let listener = IcpListener::new(icp).wrap_err("Failed to set up ICP webhook")?;
                let executor = IcpExecutor::connect(icp)
                    .await
                    .wrap_err("Failed to set up ICP executor")?;
                Plugin::new(Arc::new(listener), Arc::new(executor))?
            }
        };
        plugins.push(plugin);
    }

    Ok(plugins)
}
