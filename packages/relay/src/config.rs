use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core::RelaySettings;
use crate::error::RelayError;
use crate::executors::{CircuitBreakerConfig, QueueConfig, RetryConfig};
use crate::types::ChainId;

/// Main configuration for the relay
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub evm: Option<EvmConfig>,
    pub icp: Option<IcpConfig>,
    pub relayer: RelayerConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// EVM side: websocket for the subscription, HTTP for submissions and reads
#[derive(Clone)]
pub struct EvmConfig {
    pub chain_id: ChainId,
    pub rpc_url: String,
    pub ws_url: String,
    pub bridge_address: String,
    pub private_key: String,
    pub ipfs_gateway_url: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("ipfs_gateway_url", &self.ipfs_gateway_url)
            .finish()
    }
}

/// ICP side: agent for submissions, HTTPS webhook for intake
#[derive(Clone)]
pub struct IcpConfig {
    pub chain_id: ChainId,
    pub host_url: String,
    pub canister_id: String,
    pub secret_key: String,
    pub fetch_root_key: bool,
    pub listener_port: u16,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
}

/// Custom Debug that redacts secret_key to prevent accidental log leakage.
impl fmt::Debug for IcpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcpConfig")
            .field("chain_id", &self.chain_id)
            .field("host_url", &self.host_url)
            .field("canister_id", &self.canister_id)
            .field("secret_key", &"<redacted>")
            .field("fetch_root_key", &self.fetch_root_key)
            .field("listener_port", &self.listener_port)
            .field("tls_cert_path", &self.tls_cert_path)
            .field("tls_key_path", &self.tls_key_path)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Evm,
    Icp,
}

impl FromStr for ChainKind {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evm" => Ok(ChainKind::Evm),
            "icp" => Ok(ChainKind::Icp),
            other => Err(eyre!("unknown chain kind {:?} (expected evm or icp)", other)),
        }
    }
}

/// Relay pipeline configuration
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub enabled_chains: Vec<ChainKind>,
    pub api_port: u16,
    pub intake_capacity: usize,
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub drain_timeout_ms: u64,
}

fn default_enabled_chains() -> Vec<ChainKind> {
    vec![ChainKind::Evm, ChainKind::Icp]
}

fn default_evm_chain_id() -> ChainId {
    ChainId::Ethereum
}

fn default_ipfs_gateway() -> String {
    "https://ipfs.io/ipfs/".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_queue_capacity() -> usize {
    256
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_drain_timeout() -> u64 {
    30_000
}

/// Required variable; missing or empty is a `ConfigMissing` error
fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(RelayError::ConfigMissing(key.to_string()).into()),
    }
}

/// Optional variable parsed with a default; a present but invalid value is an error
fn optional<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| eyre!("{} has an invalid value {:?}: {}", key, value, e)),
        _ => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let enabled_chains = match env::var("RELAYER_ENABLED_CHAINS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ChainKind::from_str)
                .collect::<Result<Vec<_>>>()
                .wrap_err("RELAYER_ENABLED_CHAINS is invalid")?,
            _ => default_enabled_chains(),
        };

        let evm = if enabled_chains.contains(&ChainKind::Evm) {
            Some(EvmConfig {
                chain_id: optional("EVM_CHAIN_ID", default_evm_chain_id())?,
                rpc_url: required("EVM_RPC_PROVIDER")?,
                ws_url: required("EVM_WS_PROVIDER")?,
                bridge_address: required("EVM_BRIDGE_CONTRACT_ADDRESS")?,
                private_key: required("EVM_EXECUTOR_PRIVATE_KEY")?,
                ipfs_gateway_url: optional("IPFS_GATEWAY_URL", default_ipfs_gateway())?,
            })
        } else {
            None
        };

        let icp = if enabled_chains.contains(&ChainKind::Icp) {
            Some(IcpConfig {
                chain_id: ChainId::Icp,
                host_url: required("ICP_HOST_URL")?,
                canister_id: required("ICP_CANISTER_ID")?,
                secret_key: required("ICP_EXECUTOR_SECRET_KEY")?,
                fetch_root_key: optional("ICP_FETCH_ROOT_KEY", false)?,
                listener_port: required("ICP_LISTENER_PORT")?
                    .parse()
                    .wrap_err("ICP_LISTENER_PORT must be a valid port")?,
                tls_cert_path: PathBuf::from(required("ICP_TLS_CERT_PATH")?),
                tls_key_path: PathBuf::from(required("ICP_TLS_KEY_PATH")?),
            })
        } else {
            None
        };

        let relayer = RelayerConfig {
            enabled_chains,
            api_port: optional("RELAYER_API_PORT", default_api_port())?,
            intake_capacity: optional("RELAYER_INTAKE_CAPACITY", default_intake_capacity())?,
            queue_capacity: optional("RELAYER_QUEUE_CAPACITY", default_queue_capacity())?,
            retry_attempts: optional("RETRY_ATTEMPTS", default_retry_attempts())?,
            retry_delay_ms: optional("RETRY_DELAY_MS", default_retry_delay())?,
            drain_timeout_ms: optional("DRAIN_TIMEOUT_MS", default_drain_timeout())?,
        };

        let config = Config {
            database,
            evm,
            icp,
            relayer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.relayer.enabled_chains.is_empty() {
            return Err(eyre!("RELAYER_ENABLED_CHAINS must name at least one chain"));
        }

        if let Some(evm) = &self.evm {
            if evm.chain_id == ChainId::Icp {
                return Err(eyre!("EVM_CHAIN_ID cannot be the ICP chain id"));
            }
            if !evm.ws_url.starts_with("ws://") && !evm.ws_url.starts_with("wss://") {
                return Err(eyre!("evm.ws_url must be a ws:// or wss:// URL"));
            }
            if evm.bridge_address.len() != 42 || !evm.bridge_address.starts_with("0x") {
                return Err(eyre!(
                    "evm.bridge_address must be a valid hex address (42 chars with 0x prefix)"
                ));
            }
            if evm.private_key.len() != 66 || !evm.private_key.starts_with("0x") {
                return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
            }
        }

        if let Some(icp) = &self.icp {
            let key = icp.secret_key.trim_start_matches("0x");
            if key.len() != 64 || hex::decode(key).is_err() {
                return Err(eyre!("icp.secret_key must be 64 hex chars"));
            }
            if icp.listener_port == self.relayer.api_port {
                return Err(eyre!(
                    "ICP_LISTENER_PORT and RELAYER_API_PORT must differ (both {})",
                    icp.listener_port
                ));
            }
        }

        if self.relayer.intake_capacity == 0 || self.relayer.queue_capacity == 0 {
            return Err(eyre!("channel capacities must be greater than zero"));
        }

        Ok(())
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            intake_capacity: self.relayer.intake_capacity,
            queue: QueueConfig {
                capacity: self.relayer.queue_capacity,
                retry: RetryConfig::new(
                    self.relayer.retry_attempts,
                    Duration::from_millis(self.relayer.retry_delay_ms),
                ),
                circuit_breaker: CircuitBreakerConfig::default(),
            },
            drain_timeout: Duration::from_millis(self.relayer.drain_timeout_ms),
        }
    }
}
