//! NFT collection and token metadata resolution for mint messages.

use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eyre::{eyre, Result, WrapErr};
use std::time::Duration;
use url::Url;

use crate::contracts::evm_bridge::IERC721Metadata;

/// Upper bound on a fetched metadata document
pub const MAX_METADATA_BYTES: usize = 256 * 1024;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub symbol: String,
}

#[async_trait]
pub trait MetadataReader: Send + Sync {
    async fn collection(&self, contract: Address) -> Result<CollectionInfo>;

    /// Token metadata content, with the token URI already resolved
    async fn token_metadata(&self, contract: Address, token_id: U256) -> Result<String>;
}

/// Where a token URI's content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenUri {
    Fetch(String),
    Inline(String),
}

/// Classify a token URI: https and ipfs are fetched (ipfs through
/// `ipfs_gateway`), JSON data URIs are decoded, anything else is the metadata.
pub fn resolve_token_uri(uri: &str, ipfs_gateway: &str) -> Result<TokenUri> {
    let trimmed = uri.trim();

    if trimmed.starts_with("https://") {
        return Ok(TokenUri::Fetch(trimmed.to_string()));
    }

    if let Some(path) = trimmed.strip_prefix("ipfs://") {
        let path = path.strip_prefix("ipfs/").unwrap_or(path);
        if path.is_empty() {
            return Err(eyre!("ipfs URI has no content identifier"));
        }
        return Ok(TokenUri::Fetch(format!(
            "{}/{}",
            ipfs_gateway.trim_end_matches('/'),
            path
        )));
    }

    if let Some(rest) = trimmed.strip_prefix("data:application/json") {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| eyre!("data URI without payload"))?;
        if header.split(';').any(|p| p.eq_ignore_ascii_case("base64")) {
            let bytes = STANDARD
                .decode(payload)
                .wrap_err("data URI payload is not valid base64")?;
            let text = String::from_utf8(bytes).wrap_err("data URI payload is not UTF-8")?;
            return Ok(TokenUri::Inline(text));
        }
        return Ok(TokenUri::Inline(payload.to_string()));
    }

    Ok(TokenUri::Inline(uri.to_string()))
}

/// Reads ERC-721 metadata over JSON-RPC and fetches off-chain documents
pub struct Erc721MetadataReader {
    rpc_url: Url,
    ipfs_gateway: String,
    http: reqwest::Client,
}

impl Erc721MetadataReader {
    pub fn new(rpc_url: Url, ipfs_gateway: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .wrap_err("Failed to build metadata HTTP client")?;
        Ok(Self {
            rpc_url,
            ipfs_gateway: ipfs_gateway.into(),
            http,
        })
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .wrap_err_with(|| format!("Failed to fetch metadata from {}", url))?
            .error_for_status()
            .wrap_err_with(|| format!("Metadata host rejected {}", url))?;

        if let Some(len) = response.content_length() {
            if len as usize > MAX_METADATA_BYTES {
                return Err(eyre!("metadata at {} is {} bytes, over the limit", url, len));
            }
        }

        let body = response
            .bytes()
            .await
            .wrap_err_with(|| format!("Failed to read metadata body from {}", url))?;
        if body.len() > MAX_METADATA_BYTES {
            return Err(eyre!("metadata at {} exceeds {} bytes", url, MAX_METADATA_BYTES));
        }
        String::from_utf8(body.to_vec()).wrap_err("metadata body is not UTF-8")
    }
}

#[async_trait]
impl MetadataReader for Erc721MetadataReader {
    async fn collection(&self, contract: Address) -> Result<CollectionInfo> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let nft = IERC721Metadata::new(contract, &provider);

        let name = nft
            .name()
            .call()
            .await
            .wrap_err_with(|| format!("name() failed on {}", contract))?
            ._0;
        let symbol = nft
            .symbol()
            .call()
            .await
            .wrap_err_with(|| format!("symbol() failed on {}", contract))?
            ._0;

        Ok(CollectionInfo { name, symbol })
    }

    async fn token_metadata(&self, contract: Address, token_id: U256) -> Result<String> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let nft = IERC721Metadata::new(contract, &provider);

        let uri = nft
            .tokenURI(token_id)
            .call()
            .await
            .wrap_err_with(|| format!("tokenURI({}) failed on {}", token_id, contract))?
            ._0;

        match resolve_token_uri(&uri, &self.ipfs_gateway)? {
            TokenUri::Fetch(url) => self.fetch(&url).await,
            TokenUri::Inline(content) => Ok(content),
        }
    }
}
