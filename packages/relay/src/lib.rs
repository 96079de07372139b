//! Mirage Bridge Relay
//!
//! Forwards NFT mint/burn messages between an EVM bridge contract and an
//! ICP bridge canister.
//!
//! # Pipeline
//!
//! 1. A chain [`listeners::Listener`] turns native events into canonical messages
//! 2. The [`router::Router`] claims each message id and picks the destination queue
//! 3. One [`executors::ExecutionQueue`] per destination submits messages in order
//! 4. Every state transition is appended to the [`db::MessageStore`] log
//!
//! Chains are added as [`plugin::Plugin`]s registered on the [`core::Core`].

pub mod api;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod core;
pub mod db;
pub mod error;
pub mod executors;
pub mod listeners;
pub mod metrics;
pub mod plugin;
pub mod router;
pub mod types;
