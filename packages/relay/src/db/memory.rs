//! In-process message log with the same semantics as the Postgres store.

use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::MessageStore;
use crate::error::RelayError;
use crate::types::{Message, MessageKey, MessageState, StateRecord};

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageKey, Message>,
    order: Vec<MessageKey>,
    states: HashMap<MessageKey, Vec<StateRecord>>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| eyre!("memory store lock poisoned"))
    }

    /// Number of records with `state` across all messages
    pub fn count_state(&self, state: MessageState) -> usize {
        self.lock()
            .map(|inner| {
                inner
                    .states
                    .values()
                    .flatten()
                    .filter(|r| r.state == state)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn claim(&self, message: &Message) -> Result<bool> {
        let mut inner = self.lock()?;
        let key = message.key();
        if inner.messages.contains_key(&key) {
            return Ok(false);
        }
        inner.messages.insert(key.clone(), message.clone());
        inner.order.push(key.clone());
        inner.states.insert(
            key.clone(),
            vec![StateRecord {
                src_chain_id: key.src_chain_id,
                message_id: key.id,
                state: MessageState::Normalized,
                error_kind: None,
                detail: None,
                recorded_at: Utc::now(),
            }],
        );
        Ok(true)
    }

    async fn record(
        &self,
        key: &MessageKey,
        state: MessageState,
        failure: Option<&RelayError>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let trail = inner
            .states
            .get_mut(key)
            .ok_or_else(|| eyre!("unknown message {}", key))?;
        trail.push(StateRecord {
            src_chain_id: key.src_chain_id,
            message_id: key.id.clone(),
            state,
            error_kind: failure.map(|e| e.kind()),
            detail: failure.map(|e| e.to_string()),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn history(&self, key: &MessageKey) -> Result<Vec<StateRecord>> {
        let inner = self.lock()?;
        Ok(inner.states.get(key).cloned().unwrap_or_default())
    }

    async fn unfinished(&self) -> Result<Vec<(Message, MessageState)>> {
        let inner = self.lock()?;
        let pending = inner
            .order
            .iter()
            .filter_map(|key| {
                let state = inner.states.get(key)?.last()?.state;
                if state.is_terminal() {
                    return None;
                }
                Some((inner.messages.get(key)?.clone(), state))
            })
            .collect();
        Ok(pending)
    }
}
