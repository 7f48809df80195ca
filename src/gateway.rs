use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::model::{now_millis, Draft, Message, Timestamp};
use crate::reconcile::reconcile;
use crate::store::{Snapshot, Store};

/// The only component that touches the store for a channel's message
/// collection. One instance per workspace, passed explicitly to whoever
/// needs it.
pub struct ChannelGateway {
    store: Arc<dyn Store>,
    account_id: String,
}

impl ChannelGateway {
    pub fn new(store: Arc<dyn Store>, account_id: impl Into<String>) -> Self {
        Self {
            store,
            account_id: account_id.into(),
        }
    }

    fn messages_path(&self, channel_id: &str) -> String {
        format!(
            "accounts/{}/channels/{}/messages",
            self.account_id, channel_id
        )
    }

    /// Open a live feed over a channel. The feed yields the reconciled full
    /// list once immediately and again after every store change.
    pub async fn subscribe(&self, channel_id: &str) -> Result<ChannelFeed> {
        let path = self.messages_path(channel_id);
        // watch before the initial read so no change falls in between
        let rx = self.store.watch(&path);
        let initial = self.store.read(&path).await?;
        tracing::debug!(channel = channel_id, "channel feed opened");
        Ok(ChannelFeed {
            state: Some(FeedState {
                channel_id: channel_id.to_string(),
                stream: BroadcastStream::new(rx),
                initial: Some(initial),
            }),
        })
    }

    /// Read the channel once, reconciled.
    pub async fn messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        let snapshot = self.store.read(&self.messages_path(channel_id)).await?;
        Ok(reconcile(&snapshot))
    }

    /// Append a new message. Whitespace-only content is rejected before any
    /// store call; the returned message carries the store-assigned id.
    pub async fn send(&self, channel_id: &str, draft: Draft) -> Result<Message> {
        let content = draft.content.trim();
        if content.is_empty() {
            bail!("empty_message");
        }
        let timestamp = now_millis();
        let mut record = json!({
            "content": content,
            "timestamp": timestamp,
            "userId": draft.user_id,
            "channelId": channel_id,
            "accountId": self.account_id,
        });
        if let Some(participants) = &draft.participants {
            record["participants"] = json!(participants);
        }
        let id = self
            .store
            .push(&self.messages_path(channel_id), record)
            .await?;
        tracing::info!(channel = channel_id, message = %id, "message sent");
        Ok(Message {
            id,
            content: content.to_string(),
            timestamp: Timestamp::Millis(timestamp),
            user_id: draft.user_id,
            channel_id: channel_id.to_string(),
            account_id: self.account_id.clone(),
            participants: draft.participants,
            reactions: Default::default(),
            edited: false,
            edited_at: None,
        })
    }

    /// Replace a message's content, marking it edited. Only the touched
    /// fields are merged; concurrent unrelated updates survive.
    pub async fn edit(&self, channel_id: &str, message_id: &str, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            bail!("empty_message");
        }
        let patch = json!({
            "content": content,
            "edited": true,
            "editedAt": now_millis(),
        });
        self.store
            .merge(&self.messages_path(channel_id), message_id, patch)
            .await?;
        self.find(channel_id, message_id).await
    }

    /// Tombstone a message: the slot is cleared, not removed, so listeners
    /// observe a deletion distinct from "never existed".
    pub async fn delete(&self, channel_id: &str, message_id: &str) -> Result<()> {
        self.store
            .write(
                &self.messages_path(channel_id),
                message_id,
                serde_json::Value::Null,
            )
            .await?;
        tracing::info!(channel = channel_id, message = %message_id, "message deleted");
        Ok(())
    }

    /// Add a user's reaction. Idempotent: a second add for the same emoji
    /// makes no write and leaves the user set unchanged.
    pub async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<()> {
        if self.has_reaction(channel_id, message_id, emoji, user_id).await? {
            return Ok(());
        }
        let patch = json!({
            "reactions": {emoji: {"emoji": emoji, "users": {user_id: true}}}
        });
        self.store
            .merge(&self.messages_path(channel_id), message_id, patch)
            .await
    }

    /// Remove a user's reaction. Removing one that was never added is a
    /// no-op and makes no write. Clearing the last user drops the emoji
    /// entry entirely.
    pub async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<()> {
        let message = match self.find(channel_id, message_id).await {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        let Some(reaction) = message.reactions.get(emoji) else {
            return Ok(());
        };
        if !reaction.has_user(user_id) {
            return Ok(());
        }
        let patch = if reaction.user_count() == 1 {
            json!({"reactions": {emoji: null}})
        } else {
            json!({"reactions": {emoji: {"users": {user_id: null}}}})
        };
        self.store
            .merge(&self.messages_path(channel_id), message_id, patch)
            .await
    }

    /// Toggle a user's reaction; returns whether it is present afterwards.
    pub async fn toggle_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<bool> {
        if self.has_reaction(channel_id, message_id, emoji, user_id).await? {
            self.remove_reaction(channel_id, message_id, emoji, user_id)
                .await?;
            Ok(false)
        } else {
            self.add_reaction(channel_id, message_id, emoji, user_id)
                .await?;
            Ok(true)
        }
    }

    async fn has_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<bool> {
        let message = self.find(channel_id, message_id).await?;
        Ok(message
            .reactions
            .get(emoji)
            .map_or(false, |r| r.has_user(user_id)))
    }

    /// Look up one live message by id.
    pub async fn find(&self, channel_id: &str, message_id: &str) -> Result<Message> {
        self.messages(channel_id)
            .await?
            .into_iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow!("not_found"))
    }
}

struct FeedState {
    channel_id: String,
    stream: BroadcastStream<Snapshot>,
    initial: Option<Snapshot>,
}

/// Live subscription over one channel. Closing is idempotent; dropping the
/// feed closes it; a closed or superseded feed only ever yields `None`.
pub struct ChannelFeed {
    state: Option<FeedState>,
}

impl ChannelFeed {
    /// Next reconciled view, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<Vec<Message>> {
        loop {
            let state = self.state.as_mut()?;
            if let Some(snapshot) = state.initial.take() {
                return Some(reconcile(&snapshot));
            }
            match state.stream.next().await {
                Some(Ok(snapshot)) => return Some(reconcile(&snapshot)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    // snapshots are full state; the next one catches us up
                    tracing::debug!(
                        channel = %state.channel_id,
                        skipped,
                        "feed lagged, waiting for next snapshot"
                    );
                }
                None => {
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Detach from the store. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::debug!(channel = %state.channel_id, "channel feed closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }
}

impl Drop for ChannelFeed {
    fn drop(&mut self) {
        self.close();
    }
}
