use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Current wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Instant of a message's creation as stored.
///
/// The store delivers either a plain epoch-millisecond number or a
/// materialized server-assigned timestamp object. Decoding picks the variant
/// at the boundary so downstream code matches on a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Server(ServerTimestamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ServerTimestamp {
    pub seconds: i64,
    #[serde(default)]
    pub nanos: u32,
}

impl Timestamp {
    /// Normalize to epoch milliseconds. Pure and total over both variants.
    pub fn millis(self) -> i64 {
        match self {
            Timestamp::Millis(ms) => ms,
            Timestamp::Server(ts) => ts.seconds * 1_000 + i64::from(ts.nanos) / 1_000_000,
        }
    }
}

impl From<i64> for Timestamp {
    fn from(ms: i64) -> Self {
        Timestamp::Millis(ms)
    }
}

/// One emoji's reaction record on a message. The user set is a map keyed by
/// user id so concurrent add/remove from different clients merge per key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    #[serde(default)]
    pub users: BTreeMap<String, bool>,
}

impl Reaction {
    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// A stored message. Field names follow the store's document format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned slot id. Empty only inside a record value that has not
    /// been keyed yet; the reconciler fills it from the slot key.
    #[serde(default)]
    pub id: String,
    pub content: String,
    pub timestamp: Timestamp,
    pub user_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Reaction>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
}

/// Client-side message before persistence; the store assigns the id.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub participants: Option<Vec<String>>,
}
