use std::collections::BTreeMap;

use serde::Serialize;
use time::{Date, OffsetDateTime, UtcOffset};
use utoipa::ToSchema;

use crate::model::Message;

/// A burst ends when the author changes or the gap to the previous message
/// exceeds this window.
pub const GROUP_GAP_MS: i64 = 5 * 60 * 1_000;

/// Consecutive messages from one author within the burst window. The group's
/// displayed author comes from its first message.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageGroup {
    pub user_id: String,
    pub messages: Vec<Message>,
}

/// One calendar date's groups, oldest date first in the engine's output.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaySection {
    /// Calendar date in the viewer's offset, `YYYY-MM-DD`.
    pub date: String,
    pub groups: Vec<MessageGroup>,
}

/// Partition an ordered message list into date buckets of author bursts.
///
/// Dates are taken in the viewer's UTC offset. Buckets are keyed by parsed
/// date, so they come out chronological even when the input interleaves
/// days. Within a bucket the input order is preserved.
pub fn group_messages(messages: &[Message], offset: UtcOffset) -> Vec<DaySection> {
    let mut buckets: BTreeMap<Date, Vec<&Message>> = BTreeMap::new();
    for message in messages {
        let date = local_date(message.timestamp.millis(), offset);
        buckets.entry(date).or_default().push(message);
    }
    buckets
        .into_iter()
        .map(|(date, bucket)| DaySection {
            date: format_date(date),
            groups: group_bucket(&bucket),
        })
        .collect()
}

fn group_bucket(bucket: &[&Message]) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();
    let mut prev_ms = 0i64;
    for message in bucket {
        let ms = message.timestamp.millis();
        let starts_group = match groups.last() {
            None => true,
            Some(group) => group.user_id != message.user_id || ms - prev_ms > GROUP_GAP_MS,
        };
        if starts_group {
            groups.push(MessageGroup {
                user_id: message.user_id.clone(),
                messages: Vec::new(),
            });
        }
        if let Some(group) = groups.last_mut() {
            group.messages.push((*message).clone());
        }
        prev_ms = ms;
    }
    groups
}

fn local_date(ms: i64, offset: UtcOffset) -> Date {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .to_offset(offset)
        .date()
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn msg(id: &str, user: &str, ms: i64) -> Message {
        Message {
            id: id.into(),
            content: format!("m-{id}"),
            timestamp: Timestamp::Millis(ms),
            user_id: user.into(),
            channel_id: "general".into(),
            account_id: "acme".into(),
            participants: None,
            reactions: Default::default(),
            edited: false,
            edited_at: None,
        }
    }

    const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

    #[test]
    fn gap_of_exactly_five_minutes_continues_group() {
        let messages = vec![msg("a", "u1", 0), msg("b", "u1", GROUP_GAP_MS)];
        let days = group_messages(&messages, UtcOffset::UTC);
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].groups.len(), 1);
        assert_eq!(days[0].groups[0].messages.len(), 2);
    }

    #[test]
    fn gap_over_five_minutes_starts_group() {
        let messages = vec![msg("a", "u1", 0), msg("b", "u1", GROUP_GAP_MS + 1)];
        let days = group_messages(&messages, UtcOffset::UTC);
        assert_eq!(days[0].groups.len(), 2);
    }

    #[test]
    fn author_change_starts_group() {
        let messages = vec![
            msg("a", "u1", 0),
            msg("b", "u2", 1_000),
            msg("c", "u2", 2_000),
        ];
        let days = group_messages(&messages, UtcOffset::UTC);
        let authors: Vec<&str> = days[0].groups.iter().map(|g| g.user_id.as_str()).collect();
        assert_eq!(authors, vec!["u1", "u2"]);
        assert_eq!(days[0].groups[1].messages.len(), 2);
    }

    #[test]
    fn single_message_yields_single_group() {
        let days = group_messages(&[msg("a", "u1", 1_000)], UtcOffset::UTC);
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].groups.len(), 1);
        assert_eq!(days[0].groups[0].messages.len(), 1);
    }

    #[test]
    fn empty_input_yields_no_sections() {
        assert!(group_messages(&[], UtcOffset::UTC).is_empty());
    }

    #[test]
    fn date_buckets_come_out_chronological() {
        // three dates, deliberately interleaved
        let messages = vec![
            msg("c", "u1", 2 * DAY_MS),
            msg("a", "u1", 0),
            msg("b", "u1", DAY_MS),
        ];
        let days = group_messages(&messages, UtcOffset::UTC);
        let dates: Vec<&str> = days.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["1970-01-01", "1970-01-02", "1970-01-03"]);
    }

    #[test]
    fn viewer_offset_moves_date_boundary() {
        // 30 minutes before UTC midnight
        let messages = vec![msg("a", "u1", DAY_MS - 30 * 60 * 1_000)];
        let utc = group_messages(&messages, UtcOffset::UTC);
        assert_eq!(utc[0].date, "1970-01-01");
        let ahead = group_messages(&messages, UtcOffset::from_whole_seconds(3_600).unwrap());
        assert_eq!(ahead[0].date, "1970-01-02");
    }

    #[test]
    fn group_author_is_first_message_author() {
        let messages = vec![msg("a", "u1", 0), msg("b", "u1", 1_000)];
        let days = group_messages(&messages, UtcOffset::UTC);
        assert_eq!(days[0].groups[0].user_id, "u1");
        assert_eq!(days[0].groups[0].messages[0].id, "a");
    }
}
