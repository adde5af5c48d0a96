//! Collected records, their comments and the producer payload they are built from.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::shard::{ShardKey, parse_publish_date};

/// A persisted record. `answer_url` is unique across the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub publish_time: Option<String>,
    pub answer_url: String,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub author_field: Option<String>,
    pub author_cert: Option<String>,
    pub author_fans: i64,
    pub year: i32,
    pub task_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn shard_key(&self) -> ShardKey {
        ShardKey::from_publish_date(self.publish_time.as_deref(), self.year)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewRecord {
    pub title: String,
    pub content: String,
    pub publish_time: Option<String>,
    pub answer_url: String,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub author_field: Option<String>,
    pub author_cert: Option<String>,
    pub author_fans: i64,
    pub year: i32,
    pub task_id: i64,
}

/// A comment stored in the shard of its owning record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub record_id: i64,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub content: String,
    pub like_count: i64,
    pub time: Option<String>,
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewComment {
    pub author: Option<String>,
    pub author_url: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(deserialize_with = "null_as_default")]
    pub like_count: i64,
    pub time: Option<String>,
}

/// Producers send unset fields as `null`; those read as the field default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// JSON payload accepted from producers. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmittedRecord {
    pub rank: Option<i64>,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
    pub question_detail: Option<String>,
    pub answer_content_text: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub author_field: Option<String>,
    pub author_cert: Option<String>,
    pub author_fans: Option<i64>,
    pub year: Option<i32>,
    pub publish_time: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub images: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub comments_structured: Vec<NewComment>,
    pub task_id: Option<i64>,
}

/// A payload mapped onto store rows, with the shard its comments belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub record: NewRecord,
    pub comments: Vec<NewComment>,
    pub shard: ShardKey,
}

impl SubmittedRecord {
    /// Maps the payload onto store rows.
    ///
    /// The record year is the year of a `YYYY-MM-DD` publish date, else the
    /// payload year, else the year of `today`. The shard key comes from the
    /// same date, so comments always land in their record's year. Payloads
    /// without a task id are attributed to job 0.
    pub fn prepare(self, fallback_address: &str, today: NaiveDate) -> PreparedRecord {
        let answer_url = if self.url.trim().is_empty() {
            fallback_address.to_string()
        } else {
            self.url
        };
        let content = self
            .content
            .filter(|c| !c.trim().is_empty())
            .or(self.answer_content_text)
            .unwrap_or_default();
        let publish_time = self.publish_time.filter(|p| !p.trim().is_empty());
        let year = publish_time
            .as_deref()
            .and_then(parse_publish_date)
            .map(|d| d.year())
            .or(self.year)
            .unwrap_or_else(|| today.year());
        let shard = ShardKey::from_publish_date(publish_time.as_deref(), year);

        PreparedRecord {
            record: NewRecord {
                title: self.title,
                content,
                publish_time,
                answer_url,
                author: self.author,
                author_url: self.author_url,
                author_field: self.author_field,
                author_cert: self.author_cert,
                author_fans: self.author_fans.unwrap_or(0),
                year,
                task_id: self.task_id.unwrap_or(0),
            },
            comments: self.comments_structured,
            shard,
        }
    }
}

/// A record selected by the quota sampler together with its comments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledRecord {
    pub record: Record,
    pub stock_ratio: f64,
    pub sample_num: u32,
    pub comments: Vec<Comment>,
    pub comment_summary: String,
}

/// Sampled records grouped by year, one export sheet per entry.
pub type SampleSheets = BTreeMap<i32, Vec<SampledRecord>>;

/// Renders comments as one numbered line each.
pub fn format_comment_summary(comments: &[Comment]) -> String {
    comments
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let author = c.author.as_deref().unwrap_or("anonymous");
            match c.time.as_deref() {
                Some(time) => format!("{}. {author} ({time}, {} likes): {}", i + 1, c.like_count, c.content),
                None => format!("{}. {author} ({} likes): {}", i + 1, c.like_count, c.content),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn payload_year_follows_publish_date() {
        let payload = SubmittedRecord {
            url: "https://www.zhihu.com/question/1/answer/2".into(),
            year: Some(1999),
            publish_time: Some("2021-03-04".into()),
            ..Default::default()
        };
        let prepared = payload.prepare("ignored", today());
        assert_eq!(prepared.record.year, 2021);
        assert_eq!(prepared.shard, ShardKey::new(2021, 3).unwrap());
    }

    #[test]
    fn payload_without_date_uses_payload_year_and_january() {
        let payload = SubmittedRecord {
            year: Some(2019),
            publish_time: Some("last week".into()),
            ..Default::default()
        };
        let prepared = payload.prepare("https://example.com/a", today());
        assert_eq!(prepared.record.year, 2019);
        assert_eq!(prepared.record.answer_url, "https://example.com/a");
        assert_eq!(prepared.shard, ShardKey::new(2019, 1).unwrap());
    }

    #[test]
    fn payload_without_any_year_uses_today() {
        let prepared = SubmittedRecord::default().prepare("https://example.com/b", today());
        assert_eq!(prepared.record.year, 2024);
        assert_eq!(prepared.record.task_id, 0);
        assert_eq!(prepared.shard, ShardKey::new(2024, 1).unwrap());
    }

    #[test]
    fn content_falls_back_to_answer_text() {
        let payload = SubmittedRecord {
            content: Some("   ".into()),
            answer_content_text: Some("plain answer".into()),
            ..Default::default()
        };
        assert_eq!(payload.prepare("x", today()).record.content, "plain answer");
    }

    #[test]
    fn payload_deserializes_with_missing_fields() {
        let payload: SubmittedRecord = serde_json::from_str(
            r#"{"title":"Q","url":"https://e.com/1","comments_structured":[{"content":"hi","like_count":3}]}"#,
        )
        .unwrap();
        assert_eq!(payload.title, "Q");
        assert_eq!(payload.comments_structured.len(), 1);
        assert_eq!(payload.comments_structured[0].like_count, 3);
        assert!(payload.task_id.is_none());
    }

    #[test]
    fn payload_deserializes_with_null_fields() {
        let payload: SubmittedRecord = serde_json::from_str(
            r#"{"rank":null,"title":"t","url":null,"content":null,"images":null,"task_id":null,
                "comments_structured":[{"author":"a","content":null,"like_count":null,"time":null}]}"#,
        )
        .unwrap();
        assert_eq!(payload.title, "t");
        assert!(payload.url.is_empty());
        assert!(payload.images.is_empty());
        assert_eq!(payload.comments_structured[0].content, "");
        assert_eq!(payload.comments_structured[0].like_count, 0);

        let nothing: SubmittedRecord = serde_json::from_str(r#"{"title":null,"comments_structured":null}"#).unwrap();
        assert_eq!(nothing, SubmittedRecord::default());
    }

    #[test]
    fn timestamped_publish_time_keeps_record_and_shard_aligned() {
        let payload = SubmittedRecord {
            year: Some(2020),
            publish_time: Some("2021-03-04 10:00".into()),
            ..Default::default()
        };
        let prepared = payload.prepare("https://example.com/c", today());
        assert_eq!(prepared.record.year, 2020);
        assert_eq!(prepared.shard, ShardKey::new(2020, 1).unwrap());
    }

    #[test]
    fn comment_summary_numbers_lines() {
        let comment = |author: Option<&str>, content: &str, likes: i64| Comment {
            id: 1,
            record_id: 1,
            author: author.map(str::to_string),
            author_url: None,
            content: content.to_string(),
            like_count: likes,
            time: None,
            year: 2020,
            month: 1,
        };
        let summary = format_comment_summary(&[comment(Some("li"), "agree", 4), comment(None, "no", 0)]);
        assert_eq!(summary, "1. li (4 likes): agree\n2. anonymous (0 likes): no");
        assert_eq!(format_comment_summary(&[]), "");
    }
}
