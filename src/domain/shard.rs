//! Comment partition keys.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::errors::TaskError;

const MIN_YEAR: i32 = 1;
const MAX_YEAR: i32 = 9999;

/// `(year, month)` pair naming the partition that holds a record's comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    year: i32,
    month: u32,
}

impl ShardKey {
    pub fn new(year: i32, month: u32) -> Result<Self, TaskError> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(TaskError::precondition(format!("shard year {year} is out of range")));
        }
        if !(1..=12).contains(&month) {
            return Err(TaskError::precondition(format!("shard month {month} is out of range")));
        }
        Ok(Self { year, month })
    }

    /// Key for a record: the publish date's year and month, or `(fallback_year, 1)`
    /// when the date is absent or unparsable.
    pub fn from_publish_date(publish_time: Option<&str>, fallback_year: i32) -> Self {
        publish_time
            .and_then(parse_publish_date)
            .and_then(|date| Self::new(date.year(), date.month()).ok())
            .unwrap_or(Self {
                year: fallback_year.clamp(MIN_YEAR, MAX_YEAR),
                month: 1,
            })
    }

    pub const fn year(&self) -> i32 {
        self.year
    }

    pub const fn month(&self) -> u32 {
        self.month
    }

    /// Physical table name, e.g. `comment_data_2021_03`.
    pub fn table_name(&self) -> String {
        format!("comment_data_{:04}_{:02}", self.year, self.month)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Strict `YYYY-MM-DD` parse shared by record year and shard key derivation.
pub fn parse_publish_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
