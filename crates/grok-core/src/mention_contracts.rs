use crate::MentionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_BUSINESS_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentionedUser {
    pub user_id: String,
    pub nickname: String,
}

/// Where a mention sits on the source platform. Captured once at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentionContext {
    pub kind: String,
    pub subject_id: String,
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "default_business_id")]
    pub business_id: u32,
    #[serde(default)]
    pub reply_disabled: bool,
    #[serde(default)]
    pub mentioned: Vec<MentionedUser>,
}

fn default_business_id() -> u32 {
    DEFAULT_BUSINESS_ID
}

impl MentionContext {
    pub fn new(kind: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subject_id: subject_id.into(),
            root_id: None,
            parent_id: None,
            business_id: DEFAULT_BUSINESS_ID,
            reply_disabled: false,
            mentioned: Vec::new(),
        }
    }

    pub fn is_threaded(&self) -> bool {
        self.parent_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMention {
    pub id: String,
    pub author: String,
    pub author_id: String,
    pub content: String,
    pub context: MentionContext,
    pub source_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub id: String,
    pub author: String,
    pub author_id: String,
    pub content: String,
    pub context: MentionContext,
    pub source_ts: DateTime<Utc>,
    pub status: MentionStatus,
    pub attempt_count: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reply_text: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts(BTreeMap<MentionStatus, u64>);

impl Default for StatusCounts {
    fn default() -> Self {
        Self(
            MentionStatus::ALL
                .iter()
                .map(|status| (*status, 0))
                .collect(),
        )
    }
}

impl StatusCounts {
    pub fn set(&mut self, status: MentionStatus, count: u64) {
        self.0.insert(status, count);
    }

    pub fn get(&self, status: MentionStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MentionStatus, u64)> + '_ {
        self.0.iter().map(|(status, count)| (*status, *count))
    }
}
