use crate::mention_contracts::{Mention, MentionContext, NewMention};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worth retrying: network, timeouts, rate limiting, temporary auth trouble.
    Transient,
    /// The remote side refused this mention for good.
    Permanent,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CollaboratorError {
    pub kind: FailureKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FailureKind::Permanent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionPage {
    pub mentions: Vec<NewMention>,
    /// `None` once the source has nothing older to offer.
    pub next_cursor: Option<String>,
}

/// What the mention is attached to. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    pub video_title: Option<String>,
    pub video_description: Option<String>,
    /// The comment the mention replies to.
    pub target_content: Option<String>,
    /// Top of the thread, when it differs from the target.
    pub root_content: Option<String>,
}

impl ThreadContext {
    pub fn is_empty(&self) -> bool {
        self.video_title.is_none()
            && self.video_description.is_none()
            && self.target_content.is_none()
            && self.root_content.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub mention_id: String,
    pub author: String,
    pub content: String,
    pub context: MentionContext,
    pub thread: ThreadContext,
}

impl ReplyRequest {
    pub fn for_mention(mention: &Mention, cleaned_content: impl Into<String>) -> Self {
        Self {
            mention_id: mention.id.clone(),
            author: mention.author.clone(),
            content: cleaned_content.into(),
            context: mention.context.clone(),
            thread: ThreadContext::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedReply {
    pub remote_id: Option<String>,
}

#[async_trait]
pub trait MentionSource: Send + Sync {
    async fn list_recent_mentions(
        &self,
        cursor: Option<&str>,
    ) -> Result<MentionPage, CollaboratorError>;
}

/// Looks up the video and comments around a mention. Callers treat an error as
/// "no context"; it never fails the mention.
#[async_trait]
pub trait ContextFetcher: Send + Sync {
    async fn fetch_context(&self, mention: &Mention) -> Result<ThreadContext, CollaboratorError>;
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate_reply(&self, request: &ReplyRequest) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait ReplyPoster: Send + Sync {
    async fn post_reply(
        &self,
        mention: &Mention,
        text: &str,
    ) -> Result<PostedReply, CollaboratorError>;
}
