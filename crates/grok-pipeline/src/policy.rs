use grok_core::collaborators::ReplyRequest;
use grok_core::content::clean_mention_content;
use grok_core::mention_contracts::Mention;
use std::collections::BTreeSet;

pub const DEFAULT_ALLOWED_KINDS: [&str; 5] = ["reply", "dynamic", "1", "2", "17"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Reply(ReplyRequest),
    Skip(String),
}

/// Decides, before any collaborator is called, whether a claimed mention is
/// worth answering at all.
#[derive(Debug, Clone)]
pub struct MentionPolicy {
    pub allowed_kinds: BTreeSet<String>,
}

impl Default for MentionPolicy {
    fn default() -> Self {
        Self {
            allowed_kinds: DEFAULT_ALLOWED_KINDS
                .iter()
                .map(|kind| kind.to_string())
                .collect(),
        }
    }
}

impl MentionPolicy {
    pub fn evaluate(&self, mention: &Mention) -> PolicyDecision {
        let context = &mention.context;
        if context.reply_disabled {
            return PolicyDecision::Skip("replies are disabled on this item".to_string());
        }

        let kind = context.kind.trim().to_lowercase();
        if !self.allowed_kinds.contains(&kind) {
            return PolicyDecision::Skip(format!("unsupported mention kind: {}", context.kind));
        }

        let cleaned = clean_mention_content(&mention.content, context);
        if cleaned.is_empty() && !context.is_threaded() {
            return PolicyDecision::Skip("mention has no content to answer".to_string());
        }

        PolicyDecision::Reply(ReplyRequest::for_mention(mention, cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grok_core::mention_contracts::MentionContext;
    use grok_core::MentionStatus;

    fn mention(content: &str, context: MentionContext) -> Mention {
        let ts = Utc
            .with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp");
        Mention {
            id: "m1".to_string(),
            author: "alice".to_string(),
            author_id: "111".to_string(),
            content: content.to_string(),
            context,
            source_ts: ts,
            status: MentionStatus::Processing,
            attempt_count: 1,
            claimed_at: Some(ts),
            lease_expires_at: None,
            reply_text: None,
            last_error: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn replies_with_cleaned_content() {
        let decision = MentionPolicy::default().evaluate(&mention(
            "@grok 这是什么歌？",
            MentionContext::new("reply", "42"),
        ));
        match decision {
            PolicyDecision::Reply(request) => {
                assert_eq!(request.content, "这是什么歌？");
                assert_eq!(request.author, "alice");
                assert_eq!(request.mention_id, "m1");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn skips_disabled_unsupported_and_empty_mentions() {
        let policy = MentionPolicy::default();

        let mut disabled = MentionContext::new("reply", "42");
        disabled.reply_disabled = true;
        assert!(matches!(
            policy.evaluate(&mention("@grok hi", disabled)),
            PolicyDecision::Skip(reason) if reason.contains("disabled")
        ));

        assert!(matches!(
            policy.evaluate(&mention("@grok hi", MentionContext::new("live", "42"))),
            PolicyDecision::Skip(reason) if reason.contains("live")
        ));

        assert!(matches!(
            policy.evaluate(&mention("@grok", MentionContext::new("Reply", "42"))),
            PolicyDecision::Skip(reason) if reason.contains("no content")
        ));
    }

    #[test]
    fn empty_threaded_mention_is_still_answered() {
        let mut context = MentionContext::new("reply", "42");
        context.parent_id = Some("7".to_string());
        assert!(matches!(
            MentionPolicy::default().evaluate(&mention("回复 @bob :@grok", context)),
            PolicyDecision::Reply(request) if request.content.is_empty()
        ));
    }
}
