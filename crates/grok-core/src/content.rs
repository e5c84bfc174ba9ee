use crate::mention_contracts::MentionContext;
use regex::Regex;
use std::sync::OnceLock;

fn reply_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^回复\s+@\S+\s*[:：]\s*").expect("valid regex"))
}

fn handle_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@\S+\s*").expect("valid regex"))
}

/// Strips the platform's threaded-reply prefix and every `@handle`, leaving
/// only what the author actually said.
pub fn clean_mention_content(content: &str, context: &MentionContext) -> String {
    let mut cleaned = content.trim().to_string();
    if context.is_threaded() {
        cleaned = reply_prefix_pattern().replace(&cleaned, "").into_owned();
    }
    for user in &context.mentioned {
        if user.nickname.is_empty() {
            continue;
        }
        cleaned = cleaned.replace(&format!("@{}", user.nickname), " ");
    }
    handle_pattern()
        .replace_all(&cleaned, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cuts `text` to at most `max_chars` characters, ending with "..." when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated = text.chars().take(keep).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mention_contracts::MentionedUser;

    #[test]
    fn strips_reply_prefix_only_for_threaded_mentions() {
        let mut context = MentionContext::new("reply", "987654");
        let text = "回复 @alice :这个视频讲得怎么样 @grok";

        assert_eq!(
            clean_mention_content(text, &context),
            "回复 :这个视频讲得怎么样"
        );

        context.parent_id = Some("555".to_string());
        assert_eq!(clean_mention_content(text, &context), "这个视频讲得怎么样");
    }

    #[test]
    fn removes_nicknames_with_spaces_from_at_details() {
        let mut context = MentionContext::new("reply", "987654");
        context.mentioned.push(MentionedUser {
            user_id: "6794023".to_string(),
            nickname: "grok bot".to_string(),
        });

        assert_eq!(
            clean_mention_content("@grok bot  what is this?", &context),
            "what is this?"
        );
    }

    #[test]
    fn mention_only_content_cleans_to_empty() {
        let context = MentionContext::new("reply", "987654");
        assert_eq!(clean_mention_content("  @grok  ", &context), "");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("一二三四五六", 5), "一二...");
        assert_eq!(truncate_chars("abcdef", 6), "abcdef");
    }
}
