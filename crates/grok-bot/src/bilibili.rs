use crate::config::BilibiliConfig;
use crate::credentials::Credentials;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grok_core::collaborators::{
    CollaboratorError, ContextFetcher, MentionPage, MentionSource, PostedReply, ReplyPoster,
    ThreadContext,
};
use grok_core::content::truncate_chars;
use grok_core::mention_contracts::{Mention, MentionContext, MentionedUser, NewMention};
use grok_core::{deserialize_id, deserialize_optional_id};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const BILIBILI_REFERER: &str = "https://www.bilibili.com";

const MAX_TITLE_CHARS: usize = 1000;
const MAX_DESCRIPTION_CHARS: usize = 500;
const MAX_COMMENT_CHARS: usize = 2000;
/// A nested reply is looked up on the first page of its thread only.
const THREAD_PAGE_SIZE: &str = "20";

/// Reply API codes that will not change on retry.
const CODE_COMMENT_DELETED: i64 = 12002;
const CODE_REPLY_FORBIDDEN: i64 = 12030;

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct AtFeed {
    #[serde(default)]
    items: Vec<AtItem>,
    #[serde(default)]
    cursor: Option<AtCursor>,
}

#[derive(Debug, Deserialize)]
struct AtCursor {
    #[serde(default)]
    is_end: bool,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtItem {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
    #[serde(default)]
    user: AtUser,
    #[serde(default)]
    item: AtDetail,
    #[serde(default)]
    at_time: i64,
}

#[derive(Debug, Default, Deserialize)]
struct AtUser {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    mid: Option<String>,
    #[serde(default)]
    nickname: String,
}

#[derive(Debug, Default, Deserialize)]
struct AtDetail {
    #[serde(default, rename = "type", deserialize_with = "deserialize_optional_id")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    business_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    subject_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    root_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    target_id: Option<String>,
    #[serde(default)]
    source_content: String,
    #[serde(default)]
    hide_reply_button: bool,
    #[serde(default)]
    at_details: Vec<AtUser>,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyAdded {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    rpid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoView {
    #[serde(default)]
    title: String,
    #[serde(default)]
    desc: String,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyPage {
    #[serde(default)]
    replies: Option<Vec<ReplyItem>>,
}

#[derive(Debug, Deserialize)]
struct ReplyItem {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    rpid: Option<String>,
    #[serde(default)]
    content: ReplyContent,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyContent {
    #[serde(default)]
    message: String,
}

/// Mention feed and comment API client; one instance serves as the mention
/// source, the context fetcher and the reply poster.
pub struct BilibiliClient {
    http: reqwest::Client,
    api_base: String,
    csrf: String,
    page_size: usize,
}

impl BilibiliClient {
    pub fn new(
        config: &BilibiliConfig,
        credentials: &Credentials,
        page_size: usize,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(REFERER, HeaderValue::from_static(BILIBILI_REFERER));
        let mut cookie = HeaderValue::from_str(&credentials.cookie_header())
            .context("credentials contain characters not allowed in a cookie header")?;
        cookie.set_sensitive(true);
        headers.insert(COOKIE, cookie);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("failed to build bilibili http client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            csrf: credentials.bili_jct.clone(),
            page_size: page_size.max(1),
        })
    }
}

impl BilibiliClient {
    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, CollaboratorError> {
        let response = self
            .http
            .get(format!("{}{path}", self.api_base))
            .query(query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| CollaboratorError::transient(format!("{path} request failed: {err}")))?;
        response
            .text()
            .await
            .map_err(|err| CollaboratorError::transient(format!("{path} read failed: {err}")))
    }

    async fn fetch_video(&self, subject_id: &str) -> Result<VideoView, CollaboratorError> {
        let body = self
            .get_text("/x/web-interface/view", &[("aid", subject_id)])
            .await?;
        parse_video_view(&body)
    }

    async fn fetch_replies(
        &self,
        path: &str,
        context: &MentionContext,
        root: &str,
        page_size: &str,
    ) -> Result<Vec<ReplyItem>, CollaboratorError> {
        let business_id = context.business_id.to_string();
        let body = self
            .get_text(
                path,
                &[
                    ("oid", context.subject_id.as_str()),
                    ("type", business_id.as_str()),
                    ("root", root),
                    ("ps", page_size),
                    ("pn", "1"),
                ],
            )
            .await?;
        parse_reply_page(&body)
    }

    /// The comment the mention answers. Without a root the target is itself a
    /// top-level comment; otherwise it is searched for inside the root's thread.
    async fn fetch_target_comment(
        &self,
        context: &MentionContext,
        target_id: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        let replies = match context.root_id.as_deref() {
            None => {
                self.fetch_replies("/x/v2/reply", context, target_id, "1")
                    .await?
            }
            Some(root_id) => {
                let replies = self
                    .fetch_replies("/x/v2/reply/reply", context, root_id, THREAD_PAGE_SIZE)
                    .await?;
                replies
                    .into_iter()
                    .filter(|reply| reply.rpid.as_deref() == Some(target_id))
                    .collect()
            }
        };
        Ok(first_message(replies))
    }

    async fn fetch_root_comment(
        &self,
        context: &MentionContext,
        root_id: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        let replies = self
            .fetch_replies("/x/v2/reply", context, root_id, "1")
            .await?;
        Ok(first_message(replies))
    }
}

#[async_trait]
impl ContextFetcher for BilibiliClient {
    /// Each lookup is independent; one that fails is logged and left empty.
    async fn fetch_context(&self, mention: &Mention) -> Result<ThreadContext, CollaboratorError> {
        let context = &mention.context;
        let mut thread = ThreadContext::default();

        match self.fetch_video(&context.subject_id).await {
            Ok(video) => {
                thread.video_title = non_empty(&video.title, MAX_TITLE_CHARS);
                thread.video_description = non_empty(&video.desc, MAX_DESCRIPTION_CHARS);
            }
            Err(err) => {
                debug!(event = "context_video_unavailable", mention_id = %mention.id, error = %err)
            }
        }

        if let Some(target_id) = context.parent_id.as_deref() {
            match self.fetch_target_comment(context, target_id).await {
                Ok(content) => {
                    thread.target_content =
                        content.and_then(|content| non_empty(&content, MAX_COMMENT_CHARS));
                }
                Err(err) => {
                    warn!(event = "context_target_unavailable", mention_id = %mention.id, error = %err)
                }
            }
        }

        if let Some(root_id) = context
            .root_id
            .as_deref()
            .filter(|root_id| Some(*root_id) != context.parent_id.as_deref())
        {
            match self.fetch_root_comment(context, root_id).await {
                Ok(content) => {
                    thread.root_content =
                        content.and_then(|content| non_empty(&content, MAX_COMMENT_CHARS));
                }
                Err(err) => {
                    warn!(event = "context_root_unavailable", mention_id = %mention.id, error = %err)
                }
            }
        }

        debug!(
            event = "context_fetched",
            mention_id = %mention.id,
            empty = thread.is_empty()
        );
        Ok(thread)
    }
}

#[async_trait]
impl MentionSource for BilibiliClient {
    async fn list_recent_mentions(
        &self,
        cursor: Option<&str>,
    ) -> Result<MentionPage, CollaboratorError> {
        let cursor = cursor.unwrap_or("0");
        let size = self.page_size.to_string();
        debug!(event = "mention_feed_request", cursor, size = self.page_size);
        let response = self
            .http
            .get(format!("{}/x/msgfeed/at", self.api_base))
            .query(&[
                ("type", "at"),
                ("cursor", cursor),
                ("size", size.as_str()),
            ])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| CollaboratorError::transient(format!("mention feed request failed: {err}")))?;
        let body = response
            .text()
            .await
            .map_err(|err| CollaboratorError::transient(format!("mention feed read failed: {err}")))?;
        parse_mention_feed(&body, Utc::now())
    }
}

#[async_trait]
impl ReplyPoster for BilibiliClient {
    async fn post_reply(
        &self,
        mention: &Mention,
        text: &str,
    ) -> Result<PostedReply, CollaboratorError> {
        let context = &mention.context;
        let business_id = context.business_id.to_string();
        let form = [
            ("message", text),
            ("type", business_id.as_str()),
            ("oid", context.subject_id.as_str()),
            ("root", context.root_id.as_deref().unwrap_or("0")),
            ("parent", context.parent_id.as_deref().unwrap_or("0")),
            ("csrf", self.csrf.as_str()),
        ];
        let response = self
            .http
            .post(format!("{}/x/v2/reply/add", self.api_base))
            .form(&form)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| CollaboratorError::transient(format!("reply request failed: {err}")))?;
        let body = response
            .text()
            .await
            .map_err(|err| CollaboratorError::transient(format!("reply read failed: {err}")))?;
        parse_reply_response(&body)
    }
}

pub(crate) fn parse_mention_feed(
    body: &str,
    now: DateTime<Utc>,
) -> Result<MentionPage, CollaboratorError> {
    let envelope: ApiEnvelope<AtFeed> = serde_json::from_str(body)
        .map_err(|err| CollaboratorError::transient(format!("malformed mention feed: {err}")))?;
    if envelope.code != 0 {
        return Err(CollaboratorError::transient(format!(
            "mention feed returned code {}: {}",
            envelope.code, envelope.message
        )));
    }
    let feed = envelope.data.unwrap_or_default();

    let mut mentions = Vec::with_capacity(feed.items.len());
    for item in feed.items {
        let Some(subject_id) = item.item.subject_id.clone() else {
            warn!(event = "mention_without_subject", mention_id = %item.id);
            continue;
        };
        mentions.push(into_new_mention(item, subject_id, now));
    }

    let next_cursor = feed
        .cursor
        .filter(|cursor| !cursor.is_end)
        .and_then(|cursor| cursor.cursor);
    Ok(MentionPage {
        mentions,
        next_cursor,
    })
}

fn into_new_mention(item: AtItem, subject_id: String, now: DateTime<Utc>) -> NewMention {
    let detail = item.item;
    let mut context = MentionContext::new(detail.kind.unwrap_or_else(|| "reply".to_string()), subject_id);
    context.root_id = detail.root_id;
    context.parent_id = detail.target_id;
    if let Some(business_id) = detail.business_id.and_then(|id| id.parse().ok()) {
        context.business_id = business_id;
    }
    context.reply_disabled = detail.hide_reply_button;
    context.mentioned = detail
        .at_details
        .into_iter()
        .filter(|user| !user.nickname.is_empty())
        .map(|user| MentionedUser {
            user_id: user.mid.unwrap_or_default(),
            nickname: user.nickname,
        })
        .collect();

    NewMention {
        id: item.id,
        author: item.user.nickname,
        author_id: item.user.mid.unwrap_or_default(),
        content: detail.source_content,
        context,
        source_ts: DateTime::from_timestamp(item.at_time, 0)
            .filter(|_| item.at_time > 0)
            .unwrap_or(now),
    }
}

pub(crate) fn parse_reply_response(body: &str) -> Result<PostedReply, CollaboratorError> {
    let envelope: ApiEnvelope<ReplyAdded> = serde_json::from_str(body)
        .map_err(|err| CollaboratorError::transient(format!("malformed reply response: {err}")))?;
    match envelope.code {
        0 => Ok(PostedReply {
            remote_id: envelope.data.and_then(|data| data.rpid),
        }),
        CODE_COMMENT_DELETED => Err(CollaboratorError::permanent("comment was deleted")),
        CODE_REPLY_FORBIDDEN => Err(CollaboratorError::permanent(
            "replies to this comment are not allowed",
        )),
        code => Err(CollaboratorError::transient(format!(
            "reply rejected with code {code}: {}",
            describe_code(code, &envelope.message)
        ))),
    }
}

fn parse_video_view(body: &str) -> Result<VideoView, CollaboratorError> {
    let envelope: ApiEnvelope<VideoView> = serde_json::from_str(body)
        .map_err(|err| CollaboratorError::transient(format!("malformed video info: {err}")))?;
    if envelope.code != 0 {
        return Err(CollaboratorError::transient(format!(
            "video info returned code {}: {}",
            envelope.code, envelope.message
        )));
    }
    Ok(envelope.data.unwrap_or_default())
}

fn parse_reply_page(body: &str) -> Result<Vec<ReplyItem>, CollaboratorError> {
    let envelope: ApiEnvelope<ReplyPage> = serde_json::from_str(body)
        .map_err(|err| CollaboratorError::transient(format!("malformed reply list: {err}")))?;
    if envelope.code != 0 {
        return Err(CollaboratorError::transient(format!(
            "reply list returned code {}: {}",
            envelope.code, envelope.message
        )));
    }
    Ok(envelope
        .data
        .and_then(|page| page.replies)
        .unwrap_or_default())
}

fn first_message(replies: Vec<ReplyItem>) -> Option<String> {
    replies
        .into_iter()
        .map(|reply| reply.content.message)
        .find(|message| !message.trim().is_empty())
}

fn non_empty(text: &str, max_chars: usize) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| truncate_chars(text, max_chars))
}

fn describe_code(code: i64, message: &str) -> String {
    let known = match code {
        -101 => "not logged in",
        -102 => "account disabled",
        -104 => "rate limited",
        -412 => "request blocked",
        _ => "",
    };
    match (known.is_empty(), message.is_empty()) {
        (true, true) => "unknown error".to_string(),
        (true, false) => message.to_string(),
        (false, _) => known.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use grok_core::collaborators::FailureKind;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    const FEED: &str = r#"{
        "code": 0,
        "message": "0",
        "data": {
            "cursor": {"is_end": false, "cursor": 1771855200},
            "items": [
                {
                    "id": 90001,
                    "user": {"mid": 2001, "nickname": "viewer"},
                    "item": {
                        "type": "reply",
                        "business_id": 1,
                        "subject_id": 114514,
                        "root_id": 7001,
                        "target_id": 7002,
                        "source_content": "回复 @someone :@grok 这是什么歌？",
                        "hide_reply_button": false,
                        "at_details": [{"mid": 3001, "nickname": "grok"}]
                    },
                    "at_time": 1771855200
                },
                {
                    "id": "90002",
                    "user": {"mid": 2002, "nickname": "fan"},
                    "item": {
                        "type": 17,
                        "subject_id": "998877",
                        "root_id": 0,
                        "target_id": 0,
                        "source_content": "@grok hi",
                        "hide_reply_button": true
                    },
                    "at_time": 0
                },
                {
                    "id": 90003,
                    "user": {"mid": 2003, "nickname": "ghost"},
                    "item": {"type": "reply", "source_content": "@grok ?"},
                    "at_time": 1771855100
                }
            ]
        }
    }"#;

    #[test]
    fn parses_feed_items_into_mentions() {
        let page = parse_mention_feed(FEED, now()).expect("page");
        assert_eq!(page.next_cursor.as_deref(), Some("1771855200"));
        assert_eq!(page.mentions.len(), 2);

        let threaded = &page.mentions[0];
        assert_eq!(threaded.id, "90001");
        assert_eq!(threaded.author, "viewer");
        assert_eq!(threaded.author_id, "2001");
        assert_eq!(threaded.context.kind, "reply");
        assert_eq!(threaded.context.subject_id, "114514");
        assert_eq!(threaded.context.root_id.as_deref(), Some("7001"));
        assert_eq!(threaded.context.parent_id.as_deref(), Some("7002"));
        assert_eq!(threaded.context.mentioned[0].nickname, "grok");
        assert_eq!(threaded.source_ts.timestamp(), 1771855200);

        let top_level = &page.mentions[1];
        assert_eq!(top_level.id, "90002");
        assert_eq!(top_level.context.kind, "17");
        assert_eq!(top_level.context.root_id, None);
        assert_eq!(top_level.context.parent_id, None);
        assert!(top_level.context.reply_disabled);
        assert_eq!(top_level.source_ts, now());
    }

    #[test]
    fn end_of_feed_has_no_cursor() {
        let page = parse_mention_feed(
            r#"{"code":0,"data":{"cursor":{"is_end":true,"cursor":5},"items":[]}}"#,
            now(),
        )
        .expect("page");
        assert!(page.mentions.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn feed_api_errors_are_transient() {
        let err = parse_mention_feed(r#"{"code":-101,"message":"账号未登录"}"#, now())
            .expect_err("not logged in");
        assert_eq!(err.kind, FailureKind::Transient);
        assert!(err.message.contains("-101"));

        let err = parse_mention_feed("<html>", now()).expect_err("garbage");
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[test]
    fn reply_codes_are_classified() {
        let posted = parse_reply_response(r#"{"code":0,"data":{"rpid":123456}}"#).expect("posted");
        assert_eq!(posted.remote_id.as_deref(), Some("123456"));

        for (code, kind) in [
            (12002, FailureKind::Permanent),
            (12030, FailureKind::Permanent),
            (-101, FailureKind::Transient),
            (-104, FailureKind::Transient),
            (-412, FailureKind::Transient),
            (99999, FailureKind::Transient),
        ] {
            let err = parse_reply_response(&format!(r#"{{"code":{code},"message":"x"}}"#))
                .expect_err("rejected");
            assert_eq!(err.kind, kind, "code {code}");
        }
    }

    #[test]
    fn video_view_yields_title_and_description() {
        let video = parse_video_view(
            r#"{"code":0,"data":{"title":"晴天 MV","desc":"周杰伦","owner":{"mid":1}}}"#,
        )
        .expect("video");
        assert_eq!(non_empty(&video.title, MAX_TITLE_CHARS).as_deref(), Some("晴天 MV"));
        assert_eq!(non_empty(&video.desc, MAX_DESCRIPTION_CHARS).as_deref(), Some("周杰伦"));
        assert_eq!(non_empty("  ", MAX_DESCRIPTION_CHARS), None);

        let err = parse_video_view(r#"{"code":-404,"message":"啥都木有"}"#).expect_err("missing");
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[test]
    fn reply_page_tolerates_null_replies_and_matches_ids() {
        let replies = parse_reply_page(
            r#"{"code":0,"data":{"replies":[
                {"rpid":7001,"content":{"message":"第一"}},
                {"rpid":"7002","content":{"message":"好听"}}
            ]}}"#,
        )
        .expect("replies");
        let target = replies
            .into_iter()
            .filter(|reply| reply.rpid.as_deref() == Some("7002"))
            .collect::<Vec<_>>();
        assert_eq!(first_message(target).as_deref(), Some("好听"));

        let empty = parse_reply_page(r#"{"code":0,"data":{"replies":null}}"#).expect("empty");
        assert_eq!(first_message(empty), None);
        assert!(parse_reply_page(r#"{"code":12022,"message":"已经被删除了"}"#).is_err());
    }

    #[test]
    fn long_comments_are_truncated() {
        let long = "评".repeat(MAX_COMMENT_CHARS + 10);
        let kept = non_empty(&long, MAX_COMMENT_CHARS).expect("kept");
        assert_eq!(kept.chars().count(), MAX_COMMENT_CHARS);
    }

    #[test]
    fn rate_limit_code_is_described() {
        let err = parse_reply_response(r#"{"code":-104,"message":""}"#).expect_err("limited");
        assert!(err.message.contains("rate limited"));
    }
}
