use crate::config::AgentConfig;
use anyhow::Context;
use async_trait::async_trait;
use grok_core::collaborators::{CollaboratorError, ReplyGenerator, ReplyRequest};
use grok_core::content::truncate_chars;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const MAX_REPLY_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct ChatCompletionsGenerator {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    system_prompt: String,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        // The processor enforces the generation timeout; this only bounds a stuck socket.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                config.generation_timeout_seconds.max(1).saturating_mul(2),
            ))
            .build()
            .context("failed to build llm http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
        })
    }
}

#[async_trait]
impl ReplyGenerator for ChatCompletionsGenerator {
    async fn generate_reply(&self, request: &ReplyRequest) -> Result<String, CollaboratorError> {
        let prompt = build_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        debug!(event = "llm_request", mention_id = %request.mention_id, model = %self.model);
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| CollaboratorError::transient(format!("llm request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|err| CollaboratorError::transient(format!("malformed llm response: {err}")))?;
        let raw = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        let reply = clean_reply(&raw);
        if reply.is_empty() {
            return Err(CollaboratorError::transient("llm returned an empty completion"));
        }
        Ok(reply)
    }
}

/// A request the API refuses as malformed will be refused again; everything
/// else (auth hiccups, rate limits, outages) is worth another attempt.
fn classify_status(status: StatusCode, detail: &str) -> CollaboratorError {
    let message = format!(
        "llm returned {status}: {}",
        truncate_chars(detail.trim(), 200)
    );
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            CollaboratorError::permanent(message)
        }
        _ => CollaboratorError::transient(message),
    }
}

pub fn build_prompt(request: &ReplyRequest) -> String {
    let mut parts = vec![
        format!("用户 @{} 在B站评论中@提到了你。", request.author),
        format!("评论内容: {}", request.content),
    ];
    if request.context.is_threaded() {
        parts.push("这条评论是对楼中楼的回复。".to_string());
    }
    let thread = &request.thread;
    if let Some(title) = &thread.video_title {
        parts.push(format!("视频标题: {title}"));
    }
    if let Some(description) = &thread.video_description {
        parts.push(format!("视频简介: {description}"));
    }
    if let Some(root) = &thread.root_content {
        parts.push(format!("楼主评论: {root}"));
    }
    if let Some(target) = &thread.target_content {
        parts.push(format!("被回复的评论: {target}"));
    }
    parts.push("请生成一个简短友好的回复（不超过100字），表达感谢并适当回应。".to_string());
    parts.join("\n")
}

/// Unwraps code fences and `{"response": ...}` payloads some models emit, then
/// caps the length the comment box accepts.
pub fn clean_reply(raw: &str) -> String {
    let mut reply = raw.trim().to_string();

    if reply.starts_with("```") {
        let lines = reply.lines().collect::<Vec<_>>();
        let body = if lines.len() > 2 {
            lines[1..lines.len() - 1].join("\n")
        } else {
            reply.clone()
        };
        reply = body.trim().trim_matches('`').trim().to_string();
    }

    if reply.starts_with('{') {
        if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(&reply) {
            if let Some(serde_json::Value::String(text)) = object.get("response") {
                reply = text.trim().to_string();
            }
        }
    }

    truncate_chars(&reply, MAX_REPLY_CHARS)
}
