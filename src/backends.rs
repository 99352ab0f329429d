//! Clients for the analysis backends.
//!
//! Every backend speaks the OpenAI-compatible chat.completions protocol
//! (DeepSeek for general text, DashScope compatible-mode for math and vision).
//! Calls are instrumented and log model names, latencies and response sizes,
//! never the contents or the API key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::{BackendSettings, Prompts};
use crate::domain::{AnalysisInput, BackendKind, ImageRef, StructuredAnalysis};
use crate::error::BackendError;
use crate::util::{extract_json_object, fill_template, trunc_for_log};

/// Seam between the ingestion pipeline and the AI services.
#[async_trait]
pub trait BackendInvoker: Send + Sync {
  /// Turn a captured question into structured data.
  async fn invoke(&self, kind: BackendKind, input: &AnalysisInput) -> Result<StructuredAnalysis, BackendError>;

  /// JSON completion (used for generated practice options).
  async fn complete(&self, kind: BackendKind, system: &str, user: &str) -> Result<String, BackendError>;

  /// Plain-prose tutoring reply. Only the vision kind is shown `image`.
  async fn converse(
    &self,
    kind: BackendKind,
    system: &str,
    user: &str,
    image: Option<&ImageRef>,
  ) -> Result<String, BackendError>;
}

#[derive(Clone)]
pub struct HttpBackends {
  client: reqwest::Client,
  settings: BackendSettings,
  prompts: Prompts,
}

impl HttpBackends {
  pub fn new(settings: BackendSettings, prompts: Prompts) -> Result<Self, BackendError> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(settings.timeout_secs))
      .build()
      .map_err(|e| BackendError::Http(e.to_string()))?;
    Ok(Self { client, settings, prompts })
  }

  fn analysis_messages(&self, kind: BackendKind, input: &AnalysisInput) -> Vec<ChatMessageReq> {
    let hint = input.subject_hint.as_deref().unwrap_or("未知");
    let text = if input.text.is_empty() { "（无）" } else { input.text.as_str() };

    let content = match (kind, &input.image) {
      (BackendKind::VisionLanguage, Some(image)) => {
        let prompt = fill_template(&self.prompts.vision_user_template, &[("text", text), ("subject_hint", hint)]);
        MessageContent::Parts(vec![
          ContentPart::ImageUrl { image_url: ImageUrl { url: image.to_request_url() } },
          ContentPart::Text { text: prompt },
        ])
      }
      _ => MessageContent::Text(fill_template(
        &self.prompts.analysis_user_template,
        &[("text", text), ("subject_hint", hint)],
      )),
    };

    vec![
      ChatMessageReq { role: "system", content: MessageContent::Text(self.prompts.analysis_system.clone()) },
      ChatMessageReq { role: "user", content },
    ]
  }

  fn converse_messages(kind: BackendKind, system: &str, user: &str, image: Option<&ImageRef>) -> Vec<ChatMessageReq> {
    let content = match (kind, image) {
      (BackendKind::VisionLanguage, Some(image)) => MessageContent::Parts(vec![
        ContentPart::ImageUrl { image_url: ImageUrl { url: image.to_request_url() } },
        ContentPart::Text { text: user.into() },
      ]),
      _ => MessageContent::Text(user.into()),
    };
    vec![
      ChatMessageReq { role: "system", content: MessageContent::Text(system.into()) },
      ChatMessageReq { role: "user", content },
    ]
  }

  /// One chat.completions round trip; returns the reply text.
  #[instrument(level = "debug", target = "backend", skip(self, messages), fields(backend = %kind))]
  async fn chat(
    &self,
    kind: BackendKind,
    messages: Vec<ChatMessageReq>,
    temperature: f32,
    json_reply: bool,
  ) -> Result<String, BackendError> {
    let endpoint = self.settings.endpoint(kind);
    let api_key = endpoint.api_key.as_deref().ok_or(BackendError::NotConfigured(kind))?;

    let url = format!("{}/chat/completions", endpoint.base_url);
    let req = ChatCompletionRequest {
      model: endpoint.model.clone(),
      messages,
      temperature,
      // Only DeepSeek reliably honours json_object; the others get it by prompt.
      response_format: (json_reply && kind == BackendKind::GeneralText).then(|| ResponseFormat { r#type: "json_object" }),
      max_tokens: Some(2000),
    };

    let start = Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "cuotiben-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", api_key))
      .json(&req).send().await
      .map_err(|e| self.transport_error(e))?;

    if !res.status().is_success() {
      let status = res.status().as_u16();
      let body = res.text().await.unwrap_or_default();
      let message = extract_api_error(&body).unwrap_or_else(|| trunc_for_log(&body, 200));
      return Err(BackendError::Status { status, message });
    }

    let body: ChatCompletionResponse = res.json().await
      .map_err(|e| if e.is_timeout() { self.transport_error(e) } else { BackendError::MalformedResponse(e.to_string()) })?;
    if let Some(usage) = &body.usage {
      info!(target: "backend", backend = %kind, model = %endpoint.model, prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "Backend usage");
    }

    let text = body.choices.first()
      .and_then(|c| c.message.content.as_ref())
      .map(content_text)
      .unwrap_or_default();
    debug!(target: "backend", backend = %kind, elapsed = ?start.elapsed(), reply_len = text.len(), "Backend replied");

    if text.trim().is_empty() {
      return Err(BackendError::MalformedResponse("empty reply".into()));
    }
    Ok(text)
  }

  fn transport_error(&self, e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
      BackendError::Timeout(self.settings.timeout_secs)
    } else {
      BackendError::Http(e.to_string())
    }
  }
}

#[async_trait]
impl BackendInvoker for HttpBackends {
  #[instrument(level = "info", target = "backend", skip(self, input), fields(backend = %kind, text_len = input.text.len(), image = ?input.image.as_ref().map(|i| i.describe())))]
  async fn invoke(&self, kind: BackendKind, input: &AnalysisInput) -> Result<StructuredAnalysis, BackendError> {
    let messages = self.analysis_messages(kind, input);
    let reply = self.chat(kind, messages, 0.2, true).await?;
    parse_analysis(&reply).map_err(|e| {
      warn!(target: "backend", backend = %kind, reply = %trunc_for_log(&reply, 80), "Unparseable analysis reply");
      e
    })
  }

  #[instrument(level = "info", target = "backend", skip(self, system, user), fields(backend = %kind, user_len = user.len()))]
  async fn complete(&self, kind: BackendKind, system: &str, user: &str) -> Result<String, BackendError> {
    let messages = vec![
      ChatMessageReq { role: "system", content: MessageContent::Text(system.into()) },
      ChatMessageReq { role: "user", content: MessageContent::Text(user.into()) },
    ];
    self.chat(kind, messages, 0.7, true).await
  }

  #[instrument(level = "info", target = "backend", skip(self, system, user, image), fields(backend = %kind, user_len = user.len(), image = ?image.map(|i| i.describe())))]
  async fn converse(
    &self,
    kind: BackendKind,
    system: &str,
    user: &str,
    image: Option<&ImageRef>,
  ) -> Result<String, BackendError> {
    let messages = Self::converse_messages(kind, system, user, image);
    // Lower temperature keeps worked math steps consistent.
    let temperature = if kind == BackendKind::MathSpecialized { 0.3 } else { 0.7 };
    self.chat(kind, messages, temperature, false).await
  }
}

/// Parse a model reply into `StructuredAnalysis`, tolerating prose around the JSON.
pub fn parse_analysis(reply: &str) -> Result<StructuredAnalysis, BackendError> {
  let json = extract_json_object(reply)
    .ok_or_else(|| BackendError::MalformedResponse("no JSON object in reply".into()))?;
  serde_json::from_str::<StructuredAnalysis>(json)
    .map_err(|e| BackendError::MalformedResponse(format!("JSON parse error: {e}")))
}

// DashScope may return content as `[{"text": "..."}]` instead of a string.
fn content_text(content: &Value) -> String {
  match content {
    Value::String(s) => s.trim().to_string(),
    Value::Array(parts) => parts
      .iter()
      .filter_map(|p| p.get("text").and_then(Value::as_str))
      .collect::<Vec<_>>()
      .join("")
      .trim()
      .to_string(),
    _ => String::new(),
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: &'static str, content: MessageContent }
#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
  Text(String),
  Parts(Vec<ContentPart>),
}
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
  Text { text: String },
  ImageUrl { image_url: ImageUrl },
}
#[derive(Serialize)]
struct ImageUrl { url: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: &'static str }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<Value> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an OpenAI-style error body.
fn extract_api_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BackendEndpoint;
  use serde_json::json;

  fn backends() -> HttpBackends {
    let ep = |model: &str| BackendEndpoint { api_key: None, base_url: "http://127.0.0.1:9".into(), model: model.into() };
    let settings = BackendSettings { general: ep("g"), math: ep("m"), vision: ep("v"), timeout_secs: 1 };
    HttpBackends::new(settings, Prompts::default()).unwrap()
  }

  #[test]
  fn analysis_reply_in_code_fence_parses() {
    let reply = "分析如下：\n```json\n{\"subject\":\"数学\",\"knowledgePoint\":\"一元二次方程\",\"correctAnswer\":\"x=1\"}\n```";
    let a = parse_analysis(reply).unwrap();
    assert_eq!(a.subject, "数学");
    assert_eq!(a.knowledge_point, "一元二次方程");
    assert_eq!(a.difficulty, "medium");
  }

  #[test]
  fn prose_only_reply_is_malformed() {
    assert!(matches!(parse_analysis("抱歉，我无法识别"), Err(BackendError::MalformedResponse(_))));
  }

  #[test]
  fn array_content_is_joined() {
    assert_eq!(content_text(&json!([{ "text": "{\"a\":" }, { "text": "1}" }])), "{\"a\":1}");
    assert_eq!(content_text(&json!(" plain ")), "plain");
    assert_eq!(content_text(&json!(null)), "");
  }

  #[test]
  fn vision_request_carries_image_part() {
    let b = backends();
    let input = AnalysisInput {
      text: "如图".into(),
      image: Some(ImageRef::Inline { mime: "image/jpeg".into(), data_base64: "AAAA".into() }),
      subject_hint: None,
    };
    let msgs = serde_json::to_value(b.analysis_messages(BackendKind::VisionLanguage, &input)).unwrap();
    let parts = &msgs[1]["content"];
    assert_eq!(parts[0]["type"], "image_url");
    assert_eq!(parts[0]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
    assert_eq!(parts[1]["type"], "text");

    // Text backends never see the image.
    let msgs = serde_json::to_value(b.analysis_messages(BackendKind::GeneralText, &input)).unwrap();
    assert!(msgs[1]["content"].is_string());
  }

  #[test]
  fn tutoring_image_reaches_only_the_vision_backend() {
    let image = ImageRef::Url("https://example.com/q.jpg".into());
    let msgs = serde_json::to_value(HttpBackends::converse_messages(BackendKind::VisionLanguage, "老师", "为什么？", Some(&image))).unwrap();
    assert_eq!(msgs[0]["content"], "老师");
    assert_eq!(msgs[1]["content"][0]["image_url"]["url"], "https://example.com/q.jpg");
    assert_eq!(msgs[1]["content"][1]["text"], "为什么？");

    let msgs = serde_json::to_value(HttpBackends::converse_messages(BackendKind::MathSpecialized, "老师", "为什么？", Some(&image))).unwrap();
    assert_eq!(msgs[1]["content"], "为什么？");
  }

  #[test]
  fn api_error_message_is_extracted() {
    assert_eq!(extract_api_error(r#"{"error":{"message":"bad key"}}"#).as_deref(), Some("bad key"));
    assert_eq!(extract_api_error("<html>"), None);
  }

  #[tokio::test]
  async fn unconfigured_backend_fails_fast() {
    let b = backends();
    let input = AnalysisInput { text: "1+1=?".into(), image: None, subject_hint: None };
    let err = b.invoke(BackendKind::MathSpecialized, &input).await.unwrap_err();
    assert_eq!(err, BackendError::NotConfigured(BackendKind::MathSpecialized));
  }
}
