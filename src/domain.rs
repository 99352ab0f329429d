//! Domain models: stored questions, OCR quality, backend kinds and the structured
//! analysis a backend produces for one captured question.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SUBJECT: &str = "未分类";
pub const DEFAULT_KNOWLEDGE_POINT: &str = "待标注";
pub const DEFAULT_DIFFICULTY: &str = "medium";
pub const DEFAULT_QUESTION_TYPE: &str = "未知";

/// One question in a student's error book.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
  pub id: String,
  pub owner_id: String,
  pub subject: String,
  pub content: String,
  pub knowledge_point: String,
  pub difficulty: String,      // free-form ("easy", "medium", "中等", ...)
  pub question_type: String,
  #[serde(default)] pub image_ref: String,
  #[serde(default)] pub user_answer: String,
  #[serde(default)] pub correct_answer: String,
  #[serde(default)] pub is_correct: Option<bool>,
  #[serde(default)] pub analysis: String,
  pub mastered: bool,
  #[serde(default)] pub mastered_time: Option<DateTime<Utc>>,
  #[serde(default)] pub practice_count: u32,
  #[serde(default)] pub correct_count: u32,
  #[serde(default)] pub wrong_count: u32,
  /// Most recent tutoring turns, oldest first.
  #[serde(default)] pub chat_history: Vec<ChatTurn>,
  pub create_time: DateTime<Utc>,
  pub update_time: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
  User,
  Assistant,
}

/// One message of the tutoring conversation kept on a question.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
  pub role: ChatRole,
  pub content: String,
  pub timestamp: DateTime<Utc>,
}

/// How far the OCR text can be trusted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OcrQuality {
  None,
  Low,
  Medium,
  High,
}

impl OcrQuality {
  pub fn as_str(self) -> &'static str {
    match self {
      OcrQuality::None => "none",
      OcrQuality::Low => "low",
      OcrQuality::Medium => "medium",
      OcrQuality::High => "high",
    }
  }
}

/// Downstream AI capability that turns a captured question into structured data.
/// Declared from cheapest to most expensive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
  GeneralText,
  MathSpecialized,
  VisionLanguage,
}

impl BackendKind {
  pub fn as_str(self) -> &'static str {
    match self {
      BackendKind::GeneralText => "generalText",
      BackendKind::MathSpecialized => "mathSpecialized",
      BackendKind::VisionLanguage => "visionLanguage",
    }
  }
}

impl std::fmt::Display for BackendKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Image handed to the vision backend: either a fetchable URL or inline bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageRef {
  Url(String),
  Inline { mime: String, data_base64: String },
}

impl ImageRef {
  /// URL form accepted by OpenAI-compatible `image_url` content parts.
  pub fn to_request_url(&self) -> String {
    match self {
      ImageRef::Url(u) => u.clone(),
      ImageRef::Inline { mime, data_base64 } => format!("data:{};base64,{}", mime, data_base64),
    }
  }

  /// Short, log-safe description (never the payload itself).
  pub fn describe(&self) -> String {
    match self {
      ImageRef::Url(u) => format!("url({} chars)", u.len()),
      ImageRef::Inline { mime, data_base64 } => format!("inline({}, {} b64 chars)", mime, data_base64.len()),
    }
  }
}

/// What one backend call receives.
#[derive(Clone, Debug)]
pub struct AnalysisInput {
  pub text: String,
  pub image: Option<ImageRef>,
  pub subject_hint: Option<String>,
}

/// Structured question data produced by a backend. Every field has a default so
/// partially filled model replies still deserialize.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StructuredAnalysis {
  #[serde(default = "default_subject")] pub subject: String,
  #[serde(default = "default_knowledge_point")] pub knowledge_point: String,
  #[serde(default = "default_difficulty")] pub difficulty: String,
  #[serde(default = "default_question_type")] pub question_type: String,
  #[serde(default)] pub correct_answer: String,
  #[serde(default)] pub user_answer: String,
  #[serde(default)] pub analysis: String,
  /// Question text as re-typed by the model (used when OCR produced nothing).
  #[serde(default)] pub formatted_text: String,
}

impl Default for StructuredAnalysis {
  fn default() -> Self {
    Self {
      subject: default_subject(),
      knowledge_point: default_knowledge_point(),
      difficulty: default_difficulty(),
      question_type: default_question_type(),
      correct_answer: String::new(),
      user_answer: String::new(),
      analysis: String::new(),
      formatted_text: String::new(),
    }
  }
}

fn default_subject() -> String { DEFAULT_SUBJECT.into() }
fn default_knowledge_point() -> String { DEFAULT_KNOWLEDGE_POINT.into() }
fn default_difficulty() -> String { DEFAULT_DIFFICULTY.into() }
fn default_question_type() -> String { DEFAULT_QUESTION_TYPE.into() }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_analysis_gets_defaults() {
    let a: StructuredAnalysis = serde_json::from_str(r#"{"subject":"数学","correctAnswer":"B"}"#).unwrap();
    assert_eq!(a.subject, "数学");
    assert_eq!(a.correct_answer, "B");
    assert_eq!(a.knowledge_point, DEFAULT_KNOWLEDGE_POINT);
    assert_eq!(a.difficulty, DEFAULT_DIFFICULTY);
    assert_eq!(a.question_type, DEFAULT_QUESTION_TYPE);
  }

  #[test]
  fn inline_image_becomes_data_url() {
    let img = ImageRef::Inline { mime: "image/png".into(), data_base64: "AAAA".into() };
    assert_eq!(img.to_request_url(), "data:image/png;base64,AAAA");
    assert!(!img.describe().contains("AAAA"));
  }

  #[test]
  fn backend_kind_serializes_camel_case() {
    let s = serde_json::to_string(&BackendKind::VisionLanguage).unwrap();
    assert_eq!(s, "\"visionLanguage\"");
  }
}
