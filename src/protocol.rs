//! Public protocol structs for the HTTP endpoints (serde ready, camelCase JSON).
//! Keep this small and stable to evolve backend and frontend independently.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::dedup::DuplicateReport;
use crate::domain::{ImageRef, QuestionRecord};
use crate::error::AppError;
use crate::flow::UserDecision;
use crate::ingest::{IngestOutcome, IngestRequest};
use crate::practice::PracticeQuestion;
use crate::stats::{KnowledgeStat, UserStats};
use crate::store::NewQuestion;

pub const MAX_BATCH: usize = 20;

// ---- health ----

#[derive(Debug, Serialize)]
pub struct HealthOut {
  pub ok: bool,
  pub service: &'static str,
}

// ---- analysis ----

/// Image sent with a capture: a fetchable URL, or base64 bytes (optionally as a
/// full `data:` URL).
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageIn {
  #[serde(default)] pub url: Option<String>,
  #[serde(default)] pub base64: Option<String>,
  #[serde(default)] pub mime: Option<String>,
}

impl TryFrom<ImageIn> for ImageRef {
  type Error = AppError;

  fn try_from(img: ImageIn) -> Result<Self, Self::Error> {
    if let Some(url) = img.url.filter(|u| !u.trim().is_empty()) {
      let url = url.trim().to_string();
      if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AppError::InvalidInput("image url must be http(s)".into()));
      }
      return Ok(ImageRef::Url(url));
    }

    let raw = img.base64.unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(AppError::InvalidInput("image needs a url or base64 data".into()));
    }
    // "data:image/png;base64,AAAA" carries its own mime type.
    let (mime, data) = match raw.strip_prefix("data:").and_then(|r| r.split_once(";base64,")) {
      Some((mime, data)) => (mime.to_string(), data),
      None => (img.mime.unwrap_or_else(|| "image/jpeg".into()), raw),
    };
    if STANDARD.decode(data).is_err() {
      return Err(AppError::InvalidInput("image base64 is not valid".into()));
    }
    Ok(ImageRef::Inline { mime, data_base64: data.to_string() })
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeIn {
  pub owner_id: String,
  #[serde(default)] pub ocr_text: String,
  #[serde(default)] pub image: Option<ImageIn>,
  #[serde(default)] pub subject_hint: Option<String>,
  #[serde(default)] pub user_answer: Option<String>,
}

impl TryFrom<AnalyzeIn> for IngestRequest {
  type Error = AppError;

  fn try_from(a: AnalyzeIn) -> Result<Self, Self::Error> {
    Ok(IngestRequest {
      owner_id: a.owner_id,
      ocr_text: a.ocr_text,
      image: a.image.map(ImageRef::try_from).transpose()?,
      subject_hint: a.subject_hint,
      user_answer: a.user_answer,
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBatchIn {
  pub items: Vec<AnalyzeIn>,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
  pub code: &'static str,
  pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BatchItemOut {
  pub ok: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub outcome: Option<IngestOutcome>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<ErrorOut>,
}

impl From<Result<IngestOutcome, AppError>> for BatchItemOut {
  fn from(r: Result<IngestOutcome, AppError>) -> Self {
    match r {
      Ok(outcome) => BatchItemOut { ok: true, outcome: Some(outcome), error: None },
      Err(e) => BatchItemOut {
        ok: false,
        outcome: None,
        error: Some(ErrorOut { code: e.code(), message: e.to_string() }),
      },
    }
  }
}

#[derive(Debug, Serialize)]
pub struct AnalyzeBatchOut {
  pub results: Vec<BatchItemOut>,
}

// ---- duplicates ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDuplicateIn {
  pub owner_id: String,
  pub content: String,
  #[serde(default)] pub subject: Option<String>,
}

pub type CheckDuplicateOut = DuplicateReport;

// ---- questions ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveQuestionIn {
  #[serde(flatten)]
  pub question: NewQuestion,
  /// Edit a known question directly, skipping the duplicate check.
  #[serde(default)] pub update_id: Option<String>,
  /// Answer to a previously reported duplicate.
  #[serde(default)] pub decision: Option<UserDecision>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
  pub owner_id: String,
  #[serde(default)] pub subject: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
  pub owner_id: String,
}

#[derive(Debug, Serialize)]
pub struct QuestionsOut {
  pub questions: Vec<QuestionRecord>,
  pub count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteredIn {
  pub owner_id: String,
  pub mastered: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticeResultIn {
  pub owner_id: String,
  pub correct: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIn {
  pub owner_id: String,
  pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ClearOut {
  pub removed: usize,
}

// ---- stats / practice / routing ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsOut {
  #[serde(flatten)]
  pub user: UserStats,
  pub knowledge: Vec<KnowledgeStat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticeIn {
  pub owner_id: String,
  pub subject: String,
  pub knowledge_point: String,
  #[serde(default)] pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PracticeOut {
  pub questions: Vec<PracticeQuestion>,
  pub count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPlanIn {
  #[serde(default)] pub text: String,
  #[serde(default)] pub has_image: bool,
}
