//! Ingestion pipeline shared by the HTTP handlers.
//!
//! A captured question goes through:
//!   - OCR text cleanup
//!   - routing (which backend, and what to try when it fails)
//!   - the backend fallback chain
//!   - a duplicate scan over the owner's error book
//!
//! Saving a question runs the duplicate decision flow so a user's choice
//! ("update the old one", "keep both", "cancel") maps to a store operation.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::dedup::{find_duplicates, normalize, DuplicateReport};
use crate::domain::{AnalysisInput, BackendKind, ImageRef, QuestionRecord, StructuredAnalysis, DEFAULT_SUBJECT};
use crate::error::{AppError, BackendFailure};
use crate::flow::{DuplicateFlow, Resolution, UserDecision};
use crate::routing::RoutingPlan;
use crate::state::AppState;
use crate::store::{CorpusProvider, NewQuestion, SaveMode};
use crate::util::is_cjk;

const KEPT_SYMBOLS: &str = "+-*/=()[]{}.,?!:;'\"<>%×÷√²³π∠△≈≠≤≥∫∑∞°";

/// Normalize raw OCR output: trim, collapse whitespace runs to one space and
/// drop everything except CJK, ASCII letters and digits, punctuation and the
/// math symbols subject detection looks for.
pub fn clean_ocr_text(raw: &str) -> String {
  let kept: String = raw
    .chars()
    .filter(|&c| c.is_whitespace() || c.is_ascii_alphanumeric() || is_cjk(c) || KEPT_SYMBOLS.contains(c))
    .collect();
  kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trimmed, case-insensitive comparison. `None` when either side is missing.
pub fn check_answer(user_answer: &str, correct_answer: &str) -> Option<bool> {
  let (u, c) = (user_answer.trim(), correct_answer.trim());
  if u.is_empty() || c.is_empty() {
    return None;
  }
  Some(u.to_lowercase() == c.to_lowercase())
}

#[derive(Clone, Debug)]
pub struct IngestRequest {
  pub owner_id: String,
  pub ocr_text: String,
  pub image: Option<ImageRef>,
  pub subject_hint: Option<String>,
  /// Overrides whatever answer the backend read off the image.
  pub user_answer: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
  pub analysis: StructuredAnalysis,
  pub backend_used: BackendKind,
  pub routing: RoutingPlan,
  /// Backends that failed before `backend_used` answered.
  pub attempts: Vec<BackendFailure>,
  pub duplicates: DuplicateReport,
  pub flow: DuplicateFlow,
  pub is_correct: Option<bool>,
}

// Subject used to scope the duplicate scan: the caller's hint, else the
// subject the backend assigned (stored records carry the same labels).
fn dedup_scope(hint: Option<&str>, analysis: &StructuredAnalysis) -> Option<String> {
  hint
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .or_else(|| {
      let s = analysis.subject.trim();
      (!s.is_empty() && s != DEFAULT_SUBJECT).then(|| s.to_string())
    })
}

/// Walk `[primary, ...fallbacks]` until one backend answers.
async fn run_chain(
  state: &AppState,
  plan: &RoutingPlan,
  input: &AnalysisInput,
) -> Result<(BackendKind, StructuredAnalysis, Vec<BackendFailure>), AppError> {
  let mut attempts = Vec::new();
  for kind in plan.chain() {
    match state.backends.invoke(kind, input).await {
      Ok(analysis) => {
        debug!(target: "ingest", backend = %kind, failed_before = attempts.len(), "Backend succeeded");
        return Ok((kind, analysis, attempts));
      }
      Err(e) => {
        warn!(target: "ingest", backend = %kind, error = %e, "Backend failed; trying next in chain");
        attempts.push(BackendFailure { backend: kind, error: e.to_string() });
      }
    }
  }
  Err(AppError::BackendExhausted { attempts })
}

/// Analyse one captured question and scan the owner's book for duplicates.
#[instrument(level = "info", target = "ingest", skip(state, req), fields(owner_id = %req.owner_id, ocr_len = req.ocr_text.len(), has_image = req.image.is_some()))]
pub async fn analyze(state: &AppState, req: IngestRequest) -> Result<IngestOutcome, AppError> {
  if req.owner_id.trim().is_empty() {
    return Err(AppError::InvalidInput("ownerId is required".into()));
  }
  let text = clean_ocr_text(&req.ocr_text);
  // Punctuation-only OCR carries nothing to route or deduplicate on.
  let has_signal = !normalize(&text).is_empty();
  if !has_signal && req.image.is_none() {
    return Err(AppError::MissingContent);
  }

  let plan = state.routing.plan_routing(&text, req.image.is_some());
  info!(
    target: "ingest",
    quality = plan.ocr_quality.as_str(),
    subject = %plan.subject,
    primary = %plan.primary,
    fallbacks = plan.fallbacks.len(),
    "Routing planned"
  );

  let input = AnalysisInput {
    text: text.clone(),
    image: req.image.clone(),
    subject_hint: req.subject_hint.clone(),
  };
  let (backend_used, mut analysis, attempts) = run_chain(state, &plan, &input).await?;

  if let Some(answer) = req.user_answer.as_deref().filter(|a| !a.trim().is_empty()) {
    analysis.user_answer = answer.trim().to_string();
  }
  let is_correct = check_answer(&analysis.user_answer, &analysis.correct_answer);

  let dedup_text = if has_signal { text } else { analysis.formatted_text.trim().to_string() };
  if normalize(&dedup_text).is_empty() {
    return Err(AppError::MissingContent);
  }
  let scope = dedup_scope(req.subject_hint.as_deref(), &analysis);
  let corpus = state.store.fetch_candidates(&req.owner_id, scope.as_deref()).await;
  let duplicates = find_duplicates(&dedup_text, scope.as_deref(), &req.owner_id, &corpus)?;
  let flow = DuplicateFlow::new().on_scan_complete(duplicates.clone())?;

  info!(
    target: "ingest",
    backend = %backend_used,
    duplicates = duplicates.count,
    top_similarity = ?duplicates.duplicates.first().map(|d| d.similarity_percent()),
    ?is_correct,
    "Question analysed"
  );
  Ok(IngestOutcome { analysis, backend_used, routing: plan, attempts, duplicates, flow, is_correct })
}

/// Analyse many questions concurrently. Results keep input order; one failure
/// does not affect the others.
#[instrument(level = "info", target = "ingest", skip(state, reqs), fields(batch = reqs.len()))]
pub async fn analyze_batch(state: &AppState, reqs: Vec<IngestRequest>) -> Vec<Result<IngestOutcome, AppError>> {
  join_all(reqs.into_iter().map(|r| analyze(state, r))).await
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
  pub resolution: Resolution,
  pub question: Option<QuestionRecord>,
}

/// Save a question, resolving duplicates with the user's `decision`.
///
/// Without a decision, a duplicate blocks the save with `InvalidInput` so the
/// client can ask the user first. The scan and the write run under the store's
/// save lock, so concurrent identical saves see each other.
#[instrument(level = "info", target = "ingest", skip(state, q), fields(owner_id = %q.owner_id))]
pub async fn save_with_decision(
  state: &AppState,
  q: NewQuestion,
  decision: Option<UserDecision>,
) -> Result<SaveOutcome, AppError> {
  if q.content.trim().is_empty() {
    return Err(AppError::MissingContent);
  }
  let _saving = state.store.lock_saves().await;
  let corpus = state.store.fetch_candidates(&q.owner_id, Some(q.subject.as_str())).await;
  let report = find_duplicates(&q.content, Some(q.subject.as_str()), &q.owner_id, &corpus)?;

  let mut flow = DuplicateFlow::new().on_scan_complete(report)?;
  if !flow.is_resolved() {
    match decision {
      Some(d) => flow = flow.decide(d)?,
      None => {
        return Err(AppError::InvalidInput("duplicates found; a decision (updateExisting, keepBoth, cancel) is required".into()));
      }
    }
  }

  let resolution = flow.resolution().cloned().unwrap_or(Resolution::Cancelled);
  let question = match &resolution {
    Resolution::Insert => Some(state.store.save(q, SaveMode::Add).await?),
    Resolution::Update { target_id } => Some(state.store.save(q, SaveMode::Update { id: target_id.clone() }).await?),
    Resolution::Cancelled => None,
  };
  info!(target: "ingest", ?resolution, "Save resolved");
  Ok(SaveOutcome { resolution, question })
}
