//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs ids, lengths and basic result info.

use std::sync::Arc;
use axum::{extract::{Path, Query, State}, Json, response::IntoResponse};
use tracing::{info, instrument};

use crate::chat::chat;
use crate::dedup::find_duplicates;
use crate::error::AppError;
use crate::ingest::{analyze, analyze_batch, save_with_decision, IngestRequest, SaveOutcome};
use crate::flow::Resolution;
use crate::practice::generate_practice;
use crate::protocol::*;
use crate::state::AppState;
use crate::stats::{knowledge_stats, user_stats};
use crate::store::{CorpusProvider, SaveMode};

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse {
  Json(HealthOut { ok: true, service: "cuotiben-backend" })
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.owner_id, ocr_len = body.ocr_text.len()))]
pub async fn http_post_analyze(
  State(state): State<Arc<AppState>>,
  Json(body): Json<AnalyzeIn>,
) -> Result<impl IntoResponse, AppError> {
  let req = IngestRequest::try_from(body)?;
  let outcome = analyze(&state, req).await?;
  Ok(Json(outcome))
}

#[instrument(level = "info", skip(state, body), fields(items = body.items.len()))]
pub async fn http_post_analyze_batch(
  State(state): State<Arc<AppState>>,
  Json(body): Json<AnalyzeBatchIn>,
) -> Result<impl IntoResponse, AppError> {
  if body.items.is_empty() || body.items.len() > MAX_BATCH {
    return Err(AppError::InvalidInput(format!("batch must hold 1 to {MAX_BATCH} items")));
  }
  let reqs = body
    .items
    .into_iter()
    .map(IngestRequest::try_from)
    .collect::<Result<Vec<_>, _>>()?;
  let results: Vec<BatchItemOut> = analyze_batch(&state, reqs).await.into_iter().map(BatchItemOut::from).collect();
  let ok = results.iter().filter(|r| r.ok).count();
  info!(target: "cuotiben_backend", total = results.len(), ok, "HTTP batch analysed");
  Ok(Json(AnalyzeBatchOut { results }))
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.owner_id, content_len = body.content.len()))]
pub async fn http_post_check_duplicate(
  State(state): State<Arc<AppState>>,
  Json(body): Json<CheckDuplicateIn>,
) -> Result<impl IntoResponse, AppError> {
  let subject = body.subject.as_deref().map(str::trim).filter(|s| !s.is_empty());
  let corpus = state.store.fetch_candidates(&body.owner_id, subject).await;
  let report: CheckDuplicateOut = find_duplicates(&body.content, subject, &body.owner_id, &corpus)?;
  Ok(Json(report))
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.question.owner_id, update_id = ?body.update_id, decision = ?body.decision))]
pub async fn http_post_question(
  State(state): State<Arc<AppState>>,
  Json(body): Json<SaveQuestionIn>,
) -> Result<impl IntoResponse, AppError> {
  let outcome = match body.update_id {
    Some(id) => {
      let question = state.store.save(body.question, SaveMode::Update { id: id.clone() }).await?;
      SaveOutcome { resolution: Resolution::Update { target_id: id }, question: Some(question) }
    }
    None => save_with_decision(&state, body.question, body.decision).await?,
  };
  Ok(Json(outcome))
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_questions(
  State(state): State<Arc<AppState>>,
  Query(q): Query<ListQuery>,
) -> impl IntoResponse {
  let questions = state.store.list(&q.owner_id, q.subject.as_deref()).await;
  Json(QuestionsOut { count: questions.len(), questions })
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_question(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Query(q): Query<OwnerQuery>,
) -> Result<impl IntoResponse, AppError> {
  Ok(Json(state.store.get(&q.owner_id, &id).await?))
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.owner_id, mastered = body.mastered))]
pub async fn http_post_mastered(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<MasteredIn>,
) -> Result<impl IntoResponse, AppError> {
  let record = state.store.set_mastered(&body.owner_id, &id, body.mastered).await?;
  info!(target: "cuotiben_backend", %id, mastered = record.mastered, "HTTP mastery updated");
  Ok(Json(record))
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.owner_id, correct = body.correct))]
pub async fn http_post_practice_result(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<PracticeResultIn>,
) -> Result<impl IntoResponse, AppError> {
  let record = state.store.record_practice(&body.owner_id, &id, body.correct).await?;
  info!(target: "cuotiben_backend", %id, practice_count = record.practice_count, "HTTP practice result recorded");
  Ok(Json(record))
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.owner_id, message_len = body.message.len()))]
pub async fn http_post_chat(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<ChatIn>,
) -> Result<impl IntoResponse, AppError> {
  Ok(Json(chat(&state, &body.owner_id, &id, &body.message).await?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_clear_questions(
  State(state): State<Arc<AppState>>,
  Query(q): Query<OwnerQuery>,
) -> Result<impl IntoResponse, AppError> {
  if q.owner_id.trim().is_empty() {
    return Err(AppError::InvalidInput("ownerId is required".into()));
  }
  let removed = state.store.clear(&q.owner_id).await;
  Ok(Json(ClearOut { removed }))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_stats(
  State(state): State<Arc<AppState>>,
  Query(q): Query<OwnerQuery>,
) -> impl IntoResponse {
  let records = state.store.list(&q.owner_id, None).await;
  Json(StatsOut { user: user_stats(&records), knowledge: knowledge_stats(&records) })
}

#[instrument(level = "info", skip(state, body), fields(owner_id = %body.owner_id, subject = %body.subject, knowledge_point = %body.knowledge_point))]
pub async fn http_post_practice(
  State(state): State<Arc<AppState>>,
  Json(body): Json<PracticeIn>,
) -> Result<impl IntoResponse, AppError> {
  let questions = generate_practice(
    &state.store,
    state.backends.as_ref(),
    &state.prompts,
    &body.owner_id,
    &body.subject,
    &body.knowledge_point,
    body.count,
  )
  .await?;
  Ok(Json(PracticeOut { count: questions.len(), questions }))
}

/// Routing preview: what the pipeline would do with this text, without calling anything.
#[instrument(level = "info", skip(state, body), fields(text_len = body.text.len(), has_image = body.has_image))]
pub async fn http_post_routing_plan(
  State(state): State<Arc<AppState>>,
  Json(body): Json<RoutingPlanIn>,
) -> impl IntoResponse {
  let text = crate::ingest::clean_ocr_text(&body.text);
  Json(state.routing.plan_routing(&text, body.has_image))
}
