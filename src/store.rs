//! In-memory question store, one error book per owner.
//!
//! Also the corpus provider the duplicate scan reads from.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{ChatTurn, QuestionRecord, DEFAULT_DIFFICULTY, DEFAULT_QUESTION_TYPE};

/// Tutoring turns kept per question (ten exchanges).
pub const MAX_CHAT_TURNS: usize = 20;
use crate::error::AppError;

/// Source of stored questions for duplicate scans. Implementations return only
/// records owned by `owner_id`.
#[async_trait]
pub trait CorpusProvider: Send + Sync {
  async fn fetch_candidates(&self, owner_id: &str, subject: Option<&str>) -> Vec<QuestionRecord>;
}

/// Fields a client supplies when saving a question.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewQuestion {
  pub owner_id: String,
  pub content: String,
  pub subject: String,
  pub knowledge_point: String,
  #[serde(default)] pub difficulty: Option<String>,
  #[serde(default)] pub question_type: Option<String>,
  #[serde(default)] pub image_ref: Option<String>,
  #[serde(default)] pub user_answer: Option<String>,
  #[serde(default)] pub correct_answer: Option<String>,
  #[serde(default)] pub is_correct: Option<bool>,
  #[serde(default)] pub analysis: Option<String>,
}

impl NewQuestion {
  fn validate(&self) -> Result<(), AppError> {
    if self.owner_id.trim().is_empty() {
      return Err(AppError::InvalidInput("ownerId is required".into()));
    }
    if self.content.trim().is_empty() {
      return Err(AppError::MissingContent);
    }
    if self.subject.trim().is_empty() {
      return Err(AppError::InvalidInput("subject is required".into()));
    }
    if self.knowledge_point.trim().is_empty() {
      return Err(AppError::InvalidInput("knowledgePoint is required".into()));
    }
    Ok(())
  }

  // Overwrites the user-editable fields; identity, mastery and counters stay.
  fn apply_to(self, r: &mut QuestionRecord) {
    r.content = self.content.trim().to_string();
    r.subject = self.subject.trim().to_string();
    r.knowledge_point = self.knowledge_point.trim().to_string();
    r.difficulty = self.difficulty.filter(|d| !d.trim().is_empty()).unwrap_or_else(|| DEFAULT_DIFFICULTY.into());
    r.question_type = self.question_type.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| DEFAULT_QUESTION_TYPE.into());
    r.image_ref = self.image_ref.unwrap_or_default();
    r.user_answer = self.user_answer.unwrap_or_default();
    r.correct_answer = self.correct_answer.unwrap_or_default();
    r.is_correct = self.is_correct;
    r.analysis = self.analysis.unwrap_or_default();
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SaveMode {
  Add,
  Update { id: String },
}

#[derive(Clone, Default)]
pub struct QuestionStore {
  by_id: Arc<RwLock<HashMap<String, QuestionRecord>>>,
  // Serialises scan-then-write saves so two identical saves cannot both insert.
  save_gate: Arc<Mutex<()>>,
}

impl QuestionStore {
  pub fn new() -> Self { Self::default() }

  /// Hold while a duplicate scan and the save it decides must not interleave
  /// with another such save.
  pub async fn lock_saves(&self) -> MutexGuard<'_, ()> {
    self.save_gate.lock().await
  }

  /// Insert a new question or overwrite an existing one of the same owner.
  #[instrument(level = "info", target = "cuotiben_backend", skip(self, q), fields(owner_id = %q.owner_id))]
  pub async fn save(&self, q: NewQuestion, mode: SaveMode) -> Result<QuestionRecord, AppError> {
    q.validate()?;
    let now = Utc::now();
    let mut by_id = self.by_id.write().await;

    match mode {
      SaveMode::Add => {
        let mut r = QuestionRecord {
          id: Uuid::new_v4().to_string(),
          owner_id: q.owner_id.clone(),
          subject: String::new(),
          content: String::new(),
          knowledge_point: String::new(),
          difficulty: String::new(),
          question_type: String::new(),
          image_ref: String::new(),
          user_answer: String::new(),
          correct_answer: String::new(),
          is_correct: None,
          analysis: String::new(),
          mastered: false,
          mastered_time: None,
          practice_count: 0,
          correct_count: 0,
          wrong_count: 0,
          chat_history: Vec::new(),
          create_time: now,
          update_time: now,
        };
        q.apply_to(&mut r);
        info!(target: "cuotiben_backend", id = %r.id, subject = %r.subject, "Question added");
        by_id.insert(r.id.clone(), r.clone());
        Ok(r)
      }
      SaveMode::Update { id } => {
        let r = by_id.get_mut(&id).ok_or_else(|| AppError::NotFound { id: id.clone() })?;
        if r.owner_id != q.owner_id {
          return Err(AppError::Forbidden { id });
        }
        q.apply_to(r);
        r.update_time = now;
        info!(target: "cuotiben_backend", %id, "Question updated");
        Ok(r.clone())
      }
    }
  }

  #[instrument(level = "debug", skip(self))]
  pub async fn get(&self, owner_id: &str, id: &str) -> Result<QuestionRecord, AppError> {
    let by_id = self.by_id.read().await;
    let r = by_id.get(id).ok_or_else(|| AppError::NotFound { id: id.to_string() })?;
    if r.owner_id != owner_id {
      return Err(AppError::Forbidden { id: id.to_string() });
    }
    Ok(r.clone())
  }

  /// Questions of one owner (optionally one subject), newest first.
  #[instrument(level = "debug", skip(self))]
  pub async fn list(&self, owner_id: &str, subject: Option<&str>) -> Vec<QuestionRecord> {
    let subject = subject.map(str::trim).filter(|s| !s.is_empty());
    let mut out: Vec<QuestionRecord> = {
      let by_id = self.by_id.read().await;
      by_id
        .values()
        .filter(|r| r.owner_id == owner_id)
        .filter(|r| subject.map_or(true, |s| r.subject == s))
        .cloned()
        .collect()
    };
    out.sort_by(|a, b| b.create_time.cmp(&a.create_time).then_with(|| a.id.cmp(&b.id)));
    out
  }

  #[instrument(level = "info", target = "cuotiben_backend", skip(self))]
  pub async fn set_mastered(&self, owner_id: &str, id: &str, mastered: bool) -> Result<QuestionRecord, AppError> {
    let mut by_id = self.by_id.write().await;
    let r = owned_mut(&mut by_id, owner_id, id)?;
    let now = Utc::now();
    if mastered != r.mastered {
      r.mastered = mastered;
      r.mastered_time = mastered.then_some(now);
    }
    r.update_time = now;
    Ok(r.clone())
  }

  /// Count one practice attempt on a question.
  #[instrument(level = "info", target = "cuotiben_backend", skip(self))]
  pub async fn record_practice(&self, owner_id: &str, id: &str, correct: bool) -> Result<QuestionRecord, AppError> {
    let mut by_id = self.by_id.write().await;
    let r = owned_mut(&mut by_id, owner_id, id)?;
    r.practice_count += 1;
    if correct {
      r.correct_count += 1;
    } else {
      r.wrong_count += 1;
    }
    r.update_time = Utc::now();
    Ok(r.clone())
  }

  /// Append tutoring turns, keeping only the newest `MAX_CHAT_TURNS`.
  #[instrument(level = "debug", target = "cuotiben_backend", skip(self, turns), fields(turns = turns.len()))]
  pub async fn append_chat(&self, owner_id: &str, id: &str, turns: Vec<ChatTurn>) -> Result<QuestionRecord, AppError> {
    let mut by_id = self.by_id.write().await;
    let r = owned_mut(&mut by_id, owner_id, id)?;
    r.chat_history.extend(turns);
    let excess = r.chat_history.len().saturating_sub(MAX_CHAT_TURNS);
    r.chat_history.drain(..excess);
    r.update_time = Utc::now();
    Ok(r.clone())
  }

  /// Remove every question of `owner_id`; returns how many were removed.
  #[instrument(level = "info", target = "cuotiben_backend", skip(self))]
  pub async fn clear(&self, owner_id: &str) -> usize {
    let mut by_id = self.by_id.write().await;
    let before = by_id.len();
    by_id.retain(|_, r| r.owner_id != owner_id);
    let removed = before - by_id.len();
    info!(target: "cuotiben_backend", %owner_id, removed, "Error book cleared");
    removed
  }
}

fn owned_mut<'a>(
  by_id: &'a mut HashMap<String, QuestionRecord>,
  owner_id: &str,
  id: &str,
) -> Result<&'a mut QuestionRecord, AppError> {
  let r = by_id.get_mut(id).ok_or_else(|| AppError::NotFound { id: id.to_string() })?;
  if r.owner_id != owner_id {
    return Err(AppError::Forbidden { id: id.to_string() });
  }
  Ok(r)
}

#[async_trait]
impl CorpusProvider for QuestionStore {
  async fn fetch_candidates(&self, owner_id: &str, subject: Option<&str>) -> Vec<QuestionRecord> {
    self.list(owner_id, subject).await
  }
}
