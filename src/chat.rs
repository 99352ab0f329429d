//! Tutoring chat about one stored question.
//!
//! Each message is answered independently (the stored history is for the
//! client to display, it is not replayed to the model). The backend chain
//! comes from the routing engine: the question's image goes to the vision
//! backend, math questions to the math backend, and everything degrades to
//! the general backend.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::domain::{BackendKind, ChatRole, ChatTurn, ImageRef, QuestionRecord};
use crate::error::{AppError, BackendFailure};
use crate::state::AppState;
use crate::util::fill_template;

pub const MAX_MESSAGE_CHARS: usize = 1000;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
  pub reply: String,
  pub backend_used: BackendKind,
  /// Backends that failed before `backend_used` answered.
  pub attempts: Vec<BackendFailure>,
  pub history: Vec<ChatTurn>,
}

// Only fetchable URLs can be shown to the vision model again.
fn viewable_image(image_ref: &str) -> Option<ImageRef> {
  let r = image_ref.trim();
  (r.starts_with("https://") || r.starts_with("http://")).then(|| ImageRef::Url(r.to_string()))
}

fn system_prompt(template: &str, q: &QuestionRecord) -> String {
  let or_none = |s: &str| if s.trim().is_empty() { "暂无".to_string() } else { s.trim().to_string() };
  fill_template(
    template,
    &[
      ("subject", q.subject.as_str()),
      ("content", q.content.as_str()),
      ("knowledge_point", q.knowledge_point.as_str()),
      ("difficulty", q.difficulty.as_str()),
      ("correct_answer", or_none(&q.correct_answer).as_str()),
      ("analysis", or_none(&q.analysis).as_str()),
    ],
  )
}

/// Answer one student message about question `id` and store both turns.
#[instrument(level = "info", target = "cuotiben_backend", skip(state, message), fields(message_len = message.len()))]
pub async fn chat(state: &AppState, owner_id: &str, id: &str, message: &str) -> Result<ChatOutcome, AppError> {
  let message = message.trim();
  if message.is_empty() {
    return Err(AppError::InvalidInput("message is required".into()));
  }
  if message.chars().count() > MAX_MESSAGE_CHARS {
    return Err(AppError::InvalidInput(format!("message is longer than {MAX_MESSAGE_CHARS} characters")));
  }

  let question = state.store.get(owner_id, id).await?;
  let image = viewable_image(&question.image_ref);
  let chain = state.routing.chat_chain(&question.subject, &question.content, image.is_some());
  let system = system_prompt(&state.prompts.chat_system_template, &question);

  let mut attempts = Vec::new();
  let mut answered = None;
  for kind in chain {
    match state.backends.converse(kind, &system, message, image.as_ref()).await {
      Ok(reply) => {
        answered = Some((kind, reply));
        break;
      }
      Err(e) => {
        warn!(target: "cuotiben_backend", backend = %kind, error = %e, "Chat backend failed; trying next in chain");
        attempts.push(BackendFailure { backend: kind, error: e.to_string() });
      }
    }
  }
  let Some((backend_used, reply)) = answered else {
    return Err(AppError::BackendExhausted { attempts });
  };

  let now = Utc::now();
  let turns = vec![
    ChatTurn { role: ChatRole::User, content: message.to_string(), timestamp: now },
    ChatTurn { role: ChatRole::Assistant, content: reply.clone(), timestamp: now },
  ];
  let updated = state.store.append_chat(owner_id, id, turns).await?;
  info!(
    target: "cuotiben_backend",
    backend = %backend_used,
    failed_before = attempts.len(),
    history = updated.chat_history.len(),
    "Chat answered"
  );
  Ok(ChatOutcome { reply, backend_used, attempts, history: updated.chat_history })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use crate::config::AppConfig;
  use crate::error::BackendError;
  use crate::ingest::tests::FakeBackends;
  use crate::store::{NewQuestion, SaveMode, MAX_CHAT_TURNS};

  async fn saved(state: &AppState, subject: &str, image_ref: Option<&str>) -> QuestionRecord {
    let q = NewQuestion {
      owner_id: "u1".into(),
      content: "解方程 2x + 1 = 5".into(),
      subject: subject.into(),
      knowledge_point: "一元一次方程".into(),
      image_ref: image_ref.map(str::to_string),
      ..Default::default()
    };
    state.store.save(q, SaveMode::Add).await.unwrap()
  }

  fn state_with(fake: FakeBackends) -> (AppState, Arc<FakeBackends>) {
    let fake = Arc::new(fake);
    (AppState::with_parts(AppConfig::default(), fake.clone()), fake)
  }

  #[tokio::test]
  async fn math_question_is_tutored_by_math_backend() {
    let (state, fake) = state_with(FakeBackends::default().replying(BackendKind::MathSpecialized, "先把 1 移到右边。"));
    let q = saved(&state, "数学", None).await;

    let out = chat(&state, "u1", &q.id, " 为什么要移项？ ").await.unwrap();
    assert_eq!(out.backend_used, BackendKind::MathSpecialized);
    assert_eq!(out.reply, "先把 1 移到右边。");
    assert_eq!(out.history.len(), 2);
    assert_eq!(out.history[0].role, ChatRole::User);
    assert_eq!(out.history[0].content, "为什么要移项？");
    assert_eq!(out.history[1].role, ChatRole::Assistant);
    assert_eq!(*fake.calls.lock().unwrap(), vec![BackendKind::MathSpecialized]);

    let stored = state.store.get("u1", &q.id).await.unwrap();
    assert_eq!(stored.chat_history, out.history);
  }

  #[tokio::test]
  async fn image_goes_to_vision_then_degrades_to_general() {
    let fake = FakeBackends::default()
      .replying(BackendKind::GeneralText, "看题目中的等号。")
      .chat_failing(BackendKind::VisionLanguage, BackendError::Timeout(90));
    let (state, fake) = state_with(fake);
    let q = saved(&state, "数学", Some("https://example.com/q.jpg")).await;

    let out = chat(&state, "u1", &q.id, "看不懂").await.unwrap();
    assert_eq!(out.backend_used, BackendKind::GeneralText);
    assert_eq!(out.attempts.len(), 1);
    assert_eq!(out.attempts[0].backend, BackendKind::VisionLanguage);
    assert_eq!(*fake.calls.lock().unwrap(), vec![BackendKind::VisionLanguage, BackendKind::GeneralText]);
    assert_eq!(*fake.images_seen.lock().unwrap(), vec![true, true]);
  }

  #[tokio::test]
  async fn non_url_image_ref_is_not_sent() {
    let (state, fake) = state_with(FakeBackends::default().replying(BackendKind::GeneralText, "好的"));
    let q = saved(&state, "语文", Some("cloud://bucket/q.jpg")).await;
    chat(&state, "u1", &q.id, "解释一下").await.unwrap();
    assert_eq!(*fake.calls.lock().unwrap(), vec![BackendKind::GeneralText]);
    assert_eq!(*fake.images_seen.lock().unwrap(), vec![false]);
  }

  #[tokio::test]
  async fn exhausted_chain_stores_nothing() {
    let (state, _) = state_with(FakeBackends::default());
    let q = saved(&state, "数学", None).await;
    let err = chat(&state, "u1", &q.id, "为什么").await.unwrap_err();
    assert!(matches!(err, AppError::BackendExhausted { ref attempts } if attempts.len() == 2));
    assert!(state.store.get("u1", &q.id).await.unwrap().chat_history.is_empty());
  }

  #[tokio::test]
  async fn owner_and_message_are_checked_before_calling_backends() {
    let (state, fake) = state_with(FakeBackends::default().replying(BackendKind::MathSpecialized, "好"));
    let q = saved(&state, "数学", None).await;

    assert!(matches!(chat(&state, "u2", &q.id, "为什么").await, Err(AppError::Forbidden { .. })));
    assert!(matches!(chat(&state, "u1", "nope", "为什么").await, Err(AppError::NotFound { .. })));
    assert!(matches!(chat(&state, "u1", &q.id, "  ").await, Err(AppError::InvalidInput(_))));
    let long = "问".repeat(MAX_MESSAGE_CHARS + 1);
    assert!(matches!(chat(&state, "u1", &q.id, &long).await, Err(AppError::InvalidInput(_))));
    assert!(fake.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn long_conversations_keep_the_newest_turns() {
    let (state, _) = state_with(FakeBackends::default().replying(BackendKind::MathSpecialized, "继续"));
    let q = saved(&state, "数学", None).await;
    for i in 0..12 {
      chat(&state, "u1", &q.id, &format!("第{i}问")).await.unwrap();
    }
    let history = state.store.get("u1", &q.id).await.unwrap().chat_history;
    assert_eq!(history.len(), MAX_CHAT_TURNS);
    assert_eq!(history[0].content, "第2问");
  }

  #[test]
  fn prompt_fills_question_fields() {
    let q = QuestionRecord {
      id: "q".into(),
      owner_id: "u1".into(),
      subject: "数学".into(),
      content: "1+1=?".into(),
      knowledge_point: "加法".into(),
      difficulty: "easy".into(),
      question_type: "填空".into(),
      image_ref: String::new(),
      user_answer: String::new(),
      correct_answer: "2".into(),
      is_correct: None,
      analysis: String::new(),
      mastered: false,
      mastered_time: None,
      practice_count: 0,
      correct_count: 0,
      wrong_count: 0,
      chat_history: vec![],
      create_time: Utc::now(),
      update_time: Utc::now(),
    };
    let p = system_prompt(&crate::config::Prompts::default().chat_system_template, &q);
    assert!(p.contains("数学老师"));
    assert!(p.contains("1+1=?"));
    assert!(p.contains("正确答案：2"));
    assert!(p.contains("初步分析：暂无"));
    assert!(!p.contains('{'));
  }
}
