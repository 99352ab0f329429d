//! Practice sets built from a student's own un-mastered questions.
//!
//! Each question becomes a four-option multiple choice item. Options come from
//! the question text when it already lists A-D, otherwise from the general
//! backend, otherwise placeholders. The correct option is then shuffled.

use std::sync::LazyLock;

use futures::future::join_all;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backends::BackendInvoker;
use crate::config::Prompts;
use crate::domain::{BackendKind, QuestionRecord};
use crate::error::AppError;
use crate::store::QuestionStore;
use crate::util::{extract_json_object, fill_template};

pub const DEFAULT_PRACTICE_COUNT: usize = 5;
pub const MAX_PRACTICE_COUNT: usize = 20;
const OPTION_COUNT: usize = 4;
const LABELS: [&str; OPTION_COUNT] = ["A", "B", "C", "D"];

static OPTION_LINE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"[A-D][.、\s]*([^\n]+)").expect("valid regex"));

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PracticeOption {
  pub label: String,
  pub text: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PracticeQuestion {
  pub question_id: String,
  pub content: String,
  pub options: Vec<PracticeOption>,
  /// Index into `options`.
  pub correct_answer: usize,
  pub explanation: String,
  pub difficulty: String,
}

fn labelled(texts: impl IntoIterator<Item = String>) -> Vec<PracticeOption> {
  LABELS.iter().zip(texts).map(|(l, text)| PracticeOption { label: l.to_string(), text }).collect()
}

/// Options already written into the question ("A. 3  B. 4 ..." one per line).
/// Needs at least four; the first is taken as correct.
pub fn extract_options(content: &str) -> Option<Vec<PracticeOption>> {
  let texts: Vec<String> = OPTION_LINE
    .captures_iter(content)
    .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
    .collect();
  (texts.len() >= OPTION_COUNT).then(|| labelled(texts.into_iter().take(OPTION_COUNT)))
}

pub fn placeholder_options() -> Vec<PracticeOption> {
  labelled(LABELS.iter().map(|l| format!("选项{l}（请查看题目内容）")))
}

/// Fisher-Yates over the option indices. Options are relabelled A-D by their
/// new position; returns the new index of the correct option.
pub fn shuffle_options<R: Rng + ?Sized>(
  options: &[PracticeOption],
  correct: usize,
  rng: &mut R,
) -> (Vec<PracticeOption>, usize) {
  let mut order: Vec<usize> = (0..options.len()).collect();
  for i in (1..order.len()).rev() {
    let j = rng.gen_range(0..=i);
    order.swap(i, j);
  }
  let shuffled = order
    .iter()
    .enumerate()
    .map(|(pos, &i)| PracticeOption {
      label: LABELS.get(pos).map(|l| l.to_string()).unwrap_or_else(|| options[i].label.clone()),
      text: options[i].text.clone(),
    })
    .collect();
  let new_correct = order.iter().position(|&i| i == correct).unwrap_or(0);
  (shuffled, new_correct)
}

#[derive(Deserialize)]
struct GeneratedOptions {
  #[serde(default)]
  options: Vec<PracticeOption>,
}

/// Ask the general backend for one correct answer and three distractors.
async fn generate_options(
  invoker: &dyn BackendInvoker,
  prompts: &Prompts,
  q: &QuestionRecord,
) -> Vec<PracticeOption> {
  if let Some(options) = extract_options(&q.content) {
    return options;
  }
  let user = fill_template(
    &prompts.options_user_template,
    &[("subject", q.subject.as_str()), ("knowledge_point", q.knowledge_point.as_str()), ("content", q.content.as_str())],
  );
  match invoker.complete(BackendKind::GeneralText, &prompts.options_system, &user).await {
    Ok(reply) => {
      let parsed = extract_json_object(&reply).and_then(|j| serde_json::from_str::<GeneratedOptions>(j).ok());
      match parsed {
        Some(g) if g.options.len() >= OPTION_COUNT => {
          debug!(target: "cuotiben_backend", id = %q.id, "Generated practice options");
          return labelled(g.options.into_iter().take(OPTION_COUNT).map(|o| o.text));
        }
        _ => warn!(target: "cuotiben_backend", id = %q.id, "Generated options unusable; using placeholders"),
      }
    }
    Err(e) => warn!(target: "cuotiben_backend", id = %q.id, error = %e, "Option generation failed; using placeholders"),
  }
  placeholder_options()
}

/// Build up to `count` practice items from the owner's un-mastered questions
/// of one subject and knowledge point.
#[instrument(level = "info", target = "cuotiben_backend", skip(store, invoker, prompts))]
pub async fn generate_practice(
  store: &QuestionStore,
  invoker: &dyn BackendInvoker,
  prompts: &Prompts,
  owner_id: &str,
  subject: &str,
  knowledge_point: &str,
  count: Option<usize>,
) -> Result<Vec<PracticeQuestion>, AppError> {
  if subject.trim().is_empty() || knowledge_point.trim().is_empty() {
    return Err(AppError::InvalidInput("subject and knowledgePoint are required".into()));
  }
  let count = count.unwrap_or(DEFAULT_PRACTICE_COUNT).clamp(1, MAX_PRACTICE_COUNT);

  let picked: Vec<QuestionRecord> = store
    .list(owner_id, Some(subject.trim()))
    .await
    .into_iter()
    .filter(|r| !r.mastered && r.knowledge_point == knowledge_point.trim())
    .take(count)
    .collect();
  if picked.is_empty() {
    return Err(AppError::InvalidInput("no un-mastered questions for this knowledge point".into()));
  }

  let option_sets = join_all(picked.iter().map(|q| generate_options(invoker, prompts, q))).await;

  let mut rng = rand::thread_rng();
  let items: Vec<PracticeQuestion> = picked
    .into_iter()
    .zip(option_sets)
    .map(|(q, options)| {
      let (options, correct_answer) = shuffle_options(&options, 0, &mut rng);
      PracticeQuestion {
        question_id: q.id,
        content: q.content,
        options,
        correct_answer,
        explanation: if q.analysis.is_empty() { "暂无解析".into() } else { q.analysis },
        difficulty: q.difficulty,
      }
    })
    .collect();

  info!(target: "cuotiben_backend", %owner_id, count = items.len(), "Practice set generated");
  Ok(items)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{AnalysisInput, ImageRef, StructuredAnalysis};
  use crate::error::BackendError;
  use crate::store::{NewQuestion, SaveMode};
  use async_trait::async_trait;
  use rand::{rngs::StdRng, SeedableRng};

  struct CannedReply(Result<String, BackendError>);

  #[async_trait]
  impl BackendInvoker for CannedReply {
    async fn invoke(&self, _: BackendKind, _: &AnalysisInput) -> Result<StructuredAnalysis, BackendError> {
      Ok(StructuredAnalysis::default())
    }
    async fn complete(&self, _: BackendKind, _: &str, _: &str) -> Result<String, BackendError> {
      self.0.clone()
    }
    async fn converse(&self, kind: BackendKind, _: &str, _: &str, _: Option<&ImageRef>) -> Result<String, BackendError> {
      Err(BackendError::NotConfigured(kind))
    }
  }

  fn texts(options: &[PracticeOption]) -> Vec<&str> {
    options.iter().map(|o| o.text.as_str()).collect()
  }

  #[test]
  fn options_are_read_from_question_lines() {
    let content = "下列计算正确的是\nA. 2+3=5\nB、2+3=6\nC 2+3=7\nD.2+3=8";
    let options = extract_options(content).unwrap();
    assert_eq!(texts(&options), vec!["2+3=5", "2+3=6", "2+3=7", "2+3=8"]);
    assert_eq!(options[1].label, "B");
  }

  #[test]
  fn fewer_than_four_options_is_none() {
    assert!(extract_options("A. 1\nB. 2\nC. 3").is_none());
    assert!(extract_options("计算 3 + 5 = ?").is_none());
  }

  #[test]
  fn shuffle_keeps_the_correct_text_and_relabels() {
    let options = labelled(["对", "错1", "错2", "错3"].map(String::from));
    for seed in 0..20 {
      let mut rng = StdRng::seed_from_u64(seed);
      let (shuffled, correct) = shuffle_options(&options, 0, &mut rng);
      assert_eq!(shuffled[correct].text, "对");
      let labels: Vec<&str> = shuffled.iter().map(|o| o.label.as_str()).collect();
      assert_eq!(labels, LABELS.to_vec());
      let mut sorted = texts(&shuffled);
      sorted.sort();
      let mut original = texts(&options);
      original.sort();
      assert_eq!(sorted, original);
    }
  }

  #[test]
  fn shuffle_moves_the_answer_eventually() {
    let options = labelled(["对", "错1", "错2", "错3"].map(String::from));
    let mut rng = StdRng::seed_from_u64(7);
    let positions: std::collections::HashSet<usize> =
      (0..50).map(|_| shuffle_options(&options, 0, &mut rng).1).collect();
    assert!(positions.len() > 1);
  }

  async fn store_with(questions: &[(&str, &str, bool)]) -> QuestionStore {
    let store = QuestionStore::new();
    for (content, kp, mastered) in questions {
      let r = store
        .save(
          NewQuestion {
            owner_id: "u1".into(),
            content: content.to_string(),
            subject: "数学".into(),
            knowledge_point: kp.to_string(),
            ..Default::default()
          },
          SaveMode::Add,
        )
        .await
        .unwrap();
      if *mastered {
        store.set_mastered("u1", &r.id, true).await.unwrap();
      }
    }
    store
  }

  #[tokio::test]
  async fn practice_uses_only_unmastered_questions() {
    let store = store_with(&[("题一\nA. 1\nB. 2\nC. 3\nD. 4", "分数", false), ("题二", "分数", true), ("题三", "方程", false)]).await;
    let invoker = CannedReply(Err(BackendError::Timeout(1)));
    let items = generate_practice(&store, &invoker, &Prompts::default(), "u1", "数学", "分数", None).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].options[items[0].correct_answer].text, "1");
    assert_eq!(items[0].explanation, "暂无解析");
  }

  #[tokio::test]
  async fn generated_options_are_used_when_valid() {
    let store = store_with(&[("计算 1/2 + 1/3", "分数", false)]).await;
    let reply = r#"```json
{"options":[{"label":"A","text":"5/6"},{"label":"B","text":"2/5"},{"label":"C","text":"1/6"},{"label":"D","text":"2/6"}]}
```"#;
    let invoker = CannedReply(Ok(reply.into()));
    let items = generate_practice(&store, &invoker, &Prompts::default(), "u1", "数学", "分数", Some(5)).await.unwrap();
    assert_eq!(items[0].options[items[0].correct_answer].text, "5/6");
  }

  #[tokio::test]
  async fn backend_failure_falls_back_to_placeholders() {
    let store = store_with(&[("计算 1/2 + 1/3", "分数", false)]).await;
    let invoker = CannedReply(Ok("我不知道".into()));
    let items = generate_practice(&store, &invoker, &Prompts::default(), "u1", "数学", "分数", None).await.unwrap();
    assert!(items[0].options.iter().all(|o| o.text.contains("请查看题目内容")));
  }

  #[tokio::test]
  async fn nothing_to_practice_is_invalid_input() {
    let store = store_with(&[("题二", "分数", true)]).await;
    let invoker = CannedReply(Err(BackendError::Timeout(1)));
    let res = generate_practice(&store, &invoker, &Prompts::default(), "u1", "数学", "分数", None).await;
    assert!(matches!(res, Err(AppError::InvalidInput(_))));
  }
}
