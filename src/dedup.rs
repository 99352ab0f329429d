//! Near-duplicate detection for newly captured questions.
//!
//! Texts are normalized (lower-cased, whitespace and a fixed punctuation set
//! removed) and compared by Jaccard similarity over their sets of unique
//! characters. Character sets tolerate OCR segmentation noise in CJK text and
//! stay cheap because every scan is scoped to one owner (and subject).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::domain::QuestionRecord;
use crate::error::AppError;

/// Scores must be strictly above this to count as a duplicate.
pub const DUPLICATE_THRESHOLD: f64 = 0.85;
/// How many ranked matches are returned (the total count is reported separately).
pub const MAX_REPORTED: usize = 3;

// Sentence punctuation (CJK + Latin), quotes, brackets, underscores and dashes.
const STRIPPED: &[char] = &[
  ',', '。', '，', '、', ':', '：', ';', '；', '！', '!', '？', '?',
  '\'', '"', '‘', '’', '“', '”',
  '_', '-', '—', '(', ')', '（', '）', '[', ']', '【', '】',
];

/// Canonical form used for comparison. Idempotent; empty input gives "".
pub fn normalize(text: &str) -> String {
  text
    .to_lowercase()
    .chars()
    .filter(|c| !c.is_whitespace() && !STRIPPED.contains(c))
    .collect()
}

/// Jaccard similarity over unique characters, in [0, 1].
/// Either side empty gives 0; identical strings give exactly 1.
pub fn similarity(a: &str, b: &str) -> f64 {
  if a.is_empty() || b.is_empty() { return 0.0; }
  if a == b { return 1.0; }

  let set_a: HashSet<char> = a.chars().collect();
  let set_b: HashSet<char> = b.chars().collect();
  let intersection = set_a.intersection(&set_b).count();
  let union = set_a.union(&set_b).count();
  if union == 0 { 0.0 } else { intersection as f64 / union as f64 }
}

pub fn exceeds_threshold(score: f64) -> bool {
  score > DUPLICATE_THRESHOLD
}

/// A stored question that looks like the candidate.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCandidate {
  pub id: String,
  pub content: String,
  pub subject: String,
  pub knowledge_point: String,
  pub difficulty: String,
  pub mastered: bool,
  pub create_time: DateTime<Utc>,
  pub similarity: f64,
}

impl DuplicateCandidate {
  /// Rounded percentage, the form shown to students ("相似度 92%").
  pub fn similarity_percent(&self) -> u32 {
    (self.similarity * 100.0).round() as u32
  }

  fn from_record(r: &QuestionRecord, similarity: f64) -> Self {
    Self {
      id: r.id.clone(),
      content: r.content.clone(),
      subject: r.subject.clone(),
      knowledge_point: r.knowledge_point.clone(),
      difficulty: r.difficulty.clone(),
      mastered: r.mastered,
      create_time: r.create_time,
      similarity,
    }
  }
}

#[derive(Clone, Debug, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReport {
  pub is_duplicate: bool,
  /// Best matches first, at most `MAX_REPORTED`.
  pub duplicates: Vec<DuplicateCandidate>,
  /// Every match above the threshold, even those not listed.
  pub count: usize,
}

/// Rank stored questions of `owner_id` (and `subject`, when given) that
/// duplicate `candidate_text`.
#[instrument(level = "debug", target = "dedup", skip(candidate_text, corpus), fields(candidate_len = candidate_text.len(), corpus_len = corpus.len()))]
pub fn find_duplicates(
  candidate_text: &str,
  subject: Option<&str>,
  owner_id: &str,
  corpus: &[QuestionRecord],
) -> Result<DuplicateReport, AppError> {
  let input = normalize(candidate_text);
  if input.is_empty() {
    return Err(AppError::MissingContent);
  }
  let subject = subject.map(str::trim).filter(|s| !s.is_empty());

  let mut matches: Vec<DuplicateCandidate> = corpus
    .iter()
    .filter(|r| r.owner_id == owner_id)
    .filter(|r| subject.map_or(true, |s| r.subject == s))
    .filter_map(|r| {
      let score = similarity(&input, &normalize(&r.content));
      exceeds_threshold(score).then(|| DuplicateCandidate::from_record(r, score))
    })
    .collect();

  // Stable: equal scores keep corpus order.
  matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
  let count = matches.len();
  matches.truncate(MAX_REPORTED);

  debug!(target: "dedup", %owner_id, subject = subject.unwrap_or("*"), count, "Duplicate scan finished");
  Ok(DuplicateReport { is_duplicate: count > 0, duplicates: matches, count })
}
