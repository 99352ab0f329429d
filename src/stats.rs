//! Per-owner error book statistics, computed from the stored records.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::QuestionRecord;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStat {
  pub subject: String,
  pub total: usize,
  pub mastered: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
  pub total: usize,
  pub mastered: usize,
  /// Rounded percent, 0 when there are no questions.
  pub mastery_rate: u32,
  pub by_subject: Vec<SubjectStat>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStat {
  pub subject: String,
  pub knowledge_point: String,
  pub total: usize,
  pub mastered: usize,
  pub mastered_rate: u32,
}

fn percent(part: usize, total: usize) -> u32 {
  if total == 0 { 0 } else { ((part as f64 / total as f64) * 100.0).round() as u32 }
}

pub fn user_stats(records: &[QuestionRecord]) -> UserStats {
  let mut by_subject: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
  for r in records {
    let e = by_subject.entry(r.subject.as_str()).or_default();
    e.0 += 1;
    if r.mastered { e.1 += 1; }
  }
  let total = records.len();
  let mastered = records.iter().filter(|r| r.mastered).count();

  let mut by_subject: Vec<SubjectStat> = by_subject
    .into_iter()
    .map(|(subject, (total, mastered))| SubjectStat { subject: subject.to_string(), total, mastered })
    .collect();
  by_subject.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.subject.cmp(&b.subject)));

  UserStats { total, mastered, mastery_rate: percent(mastered, total), by_subject }
}

/// One entry per (subject, knowledge point), most frequent first.
pub fn knowledge_stats(records: &[QuestionRecord]) -> Vec<KnowledgeStat> {
  let mut groups: BTreeMap<(&str, &str), (usize, usize)> = BTreeMap::new();
  for r in records {
    let e = groups.entry((r.subject.as_str(), r.knowledge_point.as_str())).or_default();
    e.0 += 1;
    if r.mastered { e.1 += 1; }
  }
  let mut out: Vec<KnowledgeStat> = groups
    .into_iter()
    .map(|((subject, kp), (total, mastered))| KnowledgeStat {
      subject: subject.to_string(),
      knowledge_point: kp.to_string(),
      total,
      mastered,
      mastered_rate: percent(mastered, total),
    })
    .collect();
  out.sort_by(|a, b| {
    b.total
      .cmp(&a.total)
      .then_with(|| a.subject.cmp(&b.subject))
      .then_with(|| a.knowledge_point.cmp(&b.knowledge_point))
  });
  out
}
