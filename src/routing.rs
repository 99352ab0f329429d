//! Backend routing: decides which AI backend analyses a captured question.
//!
//! Order of evaluation for one question:
//!   1. `assess_ocr_quality` on the OCR text,
//!   2. `detect_subject` from keyword tables,
//!   3. `vision_trigger` (ordered OR-chain, first hit wins),
//!   4. `select_backend` plus the degrade chain in `RoutingPlan`.
//!
//! Everything here is a pure function of its inputs. The engine never calls a
//! backend; callers walk `RoutingPlan::chain()` until one call succeeds.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::domain::{BackendKind, OcrQuality, DEFAULT_SUBJECT};
use crate::keywords::RoutingTables;

pub const UNKNOWN_SUBJECT: &str = "unknown";

const MIN_USABLE_LEN: usize = 15;
const HIGH_QUALITY_MIN_LEN: usize = 30;
const HIGH_RATIO: f64 = 0.7;
const MEDIUM_RATIO: f64 = 0.5;

const LOW_QUALITY_VISION_LEN: usize = 30;
const SHORT_GEOMETRY_LEN: usize = 50;

const MIN_NUMERIC_TOKENS: usize = 2;
const MIN_QUANTIFIER_HITS: usize = 3;
const MIN_MATH_KEYWORD_HITS: usize = 2;

static MEANINGFUL_RUN: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"[\x{4e00}-\x{9fa5}A-Za-z]{2,}").expect("valid regex"));
static GARBAGE_RUN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\x{FFFD}{2,}|[^\p{L}\p{N}\p{P}\p{Sm}\p{Sc}\s]{3,}").expect("valid regex")
});
static NUMERIC_TOKEN: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));

// ---------------- OCR quality ----------------

/// Classify how reliable extracted text is.
///
/// Garbage runs, stutter and short length short-circuit to `Low` before the
/// meaningful-character ratio is looked at.
pub fn assess_ocr_quality(text: &str) -> OcrQuality {
  let text = text.trim();
  if text.is_empty() {
    return OcrQuality::None;
  }
  let len = text.chars().count();
  if GARBAGE_RUN.is_match(text) || has_stutter(text) || len < MIN_USABLE_LEN {
    return OcrQuality::Low;
  }

  let ratio = meaningful_ratio(text);
  if ratio > HIGH_RATIO && len > HIGH_QUALITY_MIN_LEN {
    OcrQuality::High
  } else if ratio > MEDIUM_RATIO {
    OcrQuality::Medium
  } else {
    OcrQuality::Low
  }
}

/// Share of characters inside runs of at least two CJK / Latin letters.
pub fn meaningful_ratio(text: &str) -> f64 {
  let total = text.chars().count();
  if total == 0 {
    return 0.0;
  }
  let meaningful: usize = MEANINGFUL_RUN
    .find_iter(text)
    .map(|m| m.as_str().chars().count())
    .sum();
  meaningful as f64 / total as f64
}

/// OCR stutter: a run of non-space characters, one whitespace character, and
/// the same run again (`(\S+)\s\1`). The run may be any tail of the left token
/// that the right token starts with.
///
/// Linear in the text length: each token is scanned once as the left side and
/// once as the right side of a separator.
pub fn has_stutter(text: &str) -> bool {
  let chars: Vec<char> = text.chars().collect();
  let mut left_start = 0;
  for (i, c) in chars.iter().enumerate() {
    if !c.is_whitespace() {
      continue;
    }
    let left = &chars[left_start..i];
    left_start = i + 1;
    if left.is_empty() {
      continue;
    }
    let right_end = chars[i + 1..]
      .iter()
      .position(|c| c.is_whitespace())
      .map_or(chars.len(), |p| i + 1 + p);
    if suffix_prefix_overlap(left, &chars[i + 1..right_end]) > 0 {
      return true;
    }
  }
  false
}

// Length of the longest tail of `left` that is also a head of `right`, via
// the KMP failure function of `right` run over `left`.
fn suffix_prefix_overlap(left: &[char], right: &[char]) -> usize {
  if right.is_empty() {
    return 0;
  }
  let mut fail = vec![0usize; right.len()];
  let mut k = 0;
  for j in 1..right.len() {
    while k > 0 && right[j] != right[k] {
      k = fail[k - 1];
    }
    if right[j] == right[k] {
      k += 1;
    }
    fail[j] = k;
  }

  let mut matched = 0;
  for &c in left {
    if matched == right.len() {
      matched = fail[matched - 1];
    }
    while matched > 0 && c != right[matched] {
      matched = fail[matched - 1];
    }
    if c == right[matched] {
      matched += 1;
    }
  }
  matched
}

// ---------------- Routing engine ----------------

/// Which rule decided the subject.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SubjectPath {
  MathSymbol,
  MathKeywords,
  ApplicationProblem,
  KeywordScore,
  Unknown,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDetection {
  pub subject: String,
  pub path: SubjectPath,
}

/// Condition of the vision OR-chain that fired, in evaluation order.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VisionTrigger {
  NoOcrText,
  LowQualityShortText,
  DiagramReference,
  DrawingTask,
  ShortGeometry,
  PictureMatching,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPlan {
  pub ocr_quality: OcrQuality,
  pub subject: String,
  pub subject_path: SubjectPath,
  /// OCR alone is not enough; the image should be analysed directly.
  pub needs_vision_fallback: bool,
  pub vision_trigger: Option<VisionTrigger>,
  pub primary: BackendKind,
  /// Tried in order after `primary` fails.
  pub fallbacks: Vec<BackendKind>,
}

impl RoutingPlan {
  pub fn chain(&self) -> Vec<BackendKind> {
    std::iter::once(self.primary).chain(self.fallbacks.iter().copied()).collect()
  }
}

#[derive(Clone, Debug)]
pub struct RoutingEngine {
  tables: RoutingTables,
}

impl RoutingEngine {
  pub fn new(tables: RoutingTables) -> Self {
    Self { tables }
  }

  pub fn detect_subject(&self, text: &str) -> String {
    self.detect_subject_explained(text).subject
  }

  /// Keyword scoring with two math boosts evaluated first.
  /// Ties go to the subject declared first in the tables.
  pub fn detect_subject_explained(&self, text: &str) -> SubjectDetection {
    let lower = text.to_lowercase();
    let t = &self.tables;

    if lower.trim().is_empty() {
      return found(UNKNOWN_SUBJECT, SubjectPath::Unknown);
    }

    if t.math_symbols.iter().any(|s| lower.contains(s.as_str())) {
      return found(&t.math_label, SubjectPath::MathSymbol);
    }

    let math_hits = t
      .subjects
      .iter()
      .find(|s| s.label == t.math_label)
      .map_or(0, |s| keyword_hits(&lower, &s.keywords));
    if math_hits >= MIN_MATH_KEYWORD_HITS {
      return found(&t.math_label, SubjectPath::MathKeywords);
    }

    let numbers = NUMERIC_TOKEN.find_iter(&lower).count();
    let quantifiers = keyword_hits(&lower, &t.quantifier_words);
    if numbers >= MIN_NUMERIC_TOKENS && quantifiers >= MIN_QUANTIFIER_HITS {
      return found(&t.math_label, SubjectPath::ApplicationProblem);
    }

    let mut best: Option<(&str, usize)> = None;
    for s in &t.subjects {
      let hits = keyword_hits(&lower, &s.keywords);
      // strict `>` keeps the earlier subject on ties
      if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
        best = Some((s.label.as_str(), hits));
      }
    }
    match best {
      Some((label, _)) => found(label, SubjectPath::KeywordScore),
      None => found(UNKNOWN_SUBJECT, SubjectPath::Unknown),
    }
  }

  #[allow(dead_code)]
  pub fn should_use_vision_model(&self, text: &str, quality: OcrQuality, subject: &str) -> bool {
    self.vision_trigger(text, quality, subject).is_some()
  }

  /// First condition of the vision OR-chain that holds, if any.
  pub fn vision_trigger(&self, text: &str, quality: OcrQuality, subject: &str) -> Option<VisionTrigger> {
    let t = &self.tables;
    let trimmed = text.trim();
    let len = trimmed.chars().count();
    let lower = trimmed.to_lowercase();
    let mentions = |list: &Vec<String>| mentions_any(&lower, list);

    if quality == OcrQuality::None {
      return Some(VisionTrigger::NoOcrText);
    }
    if quality == OcrQuality::Low && len < LOW_QUALITY_VISION_LEN {
      return Some(VisionTrigger::LowQualityShortText);
    }
    if mentions(&t.diagram_phrases) {
      return Some(VisionTrigger::DiagramReference);
    }
    if mentions(&t.drawing_keywords) {
      return Some(VisionTrigger::DrawingTask);
    }
    if subject == t.math_label && mentions(&t.geometry_terms) && len < SHORT_GEOMETRY_LEN {
      return Some(VisionTrigger::ShortGeometry);
    }
    if subject == t.english_label && mentions(&t.picture_match_phrases) {
      return Some(VisionTrigger::PictureMatching);
    }
    None
  }

  /// An available image that needs looking at beats subject routing.
  pub fn select_backend(&self, subject: &str, has_image: bool) -> BackendKind {
    if has_image {
      BackendKind::VisionLanguage
    } else if subject == self.tables.math_label {
      BackendKind::MathSpecialized
    } else {
      BackendKind::GeneralText
    }
  }

  /// Full decision for one question: quality, subject, vision need, and the
  /// ranked backend chain. `image_available` says whether the caller holds the
  /// original image.
  #[instrument(level = "debug", target = "routing", skip(self, text), fields(text_len = text.len()))]
  pub fn plan_routing(&self, text: &str, image_available: bool) -> RoutingPlan {
    let ocr_quality = assess_ocr_quality(text);
    let detection = self.detect_subject_explained(text);
    let vision_trigger = self.vision_trigger(text, ocr_quality, &detection.subject);
    let needs_vision_fallback = vision_trigger.is_some();
    let primary = self.select_backend(&detection.subject, needs_vision_fallback && image_available);

    // Vision and math both degrade to general text on the OCR text, which
    // needs OCR text to work on.
    let fallbacks = if ocr_quality == OcrQuality::None || primary == BackendKind::GeneralText {
      vec![]
    } else {
      vec![BackendKind::GeneralText]
    };

    let plan = RoutingPlan {
      ocr_quality,
      subject: detection.subject,
      subject_path: detection.path,
      needs_vision_fallback,
      vision_trigger,
      primary,
      fallbacks,
    };
    debug!(
      target: "routing",
      quality = plan.ocr_quality.as_str(),
      subject = %plan.subject,
      path = ?plan.subject_path,
      trigger = ?plan.vision_trigger,
      primary = %plan.primary,
      fallbacks = ?plan.fallbacks,
      "Routing planned"
    );
    plan
  }

  /// Backend chain for a tutoring conversation about a stored question.
  ///
  /// Stored questions carry user-facing subject names, so math is recognised
  /// through `math_aliases`; an unlabelled question falls back to detection on
  /// its content. A viewable image always goes to the vision backend first.
  pub fn chat_chain(&self, subject: &str, content: &str, has_image: bool) -> Vec<BackendKind> {
    let subject = subject.trim();
    let t = &self.tables;
    let is_math = if subject.is_empty() || subject == DEFAULT_SUBJECT {
      self.detect_subject(content) == t.math_label
    } else {
      subject == t.math_label || t.math_aliases.iter().any(|a| a == subject)
    };
    let label = if is_math { t.math_label.as_str() } else { subject };
    let primary = self.select_backend(label, has_image);

    let mut chain = vec![primary];
    if primary != BackendKind::GeneralText {
      chain.push(BackendKind::GeneralText);
    }
    debug!(target: "routing", %subject, is_math, ?chain, "Chat routing planned");
    chain
  }
}

fn found(label: &str, path: SubjectPath) -> SubjectDetection {
  SubjectDetection { subject: label.to_string(), path }
}

fn mentions_any(lower_text: &str, phrases: &[String]) -> bool {
  phrases.iter().any(|p| !p.is_empty() && lower_text.contains(&p.to_lowercase()))
}

fn keyword_hits(lower_text: &str, keywords: &[String]) -> usize {
  keywords
    .iter()
    .filter(|k| !k.is_empty() && lower_text.contains(&k.to_lowercase()))
    .count()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::keywords::SubjectKeywords;

  fn engine() -> RoutingEngine {
    RoutingEngine::new(RoutingTables::default())
  }

  // ---- quality ----

  #[test]
  fn empty_or_blank_text_has_no_quality() {
    assert_eq!(assess_ocr_quality(""), OcrQuality::None);
    assert_eq!(assess_ocr_quality(" \n\t "), OcrQuality::None);
  }

  #[test]
  fn length_gate_dominates_ratio() {
    let fourteen = "这是一道很长的数学应用题目啊";
    assert_eq!(fourteen.chars().count(), 14);
    assert_eq!(meaningful_ratio(fourteen), 1.0);
    assert_eq!(assess_ocr_quality(fourteen), OcrQuality::Low);
  }

  #[test]
  fn long_meaningful_text_is_high() {
    // 22 letters + 9 digits = 31 chars, ratio ≈ 0.71
    let text = format!("{}{}", "甲".repeat(22), "123456789");
    assert_eq!(text.chars().count(), 31);
    assert!(meaningful_ratio(&text) > 0.7);
    assert_eq!(assess_ocr_quality(&text), OcrQuality::High);
  }

  #[test]
  fn exactly_thirty_chars_is_not_high() {
    let text = "甲".repeat(30);
    assert_eq!(assess_ocr_quality(&text), OcrQuality::Medium);
  }

  #[test]
  fn ratio_bands() {
    // 10 letters of 20 chars: ratio 0.5 is not above the medium bar
    let half = format!("{}{}", "乙".repeat(10), "1234567890");
    assert_eq!(assess_ocr_quality(&half), OcrQuality::Low);
    // 12 of 20: medium (too short for high anyway)
    let medium = format!("{}{}", "乙".repeat(12), "12345678");
    assert_eq!(assess_ocr_quality(&medium), OcrQuality::Medium);
    // single letters between digits are not meaningful runs
    let scattered = "1a2b3c4d5e6f7g8h9i0j";
    assert_eq!(meaningful_ratio(scattered), 0.0);
    assert_eq!(assess_ocr_quality(scattered), OcrQuality::Low);
  }

  #[test]
  fn garbage_runs_force_low() {
    let long_ok = "已知函数的定义域为全体实数求函数的最小值并说明理由";
    assert_ne!(assess_ocr_quality(long_ok), OcrQuality::Low);
    assert_eq!(assess_ocr_quality(&format!("{long_ok}\u{FFFD}\u{FFFD}")), OcrQuality::Low);
    assert_eq!(assess_ocr_quality(&format!("{long_ok}□□□")), OcrQuality::Low);
    // ordinary math notation is not garbage
    assert!(!GARBAGE_RUN.is_match("x²+2x-3=0，求x的值（π≈3.14）"));
  }

  #[test]
  fn stutter_detection_follows_backreference_semantics() {
    assert!(has_stutter("求函数 求函数的零点"));
    assert!(has_stutter("零点 点的坐标"));
    assert!(has_stutter("the the answer"));
    assert!(!has_stutter("what is your name"));
    assert!(!has_stutter("没有空格的句子"));
    assert!(!has_stutter("two  spaces"));
    assert!(has_stutter("abcab cabx"));
    assert!(!has_stutter("abc bad"));
    assert!(!has_stutter("trailing "));
    let long = "已知函数的定义域为全体实数 实数求函数的最小值并说明理由";
    assert_eq!(assess_ocr_quality(long), OcrQuality::Low);
  }

  #[test]
  fn overlap_is_the_longest_tail_that_starts_the_right_token() {
    let v = |s: &str| s.chars().collect::<Vec<_>>();
    assert_eq!(suffix_prefix_overlap(&v("xaba"), &v("abab")), 3);
    assert_eq!(suffix_prefix_overlap(&v("aaaa"), &v("aa")), 2);
    assert_eq!(suffix_prefix_overlap(&v("abc"), &v("d")), 0);
    assert_eq!(suffix_prefix_overlap(&v("abc"), &v("")), 0);
  }

  #[test]
  fn stutter_scan_stays_fast_on_long_tokens() {
    let n = 200_000;
    let text = format!("{}b {}c", "a".repeat(n), "a".repeat(n));
    let start = std::time::Instant::now();
    assert!(!has_stutter(&text));
    let stutter = format!("{}b {}", "a".repeat(n), "b".repeat(n));
    assert!(has_stutter(&stutter));
    assert!(start.elapsed() < std::time::Duration::from_secs(2));
  }

  // ---- subject ----

  #[test]
  fn math_symbol_wins_immediately() {
    let d = engine().detect_subject_explained("英语单词 sentence: 1 + 1");
    assert_eq!(d.subject, "math");
    assert_eq!(d.path, SubjectPath::MathSymbol);
  }

  #[test]
  fn two_math_keywords_win_immediately() {
    let d = engine().detect_subject_explained("解方程并化简结果");
    assert_eq!(d.subject, "math");
    assert_eq!(d.path, SubjectPath::MathKeywords);
  }

  #[test]
  fn word_problem_without_symbols_is_math() {
    let d = engine().detect_subject_explained("计算: 3个苹果, 5个梨, 一共多少个");
    assert_eq!(d.subject, "math");
    assert_eq!(d.path, SubjectPath::ApplicationProblem);
  }

  #[test]
  fn word_problem_needs_two_numbers() {
    let d = engine().detect_subject_explained("小明有3个苹果，一共多少个，还剩几个");
    assert_eq!(d.path, SubjectPath::Unknown);
  }

  #[test]
  fn highest_keyword_score_wins() {
    let d = engine().detect_subject_explained("细胞中的基因决定遗传性状");
    assert_eq!(d.subject, "biology");
    assert_eq!(d.path, SubjectPath::KeywordScore);
  }

  #[test]
  fn english_keywords_match_case_insensitively() {
    assert_eq!(engine().detect_subject("Choose the best answer to fill in the BLANK"), "english");
  }

  #[test]
  fn nothing_recognisable_is_unknown() {
    assert_eq!(engine().detect_subject("今天天气很好"), UNKNOWN_SUBJECT);
    assert_eq!(engine().detect_subject(""), UNKNOWN_SUBJECT);
  }

  #[test]
  fn ties_follow_declaration_order() {
    let tables = RoutingTables {
      subjects: vec![
        SubjectKeywords { label: "first".into(), keywords: vec!["甲".into()] },
        SubjectKeywords { label: "second".into(), keywords: vec!["乙".into()] },
      ],
      math_symbols: vec![],
      ..RoutingTables::default()
    };
    let e = RoutingEngine::new(tables);
    assert_eq!(e.detect_subject("甲乙"), "first");
    assert_eq!(e.detect_subject("乙甲"), "first");
  }

  // ---- vision ----

  #[test]
  fn no_ocr_text_always_needs_vision() {
    let e = engine();
    for subject in ["math", "english", "unknown", ""] {
      for text in ["", "随便什么内容", "as shown in the figure"] {
        assert!(e.should_use_vision_model(text, OcrQuality::None, subject));
        assert_eq!(e.vision_trigger(text, OcrQuality::None, subject), Some(VisionTrigger::NoOcrText));
      }
    }
  }

  #[test]
  fn vision_chain_conditions() {
    let e = engine();
    assert_eq!(
      e.vision_trigger("看不清的短文本", OcrQuality::Low, "unknown"),
      Some(VisionTrigger::LowQualityShortText)
    );
    assert_eq!(
      e.vision_trigger("如图所示，小明从家出发走到学校，一共走了多远的路程呢", OcrQuality::High, "unknown"),
      Some(VisionTrigger::DiagramReference)
    );
    assert_eq!(
      e.vision_trigger("请用线把下面的词语和意思正确地连线起来吧同学们加油", OcrQuality::High, "chinese"),
      Some(VisionTrigger::DrawingTask)
    );
    assert_eq!(
      e.vision_trigger("求三角形ABC的面积", OcrQuality::Medium, "math"),
      Some(VisionTrigger::ShortGeometry)
    );
    assert_eq!(
      e.vision_trigger("Look at the picture and write the word", OcrQuality::High, "english"),
      Some(VisionTrigger::PictureMatching)
    );
    assert_eq!(
      e.vision_trigger("已知函数的定义域为全体实数求函数的最小值并说明理由", OcrQuality::High, "math"),
      None
    );
  }

  #[test]
  fn geometry_rule_needs_short_math_text() {
    let e = engine();
    assert_eq!(e.vision_trigger("求三角形ABC的面积", OcrQuality::Medium, "physics"), None);
    let long = format!("求三角形ABC的面积{}", "并写出完整的推理过程".repeat(5));
    assert!(long.chars().count() >= 50);
    assert_eq!(e.vision_trigger(&long, OcrQuality::High, "math"), None);
  }

  // ---- backend selection ----

  #[test]
  fn image_beats_subject() {
    let e = engine();
    assert_eq!(e.select_backend("math", true), BackendKind::VisionLanguage);
    assert_eq!(e.select_backend("math", false), BackendKind::MathSpecialized);
    assert_eq!(e.select_backend("english", false), BackendKind::GeneralText);
    assert_eq!(e.select_backend("unknown", false), BackendKind::GeneralText);
  }

  #[test]
  fn empty_text_routes_to_vision() {
    let e = engine();
    let quality = assess_ocr_quality("");
    assert_eq!(quality, OcrQuality::None);
    let subject = e.detect_subject("");
    assert!(e.should_use_vision_model("", quality, &subject));
    assert_eq!(e.select_backend(&subject, true), BackendKind::VisionLanguage);

    let plan = e.plan_routing("", true);
    assert_eq!(plan.primary, BackendKind::VisionLanguage);
    assert!(plan.fallbacks.is_empty());
  }

  #[test]
  fn plans_degrade_towards_cheaper_backends() {
    let e = engine();

    let math = e.plan_routing("已知函数 f(x) = x² + 2x - 3，求函数的零点并写出完整的解题过程", false);
    assert_eq!(math.subject, "math");
    assert_eq!(math.chain(), vec![BackendKind::MathSpecialized, BackendKind::GeneralText]);

    let vision_math = e.plan_routing("如图，求三角形的面积", true);
    assert!(vision_math.needs_vision_fallback);
    assert_eq!(vision_math.chain(), vec![BackendKind::VisionLanguage, BackendKind::GeneralText]);

    // vision needed but no image in hand: subject routing applies
    let no_image = e.plan_routing("如图，求三角形的面积", false);
    assert!(no_image.needs_vision_fallback);
    assert_eq!(no_image.primary, BackendKind::MathSpecialized);

    let general = e.plan_routing("细胞中的基因决定遗传性状，请说明原因并举出一个生活中的例子", false);
    assert_eq!(general.chain(), vec![BackendKind::GeneralText]);
  }

  #[test]
  fn chat_chain_follows_stored_subject_and_image() {
    let e = engine();
    assert_eq!(
      e.chat_chain("数学", "小明有3个苹果", false),
      vec![BackendKind::MathSpecialized, BackendKind::GeneralText]
    );
    assert_eq!(
      e.chat_chain("数学", "如图", true),
      vec![BackendKind::VisionLanguage, BackendKind::GeneralText]
    );
    assert_eq!(e.chat_chain("语文", "解释这句古诗的意思", false), vec![BackendKind::GeneralText]);
    // unlabelled question: the content decides
    assert_eq!(e.chat_chain("未分类", "x² + 1 = 5", false)[0], BackendKind::MathSpecialized);
    // a labelled non-math question is never re-detected
    assert_eq!(e.chat_chain("物理", "F = ma", false), vec![BackendKind::GeneralText]);
  }

  #[test]
  fn planning_is_pure() {
    let e = engine();
    let text = "计算: 3个苹果, 5个梨, 一共多少个";
    assert_eq!(e.plan_routing(text, true), e.plan_routing(text, true));
  }
}
