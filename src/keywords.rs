//! Keyword tables that drive subject detection and vision routing.
//!
//! Built-in defaults cover the subjects a primary/middle-school error book sees.
//! Any table can be replaced through the `[routing]` section of the TOML config;
//! the routing engine receives the final tables at construction time.

use serde::Deserialize;

/// Keywords of one subject. Declaration order in `RoutingTables::subjects`
/// is the tie-break order.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SubjectKeywords {
  pub label: String,
  pub keywords: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingTables {
  pub subjects: Vec<SubjectKeywords>,
  /// Label returned by the math boosts; also the subject that routes to the math backend.
  pub math_label: String,
  /// User-facing subject names of stored questions that mean math ("数学").
  pub math_aliases: Vec<String>,
  /// Label that enables the picture-matching vision rule.
  pub english_label: String,
  /// Any of these in the text means math, immediately.
  pub math_symbols: Vec<String>,
  /// Counting words / units typical of word problems ("3个苹果", "一共多少").
  pub quantifier_words: Vec<String>,
  /// Phrases that point at a figure the OCR text cannot carry.
  pub diagram_phrases: Vec<String>,
  /// Drawing, colouring and matching tasks.
  pub drawing_keywords: Vec<String>,
  pub geometry_terms: Vec<String>,
  /// English "look at the picture and match" task phrasing.
  pub picture_match_phrases: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
  list.iter().map(|s| s.to_string()).collect()
}

fn subject(label: &str, keywords: &[&str]) -> SubjectKeywords {
  SubjectKeywords { label: label.into(), keywords: words(keywords) }
}

impl Default for RoutingTables {
  fn default() -> Self {
    Self {
      subjects: vec![
        subject("math", &[
          "函数", "方程", "不等式", "因式分解", "化简", "求解", "解方程", "计算", "面积", "周长",
          "体积", "概率", "数列", "向量", "坐标", "平方", "分数", "小数", "约分", "通分",
          "equation", "function", "calculate", "solve", "fraction",
        ]),
        subject("physics", &[
          "物理", "速度", "加速度", "电流", "电压", "电阻", "牛顿", "摩擦力", "重力", "压强",
          "浮力", "功率", "磁场", "折射", "velocity", "force", "voltage",
        ]),
        subject("chemistry", &[
          "化学", "化合物", "元素", "分子", "原子", "离子", "氧化", "还原", "溶液", "摩尔",
          "化学方程式", "酸碱", "h2o", "co2", "mol",
        ]),
        subject("english", &[
          "单词", "语法", "完形填空", "阅读理解", "英译汉", "汉译英", "choose", "fill in",
          "blank", "sentence", "which", "the ", " is ", " are ", "passage",
        ]),
        subject("chinese", &[
          "古诗", "作文", "拼音", "成语", "文言文", "修辞", "段落", "词语", "造句", "近义词",
          "反义词", "病句", "课文",
        ]),
        subject("biology", &[
          "细胞", "基因", "遗传", "光合作用", "呼吸作用", "生态", "蛋白质", "dna", "器官", "生物",
        ]),
        subject("history", &[
          "朝代", "战争", "革命", "皇帝", "历史", "条约", "起义", "变法",
        ]),
        subject("geography", &[
          "地图", "气候", "经纬", "地形", "河流", "季风", "板块", "等高线", "地理",
        ]),
        subject("politics", &[
          "宪法", "法律", "公民", "道德", "国家机构", "权利", "义务",
        ]),
      ],
      math_label: "math".into(),
      math_aliases: words(&["数学", "数学题", "math"]),
      english_label: "english".into(),
      math_symbols: words(&[
        "+", "=", "×", "÷", "√", "²", "³", "π", "∠", "△", "≈", "≠", "≤", "≥", "∫", "∑", "∞",
      ]),
      quantifier_words: words(&[
        "个", "只", "本", "支", "元", "角钱", "米", "厘米", "千米", "千克", "克", "吨", "小时",
        "分钟", "一共", "多少", "还剩", "平均", "每", "倍", "几",
      ]),
      diagram_phrases: words(&[
        "如图", "如下图", "见图", "图中", "观察图", "看图", "下图所示", "上图所示", "右图", "左图",
        "as shown in the figure", "see the figure", "observe the diagram", "in the diagram",
        "in the picture",
      ]),
      drawing_keywords: words(&[
        "画出", "画一画", "作图", "画图", "连线", "连一连", "涂色", "涂一涂", "圈出", "圈一圈",
        "标出", "draw", "colour", "color the", "connect the dots",
      ]),
      geometry_terms: words(&[
        "三角形", "四边形", "平行四边形", "梯形", "正方形", "长方形", "圆", "扇形", "角", "平行",
        "垂直", "对称", "坐标系", "抛物线", "triangle", "circle", "angle", "parallel",
      ]),
      picture_match_phrases: words(&[
        "看图", "根据图片", "连线", "match the", "look at the picture", "according to the picture",
        "match the pictures", "connect the words",
      ]),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_declare_math_first() {
    let t = RoutingTables::default();
    assert_eq!(t.subjects[0].label, t.math_label);
    assert!(t.subjects.iter().any(|s| s.label == t.english_label));
  }

  #[test]
  fn quantifiers_and_math_keywords_do_not_overlap() {
    // The word-problem boost must stay reachable without two keyword hits.
    let t = RoutingTables::default();
    let math = &t.subjects[0].keywords;
    assert!(t.quantifier_words.iter().all(|q| !math.contains(q)));
  }

  #[test]
  fn partial_toml_keeps_remaining_defaults() {
    let t: RoutingTables = toml::from_str(
      r#"
        math_label = "数学"
        [[subjects]]
        label = "数学"
        keywords = ["方程"]
      "#,
    )
    .unwrap();
    assert_eq!(t.subjects.len(), 1);
    assert_eq!(t.math_label, "数学");
    assert_eq!(t.math_symbols, RoutingTables::default().math_symbols);
  }
}
