//! Service configuration: backend endpoints from the environment, prompts and
//! routing tables from an optional TOML file.
//!
//! See `AppConfig`, `Prompts` and `BackendSettings` for the expected schema.

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::domain::BackendKind;
use crate::keywords::RoutingTables;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 90;

const DASHSCOPE_COMPAT_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub routing: RoutingTables,
}

/// Prompts sent to the analysis backends. `{placeholder}`s are filled per call.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  // Question analysis ({text}, {subject_hint})
  pub analysis_system: String,
  pub analysis_user_template: String,
  // Vision: the image carries the question, the OCR text is only a hint
  pub vision_user_template: String,
  // Practice options ({subject}, {knowledge_point}, {content})
  pub options_system: String,
  pub options_user_template: String,
  // Tutoring chat ({subject}, {content}, {knowledge_point}, {difficulty},
  // {correct_answer}, {analysis})
  pub chat_system_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      analysis_system: "你是一名中小学老师，负责整理学生的错题。只输出一个 JSON 对象，不要输出任何其他文字。".into(),
      analysis_user_template: "学科提示：{subject_hint}\n题目：\n{text}\n\n请分析这道题，返回 JSON：{\"subject\": 学科, \"knowledgePoint\": 知识点, \"difficulty\": \"easy|medium|hard\", \"questionType\": 题型, \"correctAnswer\": 正确答案, \"userAnswer\": 学生作答（没有则为空）, \"analysis\": 解题思路, \"formattedText\": 整理后的题目原文}".into(),
      vision_user_template: "学科提示：{subject_hint}\n识别出的文字（可能不完整）：\n{text}\n\n请以图片为准识别并分析这道题，返回 JSON：{\"subject\": 学科, \"knowledgePoint\": 知识点, \"difficulty\": \"easy|medium|hard\", \"questionType\": 题型, \"correctAnswer\": 正确答案, \"userAnswer\": 学生作答（没有则为空）, \"analysis\": 解题思路, \"formattedText\": 完整的题目原文}".into(),
      options_system: "你是出题老师。直接返回 JSON，不要任何其他说明文字。".into(),
      options_user_template: "这是一道{subject}的{knowledge_point}相关题目，请为它生成4个选项（1个正确答案和3个干扰项）。\n\n题目：{content}\n\n要求：干扰项要有迷惑性；第一个选项必须是正确答案。\n返回格式：{\"options\": [{\"label\": \"A\", \"text\": \"正确答案\"}, {\"label\": \"B\", \"text\": \"干扰项1\"}, {\"label\": \"C\", \"text\": \"干扰项2\"}, {\"label\": \"D\", \"text\": \"干扰项3\"}]}".into(),
      chat_system_template: "你是一位耐心、专业的{subject}老师，正在为学生讲解一道错题。\n\n题目：{content}\n知识点：{knowledge_point}\n难度：{difficulty}\n正确答案：{correct_answer}\n初步分析：{analysis}\n\n请根据学生的问题给出清晰的讲解：引导思考而不是直接给答案；学生没听懂时换个角度、用更简单的语言再讲；可以用生活中的例子；不要重复已经说过的内容，每次回复控制在150字以内。".into(),
    }
  }
}

/// One OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendEndpoint {
  /// `None` means the backend is not configured; calls to it fail fast.
  pub api_key: Option<String>,
  pub base_url: String,
  pub model: String,
}

impl BackendEndpoint {
  fn from_env(prefix: &str, default_base_url: &str, default_model: &str) -> Self {
    let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok().filter(|v| !v.trim().is_empty());
    Self {
      api_key: var("API_KEY"),
      base_url: var("BASE_URL").unwrap_or_else(|| default_base_url.into()).trim_end_matches('/').to_string(),
      model: var("MODEL").unwrap_or_else(|| default_model.into()),
    }
  }

  pub fn is_configured(&self) -> bool {
    self.api_key.is_some()
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackendSettings {
  pub general: BackendEndpoint,
  pub math: BackendEndpoint,
  pub vision: BackendEndpoint,
  pub timeout_secs: u64,
}

impl BackendSettings {
  /// Read `GENERAL_*`, `MATH_*`, `VISION_*` and `BACKEND_TIMEOUT_SECS`.
  pub fn from_env() -> Self {
    let timeout_secs = match std::env::var("BACKEND_TIMEOUT_SECS") {
      Ok(v) => v.parse().unwrap_or_else(|_| {
        warn!(target: "cuotiben_backend", value = %v, "Invalid BACKEND_TIMEOUT_SECS; using default");
        DEFAULT_TIMEOUT_SECS
      }),
      Err(_) => DEFAULT_TIMEOUT_SECS,
    };
    let settings = Self {
      general: BackendEndpoint::from_env("GENERAL", "https://api.deepseek.com", "deepseek-chat"),
      math: BackendEndpoint::from_env("MATH", DASHSCOPE_COMPAT_URL, "qwen-math-turbo"),
      vision: BackendEndpoint::from_env("VISION", DASHSCOPE_COMPAT_URL, "qwen-vl-max"),
      timeout_secs,
    };
    for kind in [BackendKind::GeneralText, BackendKind::MathSpecialized, BackendKind::VisionLanguage] {
      let ep = settings.endpoint(kind);
      info!(target: "cuotiben_backend", backend = %kind, model = %ep.model, configured = ep.is_configured(), "Backend endpoint");
    }
    settings
  }

  pub fn endpoint(&self, kind: BackendKind) -> &BackendEndpoint {
    match kind {
      BackendKind::GeneralText => &self.general,
      BackendKind::MathSpecialized => &self.math,
      BackendKind::VisionLanguage => &self.vision,
    }
  }
}

/// Port from `PORT`, falling back to 3000.
pub fn port_from_env() -> u16 {
  std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(DEFAULT_PORT)
}

/// Parse a TOML config document. Missing sections keep their defaults.
pub fn parse_app_config(src: &str) -> Result<AppConfig, toml::de::Error> {
  toml::from_str::<AppConfig>(src)
}

/// Load `AppConfig` from APP_CONFIG_PATH. Without the variable, or on any
/// read/parse error, the built-in defaults are used.
pub fn load_app_config_from_env() -> AppConfig {
  let Ok(path) = std::env::var("APP_CONFIG_PATH") else {
    info!(target: "cuotiben_backend", "APP_CONFIG_PATH not set; using built-in prompts and routing tables");
    return AppConfig::default();
  };
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_app_config(&s) {
      Ok(cfg) => {
        info!(target: "cuotiben_backend", %path, subjects = cfg.routing.subjects.len(), "Loaded app config (TOML)");
        cfg
      }
      Err(e) => {
        error!(target: "cuotiben_backend", %path, error = %e, "Failed to parse TOML config; using defaults");
        AppConfig::default()
      }
    },
    Err(e) => {
      error!(target: "cuotiben_backend", %path, error = %e, "Failed to read TOML config file; using defaults");
      AppConfig::default()
    }
  }
}
