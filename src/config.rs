use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, AppResult, ConfigError};
use crate::models::BatchRequest;

/// 程序配置
///
/// 每个进程只构造一次，以 `Arc<Config>` 的形式传给各层，
/// 并发子任务之间不共享任何隐藏的全局状态。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时执行的子任务数量上限
    pub max_concurrent_subtasks: usize,
    /// 单次 AI 调用超时（秒）
    pub request_timeout_secs: u64,
    /// 题目 TOML 文件存放目录
    pub records_folder: String,
    /// 待人工复核的记录输出文件
    pub review_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    // --- 检索配置 ---
    /// 检索服务地址，不配置时不做检索增强
    pub retrieval_endpoint: Option<String>,
    pub retrieval_top_k: usize,
    pub retrieval_threshold: f32,
    /// 程序启动时执行的批处理请求
    pub batch: Option<BatchRequest>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_subtasks: 4,
            request_timeout_secs: 60,
            records_folder: "questions".to_string(),
            review_file: "review.txt".to_string(),
            verbose_logging: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_temperature: 0.3,
            llm_max_tokens: 2048,
            retrieval_endpoint: None,
            retrieval_top_k: 3,
            retrieval_threshold: 0.7,
            batch: None,
        }
    }
}

impl Config {
    /// 从环境变量加载配置（未设置的项使用默认值）
    pub fn from_env() -> AppResult<Self> {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载配置，再用环境变量覆盖
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;
        config.with_env_overrides()
    }

    /// 根据 `CONFIG_FILE` 环境变量决定加载方式
    pub fn load() -> AppResult<Self> {
        match std::env::var("CONFIG_FILE") {
            Ok(path) => Self::from_toml_file(path),
            Err(_) => Self::from_env(),
        }
    }

    fn with_env_overrides(mut self) -> AppResult<Self> {
        if let Some(v) = env_parse("MAX_CONCURRENT_SUBTASKS", "usize")? {
            self.max_concurrent_subtasks = v;
        }
        if let Some(v) = env_parse("REQUEST_TIMEOUT_SECS", "u64")? {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("VERBOSE_LOGGING", "bool")? {
            self.verbose_logging = v;
        }
        if let Some(v) = env_parse("LLM_TEMPERATURE", "f32")? {
            self.llm_temperature = v;
        }
        if let Some(v) = env_parse("LLM_MAX_TOKENS", "u32")? {
            self.llm_max_tokens = v;
        }
        if let Some(v) = env_parse("RETRIEVAL_TOP_K", "usize")? {
            self.retrieval_top_k = v;
        }
        if let Some(v) = env_parse("RETRIEVAL_THRESHOLD", "f32")? {
            self.retrieval_threshold = v;
        }
        self.records_folder = std::env::var("RECORDS_FOLDER").unwrap_or(self.records_folder);
        self.review_file = std::env::var("REVIEW_FILE").unwrap_or(self.review_file);
        self.llm_api_key = std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key);
        self.llm_api_base_url = std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url);
        self.llm_model_name = std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name);
        if let Ok(endpoint) = std::env::var("RETRIEVAL_ENDPOINT") {
            self.retrieval_endpoint = Some(endpoint).filter(|e| !e.trim().is_empty());
        }

        self.validate()?;
        Ok(self)
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrent_subtasks == 0 {
            return Err(AppError::invalid_config("max_concurrent_subtasks", "必须大于 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::invalid_config("request_timeout_secs", "必须大于 0"));
        }
        if !(0.0..=1.0).contains(&self.retrieval_threshold) {
            return Err(AppError::invalid_config(
                "retrieval_threshold",
                "必须位于 [0, 1] 区间",
            ));
        }
        Ok(())
    }

    /// 单次 AI 调用的超时时长
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(var_name: &str, expected_type: &str) -> AppResult<Option<T>> {
    match std::env::var(var_name) {
        Ok(value) => value.trim().parse::<T>().map(Some).map_err(|_| {
            AppError::Config(ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            })
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = Config {
            max_concurrent_subtasks: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_load_from_toml_file_with_batch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
max_concurrent_subtasks = 8
request_timeout_secs = 30
llm_model_name = "test-model"

[batch]
record_ids = [1, 2]
operations = ["translate", "category_tags"]
source_language = "zh"
target_languages = ["ja"]
"#
        )
        .unwrap();

        let config = Config::from_toml_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_subtasks, 8);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        let batch = config.batch.unwrap();
        assert_eq!(batch.record_ids, vec![1, 2]);
        assert_eq!(batch.target_languages, vec!["ja".to_string()]);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::from_toml_file("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
