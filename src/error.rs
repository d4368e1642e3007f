use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 输入校验失败
    #[error("校验失败: {0}")]
    Validation(String),
}

/// 内容生成服务错误
///
/// 超时、拒绝、传输失败分别建模，空响应也是错误而不是"成功但为空"。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// 调用超时
    #[error("调用超时 ({after_ms}ms)")]
    Timeout { after_ms: u64 },
    /// 服务端拒绝请求
    #[error("请求被拒绝: {message}")]
    Rejected { message: String },
    /// 网络/传输失败
    #[error("传输失败: {message}")]
    Transport { message: String },
    /// 返回内容为空
    #[error("返回内容为空")]
    EmptyContent,
}

impl ProviderError {
    /// 对应的子任务错误阶段
    pub fn stage(&self) -> ErrorStage {
        match self {
            ProviderError::Timeout { .. } => ErrorStage::ProviderTimeout,
            ProviderError::Rejected { .. } | ProviderError::EmptyContent => {
                ErrorStage::ProviderRejected
            }
            ProviderError::Transport { .. } => ErrorStage::ProviderTransport,
        }
    }
}

/// AI 响应修复失败
///
/// `raw` 始终保存原始响应，便于审计。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage:?} 阶段失败: {message}")]
pub struct RepairError {
    pub stage: ErrorStage,
    pub message: String,
    pub raw: String,
}

impl RepairError {
    pub fn parse(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            stage: ErrorStage::Parse,
            message: message.into(),
            raw: raw.into(),
        }
    }
}

/// 存储错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("题目不存在: {0}")]
    RecordNotFound(u64),
    #[error("任务不存在: {0}")]
    TaskNotFound(String),
    #[error("子任务不存在: {0}")]
    ItemNotFound(String),
    #[error("写入失败: {0}")]
    WriteFailed(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 配置值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 子任务状态迁移错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("子任务 {item_id} 不能从 {from} 迁移到 {to}")]
pub struct TransitionError {
    pub item_id: String,
    pub from: String,
    pub to: String,
}

/// 子任务失败所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Validation,
    ProviderTimeout,
    ProviderRejected,
    ProviderTransport,
    Parse,
    MergeConflict,
    Persist,
}

impl ErrorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorStage::Validation => "validation",
            ErrorStage::ProviderTimeout => "provider_timeout",
            ErrorStage::ProviderRejected => "provider_rejected",
            ErrorStage::ProviderTransport => "provider_transport",
            ErrorStage::Parse => "parse",
            ErrorStage::MergeConflict => "merge_conflict",
            ErrorStage::Persist => "persist",
        }
    }
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建输入校验错误
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    /// 创建配置值错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
