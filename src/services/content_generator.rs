//! 内容生成能力接口
//!
//! 子任务执行器只依赖这个 trait，真实实现见 [`crate::services::LlmService`]，
//! 测试中使用脚本化的实现。

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ProviderError;
use crate::models::{Operation, TokenUsage};
use crate::services::retrieval::ContextSnippet;

/// 一次内容生成请求（同时作为子任务的 `ai_request` 留档）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub record_id: u64,
    pub operation: Operation,
    pub source_language: String,
    pub target_language: Option<String>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub context: Vec<ContextSnippet>,
}

/// 内容生成结果
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub raw_text: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

/// 内容生成服务
///
/// 失败必须以带类型的错误返回（超时 / 拒绝 / 传输），不能返回"看起来成功的空内容"。
/// 超时由调用方通过 `tokio::time::timeout` 控制。
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError>;
}
