//! LLM 服务 - 业务能力层
//!
//! 只负责"调用 LLM 生成内容"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::models::TokenUsage;
use crate::services::content_generator::{ContentGenerator, GenerationOutput, GenerationRequest};

/// LLM 服务
///
/// 职责：
/// - 把一次生成请求转换为 chat completion 调用
/// - 只处理单个子任务
/// - 不解析响应内容（交给修复服务）
pub struct LlmService {
    client: Client<OpenAIConfig>,
    model_name: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        }
    }

    /// 通用的 LLM 调用函数
    ///
    /// # 返回
    /// 返回 LLM 的原始响应内容与 token 用量
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: &str,
    ) -> Result<(String, Option<TokenUsage>), ProviderError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_message)
            .build()
            .map_err(map_openai_error)?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(map_openai_error)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(map_openai_error)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            map_openai_error(e)
        })?;

        let usage = response.usage.as_ref().map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        // 空响应是错误，不是"成功但为空"
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or(ProviderError::EmptyContent)?;

        debug!("LLM API 调用成功");
        Ok((content, usage))
    }
}

fn map_openai_error(error: OpenAIError) -> ProviderError {
    match error {
        OpenAIError::ApiError(api) => ProviderError::Rejected {
            message: api.message,
        },
        other => ProviderError::Transport {
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ContentGenerator for LlmService {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        let (raw_text, usage) = self
            .send_to_llm(&request.user_prompt, &request.system_prompt)
            .await?;
        Ok(GenerationOutput {
            raw_text,
            usage,
            model: self.model_name.clone(),
        })
    }
}
