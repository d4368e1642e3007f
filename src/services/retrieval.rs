//! 检索上下文服务 - 业务能力层
//!
//! 只负责"根据题干检索参考资料"能力。没有结果是合法的，不会阻塞处理。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::ProviderError;

/// 一条参考资料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: f32,
}

/// 检索上下文提供方
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// 检索与 `query` 相关的资料，最多 `top_k` 条，分数低于 `threshold` 的丢弃
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ContextSnippet>, ProviderError>;
}

/// 不做检索增强
pub struct NoopRetriever;

#[async_trait]
impl ContextRetriever for NoopRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _top_k: usize,
        _threshold: f32,
    ) -> Result<Vec<ContextSnippet>, ProviderError> {
        Ok(Vec::new())
    }
}

/// 通过 HTTP 调用外部检索服务
///
/// 请求：`POST {endpoint}`，body 为 `{"query", "top_k", "threshold"}`；
/// 响应可以是结果数组，也可以是 `{"results": [...]}`。
pub struct HttpRetriever {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRetriever {
    /// 创建检索客户端；HTTP 客户端无法构建时返回错误，不会退回到没有超时的默认客户端
    pub fn new(endpoint: impl Into<String>, config: &Config) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ProviderError::Transport {
                message: format!("无法创建检索客户端: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

/// 解析检索响应并按阈值、数量过滤
fn parse_results(body: Value, top_k: usize, threshold: f32) -> Vec<ContextSnippet> {
    let list = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let mut snippets: Vec<ContextSnippet> = list
        .into_iter()
        .filter_map(|item| serde_json::from_value::<ContextSnippet>(item).ok())
        .filter(|s| s.score >= threshold && !s.snippet.trim().is_empty())
        .collect();
    snippets.sort_by(|a, b| b.score.total_cmp(&a.score));
    snippets.truncate(top_k);
    snippets
}

#[async_trait]
impl ContextRetriever for HttpRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ContextSnippet>, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "query": query,
                "top_k": top_k,
                "threshold": threshold,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                message: format!("检索服务返回 {}", status),
            });
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::Transport {
            message: e.to_string(),
        })?;
        let snippets = parse_results(body, top_k, threshold);
        debug!("检索到 {} 条参考资料", snippets.len());
        Ok(snippets)
    }
}
