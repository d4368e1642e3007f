//! 子任务处理流程 - 流程层
//!
//! 核心职责：定义"一个子任务"的完整处理流程
//!
//! 流程顺序（每一步失败都有独立的错误阶段）：
//! 1. prepare：读取题目、检索参考资料、构建提示词
//! 2. invoke：在超时限制内调用内容生成服务
//! 3. repair：修复并校验 AI 响应
//! 4. merge：按目标语言过滤后，在题目锁内合并
//! 5. consistency：判断题解析一致性检查（只记录，不阻止合并）
//! 6. persist：子任务终态与文档修改一起原子提交

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ErrorStage, ProviderError};
use crate::infrastructure::QuestionStore;
use crate::models::{
    ConsistencyEntry, ConsistencyRecord, Operation, ProcessedPayload, QuestionRecord,
    QuestionType, SubtaskError, SubtaskItem,
};
use crate::services::content_generator::{ContentGenerator, GenerationRequest};
use crate::services::retrieval::{ContextRetriever, ContextSnippet};
use crate::services::{
    consistency_checker, idempotency, json_repair, language_merger, prompt_builder, WriteMode,
};
use crate::utils::logging::truncate_text;
use crate::workflow::subtask_ctx::SubtaskCtx;

/// 子任务处理结果
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    /// 终态子任务
    pub item: SubtaskItem,
    /// 成功时合并后题目在本子任务视图下的输入哈希
    pub completed_hash: Option<String>,
    pub consistency: Option<ConsistencyEntry>,
}

/// 子任务处理流程
///
/// - 编排单个子任务的完整处理流程
/// - 只修改自己负责的子任务、目标题目和（可能的）一条一致性记录
/// - 不持有任务级状态
pub struct SubtaskFlow {
    generator: Arc<dyn ContentGenerator>,
    retriever: Arc<dyn ContextRetriever>,
    store: Arc<dyn QuestionStore>,
    config: Arc<Config>,
}

impl SubtaskFlow {
    /// 创建新的子任务处理流程
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        retriever: Arc<dyn ContextRetriever>,
        store: Arc<dyn QuestionStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            generator,
            retriever,
            store,
            config,
        }
    }

    pub async fn run(&self, mut item: SubtaskItem, ctx: &SubtaskCtx) -> SubtaskOutcome {
        if let Err(e) = item.start() {
            warn!("{} ⚠️ {}", ctx, e);
            return SubtaskOutcome {
                item,
                completed_hash: None,
                consistency: None,
            };
        }
        if let Err(e) = self.store.update_item(item.clone()).await {
            warn!("{} ⚠️ 无法记录处理中状态: {}", ctx, e);
        }
        info!("{} ▶ 开始处理", ctx);

        match self.process(&mut item, ctx).await {
            Ok(outcome) => {
                info!("{} ✅ 处理成功", ctx);
                outcome
            }
            Err(failure) => self.finish_failed(item, failure, ctx).await,
        }
    }

    async fn process(
        &self,
        item: &mut SubtaskItem,
        ctx: &SubtaskCtx,
    ) -> Result<SubtaskOutcome, SubtaskError> {
        // ========== 1. prepare ==========
        let snapshot = self.store.get_record(ctx.record_id).await.map_err(|e| {
            SubtaskError::new(ErrorStage::Validation, "record_not_found", e.to_string())
        })?;
        let context = self.retrieve_context(&snapshot, ctx).await;
        let prompt = prompt_builder::build_prompt(
            ctx.operation,
            &snapshot,
            &ctx.source_language,
            ctx.target_language.as_deref(),
            &context,
        )
        .map_err(|message| SubtaskError::new(ErrorStage::Validation, "invalid_input", message))?;

        let request = GenerationRequest {
            record_id: ctx.record_id,
            operation: ctx.operation,
            source_language: ctx.source_language.clone(),
            target_language: ctx.target_language.clone(),
            system_prompt: prompt.system,
            user_prompt: prompt.user,
            context,
        };
        item.ai_request = serde_json::to_value(&request).ok();

        // ========== 2. invoke ==========
        let timeout = self.config.request_timeout();
        let output = match tokio::time::timeout(timeout, self.generator.generate(&request)).await {
            Ok(result) => result.map_err(provider_failure)?,
            Err(_) => {
                return Err(provider_failure(ProviderError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                }))
            }
        };
        debug!(
            "{} AI 响应 ({}): {}",
            ctx,
            output.model,
            truncate_text(&output.raw_text, 120)
        );
        item.ai_response = Some(output.raw_text.clone());
        item.usage = output.usage;

        // ========== 3. repair ==========
        let payload =
            json_repair::repair_payload(&output.raw_text, ctx.operation, ctx.write_language())
                .map_err(|e| SubtaskError::new(e.stage, "invalid_json", e.message))?;

        // ========== 4. filter + merge ==========
        let allowed = language_merger::allowed_languages(
            ctx.operation,
            &ctx.source_language,
            ctx.target_language.as_deref(),
        );
        let payload = match payload.localized() {
            Some(localized) => {
                let filtered = language_merger::filter_payload(localized, &allowed);
                payload.clone().with_localized(filtered)
            }
            None => payload,
        };

        // 题目锁内合并
        let _guard = self.store.lock_record(ctx.record_id).await;
        let current = self.store.get_record(ctx.record_id).await.map_err(|e| {
            SubtaskError::new(ErrorStage::MergeConflict, "record_removed", e.to_string())
        })?;
        if ctx.operation.derives_from_source()
            && current.source_fields(&ctx.source_language)
                != snapshot.source_fields(&ctx.source_language)
        {
            return Err(SubtaskError::new(
                ErrorStage::MergeConflict,
                "source_changed",
                format!("题目 {} 的源语言内容在处理期间被修改", ctx.record_id),
            ));
        }

        let mut merged = match payload.localized() {
            Some(localized) => language_merger::merge_localized(
                &current,
                localized,
                &allowed,
                &language_merger::localized_fields(current.question_type),
                WriteMode::for_operation(ctx.operation),
            ),
            None => current.clone(),
        };
        if let Some(tags) = payload.tags() {
            merged = language_merger::apply_tags(&merged, tags);
        }
        merged.content_hash = idempotency::record_hash(&merged);

        // ========== 5. consistency ==========
        let consistency = self.check_consistency(&merged, &payload, ctx);
        if let Some(entry) = &consistency {
            debug!("{} 一致性检查: {:?}", ctx, entry.status);
        }
        let consistency_record = consistency.clone().map(|entry| ConsistencyRecord {
            item_id: item.item_id.clone(),
            task_id: item.task_id.clone(),
            record_id: item.record_id,
            entry,
            created_at: Utc::now(),
        });

        // ========== 6. persist ==========
        let completed_hash = idempotency::subtask_input_hash(
            &merged,
            ctx.operation,
            &ctx.source_language,
            ctx.target_language.as_deref(),
        );
        let mut done = item.clone();
        done.succeed(payload)
            .map_err(|e| SubtaskError::new(ErrorStage::Persist, "invalid_transition", e.to_string()))?;
        self.store
            .commit_subtask(done.clone(), Some(merged), consistency_record)
            .await
            .map_err(|e| SubtaskError::new(ErrorStage::Persist, "persist_failed", e.to_string()))?;

        Ok(SubtaskOutcome {
            item: done,
            completed_hash: Some(completed_hash),
            consistency,
        })
    }

    /// 检索失败视为没有参考资料
    async fn retrieve_context(&self, record: &QuestionRecord, ctx: &SubtaskCtx) -> Vec<ContextSnippet> {
        if self.config.retrieval_top_k == 0 {
            return Vec::new();
        }
        let Some(query) = record.content_in(&ctx.source_language) else {
            return Vec::new();
        };
        match self
            .retriever
            .retrieve(
                query,
                self.config.retrieval_top_k,
                self.config.retrieval_threshold,
            )
            .await
        {
            Ok(snippets) => snippets,
            Err(e) => {
                warn!("{} ⚠️ 检索参考资料失败，按无结果处理: {}", ctx, e);
                Vec::new()
            }
        }
    }

    /// 判断题且本次写入了解析时才检查
    fn check_consistency(
        &self,
        merged: &QuestionRecord,
        payload: &ProcessedPayload,
        ctx: &SubtaskCtx,
    ) -> Option<ConsistencyEntry> {
        if !ctx.operation.touches_explanation() || merged.question_type != QuestionType::TrueFalse {
            return None;
        }
        let locale = match ctx.operation {
            Operation::Polish => ctx.source_language.as_str(),
            _ => ctx.write_language(),
        };
        let touched = payload
            .localized()
            .and_then(|l| l.explanation.as_ref())
            .is_some_and(|e| e.contains_key(locale));
        if !touched {
            return None;
        }
        Some(consistency_checker::check(
            merged.explanation_in(locale),
            merged.correct_answer.as_deref(),
            locale,
        ))
    }

    async fn finish_failed(
        &self,
        mut item: SubtaskItem,
        failure: SubtaskError,
        ctx: &SubtaskCtx,
    ) -> SubtaskOutcome {
        warn!(
            "{} ❌ 失败 [{}]: {}",
            ctx,
            failure.stage,
            truncate_text(&failure.message, 200)
        );
        if let Err(e) = item.fail(failure) {
            error!("{} {}", ctx, e);
        } else if let Err(e) = self.store.commit_subtask(item.clone(), None, None).await {
            error!("{} 无法保存失败状态: {}", ctx, e);
        }
        SubtaskOutcome {
            item,
            completed_hash: None,
            consistency: None,
        }
    }
}

fn provider_failure(error: ProviderError) -> SubtaskError {
    let code = match &error {
        ProviderError::Timeout { .. } => "timeout",
        ProviderError::Rejected { .. } => "rejected",
        ProviderError::Transport { .. } => "transport",
        ProviderError::EmptyContent => "empty_content",
    };
    SubtaskError::new(error.stage(), code, error.to_string())
}
