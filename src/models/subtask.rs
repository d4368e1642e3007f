use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorStage, TransitionError};
use crate::models::payload::ProcessedPayload;
use crate::models::task::{Operation, SubtaskSpec};

/// 子任务状态
///
/// pending → processing → {succeeded, failed, skipped}；终态不可再迁移。
/// 尚未派发的子任务可直接 pending → skipped（任务被取消）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Skipped,
}

impl SubtaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Processing => "processing",
            SubtaskStatus::Succeeded => "succeeded",
            SubtaskStatus::Failed => "failed",
            SubtaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtaskStatus::Succeeded | SubtaskStatus::Failed | SubtaskStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        matches!(
            (self, next),
            (SubtaskStatus::Pending, SubtaskStatus::Processing)
                | (SubtaskStatus::Pending, SubtaskStatus::Skipped)
                | (SubtaskStatus::Processing, SubtaskStatus::Succeeded)
                | (SubtaskStatus::Processing, SubtaskStatus::Failed)
                | (SubtaskStatus::Processing, SubtaskStatus::Skipped)
        )
    }
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 题目内容哈希未变化，之前已成功处理
    Unchanged,
    /// 同一 (题目, 操作, 语言) 已有未结束的子任务
    InFlight,
    /// 任务被取消，子任务未派发
    Cancelled,
}

/// 子任务错误详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskError {
    pub code: String,
    pub stage: ErrorStage,
    pub message: String,
}

impl SubtaskError {
    pub fn new(stage: ErrorStage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stage,
            message: message.into(),
        }
    }
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// 子任务（最小执行单元与幂等单元）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskItem {
    pub item_id: String,
    pub task_id: String,
    pub record_id: u64,
    pub operation: Operation,
    pub target_language: Option<String>,
    pub status: SubtaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 发给 AI 的请求
    pub ai_request: Option<serde_json::Value>,
    /// AI 原始响应
    pub ai_response: Option<String>,
    /// 修复、过滤后实际合并的数据
    pub processed_data: Option<ProcessedPayload>,
    pub error_detail: Option<SubtaskError>,
    pub skip_reason: Option<SkipReason>,
    pub usage: Option<TokenUsage>,
}

impl SubtaskItem {
    /// 新建待执行的子任务
    pub fn pending(task_id: &str, spec: &SubtaskSpec) -> Self {
        Self {
            item_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            record_id: spec.record_id,
            operation: spec.operation,
            target_language: spec.target_language.clone(),
            status: SubtaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            ai_request: None,
            ai_response: None,
            processed_data: None,
            error_detail: None,
            skip_reason: None,
            usage: None,
        }
    }

    /// 展开时即被跳过的子任务
    pub fn skipped(task_id: &str, spec: &SubtaskSpec, reason: SkipReason) -> Self {
        let mut item = Self::pending(task_id, spec);
        item.status = SubtaskStatus::Skipped;
        item.skip_reason = Some(reason);
        item.finished_at = Some(Utc::now());
        item
    }

    /// 展开时即校验失败的子任务（如题目不存在）
    pub fn rejected(task_id: &str, spec: &SubtaskSpec, error: SubtaskError) -> Self {
        let mut item = Self::pending(task_id, spec);
        item.status = SubtaskStatus::Failed;
        item.error_detail = Some(error);
        item.finished_at = Some(Utc::now());
        item
    }

    fn transition(&mut self, next: SubtaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                item_id: self.item_id.clone(),
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        if next == SubtaskStatus::Processing {
            self.started_at = Some(Utc::now());
        } else {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(SubtaskStatus::Processing)
    }

    pub fn succeed(&mut self, processed: ProcessedPayload) -> Result<(), TransitionError> {
        self.transition(SubtaskStatus::Succeeded)?;
        self.processed_data = Some(processed);
        Ok(())
    }

    pub fn fail(&mut self, error: SubtaskError) -> Result<(), TransitionError> {
        self.transition(SubtaskStatus::Failed)?;
        self.error_detail = Some(error);
        Ok(())
    }

    pub fn skip(&mut self, reason: SkipReason) -> Result<(), TransitionError> {
        self.transition(SubtaskStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    pub fn spec(&self) -> SubtaskSpec {
        SubtaskSpec::new(self.record_id, self.operation, self.target_language.clone())
    }
}
