use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::subtask::SubtaskStatus;

/// 处理操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// 翻译到目标语言
    Translate,
    /// 润色源语言内容
    Polish,
    /// 补全缺失字段
    FillMissing,
    /// 生成分类与标签
    CategoryTags,
    /// 翻译 + 润色 + 标签
    FullPipeline,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Translate => "translate",
            Operation::Polish => "polish",
            Operation::FillMissing => "fill_missing",
            Operation::CategoryTags => "category_tags",
            Operation::FullPipeline => "full_pipeline",
        }
    }

    /// 是否按目标语言拆分子任务
    pub fn is_per_language(self) -> bool {
        matches!(self, Operation::Translate | Operation::FullPipeline)
    }

    /// 是否会生成/改写解析（需要做一致性检查）
    pub fn touches_explanation(self) -> bool {
        matches!(
            self,
            Operation::Translate | Operation::Polish | Operation::FullPipeline
        )
    }

    /// 结果是否由源语言内容推导而来（源语言被并发修改时视为冲突）
    pub fn derives_from_source(self) -> bool {
        self.touches_explanation()
    }

    /// 是否改写源语言内容
    pub fn rewrites_source(self) -> bool {
        matches!(
            self,
            Operation::FillMissing | Operation::Polish | Operation::FullPipeline
        )
    }

    /// 同一题目上改写源语言的操作的执行顺序：先补全，再润色，最后全流程
    pub(crate) fn source_rank(self) -> u8 {
        match self {
            Operation::FillMissing => 0,
            Operation::Polish => 1,
            Operation::FullPipeline => 2,
            Operation::Translate | Operation::CategoryTags => 3,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 批处理请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub record_ids: Vec<u64>,
    pub operations: Vec<Operation>,
    pub source_language: String,
    #[serde(default)]
    pub target_languages: Vec<String>,
}

impl BatchRequest {
    /// 校验请求
    pub fn validate(&self) -> AppResult<()> {
        if self.record_ids.is_empty() {
            return Err(AppError::validation("record_ids 不能为空"));
        }
        if self.operations.is_empty() {
            return Err(AppError::validation("operations 不能为空"));
        }
        if !is_valid_language_code(&self.source_language) {
            return Err(AppError::validation(format!(
                "source_language 不合法: '{}'",
                self.source_language
            )));
        }
        if let Some(bad) = self
            .target_languages
            .iter()
            .find(|lang| !is_valid_language_code(lang))
        {
            return Err(AppError::validation(format!(
                "target_languages 含有不合法的语言代码: '{}'",
                bad
            )));
        }
        let needs_targets = self.operations.iter().any(|op| op.is_per_language());
        if needs_targets && self.effective_targets().is_empty() {
            return Err(AppError::validation(
                "translate / full_pipeline 需要至少一个不同于源语言的目标语言",
            ));
        }
        Ok(())
    }

    /// 去重并排除源语言后的目标语言，保持请求顺序
    pub fn effective_targets(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.target_languages
            .iter()
            .filter(|lang| **lang != self.source_language)
            .filter(|lang| seen.insert(lang.as_str()))
            .cloned()
            .collect()
    }

    /// 展开为子任务（题目 × 操作 × 目标语言），重复项只保留一次
    pub fn expand(&self) -> Vec<SubtaskSpec> {
        let targets = self.effective_targets();
        let mut seen_records = BTreeSet::new();
        let mut seen_ops = BTreeSet::new();
        let operations: Vec<Operation> = self
            .operations
            .iter()
            .copied()
            .filter(|op| seen_ops.insert(*op))
            .collect();

        let mut specs = Vec::new();
        for record_id in self.record_ids.iter().copied() {
            if !seen_records.insert(record_id) {
                continue;
            }
            for operation in operations.iter().copied() {
                if operation.is_per_language() {
                    for lang in &targets {
                        specs.push(SubtaskSpec::new(record_id, operation, Some(lang.clone())));
                    }
                } else {
                    specs.push(SubtaskSpec::new(record_id, operation, None));
                }
            }
        }
        specs
    }
}

/// 语言代码：`zh`、`ja`、`zh-CN` 这类形式
pub fn is_valid_language_code(code: &str) -> bool {
    let mut parts = code.splitn(2, '-');
    let primary = parts.next().unwrap_or_default();
    let primary_ok =
        (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_lowercase());
    let region_ok = parts.next().map_or(true, |region| {
        (2..=8).contains(&region.len()) && region.chars().all(|c| c.is_ascii_alphanumeric())
    });
    primary_ok && region_ok
}

/// 一个待展开的子任务
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub record_id: u64,
    pub operation: Operation,
    pub target_language: Option<String>,
}

impl SubtaskSpec {
    pub fn new(record_id: u64, operation: Operation, target_language: Option<String>) -> Self {
        Self {
            record_id,
            operation,
            target_language,
        }
    }
}

/// 批处理任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 按状态统计的子任务数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: SubtaskStatus) {
        match status {
            SubtaskStatus::Pending => self.pending += 1,
            SubtaskStatus::Processing => self.processing += 1,
            SubtaskStatus::Succeeded => self.succeeded += 1,
            SubtaskStatus::Failed => self.failed += 1,
            SubtaskStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn from_statuses(statuses: impl IntoIterator<Item = SubtaskStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.record(status);
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.succeeded + self.failed + self.skipped
    }

    /// 已到达终态的数量
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// 单道题目的子任务汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub record_id: u64,
    pub operations: Vec<Operation>,
    pub counts: StatusCounts,
}

/// 批处理任务
///
/// 只由编排层创建和修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
    pub task_id: String,
    pub record_ids: Vec<u64>,
    pub operations: Vec<Operation>,
    pub source_language: String,
    pub target_languages: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: StatusCounts,
    pub details: Vec<RecordSummary>,
    /// 展开阶段的错误（如没有任何有效题目）
    pub error: Option<String>,
}

impl BatchTask {
    pub fn new(
        task_id: String,
        source_language: String,
        specs: &[SubtaskSpec],
    ) -> Self {
        let mut record_ids = Vec::new();
        let mut operations = Vec::new();
        let mut target_languages = Vec::new();
        for spec in specs {
            if !record_ids.contains(&spec.record_id) {
                record_ids.push(spec.record_id);
            }
            if !operations.contains(&spec.operation) {
                operations.push(spec.operation);
            }
            if let Some(lang) = &spec.target_language {
                if !target_languages.contains(lang) {
                    target_languages.push(lang.clone());
                }
            }
        }

        Self {
            task_id,
            record_ids,
            operations,
            source_language,
            target_languages,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            counts: StatusCounts::default(),
            details: Vec::new(),
            error: None,
        }
    }
}

/// 分页请求（页码从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, 500),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1) * self.page_size
    }
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T: Clone> Page<T> {
    pub fn slice(all: &[T], request: PageRequest) -> Self {
        let items = all
            .iter()
            .skip(request.offset())
            .take(request.page_size)
            .cloned()
            .collect();
        Self {
            items,
            total: all.len(),
            page: request.page,
            page_size: request.page_size,
        }
    }
}
