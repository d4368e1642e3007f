//! 子任务处理上下文
//!
//! 封装"我正在处理哪个任务的哪道题、哪个操作"这一信息

use std::fmt::Display;

use crate::models::{Operation, SubtaskItem};

/// 子任务处理上下文
#[derive(Debug, Clone)]
pub struct SubtaskCtx {
    /// 任务ID
    pub task_id: String,

    /// 题目ID
    pub record_id: u64,

    pub operation: Operation,

    /// 任务的源语言
    pub source_language: String,

    /// 目标语言（只有按语言拆分的操作才有）
    pub target_language: Option<String>,
}

impl SubtaskCtx {
    /// 根据子任务创建上下文
    pub fn for_item(item: &SubtaskItem, source_language: &str) -> Self {
        Self {
            task_id: item.task_id.clone(),
            record_id: item.record_id,
            operation: item.operation,
            source_language: source_language.to_string(),
            target_language: item.target_language.clone(),
        }
    }

    /// 响应中纯字符串字段归属的语言，也是本次主要写入的语言
    pub fn write_language(&self) -> &str {
        match (self.operation, self.target_language.as_deref()) {
            (Operation::Translate | Operation::FullPipeline, Some(target)) => target,
            _ => &self.source_language,
        }
    }
}

impl Display for SubtaskCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short_id: String = self.task_id.chars().take(8).collect();
        write!(
            f,
            "[任务 {} 题目#{} {} {}→{}]",
            short_id,
            self.record_id,
            self.operation,
            self.source_language,
            self.target_language.as_deref().unwrap_or("-")
        )
    }
}
