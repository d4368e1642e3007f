//! 任务查询与报表
//!
//! 只读：任务明细（分页）、一致性报表、错误统计、任务列表。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppResult, ErrorStage};
use crate::models::{
    BatchTask, ConsistencyRecord, ConsistencyStatus, Operation, Page, PageRequest, SubtaskItem,
    SubtaskStatus, TaskStatus,
};
use crate::orchestrator::batch_processor::TaskOrchestrator;

/// 任务明细：汇总 + 分页的子任务列表
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task: BatchTask,
    pub items: Page<SubtaskItem>,
}

/// 一致性报表过滤条件
#[derive(Debug, Clone, Default)]
pub struct ConsistencyFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub operation: Option<Operation>,
}

/// 一致性报表的一行：不一致记录 + 产生它的子任务
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReportRow {
    pub consistency: ConsistencyRecord,
    pub item: SubtaskItem,
}

impl TaskOrchestrator {
    /// 任务汇总与分页的子任务明细
    pub async fn task_detail(&self, task_id: &str, page: PageRequest) -> AppResult<TaskDetail> {
        let store = &self.inner.store;
        let task = store.get_task(task_id).await?;
        let items = store.list_items(Some(task_id)).await;
        Ok(TaskDetail {
            task,
            items: Page::slice(&items, page),
        })
    }

    /// 只返回 `inconsistent` 的一致性记录，按创建时间排序
    pub async fn consistency_report(
        &self,
        filter: ConsistencyFilter,
    ) -> AppResult<Vec<ConsistencyReportRow>> {
        let store = &self.inner.store;
        let mut rows = Vec::new();
        for record in store.list_consistency().await {
            if record.entry.status != ConsistencyStatus::Inconsistent {
                continue;
            }
            if filter.from.is_some_and(|from| record.created_at < from)
                || filter.to.is_some_and(|to| record.created_at > to)
            {
                continue;
            }
            let item = store.get_item(&record.item_id).await?;
            if filter.operation.is_some_and(|op| op != item.operation) {
                continue;
            }
            rows.push(ConsistencyReportRow {
                consistency: record,
                item,
            });
        }
        rows.sort_by_key(|r| r.consistency.created_at);
        Ok(rows)
    }

    /// 失败子任务按错误阶段计数；`task_id` 为 `None` 时统计全部任务
    pub async fn error_stats(&self, task_id: Option<&str>) -> AppResult<BTreeMap<ErrorStage, usize>> {
        let store = &self.inner.store;
        if let Some(task_id) = task_id {
            store.get_task(task_id).await?;
        }
        let mut stats = BTreeMap::new();
        for item in store.list_items(task_id).await {
            if item.status != SubtaskStatus::Failed {
                continue;
            }
            if let Some(error) = item.error_detail {
                *stats.entry(error.stage).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    /// 任务列表，最新的在前
    pub async fn list_tasks(&self, status: Option<TaskStatus>, page: PageRequest) -> Page<BatchTask> {
        let mut tasks: Vec<BatchTask> = self
            .inner
            .store
            .list_tasks()
            .await
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.reverse();
        Page::slice(&tasks, page)
    }
}
