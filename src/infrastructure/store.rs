//! 存储 - 基础设施层
//!
//! 持有题目、任务、子任务和一致性记录，只暴露"读写"能力。
//!
//! 职责：
//! - 按题目 id 读写规范多语言文档
//! - 提供按题目串行化的锁，避免两个子任务并发写同一题目时丢失更新
//! - 子任务终态与文档修改在一次提交中原子生效
//! - 不认识任何业务流程

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::StoreError;
use crate::models::{BatchTask, ConsistencyRecord, QuestionRecord, SubtaskItem};

/// 存储接口
#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// 读取题目
    async fn get_record(&self, id: u64) -> Result<QuestionRecord, StoreError>;

    /// 写入（新增或替换）题目
    async fn put_record(&self, record: QuestionRecord) -> Result<(), StoreError>;

    /// 获取题目的写锁，持有期间其他子任务不能合并同一题目
    async fn lock_record(&self, id: u64) -> OwnedMutexGuard<()>;

    /// 保存任务（新增或替换）
    async fn save_task(&self, task: BatchTask) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<BatchTask, StoreError>;

    /// 全部任务，按创建顺序
    async fn list_tasks(&self) -> Vec<BatchTask>;

    /// 追加子任务
    async fn insert_items(&self, items: Vec<SubtaskItem>) -> Result<(), StoreError>;

    /// 更新子任务；已是终态的子任务不能再被覆盖
    async fn update_item(&self, item: SubtaskItem) -> Result<(), StoreError>;

    async fn get_item(&self, item_id: &str) -> Result<SubtaskItem, StoreError>;

    /// 子任务列表，按创建顺序；`task_id` 为 `None` 时返回全部
    async fn list_items(&self, task_id: Option<&str>) -> Vec<SubtaskItem>;

    /// 原子提交子任务终态，以及（可选的）文档修改与一致性记录
    ///
    /// 任一部分不能生效时全部不生效。
    async fn commit_subtask(
        &self,
        item: SubtaskItem,
        record: Option<QuestionRecord>,
        consistency: Option<ConsistencyRecord>,
    ) -> Result<(), StoreError>;

    async fn list_consistency(&self) -> Vec<ConsistencyRecord>;
}

#[derive(Default)]
struct StoreState {
    records: HashMap<u64, QuestionRecord>,
    tasks: HashMap<String, BatchTask>,
    task_order: Vec<String>,
    items: Vec<SubtaskItem>,
    item_index: HashMap<String, usize>,
    consistency: Vec<ConsistencyRecord>,
}

impl StoreState {
    fn writable_item_index(&self, item_id: &str) -> Result<usize, StoreError> {
        let index = *self
            .item_index
            .get(item_id)
            .ok_or_else(|| StoreError::ItemNotFound(item_id.to_string()))?;
        if self.items[index].status.is_terminal() {
            return Err(StoreError::WriteFailed(format!(
                "子任务 {} 已是终态 {}",
                item_id,
                self.items[index].status.as_str()
            )));
        }
        Ok(index)
    }
}

/// 内存存储
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    record_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用一批题目初始化
    pub fn with_records(records: impl IntoIterator<Item = QuestionRecord>) -> Self {
        let state = StoreState {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
            ..StoreState::default()
        };
        Self {
            state: RwLock::new(state),
            record_locks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QuestionStore for InMemoryStore {
    async fn get_record(&self, id: u64) -> Result<QuestionRecord, StoreError> {
        self.state
            .read()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::RecordNotFound(id))
    }

    async fn put_record(&self, record: QuestionRecord) -> Result<(), StoreError> {
        self.state.write().await.records.insert(record.id, record);
        Ok(())
    }

    async fn lock_record(&self, id: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.record_locks.lock().await;
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn save_task(&self, task: BatchTask) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&task.task_id) {
            state.task_order.push(task.task_id.clone());
        }
        state.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<BatchTask, StoreError> {
        self.state
            .read()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    async fn list_tasks(&self) -> Vec<BatchTask> {
        let state = self.state.read().await;
        state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    async fn insert_items(&self, items: Vec<SubtaskItem>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(dup) = items.iter().find(|i| state.item_index.contains_key(&i.item_id)) {
            return Err(StoreError::WriteFailed(format!(
                "子任务 {} 已存在",
                dup.item_id
            )));
        }
        for item in items {
            let index = state.items.len();
            state.item_index.insert(item.item_id.clone(), index);
            state.items.push(item);
        }
        Ok(())
    }

    async fn update_item(&self, item: SubtaskItem) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let index = state.writable_item_index(&item.item_id)?;
        state.items[index] = item;
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> Result<SubtaskItem, StoreError> {
        let state = self.state.read().await;
        state
            .item_index
            .get(item_id)
            .map(|&i| state.items[i].clone())
            .ok_or_else(|| StoreError::ItemNotFound(item_id.to_string()))
    }

    async fn list_items(&self, task_id: Option<&str>) -> Vec<SubtaskItem> {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|i| task_id.map_or(true, |t| i.task_id == t))
            .cloned()
            .collect()
    }

    async fn commit_subtask(
        &self,
        item: SubtaskItem,
        record: Option<QuestionRecord>,
        consistency: Option<ConsistencyRecord>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        // 先检查，全部通过后再写入
        let index = state.writable_item_index(&item.item_id)?;
        if let Some(record) = &record {
            if !state.records.contains_key(&record.id) {
                return Err(StoreError::RecordNotFound(record.id));
            }
        }

        state.items[index] = item;
        if let Some(record) = record {
            state.records.insert(record.id, record);
        }
        if let Some(consistency) = consistency {
            state.consistency.push(consistency);
        }
        Ok(())
    }

    async fn list_consistency(&self) -> Vec<ConsistencyRecord> {
        self.state.read().await.consistency.clone()
    }
}
