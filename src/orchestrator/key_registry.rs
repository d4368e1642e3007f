//! 子任务键登记表
//!
//! 在派发前原子地"检查并登记"子任务键，保证同一 (题目, 操作, 语言)
//! 同时最多只有一个未结束的子任务；并记录每个键最近一次成功时的内容哈希。

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::services::SubtaskKey;

/// 登记结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 可以执行
    Admitted,
    /// 题目内容未变化且之前已成功
    Unchanged,
    /// 已有未结束的子任务
    InFlight,
}

#[derive(Default)]
struct RegistryState {
    /// 键 → 正在执行的子任务 id
    live: HashMap<SubtaskKey, String>,
    /// 键 → 上次成功后的内容哈希
    completed: HashMap<SubtaskKey, String>,
}

#[derive(Default)]
pub struct KeyRegistry {
    state: Mutex<RegistryState>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 检查并登记（一次加锁内完成）
    pub async fn try_register(&self, key: &SubtaskKey, item_id: &str, current_hash: &str) -> Admission {
        let mut state = self.state.lock().await;
        if state.live.contains_key(key) {
            return Admission::InFlight;
        }
        if state.completed.get(key).is_some_and(|h| h == current_hash) {
            return Admission::Unchanged;
        }
        state.live.insert(key.clone(), item_id.to_string());
        Admission::Admitted
    }

    /// 子任务结束后释放；成功时记录合并后的内容哈希
    pub async fn release(&self, key: &SubtaskKey, item_id: &str, completed_hash: Option<&str>) {
        let mut state = self.state.lock().await;
        if state.live.get(key).is_some_and(|id| id == item_id) {
            state.live.remove(key);
        }
        if let Some(hash) = completed_hash {
            state.completed.insert(key.clone(), hash.to_string());
        }
    }
}
