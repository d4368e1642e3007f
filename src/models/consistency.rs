use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 判断题的真假值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruthValue {
    True,
    False,
    Unknown,
}

/// 一致性状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent,
    Inconsistent,
    /// 无法从解析中推断出判断（遥测状态，不是错误）
    #[serde(rename = "consistency_unknown", alias = "unknown")]
    Unknown,
}

/// 一致性检查结果：解析隐含的判断 vs 标准答案
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyEntry {
    pub locale: String,
    pub expected: TruthValue,
    pub inferred: TruthValue,
    pub status: ConsistencyStatus,
}

/// 持久化的一致性记录，关联到产生它的子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyRecord {
    pub item_id: String,
    pub task_id: String,
    pub record_id: u64,
    pub entry: ConsistencyEntry,
    pub created_at: DateTime<Utc>,
}
