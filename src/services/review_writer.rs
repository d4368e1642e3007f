//! 待复核记录写入服务 - 业务能力层
//!
//! 只负责"追加写 review 文件"能力，不关心流程。
//! 编排层以分离任务的方式调用，出错只记录日志，不影响关键路径。

use anyhow::Result;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::models::{ConsistencyRecord, SubtaskItem};

/// 待复核记录写入服务
///
/// 职责：
/// - 将失败的子任务写入 review 文件
/// - 将解析与答案不一致的记录写入 review 文件
pub struct ReviewWriter {
    review_file_path: String,
}

impl ReviewWriter {
    /// 使用自定义文件路径创建
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            review_file_path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.review_file_path
    }

    /// 追加一个任务的待复核记录
    ///
    /// # 返回
    /// 返回写入的行数（没有待复核记录时不创建文件）
    pub async fn write_task(
        &self,
        task_id: &str,
        failed: &[SubtaskItem],
        inconsistent: &[ConsistencyRecord],
    ) -> Result<usize> {
        let mut lines = Vec::new();
        for item in failed {
            let (stage, message) = item
                .error_detail
                .as_ref()
                .map(|e| (e.stage.as_str(), e.message.as_str()))
                .unwrap_or(("unknown", ""));
            lines.push(format!(
                "任务 {} | 题目 {} | {} | {} | 失败 [{}]: {}\n",
                task_id,
                item.record_id,
                item.operation,
                item.target_language.as_deref().unwrap_or("-"),
                stage,
                message
            ));
        }
        for record in inconsistent {
            lines.push(format!(
                "任务 {} | 题目 {} | 解析与答案不一致 [{}]: 答案 {:?} / 解析 {:?}\n",
                task_id,
                record.record_id,
                record.entry.locale,
                record.entry.expected,
                record.entry.inferred
            ));
        }

        if lines.is_empty() {
            return Ok(0);
        }

        debug!(
            "写入待复核记录: 任务 {} | {} 行 -> {}",
            task_id,
            lines.len(),
            self.review_file_path
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.review_file_path)
            .await?;
        file.write_all(lines.concat().as_bytes()).await?;
        file.flush().await?;

        Ok(lines.len())
    }
}
