/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::{StatusCounts, TaskStatus};

/// 初始化 tracing 日志
///
/// 优先使用 `RUST_LOG`，否则根据 `verbose` 选择 debug / info。
/// 重复调用是安全的（测试中会多次初始化）。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `max_concurrent`: 最大并发子任务数
/// - `timeout_secs`: 单次 AI 调用超时
pub fn log_startup(max_concurrent: usize, timeout_secs: u64) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 题目批量处理模式");
    info!("📊 最大并发子任务数: {}", max_concurrent);
    info!("⏱️ 单次调用超时: {}s", timeout_secs);
    info!("{}", "=".repeat(60));
}

/// 记录任务提交信息
pub fn log_task_submitted(task_id: &str, records: usize, subtasks: usize, skipped: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 任务 {} 已提交", task_id);
    info!(
        "📄 题目 {} 道，子任务 {} 个（其中跳过 {} 个）",
        records, subtasks, skipped
    );
    info!("{}", "=".repeat(60));
}

/// 记录任务完成信息
pub fn log_task_complete(task_id: &str, status: TaskStatus, counts: &StatusCounts) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ 任务 {} 结束 [{}]: 成功 {} / 失败 {} / 跳过 {}",
        task_id,
        status.as_str(),
        counts.succeeded,
        counts.failed,
        counts.skipped
    );
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
pub fn print_final_stats(counts: &StatusCounts, review_file: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", counts.succeeded, counts.total());
    info!("❌ 失败: {}", counts.failed);
    info!("⏭️ 跳过: {}", counts.skipped);
    info!("{}", "=".repeat(60));
    info!("\n待复核记录已写入: {}", review_file);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大字符数
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
