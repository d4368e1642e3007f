use crate::models::question::QuestionRecord;
use crate::services::idempotency;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 单个 TOML 文件的结构：`[[questions]]` 数组
#[derive(Debug, Deserialize)]
struct QuestionFile {
    #[serde(default)]
    questions: Vec<QuestionRecord>,
}

/// 从 TOML 文件加载题目，并计算内容哈希
pub async fn load_toml_records(toml_file_path: &Path) -> Result<Vec<QuestionRecord>> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let file: QuestionFile = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    Ok(file
        .questions
        .into_iter()
        .map(|mut record| {
            record.content_hash = idempotency::record_hash(&record);
            record
        })
        .collect())
}

/// 从文件夹中加载所有 TOML 文件中的题目
///
/// 单个文件解析失败只记录警告，不影响其他文件。
pub async fn load_all_toml_files(folder_path: &str) -> Result<Vec<QuestionRecord>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    // 按文件名排序，保证加载顺序稳定
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_toml_records(&path).await {
            Ok(mut loaded) => {
                tracing::info!("成功加载 {} 道题目", loaded.len());
                records.append(&mut loaded);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(records)
}
