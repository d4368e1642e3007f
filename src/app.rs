use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::InMemoryStore;
use crate::models::load_all_toml_files;
use crate::orchestrator::TaskOrchestrator;
use crate::services::{ContextRetriever, HttpRetriever, LlmService, NoopRetriever, ReviewWriter};
use crate::utils::logging;

/// 应用主结构
pub struct App {
    config: Arc<Config>,
    orchestrator: TaskOrchestrator,
}

impl App {
    /// 初始化应用：加载题目、组装各层服务
    pub async fn initialize(config: Config) -> Result<Self> {
        logging::log_startup(config.max_concurrent_subtasks, config.request_timeout_secs);

        info!("\n📁 正在扫描题目文件...");
        let records = load_all_toml_files(&config.records_folder)
            .await
            .with_context(|| format!("加载题目目录失败: {}", config.records_folder))?;
        info!("✓ 共加载 {} 道题目", records.len());

        let config = Arc::new(config);
        let store = Arc::new(InMemoryStore::with_records(records));
        let generator = Arc::new(LlmService::new(&config));
        let retriever: Arc<dyn ContextRetriever> = match &config.retrieval_endpoint {
            Some(endpoint) => {
                info!("🔎 检索增强已启用: {}", endpoint);
                Arc::new(
                    HttpRetriever::new(endpoint.clone(), &config)
                        .context("初始化检索服务失败")?,
                )
            }
            None => Arc::new(NoopRetriever),
        };

        let orchestrator = TaskOrchestrator::with_review_writer(
            config.clone(),
            store,
            generator,
            retriever,
            ReviewWriter::with_path(config.review_file.clone()),
        );

        Ok(Self {
            config,
            orchestrator,
        })
    }

    /// 运行配置中的批处理请求并等待结束
    pub async fn run(&self) -> Result<()> {
        let Some(request) = self.config.batch.clone() else {
            warn!("⚠️ 配置中没有 [batch] 请求，程序结束");
            return Ok(());
        };

        let task_id = self.orchestrator.submit(request).await?;
        let task = self.orchestrator.wait(&task_id).await?;

        if let Some(reason) = &task.error {
            error!("[任务 {}] ❌ {}", task_id, reason);
        }
        let stats = self.orchestrator.error_stats(Some(&task_id)).await?;
        for (stage, count) in &stats {
            info!("  {:<20} {}", stage.as_str(), count);
        }

        logging::print_final_stats(&task.counts, &self.config.review_file);
        self.orchestrator.shutdown().await;
        Ok(())
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }
}
